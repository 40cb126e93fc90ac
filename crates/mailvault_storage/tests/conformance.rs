//! Behaviour every archive backend must share.

use mailvault_codec::{BloomFilter, Envelope, Topic};
use mailvault_storage::{ArchiveStore, InMemoryStore, RangeQuery, RedbStore, SqliteStore};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::{Duration, UNIX_EPOCH};

fn backends() -> Vec<Box<dyn ArchiveStore>> {
    vec![
        Box::new(InMemoryStore::new()),
        Box::new(RedbStore::open_in_memory().unwrap()),
        Box::new(SqliteStore::open_in_memory().unwrap()),
    ]
}

fn env(sent: u32, topic: u8, body: u8) -> Envelope {
    Envelope::new(sent + 100, 100, Topic::from_bytes([topic, 0, 0, topic]), vec![body; 24])
}

/// Collects `(timestamp, payload)` of every entry the iterator classifies as
/// a match, using the same rule as the delivery pipeline.
fn matches(store: &dyn ArchiveStore, query: &RangeQuery) -> Vec<(u32, Vec<u8>)> {
    let topics: HashSet<Topic> = query.topics.iter().copied().collect();
    let mut iter = store.build_iterator(query).unwrap();
    let mut out = Vec::new();
    while iter.next() {
        let hit = if topics.is_empty() {
            iter.match_by_bloom(&query.bloom.unwrap_or_else(BloomFilter::full))
                .unwrap()
        } else {
            iter.match_by_topics(&topics).unwrap()
        };
        if let Some(bytes) = hit {
            out.push((iter.key().unwrap().timestamp(), bytes));
        }
    }
    assert!(iter.error().is_none(), "{} scan failed", store.name());
    iter.release().unwrap();
    out
}

#[test]
fn backends_agree_on_range_scan() {
    for store in backends() {
        for ts in [50, 10, 40, 20, 30] {
            store.save_envelope(&env(ts, 1, ts as u8)).unwrap();
        }
        let seen: Vec<u32> = matches(store.as_ref(), &RangeQuery::between(20, 40))
            .into_iter()
            .map(|(ts, _)| ts)
            .collect();
        assert_eq!(seen, vec![20, 30, 40], "backend {}", store.name());
    }
}

#[test]
fn backends_agree_on_topic_and_bloom_matching() {
    let wanted = Topic::from_bytes([2, 0, 0, 2]);
    for store in backends() {
        for ts in 0..12 {
            store.save_envelope(&env(ts, (ts % 3) as u8, 0)).unwrap();
        }

        let by_topic = matches(
            store.as_ref(),
            &RangeQuery::between(0, 100).with_topics(vec![wanted]),
        );
        assert_eq!(by_topic.len(), 4, "backend {}", store.name());

        let by_bloom = matches(
            store.as_ref(),
            &RangeQuery::between(0, 100).with_bloom(Some(BloomFilter::from_topic(&wanted))),
        );
        // Bloom matching may admit false positives but never drops a match.
        assert!(by_bloom.len() >= 4, "backend {}", store.name());
    }
}

#[test]
fn backends_resume_from_cursor_without_gaps() {
    for store in backends() {
        let mut keys = Vec::new();
        for ts in 0..9 {
            keys.push(store.save_envelope(&env(100, 1, ts)).unwrap());
        }
        keys.sort();

        let query = RangeQuery::between(100, 100)
            .with_cursor(Some(keys[3].cursor().as_bytes().to_vec()));
        let rest = matches(store.as_ref(), &query);
        assert_eq!(rest.len(), 5, "backend {}", store.name());
    }
}

#[test]
fn backends_prune_strictly_before() {
    for store in backends() {
        for ts in 0..10 {
            store.save_envelope(&env(ts, 1, 0)).unwrap();
        }
        let removed = store.prune(UNIX_EPOCH + Duration::from_secs(5), 2).unwrap();
        assert_eq!(removed, 5, "backend {}", store.name());
        assert_eq!(store.count().unwrap(), 5);
        store.close().unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn scan_returns_every_saved_entry_in_order(
        stamps in prop::collection::vec(0u32..500, 1..60),
    ) {
        for store in backends() {
            for (i, ts) in stamps.iter().enumerate() {
                store.save_envelope(&env(*ts, 1, i as u8)).unwrap();
            }
            let seen: Vec<u32> = matches(store.as_ref(), &RangeQuery::between(0, 1000))
                .into_iter()
                .map(|(ts, _)| ts)
                .collect();

            let mut expected = stamps.clone();
            expected.sort_unstable();
            prop_assert_eq!(seen.len(), store.count().unwrap());
            prop_assert!(seen.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(seen.iter().all(|ts| expected.contains(ts)));
        }
    }
}
