//! Keyset-paginated scans.
//!
//! Durable backends cannot hand out an iterator that borrows a read
//! transaction for the whole request, so scans are driven page by page:
//! each page is fetched with a fresh read starting strictly after the last
//! key already yielded. Memory stays bounded by the page size.

use crate::error::{StorageError, StorageResult};
use crate::query::is_empty_range;
use crate::store::ArchiveIterator;
use mailvault_codec::ArchiveKey;
use std::collections::VecDeque;
use std::ops::Bound;

/// Entries fetched per page.
pub(crate) const DEFAULT_PAGE_SIZE: usize = 256;

/// Something that can read one page of an ordered key range.
pub(crate) trait PageSource: Send {
    /// Returns up to `limit` entries with keys satisfying `lower` and below
    /// `end`, in ascending key order.
    fn fetch(
        &self,
        lower: &Bound<ArchiveKey>,
        end: &ArchiveKey,
        limit: usize,
    ) -> StorageResult<Vec<(ArchiveKey, Vec<u8>)>>;
}

/// An [`ArchiveIterator`] over any [`PageSource`].
pub(crate) struct PagedIterator<S> {
    source: Option<S>,
    lower: Bound<ArchiveKey>,
    end: ArchiveKey,
    page_size: usize,
    buffer: VecDeque<(ArchiveKey, Vec<u8>)>,
    current: Option<(ArchiveKey, Vec<u8>)>,
    exhausted: bool,
    error: Option<StorageError>,
}

impl<S: PageSource> PagedIterator<S> {
    pub(crate) fn new(source: S, lower: Bound<ArchiveKey>, end: ArchiveKey) -> Self {
        Self::with_page_size(source, lower, end, DEFAULT_PAGE_SIZE)
    }

    pub(crate) fn with_page_size(
        source: S,
        lower: Bound<ArchiveKey>,
        end: ArchiveKey,
        page_size: usize,
    ) -> Self {
        Self {
            source: Some(source),
            lower,
            end,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            current: None,
            exhausted: false,
            error: None,
        }
    }

    fn fill(&mut self) {
        let Some(source) = self.source.as_ref() else {
            self.exhausted = true;
            return;
        };
        if is_empty_range(&self.lower, &self.end) {
            self.exhausted = true;
            return;
        }
        match source.fetch(&self.lower, &self.end, self.page_size) {
            Ok(page) => {
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                self.buffer.extend(page);
            }
            Err(err) => {
                tracing::error!(error = %err, "archive scan failed");
                self.error = Some(err);
                self.exhausted = true;
            }
        }
    }
}

impl<S: PageSource> ArchiveIterator for PagedIterator<S> {
    fn next(&mut self) -> bool {
        if self.error.is_some() {
            self.current = None;
            return false;
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        match self.buffer.pop_front() {
            Some(entry) => {
                self.lower = Bound::Excluded(entry.0);
                self.current = Some(entry);
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    fn current(&self) -> Option<(&ArchiveKey, &[u8])> {
        self.current
            .as_ref()
            .map(|(key, value)| (key, value.as_slice()))
    }

    fn error(&self) -> Option<&StorageError> {
        self.error.as_ref()
    }

    fn take_error(&mut self) -> Option<StorageError> {
        self.exhausted = true;
        self.error.take()
    }

    fn release(&mut self) -> StorageResult<()> {
        self.source = None;
        self.buffer.clear();
        self.current = None;
        self.exhausted = true;
        Ok(())
    }
}
