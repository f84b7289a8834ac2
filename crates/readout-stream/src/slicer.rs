//! Timeframe slicer: groups contiguous same-timeframe pages per source.
//!
//! One slicer serves one equipment input. It keeps an open [`DataSet`] per
//! [`SourceId`] and closes it when the timeframe id changes, when the
//! sentinel timeframe forces a close, on inactivity timeout, or when the
//! aggregator flushes. Closed sets queue up oldest-first.

use std::collections::{HashMap, VecDeque};

use readout_core::{SourceId, MAX_LINKS, UNDEFINED_LINK, UNDEFINED_TIMEFRAME};
use readout_pool::PageRef;
use thiserror::Error;
use tracing::error;

/// Ordered pages sharing one timeframe id and one source.
///
/// Never observed empty: a set is created with its first page and consumed
/// whole.
#[derive(Debug, Default)]
pub struct DataSet {
    pages: Vec<PageRef>,
}

impl DataSet {
    pub(crate) fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub(crate) fn push(&mut self, page: PageRef) {
        self.pages.push(page);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[PageRef] {
        &self.pages
    }

    /// Timeframe id shared by every page of the set.
    pub fn timeframe_id(&self) -> u64 {
        self.pages
            .first()
            .map_or(UNDEFINED_TIMEFRAME, |p| p.header().timeframe_id)
    }

    /// Source shared by every page of the set.
    pub fn source(&self) -> Option<SourceId> {
        self.pages.first().map(|p| SourceId::from(p.header()))
    }

    /// Sum of the `data_size` tags.
    pub fn total_bytes(&self) -> u64 {
        self.pages
            .iter()
            .map(|p| p.header().data_size as u64)
            .sum()
    }

    /// Consume the set; each page returns to the pool when dropped.
    pub fn into_pages(self) -> Vec<PageRef> {
        self.pages
    }
}

/// `append_block` rejection: the page carries tags the producer must never
/// emit, which the aggregator treats as fatal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceError {
    #[error("link id {0} out of range")]
    LinkOutOfRange(u8),
}

#[derive(Debug, Default)]
struct PartialSlice {
    tf_id: u64,
    open: Option<DataSet>,
    last_update: f64,
}

/// Per-input slicing state.
#[derive(Debug, Default)]
pub struct TimeframeSlicer {
    slicer_id: usize,
    per_source: HashMap<SourceId, PartialSlice>,
    completed: VecDeque<DataSet>,
}

impl TimeframeSlicer {
    pub fn new(slicer_id: usize) -> Self {
        Self {
            slicer_id,
            ..Default::default()
        }
    }

    pub fn slicer_id(&self) -> usize {
        self.slicer_id
    }

    pub(crate) fn set_slicer_id(&mut self, id: usize) {
        self.slicer_id = id;
    }

    /// Append a page to its source's open set, closing the previous set on
    /// a timeframe change or on the sentinel timeframe.
    ///
    /// Returns the open set's size. `now` is the monotonic timestamp used
    /// by [`complete_on_timeout`](Self::complete_on_timeout).
    pub fn append_block(&mut self, page: PageRef, now: f64) -> Result<usize, SliceError> {
        let header = *page.header();
        if header.link_id != UNDEFINED_LINK && header.link_id >= MAX_LINKS {
            error!(
                slicer = self.slicer_id,
                link = header.link_id,
                max = MAX_LINKS - 1,
                "wrong link id"
            );
            return Err(SliceError::LinkOutOfRange(header.link_id));
        }
        let source = SourceId::from(&header);
        let slice = self.per_source.entry(source).or_default();

        if let Some(open) = slice.open.take() {
            if slice.tf_id != header.timeframe_id
                || header.timeframe_id == UNDEFINED_TIMEFRAME
            {
                // The current slice is complete.
                self.completed.push_back(open);
            } else {
                slice.open = Some(open);
            }
        }
        let open = slice.open.get_or_insert_with(DataSet::new);
        open.push(page);
        slice.tf_id = header.timeframe_id;
        slice.last_update = now;
        Ok(open.len())
    }

    /// Close every open set not updated since `threshold`. Returns how
    /// many were closed; their flush order is unspecified.
    pub fn complete_on_timeout(&mut self, threshold: f64) -> usize {
        let mut flushed = 0;
        for slice in self.per_source.values_mut() {
            if slice.open.is_some() && slice.last_update <= threshold {
                self.completed.extend(slice.open.take());
                flushed += 1;
            }
        }
        flushed
    }

    /// Oldest completed set, if any; otherwise, with `include_incomplete`,
    /// any one open set (closing it).
    pub fn get_slice(&mut self, include_incomplete: bool) -> Option<DataSet> {
        if let Some(set) = self.completed.pop_front() {
            return Some(set);
        }
        if include_incomplete {
            for slice in self.per_source.values_mut() {
                if let Some(set) = slice.open.take() {
                    return Some(set);
                }
            }
        }
        None
    }

    /// Number of sources with an open set (test observability).
    pub fn open_slices(&self) -> usize {
        self.per_source
            .values()
            .filter(|s| s.open.is_some())
            .count()
    }
}
