//! Segment index: presentation time to segment reference lookup
//!
//! The index is restartable: a live manifest update replaces or extends
//! the reference list, and references that slid out of the availability
//! window are released from the front.

use std::sync::Arc;

use parking_lot::RwLock;

use super::segment::SegmentReference;

/// An ordered list of segment references with time-based lookup.
#[derive(Default)]
pub struct SegmentIndex {
    refs: RwLock<Vec<Arc<SegmentReference>>>,
}

impl SegmentIndex {
    pub fn new(references: Vec<SegmentReference>) -> Self {
        Self {
            refs: RwLock::new(references.into_iter().map(Arc::new).collect()),
        }
    }

    /// Number of references currently held.
    pub fn len(&self) -> usize {
        self.refs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.read().is_empty()
    }

    /// Find the reference whose `[start_time, end_time)` contains `time`.
    ///
    /// A time that lands within `boundary_tolerance` seconds past a
    /// segment start still resolves to the earlier segment, so a seek to
    /// just past a boundary does not skip a sample.
    pub fn find(&self, time: f64, boundary_tolerance: f64) -> Option<Arc<SegmentReference>> {
        let refs = self.refs.read();
        let mut found: Option<usize> = None;
        for (i, r) in refs.iter().enumerate() {
            if r.contains(time) {
                found = Some(i);
                break;
            }
        }
        let mut idx = found?;
        if idx > 0 && boundary_tolerance > 0.0 {
            let r = &refs[idx];
            if time - r.start_time < boundary_tolerance {
                idx -= 1;
            }
        }
        refs.get(idx).cloned()
    }

    /// The reference immediately after `reference`, by start time.
    pub fn next_after(&self, reference: &SegmentReference) -> Option<Arc<SegmentReference>> {
        let refs = self.refs.read();
        refs.iter()
            .find(|r| r.start_time >= reference.end_time - 1e-9)
            .cloned()
    }

    /// References starting at or after `time`, for prefetching.
    pub fn from_time(&self, time: f64) -> Vec<Arc<SegmentReference>> {
        let refs = self.refs.read();
        refs.iter()
            .filter(|r| r.end_time > time)
            .cloned()
            .collect()
    }

    pub fn first(&self) -> Option<Arc<SegmentReference>> {
        self.refs.read().first().cloned()
    }

    pub fn last(&self) -> Option<Arc<SegmentReference>> {
        self.refs.read().last().cloned()
    }

    /// Replace the whole reference list (live manifest update).
    pub fn replace(&self, references: Vec<SegmentReference>) {
        *self.refs.write() = references.into_iter().map(Arc::new).collect();
    }

    /// Append new references at the tail (live edge growth).
    pub fn extend(&self, references: Vec<SegmentReference>) {
        let mut refs = self.refs.write();
        refs.extend(references.into_iter().map(Arc::new));
    }

    /// Drop references that ended before `availability_start`.
    pub fn evict_before(&self, availability_start: f64) {
        let mut refs = self.refs.write();
        refs.retain(|r| r.end_time > availability_start);
    }
}
