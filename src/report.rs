//! Per-tablet memory usage reports flowing from handles to the controller.

use std::{fmt, sync::Arc};

use crate::{extent::TabletId, tablet::Tablet};

/// Snapshot of one tablet's memory usage at report time.
///
/// Reports are value objects; the controller keys its authoritative table by
/// extent and keeps only the latest report per tablet. The tablet reference
/// is retained so the initiator can call back into the tablet and so stale
/// entries can be recognized by instance identity.
#[derive(Clone)]
pub struct TabletReport {
    tablet: Arc<dyn Tablet>,
    memtable_bytes: u64,
    minc_bytes: u64,
    last_commit_ms: u64,
}

impl TabletReport {
    /// Build a report for `tablet`.
    pub fn new(
        tablet: Arc<dyn Tablet>,
        memtable_bytes: u64,
        minc_bytes: u64,
        last_commit_ms: u64,
    ) -> Self {
        Self {
            tablet,
            memtable_bytes,
            minc_bytes,
            last_commit_ms,
        }
    }

    /// The extent this report describes.
    pub fn extent(&self) -> &TabletId {
        self.tablet.extent()
    }

    /// The reporting tablet instance.
    pub fn tablet(&self) -> &Arc<dyn Tablet> {
        &self.tablet
    }

    /// Bytes in the active memtable.
    pub fn memtable_bytes(&self) -> u64 {
        self.memtable_bytes
    }

    /// Bytes in the memtable currently being minor compacted.
    pub fn minc_bytes(&self) -> u64 {
        self.minc_bytes
    }

    /// Last commit time reported by the tablet, epoch milliseconds.
    pub fn last_commit_ms(&self) -> u64 {
        self.last_commit_ms
    }

    /// Active plus minor-compacting bytes.
    pub fn total_bytes(&self) -> u64 {
        self.memtable_bytes + self.minc_bytes
    }
}

impl fmt::Debug for TabletReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabletReport")
            .field("extent", self.extent())
            .field("memtable_bytes", &self.memtable_bytes)
            .field("minc_bytes", &self.minc_bytes)
            .field("last_commit_ms", &self.last_commit_ms)
            .finish()
    }
}
