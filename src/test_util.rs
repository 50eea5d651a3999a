//! Shared test doubles.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::{
    extent::TabletId,
    files::{FileManager, FileRef, ScanFileManager, Volume},
    manager::{ResourceManager, ResourceManagerBuilder},
    option::ServerOption,
    tablet::{MinorCompactionReason, Tablet},
    time::Clock,
};

/// Builder pre-wired with stub file collaborators.
pub(crate) fn test_builder(option: ServerOption) -> ResourceManagerBuilder {
    ResourceManager::builder(option)
        .file_manager(Arc::new(StubFileManager))
        .volume(Arc::new(StubVolume))
}

/// Fully wired manager whose controller and reconfiguration threads are not
/// running; unit tests drive those paths directly.
pub(crate) fn unstarted_manager(option: ServerOption, clock: Clock) -> ResourceManager {
    test_builder(option)
        .clock(clock)
        .build_unstarted()
        .expect("manager builds")
}

/// Scriptable tablet: records initiation calls and can be told to refuse
/// them or report itself closed.
pub(crate) struct StubTablet {
    extent: TabletId,
    closed: AtomicBool,
    refuse_minc: AtomicBool,
    initiated: AtomicUsize,
}

impl StubTablet {
    pub(crate) fn new(extent: TabletId) -> Self {
        Self {
            extent,
            closed: AtomicBool::new(false),
            refuse_minc: AtomicBool::new(false),
            initiated: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub(crate) fn set_refuse_minc(&self, refuse: bool) {
        self.refuse_minc.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn initiated(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }
}

impl Tablet for StubTablet {
    fn extent(&self) -> &TabletId {
        &self.extent
    }

    fn initiate_minor_compaction(&self, _reason: MinorCompactionReason) -> bool {
        self.initiated.fetch_add(1, Ordering::SeqCst);
        !self.refuse_minc.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Scan file manager that tracks nothing.
pub(crate) struct StubScanFileManager;

impl ScanFileManager for StubScanFileManager {
    fn reserve(&mut self, _files: &[FileRef]) -> io::Result<()> {
        Ok(())
    }

    fn release(&mut self) {}
}

/// File manager handing out [`StubScanFileManager`]s.
pub(crate) struct StubFileManager;

impl FileManager for StubFileManager {
    fn new_scan_file_manager(&self, _extent: &TabletId) -> Box<dyn ScanFileManager> {
        Box::new(StubScanFileManager)
    }
}

/// Volume that reports a fixed size for every file.
pub(crate) struct StubVolume;

impl Volume for StubVolume {
    fn file_size(&self, _file: &FileRef) -> io::Result<u64> {
        Ok(0)
    }
}
