//! Per-tablet resource handle.
//!
//! A tablet holds one of these for its lifetime. The handle throttles memory
//! reports on the write-hot path, adjudicates major compactions, and brokers
//! scan-file reservations. It dispatches back to the manager through a
//! non-owning reference.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::ResourceError,
    extent::TabletId,
    files::{ScanFileManager, TabletFiles},
    manager::ManagerShared,
    observability::{log_debug, log_warn},
    option::TableOption,
    report::TabletReport,
    strategy::MajorCompactionRequest,
    tablet::{MajorCompactionReason, Tablet},
    time::Clock,
};

/// Memory deltas below this are not worth publishing.
const SIGNIFICANT_DELTA: i64 = 32_000;

/// Small deltas are still published once this much time has passed.
const REPORT_INTERVAL_MS: u64 = 1_000;

/// Resource handle for one hosted tablet.
pub struct TabletResources {
    manager: Weak<ManagerShared>,
    extent: TabletId,
    table: Arc<TableOption>,
    clock: Clock,
    creation_ms: u64,
    // The two atomics are read and swapped independently; the update path
    // is not synchronized and has no transactional semantics across them.
    // A lost CAS means a concurrent call already published equivalent
    // information.
    last_reported_size: AtomicU64,
    last_reported_minc: AtomicU64,
    last_reported_commit_ms: AtomicU64,
    open_files_reserved: AtomicBool,
    closed: AtomicBool,
    lock: Mutex<()>,
}

impl TabletResources {
    pub(crate) fn new(
        manager: Weak<ManagerShared>,
        extent: TabletId,
        table: Arc<TableOption>,
        clock: Clock,
    ) -> Self {
        let creation_ms = clock.now_millis();
        Self {
            manager,
            extent,
            table,
            clock,
            creation_ms,
            last_reported_size: AtomicU64::new(0),
            last_reported_minc: AtomicU64::new(0),
            last_reported_commit_ms: AtomicU64::new(0),
            open_files_reserved: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// The extent this handle belongs to.
    pub fn extent(&self) -> &TabletId {
        &self.extent
    }

    /// The tablet's table configuration.
    pub fn table(&self) -> &Arc<TableOption> {
        &self.table
    }

    /// Whether `close` has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report the tablet's memory usage.
    ///
    /// Publishes upstream only when the change is significant: the
    /// minor-compacting size crossed zero in either direction, the combined
    /// delta exceeds a threshold or went negative, or enough time has passed
    /// since the last published commit. Everything else is deliberately
    /// under-reported to keep commits from contending on the controller.
    pub fn update_memory(&self, tablet: &Arc<dyn Tablet>, size: u64, minc_size: u64) {
        let total = size + minc_size;
        let lrs = self.last_reported_size.load(Ordering::SeqCst);
        let delta = total as i64 - lrs as i64;
        let lrms = self.last_reported_minc.load(Ordering::SeqCst);
        let mut report = false;

        if ((lrms > 0 && minc_size == 0) || (lrms == 0 && minc_size > 0))
            && self
                .last_reported_minc
                .compare_exchange(lrms, minc_size, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            report = true;
        }

        let now = self.clock.now_millis();
        let since_commit = now.saturating_sub(self.last_reported_commit_ms.load(Ordering::SeqCst));
        if (delta > SIGNIFICANT_DELTA || delta < 0 || since_commit > REPORT_INTERVAL_MS)
            && self
                .last_reported_size
                .compare_exchange(lrs, total, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if delta > 0 {
                self.last_reported_commit_ms.store(now, Ordering::SeqCst);
            }
            report = true;
        }

        if report && let Some(manager) = self.manager.upgrade() {
            manager.controller.report(TabletReport::new(
                Arc::clone(tablet),
                size,
                minc_size,
                self.last_reported_commit_ms.load(Ordering::SeqCst),
            ));
        }
    }

    /// Record that files were bulk-imported into the tablet.
    pub fn import_files(&self) {
        self.last_reported_commit_ms
            .store(self.clock.now_millis(), Ordering::SeqCst);
    }

    /// Decide whether the tablet should major-compact its file set now.
    ///
    /// User-requested compactions are unconditional. Idle compactions first
    /// require the tablet to have been idle past its table's threshold. The
    /// final word belongs to the table's configured strategy; strategy
    /// failures are conservative and produce `false`.
    pub fn needs_major_compaction(
        &self,
        files: &TabletFiles,
        reason: MajorCompactionReason,
    ) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if reason == MajorCompactionReason::User {
            return true;
        }
        let now = self.clock.now_millis();
        if reason == MajorCompactionReason::Idle {
            let last_commit = self.last_reported_commit_ms.load(Ordering::SeqCst);
            let idle_ms = if last_commit == 0 {
                // No commits yet: measure from when the tablet was assigned.
                now.saturating_sub(self.creation_ms)
            } else {
                now.saturating_sub(last_commit)
            };
            if idle_ms < self.table.majc_compactall_idletime.as_millis() as u64 {
                return false;
            }
        }

        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut strategy = match manager.strategies.create(&self.table.compaction_strategy) {
            Ok(strategy) => strategy,
            Err(error) => {
                log_warn!(
                    component = "tablet",
                    event = "strategy_construction_failed",
                    extent = %self.extent,
                    error = %error,
                );
                return false;
            }
        };
        strategy.init(&self.table.strategy_options);
        let request = MajorCompactionRequest {
            extent: &self.extent,
            reason,
            volume: manager.volume.as_ref(),
            table: &self.table,
            files,
        };
        match strategy.should_compact(&request) {
            Ok(decision) => decision,
            Err(error) => {
                log_debug!(
                    component = "tablet",
                    event = "strategy_io_failed",
                    extent = %self.extent,
                    error = %error,
                );
                false
            }
        }
    }

    /// Open a scan-scoped file manager for this tablet.
    pub fn new_scan_file_manager(&self) -> Result<Box<dyn ScanFileManager>, ResourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResourceError::AlreadyClosed);
        }
        let manager = self.manager.upgrade().ok_or(ResourceError::AlreadyClosed)?;
        Ok(manager.file_manager.new_scan_file_manager(&self.extent))
    }

    /// Mark scan files reserved; `close` refuses while this is set.
    pub fn reserve_scan_files(&self) {
        self.open_files_reserved.store(true, Ordering::SeqCst);
    }

    /// Clear the scan-file reservation.
    pub fn release_scan_files(&self) {
        self.open_files_reserved.store(false, Ordering::SeqCst);
    }

    /// Run a minor compaction through the shared minor-compaction pool.
    pub fn execute_minor_compaction(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        let manager = self.manager.upgrade().ok_or(ResourceError::AlreadyClosed)?;
        manager.execute_minor_compaction(task)
    }

    /// Run a major compaction for this tablet; `rank` is the tablet's
    /// current file count.
    pub fn execute_major_compaction(
        &self,
        rank: u64,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        let manager = self.manager.upgrade().ok_or(ResourceError::AlreadyClosed)?;
        manager.execute_major_compaction(&self.extent, rank, task)
    }

    /// Release this tablet's resources.
    ///
    /// Fails when already closed or while scan files are reserved. On
    /// success the controller and the memory policy both forget the extent.
    /// Double close is an error, not a no-op.
    pub fn close(&self) -> Result<(), ResourceError> {
        let manager = self.manager.upgrade().ok_or(ResourceError::AlreadyClosed)?;
        // Always taken manager-then-handle; every close site uses this order.
        let _manager_guard = manager.handle_close_lock.lock();
        let _handle_guard = self.lock.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResourceError::AlreadyClosed);
        }
        if self.open_files_reserved.load(Ordering::SeqCst) {
            return Err(ResourceError::OpenFilesReserved);
        }
        manager.controller.tablet_closed(&self.extent);
        manager.policy.lock().tablet_closed(&self.extent);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io, time::Duration};

    use super::*;
    use crate::{
        files::{FileRef, FileStats},
        manager::ResourceManager,
        option::ServerOption,
        strategy::CompactionStrategy,
        test_util::{StubTablet, test_builder, unstarted_manager},
        time::ManualClock,
    };

    struct FailingStrategy;

    impl CompactionStrategy for FailingStrategy {
        fn init(&mut self, _options: &std::collections::HashMap<String, String>) {}

        fn should_compact(&self, _request: &MajorCompactionRequest<'_>) -> io::Result<bool> {
            Err(io::Error::other("strategy io failure"))
        }
    }

    fn fixture(start_ms: u64) -> (ResourceManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let manager = unstarted_manager(ServerOption::default(), Arc::clone(&clock) as Clock);
        (manager, clock)
    }

    fn handle_for(manager: &ResourceManager, name: &str) -> Arc<TabletResources> {
        manager.create_tablet_resources(
            TabletId::user(name, None),
            Arc::new(TableOption::default()),
        )
    }

    fn stub(name: &str) -> Arc<dyn Tablet> {
        Arc::new(StubTablet::new(TabletId::user(name, None)))
    }

    fn drain_reports(manager: &ResourceManager) -> Vec<TabletReport> {
        let mut reports = Vec::new();
        while let Some(report) = manager.shared().controller.try_recv_report() {
            reports.push(report);
        }
        reports
    }

    fn files(sizes: &[u64]) -> TabletFiles {
        let mut files = BTreeMap::new();
        for (index, size) in sizes.iter().enumerate() {
            files.insert(
                FileRef::new(format!("f{index}")),
                FileStats {
                    size: *size,
                    entries: 1,
                },
            );
        }
        files
    }

    #[test]
    fn small_deltas_are_throttled_until_a_second_passes() {
        let (manager, clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        let tablet = stub("t");

        handle.update_memory(&tablet, 1_000, 0);
        assert_eq!(drain_reports(&manager).len(), 1);

        handle.update_memory(&tablet, 1_010, 0);
        assert!(drain_reports(&manager).is_empty(), "delta of 10 within 1 s");

        clock.advance(1_001);
        handle.update_memory(&tablet, 1_020, 0);
        let reports = drain_reports(&manager);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].memtable_bytes(), 1_020);
        assert_eq!(reports[0].last_commit_ms(), 11_001);
    }

    #[test]
    fn repeated_identical_updates_publish_at_most_once() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        let tablet = stub("t");

        handle.update_memory(&tablet, 1_000, 0);
        handle.update_memory(&tablet, 1_000, 0);
        assert_eq!(drain_reports(&manager).len(), 1);
    }

    #[test]
    fn minc_zero_boundary_always_publishes() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        let tablet = stub("t");

        handle.update_memory(&tablet, 5_000, 0);
        assert_eq!(drain_reports(&manager).len(), 1);

        // Crossing zero publishes even though the delta is tiny.
        handle.update_memory(&tablet, 5_000, 1);
        let reports = drain_reports(&manager);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].minc_bytes(), 1);

        // Staying nonzero does not.
        handle.update_memory(&tablet, 5_000, 2);
        assert!(drain_reports(&manager).is_empty());

        // Crossing back to zero publishes again.
        handle.update_memory(&tablet, 5_000, 0);
        assert_eq!(drain_reports(&manager).len(), 1);
    }

    #[test]
    fn negative_delta_publishes_without_advancing_commit_time() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        let tablet = stub("t");

        handle.update_memory(&tablet, 50_000, 0);
        drain_reports(&manager);

        handle.update_memory(&tablet, 10_000, 0);
        let reports = drain_reports(&manager);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].last_commit_ms(), 10_000, "shrink is not a commit");
    }

    #[test]
    fn closed_handle_never_needs_major_compaction() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        handle.close().unwrap();
        assert!(!handle.needs_major_compaction(&files(&[10, 5, 4]), MajorCompactionReason::User));
    }

    #[test]
    fn user_reason_is_unconditional() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        assert!(handle.needs_major_compaction(&files(&[]), MajorCompactionReason::User));
    }

    #[test]
    fn normal_reason_defers_to_the_strategy() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        assert!(handle.needs_major_compaction(&files(&[10, 5, 4]), MajorCompactionReason::Normal));
        assert!(!handle.needs_major_compaction(&files(&[100, 1]), MajorCompactionReason::Normal));
    }

    #[test]
    fn idle_reason_requires_the_idle_threshold() {
        let (manager, clock) = fixture(100_000);
        let handle = manager.create_tablet_resources(
            TabletId::user("t", None),
            Arc::new(TableOption::default().majc_compactall_idletime(Duration::from_secs(60))),
        );

        // No commit reported: idleness is measured from creation.
        assert!(!handle.needs_major_compaction(&files(&[10, 5, 4]), MajorCompactionReason::Idle));
        clock.advance(60_000);
        assert!(handle.needs_major_compaction(&files(&[10, 5, 4]), MajorCompactionReason::Idle));

        // A fresh import resets the idle window.
        handle.import_files();
        assert!(!handle.needs_major_compaction(&files(&[10, 5, 4]), MajorCompactionReason::Idle));
    }

    #[test]
    fn strategy_io_failure_is_conservative() {
        let clock = Arc::new(ManualClock::new(10_000));
        let manager = test_builder(ServerOption::default())
            .clock(Arc::clone(&clock) as Clock)
            .register_strategy("failing", || Box::new(FailingStrategy))
            .build_unstarted()
            .unwrap();
        let handle = manager.create_tablet_resources(
            TabletId::user("t", None),
            Arc::new(TableOption::default().compaction_strategy("failing")),
        );
        assert!(!handle.needs_major_compaction(&files(&[10, 5, 4]), MajorCompactionReason::Normal));
    }

    #[test]
    fn close_is_not_idempotent() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        handle.close().unwrap();
        assert!(matches!(handle.close(), Err(ResourceError::AlreadyClosed)));
    }

    #[test]
    fn close_refuses_while_scan_files_reserved() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        handle.reserve_scan_files();
        assert!(matches!(
            handle.close(),
            Err(ResourceError::OpenFilesReserved)
        ));
        handle.release_scan_files();
        handle.close().unwrap();
    }

    #[test]
    fn close_removes_the_controller_report_entry() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        let extent = handle.extent().clone();
        manager
            .shared()
            .controller
            .insert_report_for_test(TabletReport::new(stub("t"), 1_000, 0, 0));
        assert!(manager.shared().controller.contains_report(&extent));

        handle.close().unwrap();
        assert!(!manager.shared().controller.contains_report(&extent));
    }

    #[test]
    fn scan_file_manager_is_refused_after_close() {
        let (manager, _clock) = fixture(10_000);
        let handle = handle_for(&manager, "t");
        assert!(handle.new_scan_file_manager().is_ok());
        handle.close().unwrap();
        assert!(matches!(
            handle.new_scan_file_manager(),
            Err(ResourceError::AlreadyClosed)
        ));
    }
}
