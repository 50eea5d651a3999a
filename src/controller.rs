//! Memory controller: two long-lived threads sharing the authoritative
//! per-tablet report table.
//!
//! The guard drains the report channel, aggregates usage, and drives the
//! commit-hold gate. The initiator periodically asks the memory policy which
//! tablets to flush and initiates minor compactions. Neither loop exits on a
//! non-fatal error; exiting would freeze back-pressure.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::{
    extent::TabletId,
    hold::CommitHold,
    observability::{log_debug, log_error, log_info, log_warn},
    policy::MemoryPolicy,
    report::TabletReport,
    tablet::MinorCompactionReason,
    time::Clock,
};

const AGGREGATION_INTERVAL_MS: u64 = 50;
const SOFT_CHECK_FRACTION: f64 = 0.90;
const HOLD_FRACTION: f64 = 0.95;
const INITIATOR_INTERVAL: Duration = Duration::from_millis(250);
const STOP_POLL: Duration = Duration::from_millis(250);

pub(crate) type SharedPolicy = Arc<Mutex<Box<dyn MemoryPolicy>>>;

/// Aggregation bookkeeping local to the guard.
pub(crate) struct GuardState {
    last_check_ms: u64,
    last_total: u64,
}

pub(crate) struct ControllerShared {
    tablet_reports: Mutex<HashMap<TabletId, TabletReport>>,
    hold: Arc<CommitHold>,
    policy: SharedPolicy,
    clock: Clock,
    max_mem: u64,
    stop: AtomicBool,
}

impl ControllerShared {
    /// Upsert the first report and whatever else is immediately available.
    fn ingest(&self, first: TabletReport, rx: &Receiver<TabletReport>) {
        let mut reports = self.tablet_reports.lock();
        reports.insert(first.extent().clone(), first);
        while let Ok(report) = rx.try_recv() {
            reports.insert(report.extent().clone(), report);
        }
    }

    /// Aggregation pass, gated so the sum is not recomputed on every report:
    /// run when commits are held, when 50 ms have passed, or when the
    /// previous total was already near the ceiling.
    pub(crate) fn aggregate(&self, state: &mut GuardState) {
        let now = self.clock.now_millis();
        let due = now.saturating_sub(state.last_check_ms) > AGGREGATION_INTERVAL_MS;
        let near_ceiling = state.last_total as f64 > SOFT_CHECK_FRACTION * self.max_mem as f64;
        if !(self.hold.is_held() || due || near_ceiling) {
            return;
        }
        state.last_check_ms = now;
        let total: u64 = self
            .tablet_reports
            .lock()
            .values()
            .map(TabletReport::total_bytes)
            .sum();
        self.hold
            .set(total as f64 > HOLD_FRACTION * self.max_mem as f64);
        state.last_total = total;
    }

    /// One initiator iteration: snapshot the table, consult the policy, and
    /// initiate minor compactions for its recommendations.
    ///
    /// The snapshot is copied under the lock but recommendations are acted on
    /// outside it; a tablet may close in between and refuse, which is handled
    /// by the identity-compared removal below.
    pub(crate) fn policy_pass(&self) {
        let snapshot: HashMap<TabletId, TabletReport> = self.tablet_reports.lock().clone();
        let states: Vec<TabletReport> = snapshot.values().cloned().collect();

        let recommendations =
            match catch_unwind(AssertUnwindSafe(|| self.policy.lock().recommend(&states))) {
                Ok(recommendations) => recommendations,
                Err(_) => {
                    log_error!(component = "memory", event = "memory_policy_failed");
                    return;
                }
            };

        for extent in recommendations {
            let Some(report) = snapshot.get(&extent) else {
                log_warn!(
                    component = "memory",
                    event = "unknown_recommendation",
                    extent = %extent,
                    "manager implementation might be misbehaving",
                );
                continue;
            };
            let tablet = Arc::clone(report.tablet());
            if tablet.initiate_minor_compaction(MinorCompactionReason::System) {
                continue;
            }
            if tablet.is_closed() {
                {
                    let mut reports = self.tablet_reports.lock();
                    if let Some(latest) = reports.remove(&extent) {
                        if Arc::ptr_eq(latest.tablet(), &tablet) {
                            log_debug!(
                                component = "memory",
                                event = "closed_tablet_report_removed",
                                extent = %extent,
                            );
                        } else {
                            // A different instance re-registered the extent.
                            reports.insert(extent.clone(), latest);
                        }
                    }
                }
                log_debug!(
                    component = "memory",
                    event = "skipped_closed_tablet",
                    extent = %extent,
                );
            } else {
                log_info!(
                    component = "memory",
                    event = "minor_compaction_refused",
                    extent = %extent,
                );
            }
        }
    }

    #[cfg(test)]
    fn insert_report(&self, report: TabletReport) {
        self.tablet_reports
            .lock()
            .insert(report.extent().clone(), report);
    }
}

/// Owner of the report channel, the report table, and the two controller
/// threads.
pub(crate) struct MemoryController {
    shared: Arc<ControllerShared>,
    report_tx: Sender<TabletReport>,
    report_rx: Receiver<TabletReport>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl MemoryController {
    pub(crate) fn new(max_mem: u64, policy: SharedPolicy, clock: Clock) -> Self {
        let (report_tx, report_rx) = flume::unbounded();
        Self {
            shared: Arc::new(ControllerShared {
                tablet_reports: Mutex::new(HashMap::new()),
                hold: Arc::new(CommitHold::new(Arc::clone(&clock))),
                policy,
                clock,
                max_mem,
                stop: AtomicBool::new(false),
            }),
            report_tx,
            report_rx,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Queue a report for the guard. Reports are throttled upstream by the
    /// tablet handles, so the channel is unbounded.
    pub(crate) fn report(&self, report: TabletReport) {
        let _ = self.report_tx.send(report);
    }

    /// Forget a closed tablet's report.
    pub(crate) fn tablet_closed(&self, extent: &TabletId) {
        self.shared.tablet_reports.lock().remove(extent);
    }

    pub(crate) fn hold(&self) -> &Arc<CommitHold> {
        &self.shared.hold
    }

    /// Start the guard and initiator threads.
    pub(crate) fn start(&self) {
        let mut threads = self.threads.lock();

        let guard_shared = Arc::clone(&self.shared);
        let guard_rx = self.report_rx.clone();
        match thread::Builder::new()
            .name("memory-guard".into())
            .spawn(move || guard_loop(guard_shared, guard_rx))
        {
            Ok(handle) => threads.push(handle),
            Err(error) => log_error!(
                component = "memory",
                event = "guard_spawn_failed",
                error = %error,
            ),
        }

        let initiator_shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("minor-compaction-initiator".into())
            .spawn(move || initiator_loop(initiator_shared))
        {
            Ok(handle) => threads.push(handle),
            Err(error) => log_error!(
                component = "memory",
                event = "initiator_spawn_failed",
                error = %error,
            ),
        }
    }

    /// Stop both threads and wait for them to exit.
    pub(crate) fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn try_recv_report(&self) -> Option<TabletReport> {
        self.report_rx.try_recv().ok()
    }

    #[cfg(test)]
    pub(crate) fn contains_report(&self, extent: &TabletId) -> bool {
        self.shared.tablet_reports.lock().contains_key(extent)
    }

    #[cfg(test)]
    pub(crate) fn insert_report_for_test(&self, report: TabletReport) {
        self.shared.insert_report(report);
    }
}

fn guard_loop(shared: Arc<ControllerShared>, rx: Receiver<TabletReport>) {
    let mut state = GuardState {
        last_check_ms: shared.clock.now_millis(),
        last_total: 0,
    };
    while !shared.stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(STOP_POLL) {
            Ok(report) => {
                let pass = catch_unwind(AssertUnwindSafe(|| {
                    shared.ingest(report, &rx);
                    shared.aggregate(&mut state);
                }));
                if pass.is_err() {
                    log_error!(component = "memory", event = "guard_pass_failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn initiator_loop(shared: Arc<ControllerShared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        if catch_unwind(AssertUnwindSafe(|| shared.policy_pass())).is_err() {
            log_error!(component = "memory", event = "initiator_pass_failed");
        }
        thread::sleep(INITIATOR_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extent::TabletId,
        option::ConfigSource,
        test_util::StubTablet,
        time::ManualClock,
    };

    struct ScriptedPolicy {
        recommend: Box<dyn FnMut(&[TabletReport]) -> Vec<TabletId> + Send>,
    }

    impl MemoryPolicy for ScriptedPolicy {
        fn init(&mut self, _config: &ConfigSource) {}

        fn recommend(&mut self, reports: &[TabletReport]) -> Vec<TabletId> {
            (self.recommend)(reports)
        }

        fn tablet_closed(&mut self, _extent: &TabletId) {}
    }

    fn scripted(
        recommend: impl FnMut(&[TabletReport]) -> Vec<TabletId> + Send + 'static,
    ) -> SharedPolicy {
        let policy: Box<dyn MemoryPolicy> = Box::new(ScriptedPolicy {
            recommend: Box::new(recommend),
        });
        Arc::new(Mutex::new(policy))
    }

    fn controller(max_mem: u64, policy: SharedPolicy, clock: Arc<ManualClock>) -> MemoryController {
        MemoryController::new(max_mem, policy, clock as Clock)
    }

    #[test]
    fn aggregate_engages_and_releases_hold() {
        let clock = Arc::new(ManualClock::new(1_000));
        let policy = scripted(|_| Vec::new());
        let controller = controller(1_000_000, policy, Arc::clone(&clock));
        let shared = &controller.shared;
        let mut state = GuardState {
            last_check_ms: 1_000,
            last_total: 0,
        };

        let t1 = Arc::new(StubTablet::new(TabletId::user("a", None)));
        let t2 = Arc::new(StubTablet::new(TabletId::user("b", None)));
        shared.insert_report(TabletReport::new(t1.clone(), 500_000, 0, 0));
        shared.insert_report(TabletReport::new(t2, 480_000, 0, 0));

        clock.advance(51);
        shared.aggregate(&mut state);
        assert!(shared.hold.is_held(), "980k of 1M exceeds 95%");

        shared.insert_report(TabletReport::new(t1, 100_000, 0, 0));
        // Hold is engaged, so the next pass runs regardless of elapsed time.
        shared.aggregate(&mut state);
        assert!(!shared.hold.is_held(), "580k of 1M is under 95%");
    }

    #[test]
    fn aggregate_is_skipped_between_intervals() {
        let clock = Arc::new(ManualClock::new(1_000));
        let policy = scripted(|_| Vec::new());
        let controller = controller(1_000_000, policy, Arc::clone(&clock));
        let shared = &controller.shared;
        let mut state = GuardState {
            last_check_ms: 1_000,
            last_total: 0,
        };

        let tablet = Arc::new(StubTablet::new(TabletId::user("a", None)));
        shared.insert_report(TabletReport::new(tablet, 999_999, 0, 0));

        clock.advance(10);
        shared.aggregate(&mut state);
        assert!(
            !shared.hold.is_held(),
            "not held, not due, last total zero: pass skipped"
        );

        clock.advance(50);
        shared.aggregate(&mut state);
        assert!(shared.hold.is_held());
    }

    #[test]
    fn policy_pass_initiates_recommended_compactions() {
        let clock = Arc::new(ManualClock::new(1_000));
        let extent = TabletId::user("a", None);
        let policy = {
            let extent = extent.clone();
            scripted(move |_| vec![extent.clone()])
        };
        let controller = controller(1_000_000, policy, clock);
        let tablet = Arc::new(StubTablet::new(extent));
        controller
            .shared
            .insert_report(TabletReport::new(tablet.clone(), 10_000, 0, 0));

        controller.shared.policy_pass();
        assert_eq!(tablet.initiated(), 1);
    }

    #[test]
    fn unknown_recommendation_is_skipped() {
        let clock = Arc::new(ManualClock::new(1_000));
        let policy = scripted(|_| vec![TabletId::user("ghost", None)]);
        let controller = controller(1_000_000, policy, clock);
        // No report for "ghost": the pass must not panic, just warn and skip.
        controller.shared.policy_pass();
    }

    #[test]
    fn closed_tablet_report_is_removed_by_identity() {
        let clock = Arc::new(ManualClock::new(1_000));
        let extent = TabletId::user("a", None);
        let policy = {
            let extent = extent.clone();
            scripted(move |_| vec![extent.clone()])
        };
        let controller = controller(1_000_000, policy, clock);
        let tablet = Arc::new(StubTablet::new(extent.clone()));
        tablet.set_closed(true);
        controller
            .shared
            .insert_report(TabletReport::new(tablet, 10_000, 0, 0));

        controller.shared.policy_pass();
        assert!(
            !controller.shared.tablet_reports.lock().contains_key(&extent),
            "closed tablet's report is cleaned up"
        );
    }

    #[test]
    fn reregistered_extent_survives_stale_cleanup() {
        let clock = Arc::new(ManualClock::new(1_000));
        let extent = TabletId::user("a", None);
        let old = Arc::new(StubTablet::new(extent.clone()));
        old.set_closed(true);
        let new = Arc::new(StubTablet::new(extent.clone()));

        let controller = controller(1_000_000, scripted(|_| Vec::new()), clock);
        controller
            .shared
            .insert_report(TabletReport::new(old, 10_000, 0, 0));

        // The snapshot sees `old`; the policy swaps the table entry to `new`
        // before the pass acts on the recommendation, simulating the tablet
        // reloading between the copy and the initiation call.
        let shared = Arc::clone(&controller.shared);
        let swap_extent = extent.clone();
        let new_clone = Arc::clone(&new);
        *controller.shared.policy.lock() = Box::new(ScriptedPolicy {
            recommend: Box::new(move |_| {
                shared.tablet_reports.lock().insert(
                    swap_extent.clone(),
                    TabletReport::new(new_clone.clone(), 20_000, 0, 0),
                );
                vec![swap_extent.clone()]
            }),
        });

        controller.shared.policy_pass();
        let reports = controller.shared.tablet_reports.lock();
        let kept = reports.get(&extent).expect("entry for new instance kept");
        let new: Arc<dyn crate::tablet::Tablet> = new;
        assert!(Arc::ptr_eq(kept.tablet(), &new));
    }

    #[test]
    fn refused_compaction_on_live_tablet_leaves_report() {
        let clock = Arc::new(ManualClock::new(1_000));
        let extent = TabletId::user("a", None);
        let policy = {
            let extent = extent.clone();
            scripted(move |_| vec![extent.clone()])
        };
        let controller = controller(1_000_000, policy, clock);
        let tablet = Arc::new(StubTablet::new(extent.clone()));
        tablet.set_refuse_minc(true);
        controller
            .shared
            .insert_report(TabletReport::new(tablet, 10_000, 0, 0));

        controller.shared.policy_pass();
        assert!(controller.shared.tablet_reports.lock().contains_key(&extent));
    }

    #[test]
    fn panicking_policy_does_not_poison_the_pass() {
        let clock = Arc::new(ManualClock::new(1_000));
        let policy = scripted(|_| panic!("policy bug"));
        let controller = controller(1_000_000, policy, clock);
        controller.shared.policy_pass();
        controller.shared.policy_pass();
    }
}
