//! Pluggable memory policy: decides which tablets to minor-compact.

use std::{collections::HashMap, sync::Arc};

use crate::{
    error::ResourceError,
    extent::TabletId,
    option::ConfigSource,
    report::TabletReport,
    time::{Clock, SystemClock},
};

/// Decides, from the current report snapshot, which tablets should minor
/// compact. Constructed by registered name from server configuration.
pub trait MemoryPolicy: Send {
    /// Called once at startup with the live configuration.
    fn init(&mut self, config: &ConfigSource);

    /// Return the tablets to minor-compact, in initiation order. May be
    /// empty. Implementations may keep internal state between calls.
    fn recommend(&mut self, reports: &[TabletReport]) -> Vec<TabletId>;

    /// A tablet was unloaded; drop any state held for it.
    fn tablet_closed(&mut self, extent: &TabletId);
}

/// Constructor registered for a policy name.
pub type PolicyCtor = fn() -> Box<dyn MemoryPolicy>;

/// Name → constructor table for memory policies. No dynamic loading; custom
/// policies are registered before the manager is built.
pub struct MemoryPolicyRegistry {
    ctors: HashMap<String, PolicyCtor>,
}

impl MemoryPolicyRegistry {
    /// Registry pre-populated with the built-in `largest-first` policy.
    pub fn new() -> Self {
        let mut ctors: HashMap<String, PolicyCtor> = HashMap::new();
        ctors.insert("largest-first".into(), || {
            Box::new(LargestFirstPolicy::new())
        });
        Self { ctors }
    }

    /// Register a policy constructor under `name`, replacing any previous
    /// registration.
    pub fn register(&mut self, name: impl Into<String>, ctor: PolicyCtor) {
        self.ctors.insert(name.into(), ctor);
    }

    /// Construct the policy registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn MemoryPolicy>, ResourceError> {
        match self.ctors.get(name) {
            Some(ctor) => Ok(ctor()),
            None => Err(ResourceError::Configuration(format!(
                "unknown memory policy {name}"
            ))),
        }
    }
}

impl Default for MemoryPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_IDLE_THRESHOLD_MS: u64 = 5 * 60 * 1000;

// A recommendation is remembered this long; if the tablet never starts
// compacting within the window it becomes eligible again.
const PENDING_EXPIRY_MS: u64 = 60_000;

/// Default memory policy: when aggregate usage exceeds half the ceiling,
/// flush the largest memtables first until projected usage falls back under;
/// independently flush tablets that have sat idle past a threshold.
pub struct LargestFirstPolicy {
    clock: Clock,
    compaction_threshold: u64,
    idle_threshold_ms: u64,
    pending: HashMap<TabletId, u64>,
}

impl LargestFirstPolicy {
    /// Policy with default thresholds; `init` derives the real compaction
    /// threshold from the configured ceiling.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            compaction_threshold: (1 << 30) / 2,
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            pending: HashMap::new(),
        }
    }

    /// Replace the clock; used by tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Override the idle threshold.
    pub fn with_idle_threshold_ms(mut self, idle_threshold_ms: u64) -> Self {
        self.idle_threshold_ms = idle_threshold_ms;
        self
    }

    fn eligible(&self, report: &TabletReport) -> bool {
        report.memtable_bytes() > 0
            && report.minc_bytes() == 0
            && !self.pending.contains_key(report.extent())
    }
}

impl Default for LargestFirstPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPolicy for LargestFirstPolicy {
    fn init(&mut self, config: &ConfigSource) {
        self.compaction_threshold = config.get(|o| o.max_inmem_bytes) / 2;
    }

    fn recommend(&mut self, reports: &[TabletReport]) -> Vec<TabletId> {
        let now = self.clock.now_millis();
        self.pending
            .retain(|_, recommended_at| now.saturating_sub(*recommended_at) < PENDING_EXPIRY_MS);
        for report in reports {
            if report.minc_bytes() > 0 {
                // The tablet started compacting; forget the recommendation.
                self.pending.remove(report.extent());
            }
        }

        let total: u64 = reports.iter().map(TabletReport::total_bytes).sum();
        let mut out: Vec<TabletId> = Vec::new();

        for report in reports {
            if self.eligible(report)
                && now.saturating_sub(report.last_commit_ms()) >= self.idle_threshold_ms
            {
                out.push(report.extent().clone());
            }
        }

        if total > self.compaction_threshold {
            let mut candidates: Vec<&TabletReport> = reports
                .iter()
                .filter(|r| self.eligible(r) && !out.contains(r.extent()))
                .collect();
            candidates.sort_by(|a, b| b.memtable_bytes().cmp(&a.memtable_bytes()));

            let mut projected = total;
            for candidate in candidates {
                if projected <= self.compaction_threshold {
                    break;
                }
                projected -= candidate.memtable_bytes();
                out.push(candidate.extent().clone());
            }
        }

        for extent in &out {
            self.pending.insert(extent.clone(), now);
        }
        out
    }

    fn tablet_closed(&mut self, extent: &TabletId) {
        self.pending.remove(extent);
    }
}
