//! Pluggable major-compaction strategy: decides whether a tablet's file set
//! should be merged now.

use std::{collections::HashMap, io};

use crate::{
    error::ResourceError,
    extent::TabletId,
    files::{TabletFiles, Volume},
    option::TableOption,
    tablet::MajorCompactionReason,
};

/// Everything a strategy may consult for one decision.
pub struct MajorCompactionRequest<'a> {
    /// Tablet under consideration.
    pub extent: &'a TabletId,
    /// Why the compaction is being considered.
    pub reason: MajorCompactionReason,
    /// File storage access; strategies may read file metadata.
    pub volume: &'a dyn Volume,
    /// The tablet's table configuration.
    pub table: &'a TableOption,
    /// The tablet's current file set.
    pub files: &'a TabletFiles,
}

/// Decides whether a major compaction should run. A fresh instance is
/// constructed per decision from the table's configured strategy name.
pub trait CompactionStrategy: Send {
    /// Called once after construction with the table's strategy options.
    fn init(&mut self, options: &HashMap<String, String>);

    /// Whether the tablet should compact now. May do I/O and fail; callers
    /// treat failure as "do not compact".
    fn should_compact(&self, request: &MajorCompactionRequest<'_>) -> io::Result<bool>;
}

/// Constructor registered for a strategy name.
pub type StrategyCtor = fn() -> Box<dyn CompactionStrategy>;

/// Name → constructor table for compaction strategies.
pub struct StrategyRegistry {
    ctors: HashMap<String, StrategyCtor>,
}

impl StrategyRegistry {
    /// Registry pre-populated with the built-in `size-ratio` strategy.
    pub fn new() -> Self {
        let mut ctors: HashMap<String, StrategyCtor> = HashMap::new();
        ctors.insert("size-ratio".into(), || {
            Box::new(SizeRatioStrategy::new())
        });
        Self { ctors }
    }

    /// Register a strategy constructor under `name`, replacing any previous
    /// registration.
    pub fn register(&mut self, name: impl Into<String>, ctor: StrategyCtor) {
        self.ctors.insert(name.into(), ctor);
    }

    /// Construct the strategy registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn CompactionStrategy>, ResourceError> {
        match self.ctors.get(name) {
            Some(ctor) => Ok(ctor()),
            None => Err(ResourceError::Configuration(format!(
                "unknown compaction strategy {name}"
            ))),
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_RATIO: f64 = 3.0;

/// Default strategy: compact when, walking file sizes largest to smallest,
/// some file is no larger than `ratio ×` the combined size of everything
/// smaller, and at least two files would participate.
pub struct SizeRatioStrategy {
    ratio: f64,
}

impl SizeRatioStrategy {
    /// Strategy with the default ratio; `init` may override it via the
    /// `ratio` option.
    pub fn new() -> Self {
        Self {
            ratio: DEFAULT_RATIO,
        }
    }
}

impl Default for SizeRatioStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionStrategy for SizeRatioStrategy {
    fn init(&mut self, options: &HashMap<String, String>) {
        if let Some(ratio) = options.get("ratio").and_then(|v| v.parse().ok()) {
            self.ratio = ratio;
        }
    }

    fn should_compact(&self, request: &MajorCompactionRequest<'_>) -> io::Result<bool> {
        let mut sizes: Vec<u64> = request.files.values().map(|stats| stats.size).collect();
        if sizes.len() < 2 {
            return Ok(false);
        }
        sizes.sort_unstable_by(|a, b| b.cmp(a));

        let mut suffix: u64 = sizes.iter().sum();
        for (index, size) in sizes.iter().enumerate() {
            suffix -= size;
            let remaining = sizes.len() - index;
            if remaining >= 2 && *size as f64 <= self.ratio * suffix as f64 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
