//! Server and per-table configuration.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;

/// Configure the operating parameters of the
/// [`ResourceManager`](crate::ResourceManager).
///
/// Values that size worker pools are read live through [`ConfigSource`] and
/// may be updated while the server runs; the rest are read at startup.
#[derive(Clone, Debug)]
pub struct ServerOption {
    /// Ceiling on total in-memory map bytes across all hosted tablets.
    pub(crate) max_inmem_bytes: u64,

    /// Whether the native in-memory map is enabled (its memory lives outside
    /// the process budget checked at startup).
    pub(crate) native_map_enabled: bool,

    /// Expected block size for the data and index caches.
    pub(crate) default_block_size: u64,

    /// Byte budget of the data block cache.
    pub(crate) data_cache_bytes: u64,

    /// Byte budget of the index block cache.
    pub(crate) index_cache_bytes: u64,

    /// Maximum files the file manager may hold open for scans.
    pub(crate) max_open_scan_files: usize,

    /// `minc.maxconcurrent`: minor-compaction pool size.
    pub minc_max_concurrent: usize,

    /// `majc.maxconcurrent`: major-compaction pool size.
    pub(crate) majc_max_concurrent: usize,

    /// `migrate.maxconcurrent`: migration pool size.
    pub(crate) migrate_max_concurrent: usize,

    /// `readahead.maxconcurrent`: read-ahead pool size.
    pub(crate) read_ahead_max_concurrent: usize,

    /// `metadata.readahead.maxconcurrent`: metadata read-ahead pool size.
    pub(crate) metadata_read_ahead_max_concurrent: usize,

    /// RPC timeout; doubles as the deadline writers wait out a commit hold.
    pub(crate) rpc_timeout: Duration,

    /// Registered name of the memory policy to construct.
    pub(crate) memory_policy: String,

    /// How often config-driven pool sizes are re-read.
    pub(crate) pool_resize_interval: Duration,

    /// Delay before the first pool-size check.
    pub(crate) pool_resize_delay: Duration,

    /// Process memory budget the map and caches must fit into. Startup
    /// validation is skipped when unset.
    pub(crate) process_memory_limit: Option<u64>,
}

impl Default for ServerOption {
    fn default() -> Self {
        Self {
            max_inmem_bytes: 1 << 30,
            native_map_enabled: false,
            default_block_size: 100 * 1024,
            data_cache_bytes: 128 << 20,
            index_cache_bytes: 40 << 20,
            max_open_scan_files: 100,
            minc_max_concurrent: 4,
            majc_max_concurrent: 3,
            migrate_max_concurrent: 1,
            read_ahead_max_concurrent: 16,
            metadata_read_ahead_max_concurrent: 8,
            rpc_timeout: Duration::from_secs(120),
            memory_policy: "largest-first".into(),
            pool_resize_interval: Duration::from_secs(10),
            pool_resize_delay: Duration::from_secs(1),
            process_memory_limit: None,
        }
    }
}

impl ServerOption {
    /// Ceiling on total in-memory map bytes.
    pub fn max_inmem_bytes(self, max_inmem_bytes: u64) -> Self {
        ServerOption {
            max_inmem_bytes,
            ..self
        }
    }

    /// Enable or disable the native in-memory map.
    pub fn native_map_enabled(self, native_map_enabled: bool) -> Self {
        ServerOption {
            native_map_enabled,
            ..self
        }
    }

    /// Expected cache block size.
    pub fn default_block_size(self, default_block_size: u64) -> Self {
        ServerOption {
            default_block_size,
            ..self
        }
    }

    /// Data block cache budget.
    pub fn data_cache_bytes(self, data_cache_bytes: u64) -> Self {
        ServerOption {
            data_cache_bytes,
            ..self
        }
    }

    /// Index block cache budget.
    pub fn index_cache_bytes(self, index_cache_bytes: u64) -> Self {
        ServerOption {
            index_cache_bytes,
            ..self
        }
    }

    /// Maximum files held open for scans.
    pub fn max_open_scan_files(self, max_open_scan_files: usize) -> Self {
        ServerOption {
            max_open_scan_files,
            ..self
        }
    }

    /// Minor-compaction pool size (`minc.maxconcurrent`).
    pub fn minc_max_concurrent(self, minc_max_concurrent: usize) -> Self {
        ServerOption {
            minc_max_concurrent,
            ..self
        }
    }

    /// Major-compaction pool size (`majc.maxconcurrent`).
    pub fn majc_max_concurrent(self, majc_max_concurrent: usize) -> Self {
        ServerOption {
            majc_max_concurrent,
            ..self
        }
    }

    /// Migration pool size (`migrate.maxconcurrent`).
    pub fn migrate_max_concurrent(self, migrate_max_concurrent: usize) -> Self {
        ServerOption {
            migrate_max_concurrent,
            ..self
        }
    }

    /// Read-ahead pool size (`readahead.maxconcurrent`).
    pub fn read_ahead_max_concurrent(self, read_ahead_max_concurrent: usize) -> Self {
        ServerOption {
            read_ahead_max_concurrent,
            ..self
        }
    }

    /// Metadata read-ahead pool size (`metadata.readahead.maxconcurrent`).
    pub fn metadata_read_ahead_max_concurrent(
        self,
        metadata_read_ahead_max_concurrent: usize,
    ) -> Self {
        ServerOption {
            metadata_read_ahead_max_concurrent,
            ..self
        }
    }

    /// RPC timeout, also the commit-hold wait deadline.
    pub fn rpc_timeout(self, rpc_timeout: Duration) -> Self {
        ServerOption {
            rpc_timeout,
            ..self
        }
    }

    /// Name of the memory policy to construct at startup.
    pub fn memory_policy(self, memory_policy: impl Into<String>) -> Self {
        ServerOption {
            memory_policy: memory_policy.into(),
            ..self
        }
    }

    /// Interval between pool-size reconfiguration checks.
    pub fn pool_resize_interval(self, pool_resize_interval: Duration) -> Self {
        ServerOption {
            pool_resize_interval,
            ..self
        }
    }

    /// Delay before the first pool-size check.
    pub fn pool_resize_delay(self, pool_resize_delay: Duration) -> Self {
        ServerOption {
            pool_resize_delay,
            ..self
        }
    }

    /// Process memory budget for startup validation.
    pub fn process_memory_limit(self, process_memory_limit: u64) -> Self {
        ServerOption {
            process_memory_limit: Some(process_memory_limit),
            ..self
        }
    }
}

/// Live handle to server configuration.
///
/// Reads go through a closure so callers always observe the current value;
/// [`ConfigSource::update`] is how operators reconfigure pool sizes at
/// runtime.
#[derive(Clone)]
pub struct ConfigSource {
    inner: Arc<RwLock<ServerOption>>,
}

impl ConfigSource {
    /// Wrap an option set in a live handle.
    pub fn new(option: ServerOption) -> Self {
        Self {
            inner: Arc::new(RwLock::new(option)),
        }
    }

    /// Read a value out of the current configuration.
    pub fn get<T>(&self, read: impl FnOnce(&ServerOption) -> T) -> T {
        read(&self.inner.read())
    }

    /// Mutate the configuration in place; subsequent reads observe the new
    /// values.
    pub fn update(&self, mutate: impl FnOnce(&mut ServerOption)) {
        mutate(&mut self.inner.write());
    }
}

/// Per-table configuration consulted by major-compaction adjudication.
#[derive(Clone, Debug)]
pub struct TableOption {
    /// Registered name of the table's compaction strategy.
    pub(crate) compaction_strategy: String,

    /// Options handed to the strategy's `init`.
    pub(crate) strategy_options: HashMap<String, String>,

    /// Idle time after which an `Idle` major compaction may proceed.
    pub(crate) majc_compactall_idletime: Duration,
}

impl Default for TableOption {
    fn default() -> Self {
        Self {
            compaction_strategy: "size-ratio".into(),
            strategy_options: HashMap::new(),
            majc_compactall_idletime: Duration::from_secs(60 * 60),
        }
    }
}

impl TableOption {
    /// Name of the compaction strategy to construct per decision.
    pub fn compaction_strategy(self, compaction_strategy: impl Into<String>) -> Self {
        TableOption {
            compaction_strategy: compaction_strategy.into(),
            ..self
        }
    }

    /// Set one strategy option.
    pub fn strategy_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.strategy_options.insert(key.into(), value.into());
        self
    }

    /// Idle threshold for `Idle`-reason major compactions.
    pub fn majc_compactall_idletime(self, majc_compactall_idletime: Duration) -> Self {
        TableOption {
            majc_compactall_idletime,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_source_reads_see_updates() {
        let config = ConfigSource::new(ServerOption::default().minc_max_concurrent(4));
        assert_eq!(config.get(|o| o.minc_max_concurrent), 4);

        config.update(|o| o.minc_max_concurrent = 9);
        assert_eq!(config.get(|o| o.minc_max_concurrent), 9);
    }

    #[test]
    fn builder_chains_keep_other_fields() {
        let option = ServerOption::default()
            .max_inmem_bytes(42)
            .rpc_timeout(Duration::from_secs(1));
        assert_eq!(option.max_inmem_bytes, 42);
        assert_eq!(option.rpc_timeout, Duration::from_secs(1));
        assert_eq!(option.memory_policy, "largest-first");
    }
}
