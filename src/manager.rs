//! The tablet-server resource manager.
//!
//! Multiplexes one server's CPU, memory, file-descriptor, and block-cache
//! budgets across every hosted tablet: routes background work to the right
//! bounded pool, keeps aggregate memtable usage under the configured
//! ceiling, and asserts back-pressure on writers when it is not.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    cache::BlockCache,
    controller::{MemoryController, SharedPolicy},
    error::ResourceError,
    extent::{TabletId, TabletKind},
    files::{FileManager, Volume},
    handle::TabletResources,
    observability::{log_error, log_info, log_warn},
    option::{ConfigSource, ServerOption, TableOption},
    policy::MemoryPolicyRegistry,
    pool::{PoolSpec, QueueKind, TaskPool, registry::PoolRegistry},
    strategy::StrategyRegistry,
    time::{Clock, SystemClock},
};

const STOP_POLL: Duration = Duration::from_millis(50);

/// The fixed pool catalogue. Names are contracts.
pub(crate) struct PoolSet {
    pub(crate) minor_compact: Arc<TaskPool>,
    pub(crate) major_compact: Arc<TaskPool>,
    pub(crate) meta_major_compact: Arc<TaskPool>,
    pub(crate) root_major_compact: Arc<TaskPool>,
    pub(crate) split: Arc<TaskPool>,
    pub(crate) meta_split: Arc<TaskPool>,
    pub(crate) migrate: Arc<TaskPool>,
    pub(crate) meta_migrate: Arc<TaskPool>,
    pub(crate) assignment: Arc<TaskPool>,
    pub(crate) meta_assignment: Arc<TaskPool>,
    pub(crate) read_ahead: Arc<TaskPool>,
    pub(crate) meta_read_ahead: Arc<TaskPool>,
}

pub(crate) struct ManagerShared {
    pub(crate) config: ConfigSource,
    pub(crate) registry: PoolRegistry,
    pub(crate) pools: PoolSet,
    pub(crate) data_cache: Arc<BlockCache>,
    pub(crate) index_cache: Arc<BlockCache>,
    pub(crate) file_manager: Arc<dyn FileManager>,
    pub(crate) volume: Arc<dyn Volume>,
    pub(crate) controller: MemoryController,
    pub(crate) policy: SharedPolicy,
    pub(crate) strategies: StrategyRegistry,
    pub(crate) handle_close_lock: Mutex<()>,
    pub(crate) clock: Clock,
    pub(crate) stop: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn execute_split(
        &self,
        extent: &TabletId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        match extent.kind() {
            TabletKind::Root => {
                log_warn!(
                    component = "manager",
                    event = "root_split_ignored",
                    "saw request to split root tablet, ignoring",
                );
                Ok(())
            }
            TabletKind::Metadata => self.pools.meta_split.submit(0, Box::new(task)),
            TabletKind::User => self.pools.split.submit(0, Box::new(task)),
        }
    }

    pub(crate) fn execute_major_compaction(
        &self,
        extent: &TabletId,
        rank: u64,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        match extent.kind() {
            TabletKind::Root => self.pools.root_major_compact.submit(rank, Box::new(task)),
            TabletKind::Metadata => self.pools.meta_major_compact.submit(rank, Box::new(task)),
            TabletKind::User => self.pools.major_compact.submit(rank, Box::new(task)),
        }
    }

    pub(crate) fn execute_read_ahead(
        &self,
        extent: &TabletId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        match extent.kind() {
            // The root tablet is unique and unpartitionable; it must not
            // wait behind any queue.
            TabletKind::Root => {
                task();
                Ok(())
            }
            TabletKind::Metadata => self.pools.meta_read_ahead.submit(0, Box::new(task)),
            TabletKind::User => self.pools.read_ahead.submit(0, Box::new(task)),
        }
    }

    pub(crate) fn execute_minor_compaction(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.pools.minor_compact.submit(0, Box::new(task))
    }

    pub(crate) fn add_assignment(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.pools.assignment.submit(0, Box::new(task))
    }

    pub(crate) fn add_metadata_assignment(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.pools.meta_assignment.submit(0, Box::new(task))
    }

    pub(crate) fn add_migration(
        &self,
        extent: &TabletId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        match extent.kind() {
            TabletKind::Root => {
                task();
                Ok(())
            }
            TabletKind::Metadata => self.pools.meta_migrate.submit(0, Box::new(task)),
            TabletKind::User => self.pools.migrate.submit(0, Box::new(task)),
        }
    }

    /// Re-read every config-driven pool size and apply changes as both the
    /// core and maximum worker count.
    pub(crate) fn apply_pool_sizes(&self) {
        let checks: [(&Arc<TaskPool>, &str, fn(&ServerOption) -> usize); 5] = [
            (
                &self.pools.minor_compact,
                "minc.maxconcurrent",
                |o| o.minc_max_concurrent,
            ),
            (
                &self.pools.major_compact,
                "majc.maxconcurrent",
                |o| o.majc_max_concurrent,
            ),
            (
                &self.pools.migrate,
                "migrate.maxconcurrent",
                |o| o.migrate_max_concurrent,
            ),
            (
                &self.pools.read_ahead,
                "readahead.maxconcurrent",
                |o| o.read_ahead_max_concurrent,
            ),
            (
                &self.pools.meta_read_ahead,
                "metadata.readahead.maxconcurrent",
                |o| o.metadata_read_ahead_max_concurrent,
            ),
        ];
        for (pool, property, read) in checks {
            let max = self.config.get(read);
            if pool.max_size() != max {
                log_info!(
                    component = "pool",
                    event = "pool_resized",
                    property = property,
                    max = max,
                );
                pool.set_size(max);
            }
        }
    }
}

/// Builder for [`ResourceManager`].
pub struct ResourceManagerBuilder {
    option: ServerOption,
    file_manager: Option<Arc<dyn FileManager>>,
    volume: Option<Arc<dyn Volume>>,
    policies: MemoryPolicyRegistry,
    strategies: StrategyRegistry,
    clock: Clock,
}

impl ResourceManagerBuilder {
    /// The server's file layer; required.
    pub fn file_manager(mut self, file_manager: Arc<dyn FileManager>) -> Self {
        self.file_manager = Some(file_manager);
        self
    }

    /// File storage access for compaction strategies; required.
    pub fn volume(mut self, volume: Arc<dyn Volume>) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Register a custom memory policy constructor.
    pub fn register_policy(
        mut self,
        name: impl Into<String>,
        ctor: crate::policy::PolicyCtor,
    ) -> Self {
        self.policies.register(name, ctor);
        self
    }

    /// Register a custom compaction strategy constructor.
    pub fn register_strategy(
        mut self,
        name: impl Into<String>,
        ctor: crate::strategy::StrategyCtor,
    ) -> Self {
        self.strategies.register(name, ctor);
        self
    }

    /// Replace the clock; used by tests.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Validate configuration, build the pool catalogue and caches, and
    /// start the controller and reconfiguration threads.
    pub fn build(self) -> Result<ResourceManager, ResourceError> {
        self.build_inner(true)
    }

    #[cfg(test)]
    pub(crate) fn build_unstarted(self) -> Result<ResourceManager, ResourceError> {
        self.build_inner(false)
    }

    fn build_inner(self, start: bool) -> Result<ResourceManager, ResourceError> {
        let file_manager = self.file_manager.ok_or_else(|| {
            ResourceError::Configuration("file manager not provided".into())
        })?;
        let volume = self
            .volume
            .ok_or_else(|| ResourceError::Configuration("volume not provided".into()))?;

        let option = self.option;
        let max_mem = option.max_inmem_bytes;
        let cache_bytes = option.data_cache_bytes + option.index_cache_bytes;
        if let Some(limit) = option.process_memory_limit {
            if !option.native_map_enabled && max_mem + cache_bytes > limit {
                return Err(ResourceError::Configuration(format!(
                    "maximum tablet server map memory {max_mem} and block cache sizes \
                     {cache_bytes} are too large for this process configuration {limit}"
                )));
            }
            if max_mem + cache_bytes > limit {
                log_warn!(
                    component = "manager",
                    event = "map_memory_overcommitted",
                    "in-memory map may not fit into local memory space",
                );
            }
        }

        let data_cache = Arc::new(BlockCache::new(
            option.data_cache_bytes,
            option.default_block_size,
        ));
        let index_cache = Arc::new(BlockCache::new(
            option.index_cache_bytes,
            option.default_block_size,
        ));

        let registry = PoolRegistry::new();
        let minor_compact =
            registry.register(PoolSpec::fixed("minor-compact", option.minc_max_concurrent))?;
        // The major-compaction pool runs tablets with the most files first.
        let major_compact = registry.register(
            PoolSpec::fixed("major-compact", option.majc_max_concurrent)
                .queue(QueueKind::Priority),
        )?;
        let meta_major_compact = registry.register(PoolSpec::cached(
            "meta-major-compact",
            1,
            Duration::from_secs(300),
        ))?;
        let root_major_compact = registry.register(PoolSpec::cached(
            "root-major-compact",
            1,
            Duration::from_secs(300),
        ))?;
        let split = registry.register(PoolSpec::fixed("split", 1))?;
        let meta_split =
            registry.register(PoolSpec::cached("meta-split", 1, Duration::from_secs(60)))?;
        let migrate =
            registry.register(PoolSpec::fixed("migrate", option.migrate_max_concurrent))?;
        let meta_migrate =
            registry.register(PoolSpec::cached("meta-migrate", 1, Duration::from_secs(60)))?;
        // Concurrent assignments would only add metadata-table load at
        // startup; each server already assigns concurrently with its peers.
        let assignment = registry.register(PoolSpec::fixed("assignment", 1))?;
        let meta_assignment = registry.register(PoolSpec::cached(
            "meta-assignment",
            1,
            Duration::from_secs(60),
        ))?;
        let read_ahead = registry.register(PoolSpec::fixed(
            "read-ahead",
            option.read_ahead_max_concurrent,
        ))?;
        let meta_read_ahead = registry.register(PoolSpec::fixed(
            "meta-read-ahead",
            option.metadata_read_ahead_max_concurrent,
        ))?;

        let config = ConfigSource::new(option.clone());
        let mut policy = self.policies.create(&option.memory_policy)?;
        policy.init(&config);
        let policy: SharedPolicy = Arc::new(Mutex::new(policy));

        let controller =
            MemoryController::new(max_mem, Arc::clone(&policy), Arc::clone(&self.clock));

        let shared = Arc::new(ManagerShared {
            config,
            registry,
            pools: PoolSet {
                minor_compact,
                major_compact,
                meta_major_compact,
                root_major_compact,
                split,
                meta_split,
                migrate,
                meta_migrate,
                assignment,
                meta_assignment,
                read_ahead,
                meta_read_ahead,
            },
            data_cache,
            index_cache,
            file_manager,
            volume,
            controller,
            policy,
            strategies: self.strategies,
            handle_close_lock: Mutex::new(()),
            clock: self.clock,
            stop: AtomicBool::new(false),
        });

        let mut resize_thread = None;
        if start {
            shared.controller.start();
            let resize_shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name("pool-reconfiguration".into())
                .spawn(move || resize_loop(resize_shared))
            {
                Ok(handle) => resize_thread = Some(handle),
                Err(error) => log_error!(
                    component = "pool",
                    event = "resize_thread_spawn_failed",
                    error = %error,
                ),
            }
        }

        Ok(ResourceManager {
            shared,
            resize_thread: Mutex::new(resize_thread),
            closed: AtomicBool::new(false),
        })
    }
}

fn resize_loop(shared: Arc<ManagerShared>) {
    let delay = shared.config.get(|o| o.pool_resize_delay);
    if !sleep_unless_stopped(&shared, delay) {
        return;
    }
    loop {
        if catch_unwind(AssertUnwindSafe(|| shared.apply_pool_sizes())).is_err() {
            log_error!(component = "pool", event = "pool_resize_failed");
        }
        let interval = shared.config.get(|o| o.pool_resize_interval);
        if !sleep_unless_stopped(&shared, interval) {
            return;
        }
    }
}

fn sleep_unless_stopped(shared: &Arc<ManagerShared>, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

/// Per-server resource manager: pool dispatcher, memory controller, and
/// block caches behind one handle.
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
    resize_thread: Mutex<Option<thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager").finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Start building a manager from server options.
    pub fn builder(option: ServerOption) -> ResourceManagerBuilder {
        ResourceManagerBuilder {
            option,
            file_manager: None,
            volume: None,
            policies: MemoryPolicyRegistry::new(),
            strategies: StrategyRegistry::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Live configuration handle; `update` reconfigures pool sizes at
    /// runtime.
    pub fn config(&self) -> ConfigSource {
        self.shared.config.clone()
    }

    /// Create the resource handle a tablet holds for its lifetime.
    pub fn create_tablet_resources(
        &self,
        extent: TabletId,
        table: Arc<TableOption>,
    ) -> Arc<TabletResources> {
        Arc::new(TabletResources::new(
            Arc::downgrade(&self.shared),
            extent,
            table,
            Arc::clone(&self.shared.clock),
        ))
    }

    /// Route a split for `extent`. Root splits are ignored with a warning.
    pub fn execute_split(
        &self,
        extent: &TabletId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.shared.execute_split(extent, task)
    }

    /// Route a major compaction for `extent`; `rank` is the tablet's file
    /// count at submission time and orders the user pool's priority queue.
    pub fn execute_major_compaction(
        &self,
        extent: &TabletId,
        rank: u64,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.shared.execute_major_compaction(extent, rank, task)
    }

    /// Route a read-ahead for `extent`. Root read-aheads run inline on the
    /// calling thread.
    pub fn execute_read_ahead(
        &self,
        extent: &TabletId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.shared.execute_read_ahead(extent, task)
    }

    /// Run a minor compaction through the shared bounded pool.
    pub fn execute_minor_compaction(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.shared.execute_minor_compaction(task)
    }

    /// Queue a user-tablet assignment; assignments run serially.
    pub fn add_assignment(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.shared.add_assignment(task)
    }

    /// Queue a metadata-tablet assignment.
    pub fn add_metadata_assignment(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.shared.add_metadata_assignment(task)
    }

    /// Route a migration for `extent`. Root migrations run inline.
    pub fn add_migration(
        &self,
        extent: &TabletId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ResourceError> {
        self.shared.add_migration(extent, task)
    }

    /// Block the calling writer while commits are held, failing after the
    /// configured RPC timeout.
    pub fn wait_until_commits_enabled(&self) -> Result<(), ResourceError> {
        let rpc_timeout = self.shared.config.get(|o| o.rpc_timeout);
        self.shared
            .controller
            .hold()
            .wait_until_commits_enabled(rpc_timeout)
    }

    /// How long commits have currently been held; zero when not held.
    pub fn hold_time(&self) -> Duration {
        self.shared.controller.hold().hold_time()
    }

    /// The data block cache.
    pub fn data_cache(&self) -> &Arc<BlockCache> {
        &self.shared.data_cache
    }

    /// The index block cache.
    pub fn index_cache(&self) -> &Arc<BlockCache> {
        &self.shared.index_cache
    }

    /// Shut down both split pools and wait for their workers.
    pub fn stop_splits(&self) {
        self.shared.pools.split.shutdown();
        self.shared.pools.meta_split.shutdown();
        self.shared.pools.split.shutdown_and_wait();
        self.shared.pools.meta_split.shutdown_and_wait();
    }

    /// Shut down the user-tablet assignment pool and wait for its workers.
    pub fn stop_normal_assignments(&self) {
        self.shared.pools.assignment.shutdown_and_wait();
    }

    /// Shut down the metadata assignment pool and wait for its workers.
    pub fn stop_metadata_assignments(&self) {
        self.shared.pools.meta_assignment.shutdown_and_wait();
    }

    /// Shut down every pool, stop the controller and reconfiguration
    /// threads, and wait for them all. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registry.close();
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.controller.stop();
        if let Some(handle) = self.resize_thread.lock().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}
