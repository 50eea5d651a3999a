//! Named registry of worker pools with coordinated shutdown.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::RwLock;

use super::{PoolSpec, TaskPool};
use crate::{error::ResourceError, observability::log_info};

/// Registry mapping pool id to its worker pool. Names are unique; shutdown
/// walks pools in name order.
pub(crate) struct PoolRegistry {
    pools: RwLock<BTreeMap<String, Arc<TaskPool>>>,
}

impl PoolRegistry {
    pub(crate) fn new() -> Self {
        Self {
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create and register a pool. Rejects duplicate names without touching
    /// the registry.
    pub(crate) fn register(&self, spec: PoolSpec) -> Result<Arc<TaskPool>, ResourceError> {
        let mut pools = self.pools.write();
        if pools.contains_key(&spec.name) {
            return Err(ResourceError::Configuration(format!(
                "cannot create two task pools with same name {}",
                spec.name
            )));
        }
        let name = spec.name.clone();
        let pool = Arc::new(TaskPool::new(spec));
        pools.insert(name, Arc::clone(&pool));
        Ok(pool)
    }

    /// Shut down every pool, then wait for each in turn, re-logging every
    /// 60 s until its workers exit.
    pub(crate) fn close(&self) {
        let pools: Vec<(String, Arc<TaskPool>)> = self
            .pools
            .read()
            .iter()
            .map(|(name, pool)| (name.clone(), Arc::clone(pool)))
            .collect();

        for (_, pool) in &pools {
            pool.shutdown();
        }
        for (name, pool) in &pools {
            while !pool.await_termination(Duration::from_secs(60)) {
                log_info!(
                    component = "pool",
                    event = "awaiting_pool_shutdown",
                    pool = %name,
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pools.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_name_is_rejected_and_registry_unchanged() {
        let registry = PoolRegistry::new();
        registry.register(PoolSpec::fixed("split", 1)).unwrap();
        let err = registry.register(PoolSpec::fixed("split", 2)).unwrap_err();
        assert!(matches!(err, ResourceError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn close_terminates_all_pools() {
        let registry = PoolRegistry::new();
        let pool = registry.register(PoolSpec::fixed("assignment", 1)).unwrap();
        pool.submit(0, Box::new(|| {})).unwrap();
        registry.close();
        assert!(matches!(
            pool.submit(0, Box::new(|| {})),
            Err(ResourceError::PoolClosed(_))
        ));
    }
}
