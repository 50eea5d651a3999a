//! Bounded, named worker pools with live resizing.
//!
//! Each pool owns its worker threads and a single queue. Workers above the
//! core count retire after the keep-alive expires; shrinking a pool takes
//! effect as workers go idle. A panicking task is logged and never takes its
//! worker down.

pub(crate) mod queue;
pub(crate) mod registry;

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::Span;

use crate::{
    error::ResourceError,
    observability::{log_error, log_info},
};
pub use queue::QueueKind;
use queue::{PoolTask, TaskQueue};

/// Describes one worker pool: name, worker bounds, and queue discipline.
#[derive(Clone, Debug)]
pub struct PoolSpec {
    pub(crate) name: String,
    pub(crate) core: usize,
    pub(crate) max: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) queue: QueueKind,
}

impl PoolSpec {
    /// Fixed-size pool: `size` workers that never retire.
    pub fn fixed(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            core: size,
            max: size,
            keep_alive: Duration::ZERO,
            queue: QueueKind::Fifo,
        }
    }

    /// On-demand pool: workers spawn up to `max` and retire after
    /// `keep_alive` idle.
    pub fn cached(name: impl Into<String>, max: usize, keep_alive: Duration) -> Self {
        Self {
            name: name.into(),
            core: 0,
            max,
            keep_alive,
            queue: QueueKind::Fifo,
        }
    }

    /// Override the queue discipline.
    pub fn queue(self, queue: QueueKind) -> Self {
        Self { queue, ..self }
    }
}

struct PoolState {
    queue: TaskQueue,
    core: usize,
    max: usize,
    live: usize,
    shutdown: bool,
}

struct PoolInner {
    name: String,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    has_work: Condvar,
    terminated: Condvar,
    seq: AtomicU64,
}

/// A named worker pool.
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool").finish_non_exhaustive()
    }
}

impl TaskPool {
    pub(crate) fn new(spec: PoolSpec) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: TaskQueue::new(spec.queue),
                    core: spec.core,
                    max: spec.max,
                    live: 0,
                    shutdown: false,
                }),
                name: spec.name,
                keep_alive: spec.keep_alive,
                has_work: Condvar::new(),
                terminated: Condvar::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a task. `rank` orders priority queues and is ignored by FIFO
    /// pools. The current tracing span is captured and entered by the worker.
    pub(crate) fn submit(
        &self,
        rank: u64,
        job: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<(), ResourceError> {
        let task = PoolTask {
            job,
            span: Span::current(),
            rank,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(ResourceError::PoolClosed(self.inner.name.clone()));
        }
        state.queue.push(task);
        if state.live < state.core || (state.live == 0 && state.max > 0) {
            spawn_worker(&self.inner, &mut state);
        }
        drop(state);
        self.inner.has_work.notify_one();
        Ok(())
    }

    /// Current maximum worker count.
    pub(crate) fn max_size(&self) -> usize {
        self.inner.state.lock().max
    }

    /// Adjust both the core and maximum worker count. Growing spawns workers
    /// for already-queued tasks; shrinking takes effect as workers go idle.
    pub(crate) fn set_size(&self, size: usize) {
        let mut state = self.inner.state.lock();
        let grow = size.saturating_sub(state.core);
        state.core = size;
        state.max = size;
        let mut spawn = grow.min(state.queue.len());
        while spawn > 0 && state.live < state.core {
            spawn_worker(&self.inner, &mut state);
            spawn -= 1;
        }
        drop(state);
        // Surplus idle workers re-evaluate their keep-alive and retire.
        self.inner.has_work.notify_all();
    }

    /// Stop accepting tasks. Queued tasks still run; workers exit once the
    /// queue drains.
    pub(crate) fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        drop(state);
        self.inner.has_work.notify_all();
        self.inner.terminated.notify_all();
    }

    /// Wait up to `timeout` for every worker to exit after shutdown.
    pub(crate) fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !(state.shutdown && state.live == 0) {
            if self
                .inner
                .terminated
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.shutdown && state.live == 0;
            }
        }
        true
    }

    /// Shut down and wait, re-logging every 60 s until workers exit.
    pub(crate) fn shutdown_and_wait(&self) {
        self.shutdown();
        while !self.await_termination(Duration::from_secs(60)) {
            log_info!(
                component = "pool",
                event = "awaiting_pool_shutdown",
                pool = %self.inner.name,
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn workers(&self) -> usize {
        self.inner.state.lock().live
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) {
    state.live += 1;
    let worker_inner = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name(format!("{}-worker", inner.name))
        .spawn(move || worker_loop(worker_inner));
    if let Err(error) = spawned {
        state.live -= 1;
        log_error!(
            component = "pool",
            event = "worker_spawn_failed",
            pool = %inner.name,
            error = %error,
        );
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if let Some(task) = state.queue.pop() {
                    break Some(task);
                }
                if state.shutdown {
                    break None;
                }
                if state.live > state.core {
                    let timed_out = inner
                        .has_work
                        .wait_for(&mut state, inner.keep_alive)
                        .timed_out();
                    if timed_out
                        && state.live > state.core
                        && state.queue.is_empty()
                        && !state.shutdown
                    {
                        break None;
                    }
                } else {
                    inner.has_work.wait(&mut state);
                }
            }
        };
        let Some(task) = task else { break };
        run_task(&inner, task);
    }

    let mut state = inner.state.lock();
    state.live -= 1;
    if state.live == 0 {
        inner.terminated.notify_all();
    }
}

fn run_task(inner: &Arc<PoolInner>, task: PoolTask) {
    let PoolTask { job, span, .. } = task;
    let _entered = span.enter();
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        log_error!(
            component = "pool",
            event = "task_panicked",
            pool = %inner.name,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    use super::*;

    fn drain_order(rx: &mpsc::Receiver<u64>) -> Vec<u64> {
        let mut order = Vec::new();
        while let Ok(value) = rx.recv_timeout(Duration::from_secs(5)) {
            order.push(value);
            if order.len() == 3 {
                break;
            }
        }
        order
    }

    #[test]
    fn fifo_pool_runs_tasks_in_submission_order() {
        let pool = TaskPool::new(PoolSpec::fixed("test-fifo", 1));
        let (tx, rx) = mpsc::channel();
        for value in [1u64, 2, 3] {
            let tx = tx.clone();
            pool.submit(0, Box::new(move || tx.send(value).unwrap()))
                .unwrap();
        }
        assert_eq!(drain_order(&rx), vec![1, 2, 3]);
        pool.shutdown_and_wait();
    }

    #[test]
    fn priority_pool_runs_highest_rank_first() {
        let pool =
            TaskPool::new(PoolSpec::fixed("test-priority", 1).queue(QueueKind::Priority));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        // Occupy the single worker so subsequent tasks queue up.
        pool.submit(
            u64::MAX,
            Box::new(move || {
                gate_rx.recv().unwrap();
            }),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        for rank in [3u64, 10, 5] {
            let tx = tx.clone();
            pool.submit(rank, Box::new(move || tx.send(rank).unwrap()))
                .unwrap();
        }
        gate_tx.send(()).unwrap();
        assert_eq!(drain_order(&rx), vec![10, 5, 3]);
        pool.shutdown_and_wait();
    }

    #[test]
    fn shutdown_rejects_new_tasks_but_drains_queue() {
        let pool = TaskPool::new(PoolSpec::fixed("test-drain", 1));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            pool.submit(
                0,
                Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }
        pool.shutdown();
        let rejected = pool.submit(0, Box::new(|| {}));
        assert!(matches!(rejected, Err(ResourceError::PoolClosed(_))));
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn resize_grows_concurrency() {
        let pool = TaskPool::new(PoolSpec::fixed("test-resize", 1));
        pool.set_size(4);

        let barrier = Arc::new(Barrier::new(5));
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            pool.submit(
                0,
                Box::new(move || {
                    barrier.wait();
                }),
            )
            .unwrap();
        }
        // All four tasks must be running concurrently for this to return.
        barrier.wait();
        pool.shutdown_and_wait();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = TaskPool::new(PoolSpec::fixed("test-panic", 1));
        pool.submit(0, Box::new(|| panic!("task failure")))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(0, Box::new(move || tx.send(1u64).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        pool.shutdown_and_wait();
    }

    #[test]
    fn cached_pool_spawns_on_demand() {
        let pool = TaskPool::new(PoolSpec::cached(
            "test-cached",
            1,
            Duration::from_secs(60),
        ));
        assert_eq!(pool.workers(), 0);
        let (tx, rx) = mpsc::channel();
        pool.submit(0, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.workers(), 1);
        pool.shutdown_and_wait();
    }
}
