//! Fixed-size worker pool with deferred-task recovery across restarts.
//!
//! The pool owns a run/stop state machine and two queues guarded by one
//! mutex:
//!
//! - the *pending* queue, claimed FIFO by worker threads while the pool is
//!   `Running` (and drained to empty while `Finishing`);
//! - the *deferred* queue, holding tasks submitted while the pool is not
//!   running plus tasks still pending when `stop()` cut a run short. At
//!   `start()` every deferred task moves to the front of the pending queue
//!   in original submission order, so a stop/start cycle loses nothing and
//!   reorders nothing.
//!
//! Workers hold the queue mutex only to claim a task; execution happens
//! outside the lock, so long-running tasks never serialize unrelated queue
//! operations. A panicking task is contained at the task boundary — pool
//! size is invariant for the life of the pool.

use crate::task::{execute_contained, Task};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Pool run state.
///
/// Worker threads exist iff the state is `Running` or `Finishing`; the state
/// returns to `Stopped` only after every worker has been joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Stopped,
    Running,
    Finishing,
    Stopping,
}

struct Queues {
    state: PoolState,
    pending: VecDeque<Box<dyn Task>>,
    deferred: VecDeque<Box<dyn Task>>,
}

struct PoolInner {
    queues: Mutex<Queues>,
    condvar: Condvar,
    thread_name_prefix: String,
}

/// A fixed-size pool of worker threads claiming tasks FIFO from a shared
/// queue.
///
/// All methods are thread safe. Worker threads are created by [`start`] and
/// joined before [`stop`] or [`finish_and_stop`] returns.
///
/// [`start`]: FixedThreadPool::start
/// [`stop`]: FixedThreadPool::stop
/// [`finish_and_stop`]: FixedThreadPool::finish_and_stop
pub struct FixedThreadPool {
    inner: Arc<PoolInner>,
    worker_count: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl FixedThreadPool {
    /// Creates a pool that will run `worker_count` threads once started.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero.
    #[must_use]
    pub fn new(worker_count: usize, thread_name_prefix: impl Into<String>) -> Self {
        assert!(worker_count > 0, "worker_count must be at least 1");
        Self {
            inner: Arc::new(PoolInner {
                queues: Mutex::new(Queues {
                    state: PoolState::Stopped,
                    pending: VecDeque::new(),
                    deferred: VecDeque::new(),
                }),
                condvar: Condvar::new(),
                thread_name_prefix: thread_name_prefix.into(),
            }),
            worker_count,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Starts the pool.
    ///
    /// Moves every deferred task to the pending queue in original order,
    /// spawns the worker threads, and transitions to `Running`. Returns
    /// `false` without doing anything if the pool is not stopped.
    pub fn start(&self) -> bool {
        let mut threads = self.threads.lock();
        {
            let mut queues = self.inner.queues.lock();
            if queues.state != PoolState::Stopped {
                return false;
            }
            // Deferred tasks go ahead of anything submitted after this call.
            while let Some(task) = queues.deferred.pop_front() {
                queues.pending.push_back(task);
            }
            queues.state = PoolState::Running;
        }
        debug!(workers = self.worker_count, "starting thread pool");
        for index in 0..self.worker_count {
            let inner = Arc::clone(&self.inner);
            let name = format!("{}-worker-{index}", self.inner.thread_name_prefix);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn pool worker thread");
            threads.push(handle);
        }
        true
    }

    /// Stops the pool without draining.
    ///
    /// Workers finish the task they are executing (no preemption) and exit
    /// without claiming further work. Pending tasks move to the deferred
    /// queue, preserving order, so they run on the next `start()`. Blocks
    /// until every worker has been joined. Returns `false` if the pool was
    /// not running.
    pub fn stop(&self) -> bool {
        self.stop_as(PoolState::Stopping)
    }

    /// Drains the pending queue, then stops the pool.
    ///
    /// Workers keep claiming tasks until the queue is empty — including
    /// tasks submitted while the drain is in progress — then exit. Blocks
    /// until the queue is drained and every worker has been joined. Returns
    /// `false` if the pool was not running.
    pub fn finish_and_stop(&self) -> bool {
        self.stop_as(PoolState::Finishing)
    }

    fn stop_as(&self, stopping_state: PoolState) -> bool {
        let mut threads = self.threads.lock();
        {
            let mut queues = self.inner.queues.lock();
            if queues.state != PoolState::Running {
                return false;
            }
            queues.state = stopping_state;
            self.inner.condvar.notify_all();
        }
        debug!(?stopping_state, "stopping thread pool");
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                // execute_contained keeps workers alive through task panics,
                // so a panicked worker is a bug in the pool itself.
                error!("pool worker thread panicked");
            }
        }
        let mut queues = self.inner.queues.lock();
        // Unclaimed tasks survive the stop: put them ahead of the deferred
        // queue in their original order.
        while let Some(task) = queues.pending.pop_back() {
            queues.deferred.push_front(task);
        }
        queues.state = PoolState::Stopped;
        true
    }

    /// Returns whether the pool is currently running and accepting tasks.
    #[must_use]
    pub fn running(&self) -> bool {
        self.inner.queues.lock().state == PoolState::Running
    }

    /// Submits a task.
    ///
    /// If the pool is running the task joins the pending queue and one
    /// waiting worker is woken; otherwise it joins the deferred queue and
    /// runs after the next `start()`. Ownership transfers to the pool.
    pub fn submit(&self, task: impl Task + 'static) {
        self.submit_boxed(Box::new(task));
    }

    /// Submits an already-boxed task.
    pub fn submit_boxed(&self, task: Box<dyn Task>) {
        let mut queues = self.inner.queues.lock();
        if queues.state == PoolState::Running {
            queues.pending.push_back(task);
            self.inner.condvar.notify_one();
        } else {
            queues.deferred.push_back(task);
        }
    }

    /// Discards every pending (not yet claimed) task.
    ///
    /// Tasks already claimed by a worker and tasks in the deferred queue are
    /// unaffected.
    pub fn clear(&self) {
        let mut queues = self.inner.queues.lock();
        let discarded = queues.pending.len();
        queues.pending.clear();
        if discarded > 0 {
            debug!(discarded, "cleared pending tasks");
        }
    }

    /// Number of tasks waiting in the pending queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queues.lock().pending.len()
    }

    /// Number of tasks parked in the deferred queue.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.inner.queues.lock().deferred.len()
    }
}

impl Drop for FixedThreadPool {
    fn drop(&mut self) {
        // Forced stop: in-flight tasks finish naturally, nothing new is
        // claimed, and deferred tasks are discarded with the pool.
        let _ = self.stop();
    }
}

impl fmt::Debug for FixedThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.inner.queues.lock();
        f.debug_struct("FixedThreadPool")
            .field("state", &queues.state)
            .field("workers", &self.worker_count)
            .field("pending", &queues.pending.len())
            .field("deferred", &queues.deferred.len())
            .finish()
    }
}

/// Claims the next task, blocking while the pool is running and idle.
///
/// Returns `None` when the worker should exit: the state left `Running`
/// (and, for `Finishing`, the queue has drained).
fn claim_task(inner: &PoolInner) -> Option<Box<dyn Task>> {
    let mut queues = inner.queues.lock();
    loop {
        match queues.state {
            PoolState::Running => {
                if let Some(task) = queues.pending.pop_front() {
                    return Some(task);
                }
                inner.condvar.wait(&mut queues);
            }
            PoolState::Finishing => return queues.pending.pop_front(),
            PoolState::Stopping | PoolState::Stopped => return None,
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    trace!("pool worker started");
    while let Some(task) = claim_task(inner) {
        let name = task.describe().to_owned();
        // Execution happens outside the queue lock.
        if let Err(panic) = execute_contained(task) {
            // Callable tasks have already recorded the failure in their call
            // slot by this point; this is the backstop for fire-and-forget
            // tasks.
            error!(task = %name, panic = %panic, "task panicked; worker continues");
        }
    }
    trace!("pool worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    /// Pool with one worker: claim order is observation order.
    fn ordered_pool() -> FixedThreadPool {
        FixedThreadPool::new(1, "test")
    }

    fn record(order: &Arc<Mutex<Vec<usize>>>, value: usize) -> impl FnOnce() + Send + 'static {
        let order = Arc::clone(order);
        move || order.lock().push(value)
    }

    #[test]
    fn start_moves_deferred_tasks_in_order() {
        let pool = ordered_pool();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=5 {
            pool.submit(record(&order, i));
        }
        assert_eq!(pool.deferred_count(), 5);
        assert!(pool.start());
        assert!(pool.finish_and_stop());

        assert_eq!(*order.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn fifo_claim_order_while_running() {
        let pool = ordered_pool();
        assert!(pool.start());

        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Barrier::new(2));
        let gate_clone = Arc::clone(&gate);
        // Hold the worker so every submission lands in the queue first.
        pool.submit(move || {
            gate_clone.wait();
        });
        for i in 1..=10 {
            pool.submit(record(&order, i));
        }
        gate.wait();

        assert!(pool.finish_and_stop());
        assert_eq!(*order.lock(), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn start_when_running_is_rejected() {
        let pool = ordered_pool();
        assert!(pool.start());
        assert!(!pool.start());
        assert!(pool.stop());
    }

    #[test]
    fn stop_when_stopped_is_rejected() {
        let pool = ordered_pool();
        assert!(!pool.stop());
        assert!(!pool.finish_and_stop());
    }

    #[test]
    fn stop_preserves_unclaimed_tasks_for_next_start() {
        let pool = ordered_pool();
        assert!(pool.start());

        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Barrier::new(2));
        let gate_clone = Arc::clone(&gate);
        pool.submit(move || {
            gate_clone.wait();
            // Keep the worker busy long enough for stop() to begin.
            std::thread::sleep(Duration::from_millis(50));
        });
        gate.wait();
        for i in 1..=3 {
            pool.submit(record(&order, i));
        }

        assert!(pool.stop());
        assert!(order.lock().is_empty(), "stop() must not drain");
        assert_eq!(pool.deferred_count(), 3);

        assert!(pool.start());
        assert!(pool.finish_and_stop());
        assert_eq!(*order.lock(), vec![1, 2, 3], "tasks run once, in order");
    }

    #[test]
    fn finish_and_stop_drains_everything() {
        let pool = ordered_pool();
        assert!(pool.start());

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(pool.finish_and_stop());
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert!(!pool.running());
    }

    #[test]
    fn tasks_submitted_during_drain_still_execute() {
        let pool = ordered_pool();
        assert!(pool.start());

        let counter = Arc::new(AtomicUsize::new(0));
        let pool_submitting = {
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        };
        // A task that submits another task cannot reach the pool from inside
        // itself without a handle; emulate a mid-drain submission by racing a
        // submitter thread against finish_and_stop.
        let gate = Arc::new(Barrier::new(2));
        let gate_clone = Arc::clone(&gate);
        pool.submit(move || {
            gate_clone.wait();
            std::thread::sleep(Duration::from_millis(20));
        });
        gate.wait();
        pool.submit(pool_submitting);

        assert!(pool.finish_and_stop());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn running_reflects_state() {
        let pool = ordered_pool();
        assert!(!pool.running());
        assert!(pool.start());
        assert!(pool.running());
        assert!(pool.stop());
        assert!(!pool.running());
    }

    #[test]
    fn clear_discards_pending_only() {
        let pool = ordered_pool();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Deferred tasks are untouched by clear().
        pool.submit(record(&order, 1));
        pool.clear();
        assert_eq!(pool.deferred_count(), 1);

        assert!(pool.start());
        let gate = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        {
            let gate = Arc::clone(&gate);
            let release = Arc::clone(&release);
            pool.submit(move || {
                gate.wait();
                release.wait();
            });
        }
        gate.wait();
        pool.submit(record(&order, 2));
        pool.submit(record(&order, 3));
        pool.clear();
        assert_eq!(pool.pending_count(), 0);
        release.wait();

        assert!(pool.finish_and_stop());
        // Task 1 ran at start; 2 and 3 were discarded while pending.
        assert_eq!(*order.lock(), vec![1]);
    }

    #[test]
    fn panicking_task_does_not_shrink_pool() {
        let pool = ordered_pool();
        assert!(pool.start());

        pool.submit(|| panic!("deliberate task panic"));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(pool.finish_and_stop());
        assert_eq!(
            counter.load(Ordering::Relaxed),
            5,
            "worker must survive the panic and keep draining"
        );
    }

    #[test]
    fn drop_stops_without_draining() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ordered_pool();
            assert!(pool.start());
            let gate = Arc::new(Barrier::new(2));
            let gate_clone = Arc::clone(&gate);
            pool.submit(move || {
                gate_clone.wait();
                std::thread::sleep(Duration::from_millis(30));
            });
            gate.wait();
            for _ in 0..4 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            // Dropped here: the in-flight task finishes, queued ones do not.
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn concurrent_submitters_all_execute() {
        let pool = Arc::new(FixedThreadPool::new(4, "stress"));
        assert!(pool.start());

        let counter = Arc::new(AtomicUsize::new(0));
        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let counter = Arc::clone(&counter);
                        pool.submit(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();
        for s in submitters {
            s.join().expect("submitter");
        }

        assert!(pool.finish_and_stop());
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }
}
