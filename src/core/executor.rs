//! Bounded task executor.
//!
//! A fixed number of worker slots run a registered process function over
//! submitted [`TaskUnit`]s. Submitting blocks only while every slot is busy,
//! and [`BoundedExecutor::hold`] waits for everything submitted since the
//! previous hold.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{ExecutorError, TaskError};

/// One item submitted to the executor.
#[derive(Debug, Clone)]
pub struct TaskUnit<T> {
    pub index: usize,
    pub total: usize,
    pub payload: T,
}

impl<T> TaskUnit<T> {
    pub fn new(index: usize, total: usize, payload: T) -> Self {
        Self {
            index,
            total,
            payload,
        }
    }
}

/// Per-unit execution context handed to the process function.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub name: Arc<str>,
    pub deadline: Instant,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves when the pool is released. Long-running units can select on this.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

type ProcessFn<T> = Arc<dyn Fn(TaskContext, TaskUnit<T>) -> TaskFuture + Send + Sync>;

struct Registered<T> {
    name: Arc<str>,
    func: ProcessFn<T>,
    timeout: Duration,
}

impl<T> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            func: Arc::clone(&self.func),
            timeout: self.timeout,
        }
    }
}

struct Pool {
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Pool {
    fn new(concurrency: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(concurrency)),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }
}

#[derive(Default)]
struct BatchCounters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    cancelled: AtomicUsize,
}

impl BatchCounters {
    fn take(&self) -> BatchReport {
        BatchReport {
            succeeded: self.succeeded.swap(0, Ordering::AcqRel),
            failed: self.failed.swap(0, Ordering::AcqRel),
            timed_out: self.timed_out.swap(0, Ordering::AcqRel),
            cancelled: self.cancelled.swap(0, Ordering::AcqRel),
        }
    }
}

/// Per-batch outcome counts returned by [`BoundedExecutor::hold`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out + self.cancelled
    }

    /// Units that did not complete successfully.
    pub fn unsuccessful(&self) -> usize {
        self.failed + self.timed_out + self.cancelled
    }
}

pub struct BoundedExecutor<T> {
    concurrency: usize,
    pool: Mutex<Pool>,
    process: RwLock<Option<Registered<T>>>,
    counters: Arc<BatchCounters>,
}

impl<T: Send + 'static> BoundedExecutor<T> {
    pub fn new(concurrency: usize) -> Result<Self, ExecutorError> {
        if concurrency == 0 {
            return Err(ExecutorError::InvalidConcurrency);
        }
        Ok(Self {
            concurrency,
            pool: Mutex::new(Pool::new(concurrency)),
            process: RwLock::new(None),
            counters: Arc::new(BatchCounters::default()),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Register the function run for the next batch. Call [`hold`](Self::hold)
    /// first if a previous batch may still be running.
    pub fn set_process_func<F, Fut>(&self, name: &str, func: F, timeout: Duration)
    where
        F: Fn(TaskContext, TaskUnit<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let func: ProcessFn<T> = Arc::new(move |ctx, unit| Box::pin(func(ctx, unit)));
        *self.process.write() = Some(Registered {
            name: Arc::from(name),
            func,
            timeout,
        });
        debug!(task = name, timeout_ms = timeout.as_millis() as u64, "Process function registered");
    }

    /// Submit one unit, waiting for a free worker slot.
    pub async fn invoke(&self, unit: TaskUnit<T>) -> Result<(), ExecutorError> {
        let registered = self
            .process
            .read()
            .clone()
            .ok_or(ExecutorError::NoProcessFunc)?;

        let (slots, cancel) = {
            let pool = self.pool.lock();
            (Arc::clone(&pool.slots), pool.cancel.clone())
        };
        if cancel.is_cancelled() {
            return Err(ExecutorError::Released);
        }

        // Backpressure: the only point where callers block.
        let permit = tokio::select! {
            permit = Arc::clone(&slots).acquire_owned() => permit.map_err(|_| ExecutorError::Released)?,
            _ = cancel.cancelled() => return Err(ExecutorError::Released),
        };

        let counters = Arc::clone(&self.counters);
        let mut pool = self.pool.lock();
        // A release/reboot may have swapped the pool while we waited.
        if pool.cancel.is_cancelled() || !Arc::ptr_eq(&pool.slots, &slots) {
            return Err(ExecutorError::Released);
        }
        pool.tasks.spawn(async move {
            let _permit = permit;
            run_unit(registered, cancel, unit, &counters).await;
        });
        Ok(())
    }

    /// Wait until every unit submitted since the last hold has finished.
    pub async fn hold(&self) -> BatchReport {
        let mut tasks = std::mem::take(&mut self.pool.lock().tasks);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    self.counters.failed.fetch_add(1, Ordering::AcqRel);
                    error!(error = %e, "Task panicked");
                } else {
                    self.counters.cancelled.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        self.counters.take()
    }

    /// Cancel in-flight units and refuse further submissions until [`reboot`](Self::reboot).
    pub fn release(&self) {
        let pool = self.pool.lock();
        pool.cancel.cancel();
        pool.slots.close();
        debug!(in_flight = pool.tasks.len(), "Worker pool released");
    }

    /// Recreate the pool so it can be reused after [`release`](Self::release).
    pub fn reboot(&self) {
        let mut pool = self.pool.lock();
        pool.cancel.cancel();
        pool.slots.close();
        // Dropping the old set aborts anything still parked on its deadline.
        *pool = Pool::new(self.concurrency);
        self.counters.take();
        debug!(concurrency = self.concurrency, "Worker pool rebooted");
    }

    pub fn is_released(&self) -> bool {
        self.pool.lock().cancel.is_cancelled()
    }
}

async fn run_unit<T>(
    registered: Registered<T>,
    cancel: CancellationToken,
    unit: TaskUnit<T>,
    counters: &BatchCounters,
) {
    let index = unit.index;
    let total = unit.total;
    let ctx = TaskContext {
        name: Arc::clone(&registered.name),
        deadline: Instant::now() + registered.timeout,
        cancel: cancel.clone(),
    };
    let fut = (registered.func)(ctx, unit);

    tokio::select! {
        _ = cancel.cancelled() => {
            counters.cancelled.fetch_add(1, Ordering::AcqRel);
            debug!(task = %registered.name, index, total, "Task cancelled");
        }
        outcome = tokio::time::timeout(registered.timeout, fut) => match outcome {
            Ok(Ok(())) => {
                counters.succeeded.fetch_add(1, Ordering::AcqRel);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::AcqRel);
                warn!(task = %registered.name, index, total, error = %e, "Task failed");
            }
            Err(_) => {
                counters.timed_out.fetch_add(1, Ordering::AcqRel);
                warn!(
                    task = %registered.name,
                    index,
                    total,
                    timeout_ms = registered.timeout.as_millis() as u64,
                    "Task timed out"
                );
            }
        },
    }
}
