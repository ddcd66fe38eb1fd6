//! # Adaptive Worker Pool
//!
//! A pool of tokio worker tasks draining one FIFO job channel. The pool
//! adapts to consumption: a monitor task keeps the worker count at or above
//! the floor and spawns extra workers when too few are idle, while idle
//! workers above the floor retire after a drain timeout.
//!
//! Tasks may be one-shot or infinite. An infinite task is re-enqueued after
//! every completed execution until its stop token is cancelled; the token is
//! handed to the target on every run so long-running bodies can wind down at
//! their natural iteration boundary.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{AgentError, AgentResult};

/// How long an idle worker above the floor waits for work before retiring.
const IDLE_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Monitor wake interval when no submissions arrive.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// The future a task target produces for one execution.
pub type TaskFuture = BoxFuture<'static, AgentResult<()>>;

type TaskTarget = Box<dyn FnMut(CancellationToken) -> TaskFuture + Send>;
type SuccessCallback = Box<dyn Fn() + Send + Sync>;
type FailureCallback = Box<dyn Fn(&Failure) + Send + Sync>;

/// Diagnostic record handed to a task's failure callback.
#[derive(Debug)]
pub struct Failure {
    pub task_id: Uuid,
    pub error: AgentError,
}

/// A unit of work for the pool.
pub struct Task {
    id: Uuid,
    target: TaskTarget,
    success: Option<SuccessCallback>,
    failure: Option<FailureCallback>,
    infinite: bool,
    token: CancellationToken,
}

impl Task {
    /// Create a one-shot task. The target receives the task's stop token on
    /// every execution.
    pub fn new<F>(target: F) -> Self
    where
        F: FnMut(CancellationToken) -> TaskFuture + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            target: Box::new(target),
            success: None,
            failure: None,
            infinite: false,
            token: CancellationToken::new(),
        }
    }

    /// Mark this task infinite: re-enqueued after each execution until its
    /// stop token is cancelled.
    pub fn infinite(mut self) -> Self {
        self.infinite = true;
        self
    }

    /// Register a callback invoked after a successful execution.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.success = Some(Box::new(callback));
        self
    }

    /// Register a callback invoked with the failure record when the target
    /// errors or panics.
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Failure) + Send + Sync + 'static,
    {
        self.failure = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// A handle that can stop this task from outside the pool.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            token: self.token.clone(),
        }
    }
}

/// Control handle for a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: Uuid,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Signal the task to stop as soon as possible. An infinite task will
    /// not be re-enqueued once stopped.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum PoolJob {
    Run(Task),
    /// Sentinel telling one worker to retire.
    Exit,
}

#[derive(Default)]
struct Counters {
    workers: usize,
    avail: usize,
}

struct PoolInner {
    min_workers: usize,
    job_tx: mpsc::UnboundedSender<PoolJob>,
    job_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PoolJob>>,
    counters: Mutex<Counters>,
    workers_tx: watch::Sender<usize>,
    submitted: Notify,
    stop: CancellationToken,
    running: Mutex<HashMap<Uuid, TaskHandle>>,
}

/// The adaptive worker pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool that keeps at least `min_workers` workers available for
    /// tasks (one extra slot is reserved for the pool's own monitor task).
    /// Must be called from within a tokio runtime.
    pub fn new(min_workers: usize) -> Self {
        let min_workers = min_workers + 1;
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (workers_tx, _) = watch::channel(0usize);
        let inner = Arc::new(PoolInner {
            min_workers,
            job_tx,
            job_rx: tokio::sync::Mutex::new(job_rx),
            counters: Mutex::new(Counters::default()),
            workers_tx,
            submitted: Notify::new(),
            stop: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
        });
        inner.spawn_workers(min_workers);

        let pool = Self { inner };
        let monitor_inner = pool.inner.clone();
        let monitor = Task::new(move |token| {
            let inner = monitor_inner.clone();
            async move { inner.monitor_once(token).await }.boxed()
        })
        .infinite();
        pool.run(monitor);
        pool
    }

    /// Submit a task. Returns a handle that can stop it.
    pub fn run(&self, task: Task) -> TaskHandle {
        let handle = task.handle();
        self.inner.submitted.notify_one();
        if self.inner.job_tx.send(PoolJob::Run(task)).is_err() {
            debug!(task_id = %handle.id(), "pool is shut down; task dropped");
        }
        handle
    }

    /// Total workers currently alive.
    pub fn workers(&self) -> usize {
        self.inner.counters.lock().expect("pool counters").workers
    }

    /// Workers currently idle.
    pub fn available_workers(&self) -> usize {
        self.inner.counters.lock().expect("pool counters").avail
    }

    /// Stop the pool: signals every running task, retires every worker, and
    /// waits up to `wait` (forever when `None`) for the last worker to exit.
    /// Returns whether full shutdown was observed.
    pub async fn remove_all_workers(&self, wait: Option<Duration>) -> bool {
        self.inner.stop.cancel();

        let workers = self.workers();
        for _ in 0..workers {
            let _ = self.inner.job_tx.send(PoolJob::Exit);
        }
        self.inner.submitted.notify_one();

        let running: Vec<TaskHandle> = self
            .inner
            .running
            .lock()
            .expect("running task registry")
            .values()
            .cloned()
            .collect();
        for handle in running {
            handle.stop();
        }

        let mut workers_rx = self.inner.workers_tx.subscribe();
        let all_died = workers_rx.wait_for(|count| *count == 0);
        match wait {
            Some(duration) => matches!(tokio::time::timeout(duration, all_died).await, Ok(Ok(_))),
            None => all_died.await.is_ok(),
        }
    }
}

impl PoolInner {
    fn spawn_workers(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let inner = self.clone();
            tokio::spawn(async move { inner.worker_loop().await });
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        self.worker_started();
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let received = {
                let mut rx = self.job_rx.lock().await;
                tokio::time::timeout(IDLE_EXIT_TIMEOUT, rx.recv()).await
            };
            let task = match received {
                // Idle too long: retire, but never below the floor.
                Err(_) => {
                    if self.worker_count() > self.min_workers {
                        break;
                    }
                    continue;
                }
                Ok(None) | Ok(Some(PoolJob::Exit)) => break,
                Ok(Some(PoolJob::Run(task))) => task,
            };
            self.run_task(task).await;
        }
        self.worker_exited();
    }

    async fn run_task(self: &Arc<Self>, mut task: Task) {
        {
            let mut counters = self.counters.lock().expect("pool counters");
            counters.avail -= 1;
        }
        self.running
            .lock()
            .expect("running task registry")
            .insert(task.id, task.handle());

        let execution = AssertUnwindSafe((task.target)(task.token.clone()))
            .catch_unwind()
            .await;

        self.running
            .lock()
            .expect("running task registry")
            .remove(&task.id);

        match execution {
            Ok(Ok(())) => {
                if let Some(callback) = &task.success {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                        error!(task_id = %task.id, "success callback raised an error");
                    }
                }
            }
            Ok(Err(error)) => self.dispatch_failure(&task, error),
            Err(panic) => {
                self.dispatch_failure(&task, AgentError::task(panic_message(panic.as_ref())))
            }
        }

        if task.infinite && !task.token.is_cancelled() {
            let _ = self.job_tx.send(PoolJob::Run(task));
        }

        {
            let mut counters = self.counters.lock().expect("pool counters");
            counters.avail += 1;
        }
    }

    fn dispatch_failure(&self, task: &Task, error: AgentError) {
        let failure = Failure {
            task_id: task.id,
            error,
        };
        match &task.failure {
            Some(callback) => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&failure))).is_err() {
                    error!(task_id = %task.id, "failure callback raised an error");
                }
            }
            None => {
                error!(
                    task_id = %task.id,
                    error = %failure.error,
                    "unhandled error occurred on task"
                );
            }
        }
    }

    /// One monitor pass: top the pool up, then sleep until the next
    /// submission, the poll interval, or shutdown.
    async fn monitor_once(self: &Arc<Self>, token: CancellationToken) -> AgentResult<()> {
        let (workers, avail) = {
            let counters = self.counters.lock().expect("pool counters");
            (counters.workers, counters.avail)
        };
        if workers < self.min_workers {
            self.spawn_workers(self.min_workers - workers);
        }
        if avail < self.min_workers {
            // Spawn roughly half the busy count so bursts grow the pool
            // without doubling it on every pass.
            let deficit = workers.abs_diff(avail);
            self.spawn_workers(deficit.div_ceil(2));
        }

        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.submitted.notified() => {}
            _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
        }
        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.counters.lock().expect("pool counters").workers
    }

    fn worker_started(&self) {
        let mut counters = self.counters.lock().expect("pool counters");
        counters.workers += 1;
        counters.avail += 1;
        self.workers_tx.send_replace(counters.workers);
    }

    fn worker_exited(&self) {
        let mut counters = self.counters.lock().expect("pool counters");
        counters.workers -= 1;
        counters.avail = counters.avail.saturating_sub(1);
        self.workers_tx.send_replace(counters.workers);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
