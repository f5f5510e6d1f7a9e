use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::FutureExt;
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::services::notifier::Notifier;
use crate::services::queue::{Enqueued, Popped, QueuePolicy, WorkQueue};

/// Error type a processing step may return. Contained at the worker loop.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// The per-item processing step plugged into a [`Worker`].
pub trait Processor<T>: Send + 'static {
    fn process(&mut self, item: T) -> impl Future<Output = Result<(), StepError>>;
}

impl<T, F, Fut> Processor<T> for F
where
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), StepError>>,
{
    fn process(&mut self, item: T) -> impl Future<Output = Result<(), StepError>> {
        (self)(item)
    }
}

/// Contract the orchestration layer relies on.
pub trait Task<T> {
    fn start(&mut self) -> Result<(), WorkerError>;
    fn stop(&self);
    fn join(&mut self, timeout: Option<Duration>) -> Result<(), WorkerError>;
    fn enqueue(&self, item: T) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WorkerState {
    Stopped,
    Running,
    StopRequested,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Failed to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Processor was lost with a worker thread that panicked")]
    ProcessorLost,

    #[error("Worker did not exit within {0:?}")]
    JoinTimeout(Duration),

    #[error("Worker thread panicked")]
    Panicked,
}

/// Cloneable producer-side handle to a worker's queue.
pub struct QueueHandle<T> {
    queue: Arc<WorkQueue<T>>,
    name: Arc<str>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            name: Arc::clone(&self.name),
        }
    }
}

impl<T> QueueHandle<T> {
    /// Non-blocking. `false` tells the producer the item was not taken.
    pub fn enqueue(&self, item: T) -> bool {
        let result = self.queue.push(item);
        match result {
            Enqueued::Accepted => {}
            Enqueued::Replaced => {
                tracing::debug!(worker = %self.name, "Pending item overwritten");
                metrics::counter!("work_queue_overwritten_total").increment(1);
            }
            rejected => {
                tracing::debug!(worker = %self.name, reason = ?rejected, "Item rejected");
                metrics::counter!("work_queue_rejected_total").increment(1);
            }
        }
        result.is_accepted()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

struct Running<P> {
    // `None` when the processor never reached the thread.
    handle: JoinHandle<Option<P>>,
    cancel: CancellationToken,
    // Never sent on; disconnects when the worker thread exits.
    exited: mpsc::Receiver<()>,
}

/// Owns one queue and one dedicated thread that feeds queued items, one at
/// a time, through a [`Processor`].
///
/// The step runs to completion before the next item is taken, so state held
/// by the processor is only ever touched from the worker thread.
pub struct Worker<T, P> {
    name: Arc<str>,
    queue: Arc<WorkQueue<T>>,
    notifier: Arc<dyn Notifier>,
    processor: Option<P>,
    running: Option<Running<P>>,
    stack_size: Option<usize>,
}

impl<T, P> Worker<T, P>
where
    T: Send + 'static,
    P: Processor<T>,
{
    pub fn new(
        name: impl Into<String>,
        policy: QueuePolicy,
        processor: P,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            queue: Arc::new(WorkQueue::new(policy)),
            notifier,
            processor: Some(processor),
            running: None,
            stack_size: None,
        }
    }

    /// Stack size for the worker thread. Platform default when unset.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> QueueHandle<T> {
        QueueHandle {
            queue: Arc::clone(&self.queue),
            name: Arc::clone(&self.name),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn state(&self) -> WorkerState {
        match &self.running {
            None => WorkerState::Stopped,
            Some(running) if running.handle.is_finished() => WorkerState::Stopped,
            Some(running) if running.cancel.is_cancelled() || self.queue.is_closed() => {
                WorkerState::StopRequested
            }
            Some(_) => WorkerState::Running,
        }
    }

    /// Processor back after a successful join.
    pub fn processor(&self) -> Option<&P> {
        self.processor.as_ref()
    }

    /// Stop accepting items, finish everything already queued, then exit.
    pub fn close(&self) {
        self.queue.close();
    }

    fn spawn(&mut self) -> Result<(), WorkerError> {
        if self.running.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }
        let Some(processor) = self.processor.take() else {
            return Err(WorkerError::ProcessorLost);
        };
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.processor = Some(processor);
                return Err(WorkerError::Runtime(e));
            }
        };

        let cancel = CancellationToken::new();
        let (exit_guard, exited) = mpsc::channel::<()>();
        // The processor is handed over only once the thread exists, so a
        // failed spawn leaves it with the worker.
        let (handoff, received) = mpsc::sync_channel::<P>(1);
        let ctx = LoopContext {
            name: Arc::clone(&self.name),
            queue: Arc::clone(&self.queue),
            notifier: Arc::clone(&self.notifier),
            cancel: cancel.clone(),
        };

        let mut builder = thread::Builder::new().name(self.name.to_string());
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        let spawned = builder.spawn(move || {
            let _exit_guard = exit_guard;
            let mut processor = received.recv().ok()?;
            runtime.block_on(ctx.run(&mut processor));
            Some(processor)
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.processor = Some(processor);
                return Err(WorkerError::Spawn(e));
            }
        };
        self.queue.reopen();
        if let Err(mpsc::SendError(processor)) = handoff.send(processor) {
            self.processor = Some(processor);
            return Err(WorkerError::Panicked);
        }

        tracing::info!(worker = %self.name, policy = ?self.queue.policy(), "Worker started");
        self.running = Some(Running {
            handle,
            cancel,
            exited,
        });
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<(), WorkerError> {
        let Some(running) = self.running.as_ref() else {
            return Ok(());
        };
        match timeout {
            Some(limit) => {
                if let Err(RecvTimeoutError::Timeout) = running.exited.recv_timeout(limit) {
                    return Err(WorkerError::JoinTimeout(limit));
                }
            }
            None => {
                let _ = running.exited.recv();
            }
        }

        let Some(running) = self.running.take() else {
            return Ok(());
        };
        match running.handle.join() {
            Ok(Some(processor)) => {
                self.processor = Some(processor);
                tracing::info!(worker = %self.name, "Worker stopped");
                Ok(())
            }
            Ok(None) => Err(WorkerError::ProcessorLost),
            Err(_) => Err(WorkerError::Panicked),
        }
    }
}

impl<T, P> Task<T> for Worker<T, P>
where
    T: Send + 'static,
    P: Processor<T>,
{
    fn start(&mut self) -> Result<(), WorkerError> {
        self.spawn()
    }

    /// Signal only. The in-flight item finishes; queued items are left
    /// behind and new ones are refused until the next `start`.
    fn stop(&self) {
        if let Some(running) = &self.running {
            self.queue.close();
            running.cancel.cancel();
        }
    }

    fn join(&mut self, timeout: Option<Duration>) -> Result<(), WorkerError> {
        self.wait(timeout)
    }

    fn enqueue(&self, item: T) -> bool {
        self.handle().enqueue(item)
    }
}

impl<T, P> Drop for Worker<T, P> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

struct LoopContext<T> {
    name: Arc<str>,
    queue: Arc<WorkQueue<T>>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
}

impl<T> LoopContext<T> {
    async fn run<P: Processor<T>>(self, processor: &mut P) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.queue.pop() {
                Popped::Item(item) => self.step(processor, item).await,
                Popped::Closed => break,
                Popped::Empty => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.queue.notified() => {}
                    }
                }
            }
        }

        let abandoned = self.queue.len();
        if abandoned > 0 {
            tracing::warn!(worker = %self.name, abandoned, "Worker exiting with queued items");
        }
    }

    async fn step<P: Processor<T>>(&self, processor: &mut P, item: T) {
        let result = AssertUnwindSafe(processor.process(item))
            .catch_unwind()
            .await;
        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(&*panic)),
        };
        tracing::error!(worker = %self.name, error = %failure, "Processing step failed");
        self.notifier
            .notify(&format!("{} step failed: {}", self.name, failure));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
