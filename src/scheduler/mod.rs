//! Request serializer: one queue, one worker, one request on the wire.
//!
//! The queue is shared by every slave id behind the link; each operation
//! names its unit.

pub mod queue;
pub mod retry;
mod worker;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, RwLock};

pub use queue::{Operation, Outcome, RequestClass, WriteStep};
pub use retry::RetryPolicy;

use crate::error::{Error, Result};
use crate::modbus::Transport;
use crate::session::Sessions;
use queue::PendingRequest;
use worker::{Message, Worker};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Counters kept by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Result of a submitted request. Dropping it (or calling [`cancel`])
/// before the worker picks the request up removes it from the queue.
///
/// [`cancel`]: PendingHandle::cancel
pub struct PendingHandle {
    id: u64,
    rx: oneshot::Receiver<Result<Outcome>>,
}

impl PendingHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(mut self) {
        self.rx.close();
    }
}

impl Future for PendingHandle {
    type Output = Result<Outcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::SchedulerClosed)))
    }
}

/// Cloneable handle to the worker task.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Message>,
    next_id: Arc<AtomicU64>,
    stats: Arc<RwLock<SchedulerStats>>,
}

impl Scheduler {
    /// Spawn the worker on the current runtime.
    pub fn spawn(
        transport: Box<dyn Transport>,
        sessions: Sessions,
        policy: RetryPolicy,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(RwLock::new(SchedulerStats::default()));
        let worker = Worker::new(transport, sessions, policy, rx, stats.clone());
        tokio::spawn(worker.run());
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            stats,
        }
    }

    pub async fn submit(&self, operation: Operation) -> Result<PendingHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Submit(PendingRequest::new(id, operation, reply)))
            .await
            .map_err(|_| Error::SchedulerClosed)?;
        Ok(PendingHandle { id, rx })
    }

    /// Submit and wait for the outcome.
    pub async fn execute(&self, operation: Operation) -> Result<Outcome> {
        self.submit(operation).await?.await
    }

    /// Stop accepting work, finish what is queued, close the link.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Message::Shutdown(ack))
            .await
            .map_err(|_| Error::SchedulerClosed)?;
        done.await.map_err(|_| Error::SchedulerClosed)
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.stats.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
