//! The task that owns the transport and the per-unit sessions.
//!
//! Everything that reaches the wire goes through [`Worker::run`], one
//! request at a time, so the single-exchange invariant holds by
//! construction rather than by locking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::queue::{Operation, Outcome, PendingRequest, RequestQueue, WriteStep};
use super::retry::RetryPolicy;
use super::SchedulerStats;
use crate::error::{Error, Result};
use crate::modbus::{Request, Response, Transport};
use crate::session::Sessions;

pub(crate) enum Message {
    Submit(PendingRequest),
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct Worker {
    transport: Box<dyn Transport>,
    sessions: Sessions,
    policy: RetryPolicy,
    queue: RequestQueue,
    rx: mpsc::Receiver<Message>,
    stats: Arc<RwLock<SchedulerStats>>,
}

impl Worker {
    pub fn new(
        transport: Box<dyn Transport>,
        sessions: Sessions,
        policy: RetryPolicy,
        rx: mpsc::Receiver<Message>,
        stats: Arc<RwLock<SchedulerStats>>,
    ) -> Self {
        Self {
            transport,
            sessions,
            policy,
            queue: RequestQueue::default(),
            rx,
            stats,
        }
    }

    pub async fn run(mut self) {
        // tick at half the heartbeat interval so an idle session never
        // goes more than 1.5 intervals without one
        let period = (self.sessions.heartbeat_interval() / 2).max(Duration::from_millis(100));
        let mut idle = interval(period);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_ack = None;
        loop {
            // pick up whatever arrived while the last request was on the wire
            while let Ok(message) = self.rx.try_recv() {
                if let Some(ack) = self.accept(message) {
                    shutdown_ack = Some(ack);
                }
            }

            if let Some(request) = self.queue.pop_next() {
                self.dispatch(request).await;
                continue;
            }
            if shutdown_ack.is_some() {
                break;
            }

            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => {
                        if let Some(ack) = self.accept(message) {
                            shutdown_ack = Some(ack);
                        }
                    }
                    None => break,
                },
                _ = idle.tick() => self.idle().await,
            }
        }

        self.transport.close().await;
        info!("scheduler stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn accept(&mut self, message: Message) -> Option<oneshot::Sender<()>> {
        match message {
            Message::Submit(request) => {
                debug!(id = request.id, class = %request.class(), queued = self.queue.len(), "request queued");
                self.queue.push(request);
                None
            }
            Message::Shutdown(ack) => {
                info!(pending = self.queue.len(), "shutdown requested, draining queue");
                self.rx.close();
                Some(ack)
            }
        }
    }

    async fn idle(&mut self) {
        let generation = self.transport.generation();
        for session in self.sessions.iter_mut() {
            if session.heartbeat_due(generation) {
                // failure is logged and ends the session; the next privileged
                // write logs in again
                let _ = session.heartbeat(self.transport.as_mut()).await;
            }
        }
    }

    async fn dispatch(&mut self, mut request: PendingRequest) {
        self.stats.write().await.dispatched += 1;

        let result = loop {
            request.attempts += 1;
            match self.execute(&mut request).await {
                Ok(outcome) => break Ok(outcome),
                Err(error) if self.policy.should_retry(&error, request.attempts) => {
                    let delay = self.policy.delay(request.attempts);
                    warn!(
                        id = request.id,
                        slave = request.operation.slave(),
                        attempt = request.attempts,
                        %error,
                        ?delay,
                        "transient failure, retrying"
                    );
                    self.stats.write().await.retried += 1;
                    sleep(delay).await;
                }
                Err(error) => {
                    error!(
                        id = request.id,
                        slave = request.operation.slave(),
                        class = %request.class(),
                        attempts = request.attempts,
                        %error,
                        "request failed"
                    );
                    break Err(error);
                }
            }
        };

        {
            let mut stats = self.stats.write().await;
            match &result {
                Ok(_) => stats.succeeded += 1,
                Err(_) => stats.failed += 1,
            }
        }
        if request.reply.send(result).is_err() {
            debug!(id = request.id, "caller gone before the result arrived");
        }
    }

    async fn execute(&mut self, request: &mut PendingRequest) -> Result<Outcome> {
        let PendingRequest {
            operation,
            progress,
            ..
        } = request;

        match operation {
            Operation::Read {
                slave,
                address,
                count,
            } => {
                let response = self
                    .transport
                    .exchange(
                        *slave,
                        &Request::ReadHoldingRegisters {
                            address: *address,
                            count: *count,
                        },
                    )
                    .await?
                    .into_result()?;
                match response {
                    Response::ReadHoldingRegisters(words) if words.len() == *count as usize => {
                        Ok(Outcome::Words(words))
                    }
                    other => Err(Error::Protocol(format!(
                        "expected {count} registers at {address}, got {other:?}"
                    ))),
                }
            }
            Operation::Write {
                slave,
                steps,
                privileged,
            } => {
                let slave = *slave;
                let mut relogged = false;
                while let Some(step) = steps.get(*progress) {
                    if *privileged {
                        self.sessions
                            .get(slave)
                            .ensure_logged_in(self.transport.as_mut())
                            .await?;
                    }
                    match write(self.transport.as_mut(), slave, step).await {
                        Ok(()) => {
                            *progress += 1;
                            if *privileged {
                                self.sessions.get(slave).touch();
                            }
                        }
                        Err(Error::AccessDenied) if *privileged && !relogged => {
                            warn!(slave, address = step.address, "write denied, logging in again");
                            self.sessions.get(slave).mark_logged_out();
                            relogged = true;
                        }
                        Err(Error::AccessDenied) => {
                            self.sessions.get(slave).mark_logged_out();
                            return Err(Error::AccessDenied);
                        }
                        Err(error) => return Err(error),
                    }
                }
                Ok(Outcome::Written)
            }
        }
    }
}

async fn write(transport: &mut dyn Transport, slave: u8, step: &WriteStep) -> Result<()> {
    let response = transport
        .exchange(
            slave,
            &Request::WriteMultipleRegisters {
                address: step.address,
                words: step.words.clone(),
            },
        )
        .await?
        .into_result()?;
    match response {
        Response::WriteMultipleRegisters { address, count }
            if address == step.address && count as usize == step.words.len() =>
        {
            debug!(slave, address, count, "write acknowledged");
            Ok(())
        }
        other => Err(Error::Protocol(format!(
            "unexpected write acknowledgement {other:?}"
        ))),
    }
}
