//! Single-message poll worker shared by the enricher and notifier
//!
//! Each iteration long-polls the source queue for at most one message and
//! drives it to one terminal state:
//! - handled: the handler published downstream, then the message is deleted
//! - rejected: written to the dead-letter sink, then deleted
//! - left for redelivery: nothing is deleted and the visibility timeout
//!   hands the message to the next receive
//!
//! Shutdown is only observed while waiting for a message, so a message that
//! was received is always processed to its terminal state.

use crate::domain::error::PipelineError;
use crate::domain::types::{DeadLetter, RejectReason};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::collaborators::{DeadLetterSink, MessageQueue, ReceivedMessage};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Back-off after a failed receive
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What a handler did with one message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Downstream output published; the message can be acknowledged
    Completed,
    /// The message can never succeed and must be dead-lettered
    Rejected { reason: RejectReason, detail: String },
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stage name for logs and dead letters
    fn stage(&self) -> &'static str;

    /// Process one body. `Err` with a transient error leaves the message
    /// on the queue; decode and validation errors reject it.
    async fn handle(&self, body: &str) -> Result<Handled, PipelineError>;
}

/// Terminal state of one poll iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No message arrived within the wait bound
    Idle,
    Completed,
    Rejected(RejectReason),
    LeftForRedelivery,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Long-poll bound per receive
    pub wait: Duration,
    /// Dead-letter once a message has been received more often (0 = unbounded)
    pub max_receive_count: u32,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            wait: Duration::from_secs(config.wait_secs()),
            max_receive_count: config.max_receive_count(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct PollWorker<H: MessageHandler> {
    queue: Arc<dyn MessageQueue>,
    handler: H,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<Metrics>,
    settings: WorkerSettings,
}

impl<H: MessageHandler> PollWorker<H> {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        handler: H,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<Metrics>,
        settings: WorkerSettings,
    ) -> Self {
        Self { queue, handler, dead_letters, metrics, settings }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Receive and process at most one message
    pub async fn poll_once(&self) -> anyhow::Result<PollOutcome> {
        let outcome = self.poll_until(std::future::pending()).await?;
        Ok(outcome.unwrap_or(PollOutcome::Idle))
    }

    /// Poll until the shutdown signal reads true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let stage = self.handler.stage();
        info!(stage = %stage, "poll_worker_started");

        loop {
            let stop = async {
                loop {
                    let stopping = *shutdown.borrow_and_update();
                    // A dropped sender also stops the worker
                    if stopping || shutdown.changed().await.is_err() {
                        break;
                    }
                }
            };
            match self.poll_until(stop).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    self.metrics.record_poll_error();
                    warn!(stage = %stage, error = %format!("{e:#}"), "queue_receive_failed");
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                }
            }
        }

        info!(stage = %stage, "poll_worker_stopped");
    }

    /// Wait for one message unless `stop` completes first (`Ok(None)`).
    /// Once a message is in hand it is processed to its terminal state.
    async fn poll_until(&self, stop: impl Future<Output = ()>) -> anyhow::Result<Option<PollOutcome>> {
        let received = tokio::select! {
            biased;
            _ = stop => return Ok(None),
            result = self.queue.receive(self.settings.wait) => result?,
        };
        let outcome = match received {
            Some(message) => self.process(message).await,
            None => PollOutcome::Idle,
        };
        Ok(Some(outcome))
    }

    async fn process(&self, message: ReceivedMessage) -> PollOutcome {
        let started = Instant::now();
        let stage = self.handler.stage();
        self.metrics.record_message_received();
        debug!(
            stage = %stage,
            message_id = %message.message_id,
            receive_count = message.receive_count,
            "message_received"
        );

        let max = self.settings.max_receive_count;
        let handled = if max > 0 && message.receive_count > max {
            Ok(Handled::Rejected {
                reason: RejectReason::MaxReceivesExceeded,
                detail: format!("received {} times, limit {}", message.receive_count, max),
            })
        } else {
            self.handler.handle(&message.body).await
        };

        let outcome = match handled {
            Ok(Handled::Completed) => self.acknowledge(&message, PollOutcome::Completed).await,
            Ok(Handled::Rejected { reason, detail }) => self.reject(&message, reason, detail).await,
            Err(e) if e.is_transient() => {
                warn!(
                    stage = %stage,
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %e,
                    "message_processing_failed"
                );
                self.leave(&message)
            }
            Err(e) => self.reject(&message, RejectReason::Malformed, e.to_string()).await,
        };

        self.metrics.record_handling_latency(started.elapsed().as_millis() as u64);
        outcome
    }

    async fn reject(&self, message: &ReceivedMessage, reason: RejectReason, detail: String) -> PollOutcome {
        let stage = self.handler.stage();
        let letter = DeadLetter::now(stage, reason, detail, message.receive_count, message.body.clone());

        if let Err(e) = self.dead_letters.put(letter).await {
            warn!(stage = %stage, message_id = %message.message_id, error = %format!("{e:#}"), "dead_letter_failed");
            return self.leave(message);
        }
        self.metrics.record_dead_lettered();
        info!(stage = %stage, message_id = %message.message_id, reason = %reason, "message_dead_lettered");

        self.acknowledge(message, PollOutcome::Rejected(reason)).await
    }

    async fn acknowledge(&self, message: &ReceivedMessage, outcome: PollOutcome) -> PollOutcome {
        match self.queue.delete(&message.receipt_handle).await {
            Ok(()) => outcome,
            Err(e) => {
                // Output is already out; the redelivered copy is absorbed downstream by dedup
                warn!(
                    stage = %self.handler.stage(),
                    message_id = %message.message_id,
                    error = %format!("{e:#}"),
                    "message_delete_failed"
                );
                self.leave(message)
            }
        }
    }

    fn leave(&self, message: &ReceivedMessage) -> PollOutcome {
        self.metrics.record_left_for_redelivery();
        info!(
            stage = %self.handler.stage(),
            message_id = %message.message_id,
            receive_count = message.receive_count,
            "message_left_for_redelivery"
        );
        PollOutcome::LeftForRedelivery
    }
}
