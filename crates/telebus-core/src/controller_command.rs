//! Receiving and acknowledging commands.
//!
//! Every received command is acknowledged with `Acknowledged` as soon as it
//! is queued. A handler's outcome then becomes the final acknowledgment:
//! `Ok(None)` completes, `Ok(Some(ack))` is sent as is, errors and panics
//! fail the command.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::ack::{Ack, AckCode};
use crate::error::{Error, Result};
use crate::sample::{Origin, Sample};
use crate::session::{Session, SessionInner};
use crate::topic::read::{HookAction, SampleHook};
use crate::topic::{ReadTopic, ReadTopicOptions, WriteTopic};
use crate::transport::TopicKind;

/// Error code of acknowledgments for failed handlers.
pub const HANDLER_FAILED_ERROR: i32 = 1;

/// Acknowledges each command as it is queued.
struct AutoAck {
    command: String,
    ack_writer: WriteTopic,
}

impl SampleHook for AutoAck {
    fn on_sample(&self, sample: &Sample) -> HookAction {
        if sample.seq_num() <= 0 {
            tracing::warn!(command = %self.command, seq_num = sample.seq_num(), "Dropping command with invalid seq_num");
            return HookAction::Consume;
        }
        let ack = Ack::new(sample.seq_num(), AckCode::Acknowledged);
        if let Err(e) = write_ack(&self.ack_writer, sample, &ack) {
            tracing::warn!(command = %self.command, error = %e, "Could not acknowledge command");
        }
        HookAction::Keep
    }
}

fn write_ack(writer: &WriteTopic, command: &Sample, ack: &Ack) -> Result<()> {
    let origin = Origin {
        identity: command.identity().to_string(),
        origin: command.origin().origin,
        host: command.origin().host,
    };
    writer.write_as(command.seq_num(), origin, ack.to_fields())
}

/// Receives one command of the session's component.
#[derive(Clone)]
pub struct ControllerCommand {
    name: String,
    topic: ReadTopic,
    ack_writer: WriteTopic,
}

impl ControllerCommand {
    /// Create the receiver. Must be called before the session starts.
    pub fn new(session: &Session, name: &str) -> Result<Self> {
        let inner = session.inner();
        let ack_writer = SessionInner::ack_writer(inner)?;
        let hook: Arc<dyn SampleHook> = Arc::new(AutoAck {
            command: name.to_string(),
            ack_writer: ack_writer.clone(),
        });
        let topic = ReadTopic::with_hook(
            inner,
            TopicKind::Command,
            name,
            ReadTopicOptions::command(),
            Some(hook),
        )?;
        Ok(Self {
            name: name.to_string(),
            topic,
            ack_writer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying queue.
    pub fn topic(&self) -> &ReadTopic {
        &self.topic
    }

    pub fn has_handler(&self) -> bool {
        self.topic.has_callback()
    }

    /// Send an acknowledgment for `command`.
    pub fn ack(&self, command: &Sample, ack: Ack) -> Result<()> {
        let mut ack = ack;
        ack.seq_num = command.seq_num();
        write_ack(&self.ack_writer, command, &ack)
    }

    /// Report that `command` is still running.
    pub fn ack_in_progress(&self, command: &Sample, result: &str) -> Result<()> {
        let ack = Ack::new(command.seq_num(), AckCode::InProgress).with_result(result, true)?;
        self.ack(command, ack)
    }

    /// Install the handler run for every received command.
    ///
    /// With `allow_multiple_callbacks` false, one command finishes before the
    /// next handler starts.
    pub fn set_handler<F, Fut>(&self, allow_multiple_callbacks: bool, handler: F) -> Result<()>
    where
        F: Fn(CommandRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Ack>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let command = self.clone();
        self.topic.set_allow_multiple_callbacks(allow_multiple_callbacks);
        self.topic.set_callback(move |sample| {
            let handler = Arc::clone(&handler);
            let command = command.clone();
            async move {
                let request = CommandRequest {
                    sample,
                    command: command.clone(),
                };
                let outcome = handler(request.clone());
                command.finish(&request.sample, outcome).await;
            }
        })
    }

    /// Remove the handler.
    pub fn clear_handler(&self) {
        self.topic.clear_callback();
    }

    /// Pop the oldest received command (manual mode).
    pub fn get_oldest(&self) -> Result<Option<Sample>> {
        self.topic.get_oldest()
    }

    /// Wait for the next received command (manual mode).
    pub async fn next(&self, timeout: Option<Duration>) -> Result<Sample> {
        self.topic.next(false, timeout).await
    }

    /// Discard received commands (manual mode).
    pub fn flush(&self) -> Result<()> {
        self.topic.flush()
    }

    async fn finish<Fut>(&self, command: &Sample, outcome: Fut)
    where
        Fut: Future<Output = Result<Option<Ack>>>,
    {
        let seq_num = command.seq_num();
        let ack = match AssertUnwindSafe(outcome).catch_unwind().await {
            Ok(Ok(Some(ack))) => ack,
            Ok(Ok(None)) => Ack {
                result: "Done".to_string(),
                ..Ack::new(seq_num, AckCode::Complete)
            },
            Ok(Err(e)) => {
                if e.is_expected() {
                    tracing::warn!(command = %self.name, seq_num, "Command failed: {e}");
                } else {
                    tracing::error!(command = %self.name, seq_num, error = ?e, "Command failed");
                }
                Ack::failed(seq_num, HANDLER_FAILED_ERROR, &format!("Failed: {e}"))
            }
            Err(_) => {
                tracing::error!(command = %self.name, seq_num, "Command handler panicked");
                Ack::failed(seq_num, HANDLER_FAILED_ERROR, "Failed: handler panicked")
            }
        };
        if let Err(e) = self.ack(command, ack) {
            tracing::warn!(command = %self.name, seq_num, error = %e, "Could not send final ack");
        }
    }
}

/// A received command passed to a handler.
#[derive(Clone)]
pub struct CommandRequest {
    sample: Sample,
    command: ControllerCommand,
}

impl CommandRequest {
    pub fn sample(&self) -> &Sample {
        &self.sample
    }

    pub fn seq_num(&self) -> i64 {
        self.sample.seq_num()
    }

    /// Identity of the commander.
    pub fn identity(&self) -> &str {
        self.sample.identity()
    }

    pub fn command_name(&self) -> &str {
        &self.command.name
    }

    /// Typed value of one command field.
    pub fn field<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.sample.field(name)
    }

    /// Send an `InProgress` acknowledgment.
    pub fn ack_in_progress(&self, result: &str) -> Result<()> {
        self.command.ack_in_progress(&self.sample, result)
    }

    /// An `Error::Expected` naming this command, for business rejections.
    pub fn reject(&self, reason: impl std::fmt::Display) -> Error {
        Error::expected(format!("{}: {reason}", self.command.name))
    }
}
