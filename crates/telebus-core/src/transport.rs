//! Transport collaborator interface.
//!
//! The publish/subscribe transport is an external system. A session only
//! needs keyed readers and writers scoped to a partition, a non-blocking
//! take, a history wait and a wait set that blocks until data arrives.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sample::{Delivery, Message};

/// Identifier of an open reader.
pub type ReaderId = u64;

/// Identifier of an open writer.
pub type WriterId = u64;

/// Kind of topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Command,
    Event,
    Telemetry,
    /// Command acknowledgments.
    AckCommand,
}

/// Fully qualified topic identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    pub component: String,
    pub name: String,
    pub kind: TopicKind,
}

impl TopicKey {
    pub fn new(component: impl Into<String>, kind: TopicKind, name: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            name: name.into(),
            kind,
        }
    }

    pub fn command(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(component, TopicKind::Command, name)
    }

    pub fn event(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(component, TopicKind::Event, name)
    }

    pub fn telemetry(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(component, TopicKind::Telemetry, name)
    }

    pub fn ackcmd(component: impl Into<String>) -> Self {
        Self::new(component, TopicKind::AckCommand, "ackcmd")
    }

    /// Name of the topic on the transport.
    pub fn sal_name(&self) -> String {
        sal_name(self.kind, &self.name)
    }
}

/// Transport name of a topic.
pub fn sal_name(kind: TopicKind, name: &str) -> String {
    match kind {
        TopicKind::Command => format!("command_{name}"),
        TopicKind::Event => format!("logevent_{name}"),
        TopicKind::Telemetry => name.to_string(),
        TopicKind::AckCommand => "ackcmd".to_string(),
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.sal_name())
    }
}

/// Parameters of a reader.
#[derive(Debug, Clone)]
pub struct ReaderSpec {
    pub partition: String,
    pub key: TopicKey,
    /// Only messages with this index are delivered; 0 delivers every index.
    pub index: u32,
    /// Volatile readers get no data written before they were created.
    pub volatile: bool,
}

/// Parameters of a writer.
#[derive(Debug, Clone)]
pub struct WriterSpec {
    pub partition: String,
    pub key: TopicKey,
    /// Non-volatile writers retain their output for late-joining readers.
    pub volatile: bool,
}

/// A publish/subscribe transport.
pub trait Transport: Send + Sync + 'static {
    fn create_reader(&self, spec: &ReaderSpec) -> Result<ReaderId>;

    fn create_writer(&self, spec: &WriterSpec) -> Result<WriterId>;

    fn write(&self, writer: WriterId, message: Message) -> Result<()>;

    /// Remove and return up to `max` pending deliveries, oldest first.
    fn take(&self, reader: ReaderId, max: usize) -> Result<Vec<Delivery>>;

    /// Block until the reader has received the historical data retained by
    /// writers, or `timeout` elapses. Returns true if the data arrived.
    fn wait_for_historical_data(&self, reader: ReaderId, timeout: Duration) -> bool;

    /// Create a wait set watching `readers`.
    fn create_wait_set(&self, readers: &[ReaderId]) -> Result<Arc<dyn WaitSet>>;

    fn close_reader(&self, reader: ReaderId);

    fn close_writer(&self, writer: WriterId);
}

/// Blocks until one of its readers has data.
pub trait WaitSet: Send + Sync {
    /// Block until data is available, [`WaitSet::wake`] is called, or
    /// `timeout` elapses. Returns the readers with pending data, which is
    /// empty after a wake or a timeout.
    fn wait(&self, timeout: Duration) -> Result<Vec<ReaderId>>;

    /// Unblock a pending or the next [`WaitSet::wait`].
    fn wake(&self);
}
