//! Sending side of a topic.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::sample::{Fields, Message, Origin};
use crate::session::{Session, SessionInner};
use crate::transport::{TopicKey, TopicKind, WriterId, WriterSpec};

struct WriteState {
    fields: Fields,
    has_data: bool,
    next_seq_num: i64,
}

struct WriteTopicInner {
    session: Arc<SessionInner>,
    key: TopicKey,
    writer_id: WriterId,
    known_fields: Option<BTreeSet<String>>,
    state: Mutex<WriteState>,
}

/// Sending side of a topic.
///
/// Keeps the most recently set field values; `put` publishes them stamped
/// with the session's index and identity.
#[derive(Clone)]
pub struct WriteTopic {
    inner: Arc<WriteTopicInner>,
}

impl WriteTopic {
    pub fn new(session: &Session, kind: TopicKind, name: &str) -> Result<Self> {
        Self::open(session.inner(), kind, name)
    }

    pub(crate) fn open(session: &Arc<SessionInner>, kind: TopicKind, name: &str) -> Result<Self> {
        session.check_topic(kind, name)?;
        let known_fields = session
            .metadata()
            .topic(kind, name)
            .filter(|topic| !topic.fields.is_empty())
            .map(|topic| topic.fields.keys().cloned().collect());
        let key = TopicKey::new(session.name(), kind, name);
        let writer_id = session.add_writer(&WriterSpec {
            partition: session.partition().to_string(),
            key: key.clone(),
            volatile: kind == TopicKind::Telemetry,
        })?;
        Ok(Self {
            inner: Arc::new(WriteTopicInner {
                session: Arc::clone(session),
                key,
                writer_id,
                known_fields,
                state: Mutex::new(WriteState {
                    fields: Fields::new(),
                    has_data: false,
                    next_seq_num: 1,
                }),
            }),
        })
    }

    pub fn key(&self) -> &TopicKey {
        &self.inner.key
    }

    /// True once data has been set or written.
    pub fn has_data(&self) -> bool {
        self.inner.state.lock().has_data
    }

    /// Currently set field values.
    pub fn data(&self) -> Fields {
        self.inner.state.lock().fields.clone()
    }

    /// Merge `fields` into the cached values. Returns true if any value
    /// changed or no data had been set before.
    pub fn set(&self, fields: Fields) -> Result<bool> {
        if let Some(known) = &self.inner.known_fields {
            if let Some(unknown) = fields.keys().find(|name| !known.contains(*name)) {
                return Err(Error::InvalidValue(format!(
                    "{} has no field {unknown}",
                    self.inner.key
                )));
            }
        }
        let mut state = self.inner.state.lock();
        let mut changed = !state.has_data;
        for (name, value) in fields {
            if state.fields.get(&name) != Some(&value) {
                changed = true;
                state.fields.insert(name, value);
            }
        }
        state.has_data = true;
        Ok(changed)
    }

    /// Publish the cached values, after merging `fields` if given.
    pub fn put(&self, fields: Option<Fields>) -> Result<Message> {
        if let Some(fields) = fields {
            self.set(fields)?;
        }
        let message = self.next_message()?;
        self.write(message.clone())?;
        Ok(message)
    }

    /// Set `fields` and publish if anything changed, nothing had been
    /// published yet, or `force_output`. Returns whether it published.
    pub fn set_put(&self, fields: Fields, force_output: bool) -> Result<bool> {
        let changed = self.set(fields)?;
        if changed || force_output {
            self.put(None)?;
        }
        Ok(changed || force_output)
    }

    /// Build the next message from the cached values. Command topics draw
    /// sequence numbers from the session; other topics count per writer.
    pub(crate) fn next_message(&self) -> Result<Message> {
        let session = &self.inner.session;
        let seq_num = if self.inner.key.kind == TopicKind::Command {
            session.next_seq_num()
        } else {
            let mut state = self.inner.state.lock();
            let seq_num = state.next_seq_num;
            state.next_seq_num = if seq_num >= i64::from(i32::MAX) { 1 } else { seq_num + 1 };
            seq_num
        };
        let mut state = self.inner.state.lock();
        state.has_data = true;
        Ok(Message {
            sal_index: session.index(),
            seq_num,
            origin: session.writer_origin(),
            snd_stamp: session.domain().time().stamp_now(),
            fields: state.fields.clone(),
        })
    }

    /// Publish a message on behalf of another writer identity, as used for
    /// acknowledgments addressed to a commander.
    pub(crate) fn write_as(&self, seq_num: i64, origin: Origin, fields: Fields) -> Result<()> {
        let session = &self.inner.session;
        self.write(Message {
            sal_index: session.index(),
            seq_num,
            origin,
            snd_stamp: session.domain().time().stamp_now(),
            fields,
        })
    }

    pub(crate) fn write(&self, message: Message) -> Result<()> {
        let session = &self.inner.session;
        if !session.is_open() {
            return Err(Error::Closed(self.inner.key.to_string()));
        }
        tracing::trace!(topic = %self.inner.key, seq_num = message.seq_num, "Writing");
        session
            .domain()
            .transport()
            .write(self.inner.writer_id, message)
    }
}
