//! Issuing commands and tracking their acknowledgments.
//!
//! Each issued command is registered under its sequence number before it is
//! written. Acknowledgments routed from the session's ack reader resolve the
//! waiters of the matching command; acknowledgments that arrive while nobody
//! waits are kept in order until someone does.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::ack::{Ack, AckCode, AckError};
use crate::error::{Error, Result};
use crate::sample::Fields;
use crate::session::{Session, SessionInner};
use crate::topic::WriteTopic;
use crate::transport::TopicKind;

struct Waiter {
    wait_done: bool,
    tx: oneshot::Sender<Ack>,
}

/// State of one running command.
struct CommandInfo {
    command: String,
    last_ack: Option<Ack>,
    pending: VecDeque<Ack>,
    waiters: Vec<Waiter>,
}

impl CommandInfo {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            last_ack: None,
            pending: VecDeque::new(),
            waiters: Vec::new(),
        }
    }

    /// Resolve waiters with `ack`; keep it if nobody took it.
    fn add_ack(&mut self, ack: Ack) {
        self.last_ack = Some(ack.clone());
        let terminal = ack.ack.is_terminal();
        let mut delivered = false;
        for waiter in std::mem::take(&mut self.waiters) {
            if waiter.tx.is_closed() {
                continue;
            }
            if terminal || !waiter.wait_done {
                delivered |= waiter.tx.send(ack.clone()).is_ok();
            } else {
                self.waiters.push(waiter);
            }
        }
        if !delivered {
            self.pending.push_back(ack);
        }
    }

    /// Oldest kept ack that satisfies a waiter.
    fn take_ready(&mut self, wait_done: bool) -> Option<Ack> {
        if wait_done {
            while let Some(ack) = self.pending.pop_front() {
                if ack.ack.is_terminal() {
                    return Some(ack);
                }
            }
            None
        } else {
            self.pending.pop_front()
        }
    }

    fn is_finished(&self) -> bool {
        self.last_ack.as_ref().is_some_and(|a| a.ack.is_terminal())
            && self.pending.is_empty()
            && self.waiters.is_empty()
    }
}

enum WaitFor {
    Ready(Ack),
    Pending(oneshot::Receiver<Ack>),
    Unknown,
}

/// Running commands of one session, by sequence number.
#[derive(Default)]
pub(crate) struct CommandTracker {
    commands: Mutex<HashMap<i64, CommandInfo>>,
}

impl CommandTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, seq_num: i64, command: &str) -> Result<()> {
        let mut commands = self.commands.lock();
        if commands.contains_key(&seq_num) {
            return Err(Error::Protocol(format!(
                "a command with seq_num={seq_num} is already running"
            )));
        }
        commands.insert(seq_num, CommandInfo::new(command));
        Ok(())
    }

    /// Stop tracking a command, returning its last ack.
    fn forget(&self, seq_num: i64) -> Option<Ack> {
        self.commands
            .lock()
            .remove(&seq_num)
            .and_then(|info| info.last_ack)
    }

    fn wait_for(&self, seq_num: i64, wait_done: bool) -> WaitFor {
        let mut commands = self.commands.lock();
        let Some(info) = commands.get_mut(&seq_num) else {
            return WaitFor::Unknown;
        };
        if let Some(ack) = info.take_ready(wait_done) {
            if ack.ack.is_terminal() {
                commands.remove(&seq_num);
            }
            return WaitFor::Ready(ack);
        }
        let (tx, rx) = oneshot::channel();
        info.waiters.push(Waiter { wait_done, tx });
        WaitFor::Pending(rx)
    }

    /// Route an inbound ack. Returns false if no running command matches.
    pub(crate) fn route(&self, ack: Ack) -> bool {
        let mut commands = self.commands.lock();
        let seq_num = ack.seq_num;
        let Some(info) = commands.get_mut(&seq_num) else {
            return false;
        };
        tracing::debug!(command = %info.command, %ack, "Received ack");
        info.add_ack(ack);
        if info.is_finished() {
            commands.remove(&seq_num);
        }
        true
    }

    /// Resolve every running command with `Aborted`.
    pub(crate) fn abort_all(&self, reason: &str) {
        let commands: Vec<(i64, CommandInfo)> = self.commands.lock().drain().collect();
        for (seq_num, mut info) in commands {
            tracing::debug!(command = %info.command, seq_num, "Aborting command");
            info.add_ack(aborted(seq_num, reason));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.lock().len()
    }
}

fn aborted(seq_num: i64, reason: &str) -> Ack {
    let mut ack = Ack::new(seq_num, AckCode::Aborted);
    ack.result = reason.to_string();
    ack
}

/// Sends one command of a remote component.
#[derive(Clone)]
pub struct RemoteCommand {
    topic: WriteTopic,
    session: Arc<SessionInner>,
    name: String,
}

impl RemoteCommand {
    /// Create the sender; the first one in a session also creates the
    /// session's ack reader, so this must happen before the session starts.
    pub fn new(session: &Session, name: &str) -> Result<Self> {
        Self::open(session.inner(), name)
    }

    pub(crate) fn open(session: &Arc<SessionInner>, name: &str) -> Result<Self> {
        let topic = WriteTopic::open(session, TopicKind::Command, name)?;
        SessionInner::ensure_ack_reader(session)?;
        Ok(Self {
            topic,
            session: Arc::clone(session),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set command fields without sending.
    pub fn set(&self, fields: Fields) -> Result<bool> {
        self.topic.set(fields)
    }

    /// Send the command, merging `fields` into the current values first.
    pub fn issue(&self, fields: Option<Fields>) -> Result<CommandHandle> {
        if let Some(fields) = fields {
            self.topic.set(fields)?;
        }
        let message = self.topic.next_message()?;
        let seq_num = message.seq_num;
        let tracker = self.session.commands();
        tracker.register(seq_num, &self.name)?;
        if let Err(e) = self.topic.write(message) {
            tracker.forget(seq_num);
            return Err(e);
        }
        tracing::debug!(command = %self.name, seq_num, "Issued command");
        Ok(CommandHandle {
            seq_num,
            command: self.name.clone(),
            session: Arc::clone(&self.session),
        })
    }

    /// Send the command and wait.
    ///
    /// With `wait_done`, waits for the final ack; otherwise for the first ack
    /// after the initial `Acknowledged`. `timeout` bounds the whole wait.
    pub async fn start(
        &self,
        fields: Option<Fields>,
        timeout: Duration,
        wait_done: bool,
    ) -> Result<Ack> {
        let handle = self.issue(fields)?;
        if wait_done {
            return handle.final_ack(timeout).await;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ack = handle.next_ack(remaining).await?;
            if ack.ack != AckCode::Acknowledged {
                return Ok(ack);
            }
        }
    }
}

/// Handle of one issued command.
///
/// Dropping the handle stops tracking the command.
pub struct CommandHandle {
    seq_num: i64,
    command: String,
    session: Arc<SessionInner>,
}

impl CommandHandle {
    pub fn seq_num(&self) -> i64 {
        self.seq_num
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the next ack.
    pub async fn next_ack(&self, timeout: Duration) -> Result<Ack> {
        self.wait(false, timeout).await
    }

    /// Wait for the final ack.
    pub async fn final_ack(&self, timeout: Duration) -> Result<Ack> {
        self.wait(true, timeout).await
    }

    async fn wait(&self, wait_done: bool, timeout: Duration) -> Result<Ack> {
        let tracker = self.session.commands();
        let ack = match tracker.wait_for(self.seq_num, wait_done) {
            WaitFor::Ready(ack) => ack,
            WaitFor::Pending(rx) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(ack)) => ack,
                Ok(Err(_)) => aborted(self.seq_num, "shutting down"),
                Err(_) => {
                    let last = tracker.forget(self.seq_num);
                    tracing::debug!(command = %self.command, seq_num = self.seq_num, "No ack in time");
                    let mut ack = Ack::new(self.seq_num, AckCode::NoAck);
                    match last {
                        Some(last) => {
                            ack.error = last.error;
                            ack.result = last.result;
                        }
                        None => ack.result = format!("No ack received in {timeout:?}"),
                    }
                    ack
                }
            },
            WaitFor::Unknown if !self.session.is_open() => aborted(self.seq_num, "shutting down"),
            WaitFor::Unknown => {
                return Err(Error::Protocol(format!(
                    "command {} seq_num={} is unknown or finished",
                    self.command, self.seq_num
                )))
            }
        };
        if ack.ack.is_good() {
            Ok(ack)
        } else {
            Err(AckError::new(format!("Command {} failed", self.command), ack).into())
        }
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.session.commands().forget(self.seq_num);
    }
}
