//! Component-side view of a session: receives commands, writes events and
//! telemetry.

use std::collections::{BTreeSet, HashMap};

use crate::config::SessionConfig;
use crate::controller_command::ControllerCommand;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::metadata::{MetadataSource, OPTIONAL_COMMAND_NAMES};
use crate::session::Session;
use crate::topic::WriteTopic;
use crate::transport::TopicKind;

/// Check that `handled` covers every command except the optional ones and
/// names no command the component lacks.
pub fn validate_handlers<S: AsRef<str>>(command_names: &[S], handled: &BTreeSet<String>) -> Result<()> {
    let commands: BTreeSet<&str> = command_names.iter().map(|s| s.as_ref()).collect();
    let missing: Vec<&str> = commands
        .iter()
        .copied()
        .filter(|name| !handled.contains(*name) && !OPTIONAL_COMMAND_NAMES.contains(name))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Protocol(format!(
            "must add handlers for commands: {}",
            missing.join(", ")
        )));
    }
    let extra: Vec<&str> = handled
        .iter()
        .map(String::as_str)
        .filter(|name| !commands.contains(name))
        .collect();
    if !extra.is_empty() {
        return Err(Error::Protocol(format!(
            "must remove handlers for unknown commands: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

/// Controller of one component instance.
pub struct Controller {
    session: Session,
    commands: HashMap<String, ControllerCommand>,
    events: HashMap<String, WriteTopic>,
    telemetry: HashMap<String, WriteTopic>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Create topics for every command, event and telemetry topic of the
    /// component. The session identity defaults to `name[:index]`.
    pub fn new(
        domain: &Domain,
        name: &str,
        index: u32,
        metadata: &dyn MetadataSource,
        config: SessionConfig,
    ) -> Result<Self> {
        let config = match config.identity {
            Some(_) => config,
            None if index == 0 => config.with_identity(name),
            None => config.with_identity(format!("{name}:{index}")),
        };
        let session = Session::new(domain, name, index, metadata, config)?;
        if session.metadata().indexed && index == 0 {
            return Err(Error::Config(format!(
                "{name} is indexed; the controller needs a non-zero index"
            )));
        }

        let mut commands = HashMap::new();
        for command in session.metadata().command_names() {
            let topic = ControllerCommand::new(&session, &command)?;
            commands.insert(command, topic);
        }
        let mut events = HashMap::new();
        for event in session.metadata().event_names() {
            let topic = WriteTopic::new(&session, TopicKind::Event, &event)?;
            events.insert(event, topic);
        }
        let mut telemetry = HashMap::new();
        for tel in session.metadata().telemetry_names() {
            let topic = WriteTopic::new(&session, TopicKind::Telemetry, &tel)?;
            telemetry.insert(tel, topic);
        }

        tracing::debug!(
            session = %session.name_index(),
            commands = commands.len(),
            events = events.len(),
            telemetry = telemetry.len(),
            "Controller created"
        );
        Ok(Self {
            session,
            commands,
            events,
            telemetry,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cmd(&self, name: &str) -> Result<&ControllerCommand> {
        self.commands
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("command {name}")))
    }

    pub fn evt(&self, name: &str) -> Result<&WriteTopic> {
        self.events
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("event {name}")))
    }

    pub fn tel(&self, name: &str) -> Result<&WriteTopic> {
        self.telemetry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("telemetry {name}")))
    }

    pub fn has_evt(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    /// Sorted command names.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start the session after checking that every required command has a
    /// handler.
    pub async fn start(&self) -> Result<()> {
        let handled: BTreeSet<String> = self
            .commands
            .iter()
            .filter(|(_, command)| command.has_handler())
            .map(|(name, _)| name.clone())
            .collect();
        validate_handlers(&self.command_names(), &handled)?;
        self.session.start().await
    }

    pub async fn close(&self) {
        self.session.close().await
    }
}
