//! Commander-side view of a session: sends commands, reads events and
//! telemetry.

use std::collections::HashMap;

use crate::command::RemoteCommand;
use crate::config::SessionConfig;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::metadata::MetadataSource;
use crate::session::Session;
use crate::topic::{ReadTopic, ReadTopicOptions};
use crate::transport::TopicKind;

/// Which topics a remote subscribes to.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Skip commands (and the ack reader).
    pub readonly: bool,
    /// Only these events and telemetry topics; `None` means all.
    pub include: Option<Vec<String>>,
    pub event_options: ReadTopicOptions,
    pub telemetry_options: ReadTopicOptions,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            include: None,
            event_options: ReadTopicOptions::event(),
            telemetry_options: ReadTopicOptions::telemetry(),
        }
    }
}

impl RemoteOptions {
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_event_options(mut self, options: ReadTopicOptions) -> Self {
        self.event_options = options;
        self
    }

    fn includes(&self, name: &str) -> bool {
        self.include
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == name))
    }
}

/// Remote view of one component instance.
pub struct Remote {
    session: Session,
    commands: HashMap<String, RemoteCommand>,
    events: HashMap<String, ReadTopic>,
    telemetry: HashMap<String, ReadTopic>,
}

impl Remote {
    /// Create topics; `index` 0 reads every instance of an indexed
    /// component.
    pub fn new(
        domain: &Domain,
        name: &str,
        index: u32,
        metadata: &dyn MetadataSource,
        config: SessionConfig,
        options: RemoteOptions,
    ) -> Result<Self> {
        let session = Session::new(domain, name, index, metadata, config)?;

        let mut commands = HashMap::new();
        if !options.readonly {
            for command in session.metadata().command_names() {
                let topic = RemoteCommand::new(&session, &command)?;
                commands.insert(command, topic);
            }
        }
        let mut events = HashMap::new();
        for event in session.metadata().event_names() {
            if options.includes(&event) {
                let topic = ReadTopic::new(
                    &session,
                    TopicKind::Event,
                    &event,
                    options.event_options.clone(),
                )?;
                events.insert(event, topic);
            }
        }
        let mut telemetry = HashMap::new();
        for tel in session.metadata().telemetry_names() {
            if options.includes(&tel) {
                let topic = ReadTopic::new(
                    &session,
                    TopicKind::Telemetry,
                    &tel,
                    options.telemetry_options.clone(),
                )?;
                telemetry.insert(tel, topic);
            }
        }
        Ok(Self {
            session,
            commands,
            events,
            telemetry,
        })
    }

    /// Create and start a remote.
    pub async fn connect(
        domain: &Domain,
        name: &str,
        index: u32,
        metadata: &dyn MetadataSource,
        config: SessionConfig,
        options: RemoteOptions,
    ) -> Result<Self> {
        let remote = Self::new(domain, name, index, metadata, config, options)?;
        remote.start().await?;
        Ok(remote)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cmd(&self, name: &str) -> Result<&RemoteCommand> {
        self.commands
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("command {name}")))
    }

    pub fn evt(&self, name: &str) -> Result<&ReadTopic> {
        self.events
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("event {name}")))
    }

    pub fn tel(&self, name: &str) -> Result<&ReadTopic> {
        self.telemetry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("telemetry {name}")))
    }

    pub async fn start(&self) -> Result<()> {
        self.session.start().await
    }

    pub async fn close(&self) {
        self.session.close().await
    }
}
