//! Component interface metadata.
//!
//! The interface-description parser is an external collaborator; this
//! module holds its output and the sources a session loads it from.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::TopicKind;

/// Commands every commandable component understands.
pub const CSC_COMMANDS: &[&str] = &[
    "disable",
    "enable",
    "enterControl",
    "exitControl",
    "setLogLevel",
    "setSimulationMode",
    "standby",
    "start",
];

/// Events every commandable component publishes.
pub const CSC_EVENTS: &[&str] = &[
    "errorCode",
    "heartbeat",
    "logLevel",
    "logMessage",
    "simulationMode",
    "summaryState",
];

/// Commands a component may omit without a handler-presence error.
pub const OPTIONAL_COMMAND_NAMES: &[&str] = &["abort", "enterControl", "setValue"];

/// Description of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str_length: Option<usize>,
}

impl FieldMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            description: None,
            units: None,
            array_length: None,
            str_length: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_array_length(mut self, len: usize) -> Self {
        self.array_length = Some(len);
        self
    }
}

/// Description of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    /// Short name, e.g. `start` for `command_start`.
    pub name: String,
    pub kind: TopicKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Public fields by name. Empty means "not described".
    #[serde(default)]
    pub fields: BTreeMap<String, FieldMetadata>,
}

impl TopicMetadata {
    pub fn new(kind: TopicKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: FieldMetadata) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }
}

/// Interface of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub name: String,
    /// Indexed components require a non-zero instance index.
    #[serde(default)]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub topics: Vec<TopicMetadata>,
}

impl ComponentMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexed: false,
            description: None,
            topics: Vec::new(),
        }
    }

    pub fn indexed(mut self, indexed: bool) -> Self {
        self.indexed = indexed;
        self
    }

    /// Add or replace a topic.
    pub fn with_topic(mut self, topic: TopicMetadata) -> Self {
        self.topics
            .retain(|t| !(t.kind == topic.kind && t.name == topic.name));
        self.topics.push(topic);
        self
    }

    pub fn with_command(self, name: &str) -> Self {
        self.with_topic(TopicMetadata::new(TopicKind::Command, name))
    }

    pub fn with_event(self, name: &str) -> Self {
        self.with_topic(TopicMetadata::new(TopicKind::Event, name))
    }

    pub fn with_telemetry(self, name: &str) -> Self {
        self.with_topic(TopicMetadata::new(TopicKind::Telemetry, name))
    }

    /// Add the commands and events shared by all commandable components.
    pub fn with_csc_topics(mut self) -> Self {
        use TopicKind::{Command, Event};

        let int = |name: &str| FieldMetadata::new(name, "long");
        let string = |name: &str| FieldMetadata::new(name, "string");
        for name in CSC_COMMANDS {
            let topic = match *name {
                "start" => TopicMetadata::new(Command, *name).with_field(string("configurationOverride")),
                "setLogLevel" => TopicMetadata::new(Command, *name)
                    .with_field(int("level"))
                    .with_field(string("subsystem")),
                "setSimulationMode" => TopicMetadata::new(Command, *name).with_field(int("mode")),
                _ => TopicMetadata::new(Command, *name),
            };
            self = self.with_topic(topic);
        }
        for name in CSC_EVENTS {
            let topic = match *name {
                "errorCode" => TopicMetadata::new(Event, *name)
                    .with_field(int("errorCode"))
                    .with_field(string("errorReport"))
                    .with_field(string("traceback")),
                "logLevel" => TopicMetadata::new(Event, *name)
                    .with_field(int("level"))
                    .with_field(string("subsystem")),
                "logMessage" => TopicMetadata::new(Event, *name)
                    .with_field(string("name"))
                    .with_field(int("level"))
                    .with_field(string("message"))
                    .with_field(string("traceback")),
                "simulationMode" => TopicMetadata::new(Event, *name).with_field(int("mode")),
                "summaryState" => TopicMetadata::new(Event, *name).with_field(int("summaryState")),
                _ => TopicMetadata::new(Event, *name),
            };
            self = self.with_topic(topic);
        }
        self
    }

    pub fn topic(&self, kind: TopicKind, name: &str) -> Option<&TopicMetadata> {
        self.topics.iter().find(|t| t.kind == kind && t.name == name)
    }

    fn names(&self, kind: TopicKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .topics
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Sorted command names.
    pub fn command_names(&self) -> Vec<String> {
        self.names(TopicKind::Command)
    }

    /// Sorted event names.
    pub fn event_names(&self) -> Vec<String> {
        self.names(TopicKind::Event)
    }

    /// Sorted telemetry names.
    pub fn telemetry_names(&self) -> Vec<String> {
        self.names(TopicKind::Telemetry)
    }
}

/// Source of component metadata.
pub trait MetadataSource: Send + Sync {
    /// Load the metadata of `component`; a missing description is a
    /// configuration error.
    fn load(&self, component: &str) -> Result<ComponentMetadata>;
}

/// Metadata held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    components: HashMap<String, ComponentMetadata>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metadata: ComponentMetadata) -> Self {
        self.insert(metadata);
        self
    }

    pub fn insert(&mut self, metadata: ComponentMetadata) {
        self.components.insert(metadata.name.clone(), metadata);
    }
}

impl MetadataSource for StaticMetadata {
    fn load(&self, component: &str) -> Result<ComponentMetadata> {
        self.components
            .get(component)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no metadata for component {component}")))
    }
}

/// Metadata read from `<dir>/<component>.json`.
#[derive(Debug, Clone)]
pub struct JsonMetadataDir {
    dir: PathBuf,
}

impl JsonMetadataDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl MetadataSource for JsonMetadataDir {
    fn load(&self, component: &str) -> Result<ComponentMetadata> {
        let path = self.dir.join(format!("{component}.json"));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("cannot read metadata {}: {e}", path.display()))
        })?;
        let metadata: ComponentMetadata = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!("cannot parse metadata {}: {e}", path.display()))
        })?;
        if metadata.name != component {
            return Err(Error::Config(format!(
                "{} describes {}, not {component}",
                path.display(),
                metadata.name
            )));
        }
        Ok(metadata)
    }
}
