//! telebus core.
//!
//! Components talk over named topics: commands flow from remotes to a
//! controller, events and telemetry flow back, and every command is
//! answered with a stream of acknowledgments ending in a final one.
//!
//! ## Structure
//!
//! - [`Domain`]: transport, time service and writer identity shared by a process
//! - [`Session`]: one component instance; owns its topics and the dispatch loop
//! - [`ReadTopic`] / [`WriteTopic`]: bounded receive queues and cached senders
//! - [`RemoteCommand`] / [`ControllerCommand`]: the two ends of the command protocol
//! - [`Controller`] / [`Remote`]: every topic of a component, from either side
//! - [`Transport`]: pluggable message bus; [`MemoryTransport`] runs in process
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use telebus_core::{
//!     ComponentMetadata, Controller, Domain, MemoryTransport, Remote, RemoteOptions,
//!     SessionConfig, StaticMetadata,
//! };
//!
//! # async fn run() -> telebus_core::Result<()> {
//! let domain = Domain::new(Arc::new(MemoryTransport::new()))?;
//! let metadata = StaticMetadata::new()
//!     .with(ComponentMetadata::new("Test").with_command("wait").with_event("scalars"));
//! let config = SessionConfig::new("dev");
//!
//! let controller = Controller::new(&domain, "Test", 0, &metadata, config.clone())?;
//! controller.cmd("wait")?.set_handler(false, |_request| async { Ok(None) })?;
//! controller.start().await?;
//!
//! let remote = Remote::connect(&domain, "Test", 0, &metadata, config, RemoteOptions::default()).await?;
//! let ack = remote.cmd("wait")?.start(None, Duration::from_secs(5), true).await?;
//! println!("{ack}");
//! domain.close().await;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod command;
pub mod config;
pub mod controller;
pub mod controller_command;
pub mod domain;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metadata;
pub mod remote;
pub mod sample;
pub mod session;
pub mod time;
pub mod topic;
pub mod transport;

pub use ack::{Ack, AckCode, AckError};
pub use command::{CommandHandle, RemoteCommand};
pub use config::{name_to_name_index, AckIdentityPolicy, SessionConfig};
pub use controller::{validate_handlers, Controller};
pub use controller_command::{CommandRequest, ControllerCommand, HANDLER_FAILED_ERROR};
pub use domain::Domain;
pub use error::{Error, Result};
pub use logging::{init_tracing, BoxedLayer};
pub use memory::MemoryTransport;
pub use metadata::{
    ComponentMetadata, FieldMetadata, JsonMetadataDir, MetadataSource, StaticMetadata,
    TopicMetadata,
};
pub use remote::{Remote, RemoteOptions};
pub use sample::{to_fields, Fields, Message, Origin, Sample};
pub use session::{Session, SessionStatus};
pub use time::{LeapSecondTable, TimeService};
pub use topic::{ReadTopic, ReadTopicOptions, WriteTopic};
pub use transport::{TopicKey, TopicKind, Transport, WaitSet};
