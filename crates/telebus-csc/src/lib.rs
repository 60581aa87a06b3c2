//! Commandable components for telebus.
//!
//! [`BaseCsc`] runs the standard summary-state machine (`start`, `enable`,
//! `disable`, `standby`, `enterControl`, `exitControl`) on top of a
//! [`telebus_core::Controller`], publishes `summaryState` and `heartbeat`,
//! and hands component-specific commands to a [`CscHooks`] implementation.
//! The log bridge forwards tracing records to the `logMessage` event, and
//! [`set_summary_state`] drives a component to a state from a remote.

pub mod csc;
pub mod log_bridge;
pub mod state;
pub mod summary_state;

pub use csc::{BaseCsc, CscHandle, CscHooks, CscOptions, HEARTBEAT_INTERVAL};
pub use log_bridge::{log_bridge, LogBridge, LogBridgeLayer, LogRecord, LOG_MESSAGES_INTERVAL};
pub use state::{State, Transition};
pub use summary_state::{current_summary_state, enable_csc, set_summary_state, transition_path};
