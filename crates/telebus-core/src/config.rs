//! Configuration defaults and environment lookups.
//!
//! Every tunable has a constant in [`defaults`] and, where the deployment
//! decides it, an environment variable in [`env_vars`].

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable names.
pub mod env_vars {
    /// Partition name shared by every participant of one deployment. Required.
    pub const PARTITION: &str = "TELEBUS_PARTITION";
    /// Seconds to wait for historical data at session start.
    pub const HISTORY_SYNC: &str = "TELEBUS_HISTORYSYNC";
    /// IPv4 address used as the host id of outgoing messages.
    pub const HOST_IP: &str = "TELEBUS_IP";
    /// `true` switches log output to JSON.
    pub const LOG_JSON: &str = "TELEBUS_LOG_JSON";
}

/// Default values.
pub mod defaults {
    use std::time::Duration;

    /// Historical data wait budget.
    pub const HISTORY_SYNC: Duration = Duration::from_secs(60);
    /// Failsafe timeout of a single blocking wait in the dispatch loop.
    pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Reader depth of the transport and the default topic queue length.
    pub const READ_QUEUE_LEN: usize = 100;
    /// Maximum characters in an acknowledgment result.
    pub const MAX_RESULT_LEN: usize = 256;
    /// Delay before a failed transport take is retried.
    pub const TAKE_RETRY_DELAY: Duration = Duration::from_millis(1);
    /// Minimum remaining budget per topic while waiting for history.
    pub const MIN_HISTORY_WAIT: Duration = Duration::from_millis(10);
    /// How long `close()` waits for the wait worker to exit.
    pub const CLOSE_GRACE: Duration = Duration::from_secs(1);
    /// Largest valid instance index.
    pub const MAX_SAL_INDEX: u32 = (1 << 31) - 1;
    /// Default tracing filter.
    pub const LOG_FILTER: &str = "telebus=info";
}

/// How acknowledgments are matched to the writer that issued the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckIdentityPolicy {
    /// Accept acks with an empty identity; ignore acks for other identities.
    #[default]
    Lenient,
    /// Accept only acks carrying exactly this session's identity.
    Strict,
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transport partition.
    pub partition: String,
    /// Historical data wait budget.
    pub history_sync: Duration,
    /// Failsafe timeout of one blocking wait.
    pub wait_timeout: Duration,
    /// Ack identity matching.
    pub ack_identity_policy: AckIdentityPolicy,
    /// Identity override; defaults to the domain identity.
    pub identity: Option<String>,
}

impl SessionConfig {
    /// Create a configuration for an explicit partition.
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            history_sync: defaults::HISTORY_SYNC,
            wait_timeout: defaults::WAIT_TIMEOUT,
            ack_identity_policy: AckIdentityPolicy::default(),
            identity: None,
        }
    }

    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let partition = lookup(env_vars::PARTITION)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "environment variable {} must be defined",
                    env_vars::PARTITION
                ))
            })?;

        let mut config = Self::new(partition);
        if let Some(raw) = lookup(env_vars::HISTORY_SYNC) {
            let secs: f64 = raw.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{}={raw:?} is not a number of seconds",
                    env_vars::HISTORY_SYNC
                ))
            })?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::Config(format!(
                    "{}={raw:?} must be non-negative",
                    env_vars::HISTORY_SYNC
                )));
            }
            config.history_sync = Duration::from_secs_f64(secs);
        }
        Ok(config)
    }

    pub fn with_history_sync(mut self, history_sync: Duration) -> Self {
        self.history_sync = history_sync;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_ack_identity_policy(mut self, policy: AckIdentityPolicy) -> Self {
        self.ack_identity_policy = policy;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

/// Whether log output should be JSON, from [`env_vars::LOG_JSON`].
pub fn log_json() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

/// Split `"Name"` or `"Name:index"` into a component name and index.
pub fn name_to_name_index(name: &str) -> Result<(String, u32)> {
    let (base, index) = match name.split_once(':') {
        Some((base, index)) => {
            let index: u32 = index
                .parse()
                .map_err(|_| Error::InvalidValue(format!("bad index in {name:?}")))?;
            (base, index)
        }
        None => (name, 0),
    };
    let valid = !base.is_empty()
        && base.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && base.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::InvalidValue(format!("bad component name {name:?}")));
    }
    if index > defaults::MAX_SAL_INDEX {
        return Err(Error::InvalidValue(format!(
            "index {index} exceeds {}",
            defaults::MAX_SAL_INDEX
        )));
    }
    Ok((base.to_string(), index))
}
