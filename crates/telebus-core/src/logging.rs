//! Process-wide tracing setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{defaults, log_json};
use crate::error::{Error, Result};

/// A layer that can be stacked on the global subscriber.
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber: a console layer filtered by `RUST_LOG`
/// (default `telebus=info`), JSON when `TELEBUS_LOG_JSON=true`, plus `extra`
/// layers with their own filtering.
pub fn init_tracing(extra: Vec<BoxedLayer>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(defaults::LOG_FILTER).add_directive(tracing::Level::WARN.into())
    });

    let console = if log_json() {
        fmt::layer()
            .json()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_filter(env_filter)
            .boxed()
    };

    let mut layers = vec![console];
    layers.extend(extra);
    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))
}
