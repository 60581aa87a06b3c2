//! Forwards local log records to the `logMessage` event.
//!
//! [`LogBridgeLayer`] is installed on the tracing subscriber and only
//! queues records, so logging never blocks the caller. The [`LogBridge`]
//! pump drains the queue on a fixed interval and publishes each record.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use telebus_core::{Error, Fields, Result, WriteTopic};

/// Interval between drains of the log queue.
pub const LOG_MESSAGES_INTERVAL: Duration = Duration::from_millis(50);

/// Numeric level published for a tracing level.
pub fn level_code(level: &Level) -> i32 {
    match *level {
        Level::TRACE => 5,
        Level::DEBUG => 10,
        Level::INFO => 20,
        Level::WARN => 30,
        Level::ERROR => 40,
    }
}

/// Tracing level whose numeric level is the closest at or below `code`.
pub fn level_from_code(code: i32) -> Level {
    match code {
        i32::MIN..=5 => Level::TRACE,
        6..=10 => Level::DEBUG,
        11..=20 => Level::INFO,
        21..=30 => Level::WARN,
        _ => Level::ERROR,
    }
}

/// One queued log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: i32,
    pub message: String,
    pub target: String,
}

thread_local! {
    // Set while the pump publishes, so its own writes are not queued.
    static PUBLISHING: Cell<bool> = const { Cell::new(false) };
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl MessageVisitor {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }

    fn into_message(self) -> String {
        let mut message = self.message.unwrap_or_default();
        for (name, value) in self.fields {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&format!("{name}={value}"));
        }
        message
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record(field, value.to_string());
    }
}

/// Tracing layer that queues records at or above the bridge's level.
#[derive(Clone)]
pub struct LogBridgeLayer {
    tx: mpsc::UnboundedSender<LogRecord>,
    level: Arc<AtomicI32>,
}

impl<S: Subscriber> Layer<S> for LogBridgeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = level_code(event.metadata().level());
        if level < self.level.load(Ordering::Relaxed) || PUBLISHING.with(Cell::get) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let _ = self.tx.send(LogRecord {
            level,
            message: visitor.into_message(),
            target: event.metadata().target().to_string(),
        });
    }
}

struct Pump {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Receiving end of the bridge; publishes queued records.
pub struct LogBridge {
    rx: Mutex<Option<mpsc::UnboundedReceiver<LogRecord>>>,
    level: Arc<AtomicI32>,
    pump: Mutex<Option<Pump>>,
}

/// Create a bridge forwarding records at or above `level`.
pub fn log_bridge(level: Level) -> (LogBridgeLayer, LogBridge) {
    let (tx, rx) = mpsc::unbounded_channel();
    let level = Arc::new(AtomicI32::new(level_code(&level)));
    (
        LogBridgeLayer {
            tx,
            level: Arc::clone(&level),
        },
        LogBridge {
            rx: Mutex::new(Some(rx)),
            level,
            pump: Mutex::new(None),
        },
    )
}

impl LogBridge {
    /// Current numeric threshold.
    pub fn level(&self) -> i32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: i32) {
        self.level.store(level, Ordering::Relaxed);
    }

    /// Start publishing to `topic` (the component's `logMessage` event).
    /// May be called once.
    pub fn start(&self, topic: WriteTopic) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::Protocol("log bridge already started".into()))?;
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(pump(rx, topic, stopped));
        *self.pump.lock() = Some(Pump { stop, task });
        Ok(())
    }

    /// Publish what is still queued and stop the pump.
    pub async fn stop(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.stop.send(());
            let _ = tokio::time::timeout(LOG_MESSAGES_INTERVAL * 5, pump.task).await;
        }
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<LogRecord>,
    topic: WriteTopic,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(LOG_MESSAGES_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => publish_pending(&mut rx, &topic),
            _ = &mut stopped => {
                publish_pending(&mut rx, &topic);
                break;
            }
        }
    }
}

fn publish_pending(rx: &mut mpsc::UnboundedReceiver<LogRecord>, topic: &WriteTopic) {
    PUBLISHING.with(|p| p.set(true));
    while let Ok(record) = rx.try_recv() {
        if let Err(e) = topic.set_put(record_fields(&record), true) {
            tracing::debug!(error = %e, "Could not publish log message");
        }
    }
    PUBLISHING.with(|p| p.set(false));
}

fn record_fields(record: &LogRecord) -> Fields {
    let mut fields = Fields::new();
    fields.insert("name".into(), json!(record.target));
    fields.insert("level".into(), json!(record.level));
    fields.insert("message".into(), json!(record.message));
    fields.insert("traceback".into(), json!(""));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_level_codes() {
        assert_eq!(level_code(&Level::TRACE), 5);
        assert_eq!(level_code(&Level::ERROR), 40);
        assert_eq!(level_from_code(20), Level::INFO);
        assert_eq!(level_from_code(25), Level::WARN);
        assert_eq!(level_from_code(0), Level::TRACE);
        assert_eq!(level_from_code(50), Level::ERROR);
    }

    #[test]
    fn test_layer_queues_records_above_threshold() {
        let (layer, bridge) = log_bridge(Level::INFO);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("too quiet");
            tracing::info!(count = 3, "loud enough");
            bridge.set_level(level_code(&Level::WARN));
            tracing::info!("now too quiet");
            tracing::error!("failure");
        });

        let mut rx = bridge.rx.lock().take().unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.level, 20);
        assert_eq!(first.message, "loud enough count=3");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.level, 40);
        assert_eq!(second.message, "failure");
        assert!(rx.try_recv().is_err());
    }
}
