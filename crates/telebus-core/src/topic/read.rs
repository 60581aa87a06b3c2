//! Receiving side of a topic.
//!
//! The session's dispatch task enqueues samples; consumers either pull
//! (`get_oldest`, `next`, `flush`) or register a callback. A topic commits to
//! one of the two on first use.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::defaults;
use crate::error::{Error, Result};
use crate::sample::Sample;
use crate::session::{Session, SessionInner};
use crate::topic::length_checker::QueueLengthChecker;
use crate::transport::{ReaderId, ReaderSpec, TopicKey, TopicKind};

/// Callback invoked with each received sample.
pub type Callback = Arc<dyn Fn(Sample) -> BoxFuture<'static, ()> + Send + Sync>;

/// What happens to a sample after a [`SampleHook`] has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookAction {
    /// Queue it for consumers.
    Keep,
    /// Drop it; the hook handled it.
    Consume,
}

/// Synchronous interception of samples before they are queued.
pub(crate) trait SampleHook: Send + Sync {
    fn on_sample(&self, sample: &Sample) -> HookAction;
}

/// Queue sizing of a read topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTopicOptions {
    /// Number of historical samples delivered at start.
    pub max_history: usize,
    /// Capacity of the queue; the oldest sample is dropped when full.
    pub queue_len: usize,
    /// Volatile topics get no data written before the reader existed.
    pub volatile: bool,
}

impl ReadTopicOptions {
    /// Commands: no history.
    pub fn command() -> Self {
        Self {
            max_history: 0,
            queue_len: defaults::READ_QUEUE_LEN,
            volatile: false,
        }
    }

    /// Events: the latest retained value.
    pub fn event() -> Self {
        Self {
            max_history: 1,
            queue_len: defaults::READ_QUEUE_LEN,
            volatile: false,
        }
    }

    /// Telemetry: live data only.
    pub fn telemetry() -> Self {
        Self {
            max_history: 0,
            queue_len: defaults::READ_QUEUE_LEN,
            volatile: true,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.queue_len == 0 {
            return Err(Error::InvalidValue("queue_len must be positive".into()));
        }
        if self.max_history > self.queue_len {
            return Err(Error::InvalidValue(format!(
                "max_history={} must be <= queue_len={}",
                self.max_history, self.queue_len
            )));
        }
        Ok(())
    }
}

enum ConsumptionMode {
    Unconsumed,
    Pull,
    Push { callback_loop: JoinHandle<()> },
}

struct ReadState {
    queue: VecDeque<Sample>,
    current: Option<Sample>,
    mode: ConsumptionMode,
    length_checker: Option<QueueLengthChecker>,
    arrivals: Option<broadcast::Sender<Sample>>,
}

pub(crate) struct ReadTopicInner {
    key: TopicKey,
    reader_id: ReaderId,
    options: ReadTopicOptions,
    state: Mutex<ReadState>,
    allow_multiple_callbacks: AtomicBool,
    hook: Option<Arc<dyn SampleHook>>,
}

impl ReadTopicInner {
    pub(crate) fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    pub(crate) fn key(&self) -> &TopicKey {
        &self.key
    }

    pub(crate) fn max_history(&self) -> usize {
        self.options.max_history
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.options.queue_len
    }

    pub(crate) fn volatile(&self) -> bool {
        self.options.volatile
    }

    /// Run the hook and append the kept samples, dropping the oldest queued
    /// sample when full.
    pub(crate) fn queue_samples(&self, samples: Vec<Sample>) {
        let kept: Vec<Sample> = match &self.hook {
            Some(hook) => samples
                .into_iter()
                .filter(|s| hook.on_sample(s) == HookAction::Keep)
                .collect(),
            None => samples,
        };
        if kept.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for sample in kept {
            if state.queue.len() >= self.options.queue_len {
                state.queue.pop_front();
            }
            state.queue.push_back(sample.clone());
            state.current = Some(sample.clone());
            if let Some(arrivals) = &state.arrivals {
                let _ = arrivals.send(sample);
            }
        }
    }

    /// Stop delivery and wake every waiter with [`Error::Closed`].
    ///
    /// A callback that is running finishes; its loop then exits.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.mode = ConsumptionMode::Unconsumed;
        state.queue.clear();
        state.arrivals = None;
    }

    /// Oldest queued sample, or the next to arrive.
    async fn next_sample(&self, timeout: Option<Duration>) -> Result<Sample> {
        let mut arrivals = {
            let mut state = self.state.lock();
            let length = state.queue.len();
            if let Some(checker) = state.length_checker.as_mut() {
                if !checker.length_ok(length) {
                    tracing::warn!(topic = %self.key, length, "Falling behind; queue is filling up");
                }
            }
            if let Some(sample) = state.queue.pop_front() {
                return Ok(sample);
            }
            match &state.arrivals {
                Some(arrivals) => arrivals.subscribe(),
                None => return Err(Error::Closed(self.key.to_string())),
            }
        };

        let key = &self.key;
        let arrival = async move {
            loop {
                match arrivals.recv().await {
                    Ok(sample) => return Ok(sample),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::Closed(key.to_string()))
                    }
                }
            }
        };
        let sample = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, arrival)
                .await
                .map_err(|_| Error::Timeout(timeout))??,
            None => arrival.await?,
        };

        // Every concurrent waiter gets this sample; it leaves the queue once.
        let mut state = self.state.lock();
        if let Some(pos) = state.queue.iter().position(|s| s.same_as(&sample)) {
            state.queue.remove(pos);
        }
        Ok(sample)
    }
}

/// Receiving side of a topic.
#[derive(Clone)]
pub struct ReadTopic {
    inner: Arc<ReadTopicInner>,
}

impl std::fmt::Debug for ReadTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTopic")
            .field("key", &self.inner.key)
            .field("reader_id", &self.inner.reader_id)
            .finish()
    }
}

impl ReadTopic {
    /// Create a reader for a topic of the session's component. Must be
    /// called before the session starts.
    pub fn new(
        session: &Session,
        kind: TopicKind,
        name: &str,
        options: ReadTopicOptions,
    ) -> Result<Self> {
        Self::with_hook(session.inner(), kind, name, options, None)
    }

    pub(crate) fn with_hook(
        session: &Arc<SessionInner>,
        kind: TopicKind,
        name: &str,
        options: ReadTopicOptions,
        hook: Option<Arc<dyn SampleHook>>,
    ) -> Result<Self> {
        options.validate()?;
        session.check_topic(kind, name)?;
        let key = TopicKey::new(session.name(), kind, name);
        let spec = ReaderSpec {
            partition: session.partition().to_string(),
            key: key.clone(),
            index: session.index(),
            volatile: options.volatile,
        };
        let inner = session.add_reader(&spec, |reader_id| {
            let (arrivals, _) = broadcast::channel(options.queue_len);
            Arc::new(ReadTopicInner {
                key,
                reader_id,
                state: Mutex::new(ReadState {
                    queue: VecDeque::with_capacity(options.queue_len),
                    current: None,
                    mode: ConsumptionMode::Unconsumed,
                    length_checker: QueueLengthChecker::new(options.queue_len),
                    arrivals: Some(arrivals),
                }),
                options,
                allow_multiple_callbacks: AtomicBool::new(false),
                hook,
            })
        })?;
        Ok(Self { inner })
    }

    pub fn key(&self) -> &TopicKey {
        &self.inner.key
    }

    pub fn options(&self) -> &ReadTopicOptions {
        &self.inner.options
    }

    /// True once any sample has been received.
    pub fn has_data(&self) -> bool {
        self.inner.state.lock().current.is_some()
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_callback(&self) -> bool {
        matches!(self.inner.state.lock().mode, ConsumptionMode::Push { .. })
    }

    /// Most recently received sample, without consuming anything. Allowed
    /// in every mode.
    pub fn get(&self) -> Option<Sample> {
        self.inner.state.lock().current.clone()
    }

    /// Pop the oldest queued sample.
    pub fn get_oldest(&self) -> Result<Option<Sample>> {
        let mut state = self.inner.state.lock();
        self.enter_pull(&mut state)?;
        Ok(state.queue.pop_front())
    }

    /// Discard all queued samples.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.enter_pull(&mut state)?;
        state.queue.clear();
        Ok(())
    }

    /// Pop the oldest queued sample, or wait for the next one.
    ///
    /// With `flush_first`, queued samples are discarded so only a sample
    /// arriving after the call satisfies it. `None` waits forever.
    pub async fn next(&self, flush_first: bool, timeout: Option<Duration>) -> Result<Sample> {
        {
            let mut state = self.inner.state.lock();
            self.enter_pull(&mut state)?;
            if flush_first {
                state.queue.clear();
            }
        }
        self.inner.next_sample(timeout).await
    }

    fn enter_pull(&self, state: &mut ReadState) -> Result<()> {
        match state.mode {
            ConsumptionMode::Push { .. } => Err(Error::InvalidMode(format!(
                "{} has a callback; pull operations are not allowed",
                self.inner.key
            ))),
            ConsumptionMode::Pull => Ok(()),
            ConsumptionMode::Unconsumed => {
                state.mode = ConsumptionMode::Pull;
                Ok(())
            }
        }
    }

    /// Invoke `callback` for every sample received from now on, in arrival
    /// order. Flushes the queue. Fails once pull operations have been used.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_callback<F, Fut>(&self, callback: F) -> Result<()>
    where
        F: Fn(Sample) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |sample| callback(sample).boxed());
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut state.mode, ConsumptionMode::Unconsumed) {
            ConsumptionMode::Pull => {
                state.mode = ConsumptionMode::Pull;
                return Err(Error::InvalidMode(format!(
                    "{} is being read with pull operations; cannot set a callback",
                    self.inner.key
                )));
            }
            ConsumptionMode::Push { callback_loop } => callback_loop.abort(),
            ConsumptionMode::Unconsumed => {}
        }
        if state.arrivals.is_none() {
            return Err(Error::Closed(self.inner.key.to_string()));
        }
        state.queue.clear();
        let callback_loop = tokio::spawn(callback_loop(Arc::clone(&self.inner), callback));
        state.mode = ConsumptionMode::Push { callback_loop };
        Ok(())
    }

    /// Remove the callback, returning the topic to the unconsumed mode.
    pub fn clear_callback(&self) {
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut state.mode, ConsumptionMode::Unconsumed) {
            ConsumptionMode::Push { callback_loop } => callback_loop.abort(),
            other => state.mode = other,
        }
    }

    /// Whether callbacks may run concurrently. When false, each callback
    /// finishes before the next sample is delivered.
    pub fn allow_multiple_callbacks(&self) -> bool {
        self.inner.allow_multiple_callbacks.load(Ordering::SeqCst)
    }

    pub fn set_allow_multiple_callbacks(&self, allow: bool) {
        self.inner
            .allow_multiple_callbacks
            .store(allow, Ordering::SeqCst);
    }
}

async fn callback_loop(inner: Arc<ReadTopicInner>, callback: Callback) {
    let mut running = JoinSet::new();
    loop {
        let sample = match inner.next_sample(None).await {
            Ok(sample) => sample,
            Err(_) => break,
        };
        if inner.allow_multiple_callbacks.load(Ordering::SeqCst) {
            while running.try_join_next().is_some() {}
            running.spawn(run_callback(inner.key.clone(), callback.clone(), sample));
        } else {
            run_callback(inner.key.clone(), callback.clone(), sample).await;
        }
    }
    while running.join_next().await.is_some() {}
}

async fn run_callback(key: TopicKey, callback: Callback, sample: Sample) {
    if AssertUnwindSafe(callback(sample)).catch_unwind().await.is_err() {
        tracing::error!(topic = %key, "Callback panicked");
    }
}
