//! Per-component session: topic registry and dispatch loop.
//!
//! A session owns the readers and writers of one component instance. After
//! `start()` it delivers historical data, then runs a dispatch task that
//! asks a dedicated worker thread to block on the transport's wait set and
//! drains whatever became ready into the topic queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::ack::Ack;
use crate::command::CommandTracker;
use crate::config::{defaults, AckIdentityPolicy, SessionConfig};
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::metadata::{ComponentMetadata, MetadataSource};
use crate::sample::{Delivery, Origin, Sample};
use crate::topic::read::{HookAction, ReadTopicInner, SampleHook};
use crate::topic::{ReadTopic, ReadTopicOptions, WriteTopic};
use crate::transport::{ReaderId, ReaderSpec, TopicKind, Transport, WaitSet, WriterId, WriterSpec};

/// Lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    /// Historical data delivered; the dispatch loop is running.
    Started,
    /// The dispatch loop stopped on a fatal transport error.
    Failed(String),
    Closed,
}

struct WaitRequest {
    timeout: Duration,
    reply: oneshot::Sender<Result<Vec<ReaderId>>>,
}

pub(crate) struct SessionInner {
    domain: Domain,
    name: String,
    index: u32,
    metadata: ComponentMetadata,
    config: SessionConfig,
    identity: String,
    readers: Mutex<HashMap<ReaderId, Arc<ReadTopicInner>>>,
    writers: Mutex<Vec<WriterId>>,
    commands: CommandTracker,
    next_seq_num: Mutex<i64>,
    ack_reader: Mutex<Option<ReadTopic>>,
    ack_writer: Mutex<Option<WriteTopic>>,
    is_open: AtomicBool,
    start_called: AtomicBool,
    status: watch::Sender<SessionStatus>,
    failure: Mutex<Option<String>>,
    wait_set: Mutex<Option<Arc<dyn WaitSet>>>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SessionInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn partition(&self) -> &str {
        &self.config.partition
    }

    pub(crate) fn metadata(&self) -> &ComponentMetadata {
        &self.metadata
    }

    pub(crate) fn domain(&self) -> &Domain {
        &self.domain
    }

    pub(crate) fn commands(&self) -> &CommandTracker {
        &self.commands
    }

    pub(crate) fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn name_index(&self) -> String {
        if self.index == 0 {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.index)
        }
    }

    /// Origin stamped on messages this session writes.
    pub(crate) fn writer_origin(&self) -> Origin {
        self.domain.origin_for(&self.identity)
    }

    /// Next command sequence number; wraps back to 1.
    pub(crate) fn next_seq_num(&self) -> i64 {
        let mut next = self.next_seq_num.lock();
        let seq_num = *next;
        *next = if seq_num >= i64::from(i32::MAX) { 1 } else { seq_num + 1 };
        seq_num
    }

    /// Fail unless the component has this topic.
    pub(crate) fn check_topic(&self, kind: TopicKind, name: &str) -> Result<()> {
        if kind == TopicKind::AckCommand || self.metadata.topic(kind, name).is_some() {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "{} has no {kind:?} topic {name}",
                self.name
            )))
        }
    }

    pub(crate) fn add_reader<F>(&self, spec: &ReaderSpec, build: F) -> Result<Arc<ReadTopicInner>>
    where
        F: FnOnce(ReaderId) -> Arc<ReadTopicInner>,
    {
        if !self.is_open() {
            return Err(Error::Closed(self.name_index()));
        }
        let mut readers = self.readers.lock();
        if self.start_called.load(Ordering::SeqCst) {
            return Err(Error::Protocol(format!(
                "cannot add {} after {} has started",
                spec.key,
                self.name_index()
            )));
        }
        let reader_id = self.domain.transport().create_reader(spec)?;
        let reader = build(reader_id);
        readers.insert(reader_id, Arc::clone(&reader));
        Ok(reader)
    }

    pub(crate) fn add_writer(&self, spec: &WriterSpec) -> Result<WriterId> {
        if !self.is_open() {
            return Err(Error::Closed(self.name_index()));
        }
        let writer_id = self.domain.transport().create_writer(spec)?;
        self.writers.lock().push(writer_id);
        Ok(writer_id)
    }

    /// Create the ack reader that routes acknowledgments to the tracker.
    pub(crate) fn ensure_ack_reader(this: &Arc<Self>) -> Result<()> {
        let mut slot = this.ack_reader.lock();
        if slot.is_none() {
            let hook: Arc<dyn SampleHook> = Arc::new(AckRouter {
                session: Arc::downgrade(this),
            });
            *slot = Some(ReadTopic::with_hook(
                this,
                TopicKind::AckCommand,
                "ackcmd",
                ReadTopicOptions::command(),
                Some(hook),
            )?);
        }
        Ok(())
    }

    /// Shared writer for acknowledgments of received commands.
    pub(crate) fn ack_writer(this: &Arc<Self>) -> Result<WriteTopic> {
        let mut slot = this.ack_writer.lock();
        if let Some(writer) = slot.as_ref() {
            return Ok(writer.clone());
        }
        let writer = WriteTopic::open(this, TopicKind::AckCommand, "ackcmd")?;
        *slot = Some(writer.clone());
        Ok(writer)
    }

    fn accepts_ack_identity(&self, identity: &str) -> bool {
        match self.config.ack_identity_policy {
            AckIdentityPolicy::Lenient => identity.is_empty() || identity == self.identity,
            AckIdentityPolicy::Strict => identity == self.identity,
        }
    }

    fn reader(&self, reader_id: ReaderId) -> Option<Arc<ReadTopicInner>> {
        self.readers.lock().get(&reader_id).cloned()
    }

    fn to_samples(&self, reader: &ReadTopicInner, deliveries: Vec<Delivery>) -> Vec<Sample> {
        let time = self.domain.time();
        deliveries
            .into_iter()
            .filter_map(|delivery| {
                if delivery.valid {
                    Some(Sample::from_delivery(delivery, time))
                } else {
                    tracing::warn!(topic = %reader.key(), "Skipping invalid sample");
                    None
                }
            })
            .collect()
    }

    /// Take pending data, retrying once after a short delay.
    async fn take_with_retry(&self, reader: &ReadTopicInner) -> Result<Vec<Delivery>> {
        let transport = self.domain.transport();
        match transport.take(reader.reader_id(), reader.queue_len()) {
            Ok(deliveries) => Ok(deliveries),
            Err(e) => {
                tracing::warn!(topic = %reader.key(), error = %e, "Take failed; retrying");
                tokio::time::sleep(defaults::TAKE_RETRY_DELAY).await;
                transport
                    .take(reader.reader_id(), reader.queue_len())
                    .map_err(|e| Error::Transport(format!("giving up reading {}: {e}", reader.key())))
            }
        }
    }

    fn fail(&self, message: String) {
        tracing::error!(session = %self.name_index(), "Dispatch loop failed: {message}");
        *self.failure.lock() = Some(message.clone());
        if self.is_open() {
            self.status.send_replace(SessionStatus::Failed(message));
        }
    }

    async fn start(this: &Arc<Self>) -> Result<()> {
        if this.start_called.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol(format!(
                "start already called for {}",
                this.name_index()
            )));
        }
        if !this.is_open() {
            return Err(Error::Closed(this.name_index()));
        }

        let readers: Vec<Arc<ReadTopicInner>> = this.readers.lock().values().cloned().collect();
        let transport = Arc::clone(this.domain.transport());
        let reader_ids: Vec<ReaderId> = readers.iter().map(|r| r.reader_id()).collect();
        let wait_set = transport.create_wait_set(&reader_ids)?;
        *this.wait_set.lock() = Some(Arc::clone(&wait_set));

        let durable: Vec<Arc<ReadTopicInner>> =
            readers.into_iter().filter(|r| !r.volatile()).collect();
        if !durable.is_empty() {
            Self::wait_for_history(this, &transport, &durable).await?;
            for reader in &durable {
                if !this.is_open() {
                    return Ok(());
                }
                let deliveries = this.take_with_retry(reader).await?;
                if reader.max_history() == 0 {
                    continue;
                }
                let mut samples = this.to_samples(reader, deliveries);
                let excess = samples.len().saturating_sub(reader.max_history());
                samples.drain(..excess);
                if !samples.is_empty() {
                    tracing::debug!(topic = %reader.key(), count = samples.len(), "Delivering historical data");
                    reader.queue_samples(samples);
                }
            }
        }

        if !this.is_open() {
            return Ok(());
        }
        let requests = Self::spawn_worker(this, Arc::clone(&wait_set))?;
        let read_loop = tokio::spawn(read_loop(
            Arc::downgrade(this),
            requests,
            this.config.wait_timeout,
        ));
        *this.read_loop.lock() = Some(read_loop);

        // A close that raced the spawn may have missed the loop.
        if !this.is_open() {
            if let Some(read_loop) = this.read_loop.lock().take() {
                read_loop.abort();
            }
            wait_set.wake();
            return Ok(());
        }
        let started = this.status.send_if_modified(|status| {
            if *status == SessionStatus::Created {
                *status = SessionStatus::Started;
                true
            } else {
                false
            }
        });
        if started {
            tracing::info!(session = %this.name_index(), "Session started");
        }
        Ok(())
    }

    async fn wait_for_history(
        this: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        durable: &[Arc<ReadTopicInner>],
    ) -> Result<()> {
        let ids: Vec<ReaderId> = durable.iter().map(|r| r.reader_id()).collect();
        let budget = this.config.history_sync;
        let transport = Arc::clone(transport);
        let session = Arc::clone(this);
        let started = Instant::now();
        let (num_ok, num_checked) = tokio::task::spawn_blocking(move || {
            let mut num_ok = 0usize;
            let mut num_checked = 0usize;
            for id in ids {
                if !session.is_open() {
                    break;
                }
                let remaining = budget
                    .saturating_sub(started.elapsed())
                    .max(defaults::MIN_HISTORY_WAIT);
                num_checked += 1;
                if transport.wait_for_historical_data(id, remaining) {
                    num_ok += 1;
                }
            }
            (num_ok, num_checked)
        })
        .await
        .map_err(|e| Error::Transport(format!("history wait failed: {e}")))?;

        let elapsed = started.elapsed();
        if num_ok > 0 || num_checked == 0 {
            tracing::info!(
                session = %this.name_index(),
                num_ok,
                num_checked,
                "Read historical data in {:.2} sec",
                elapsed.as_secs_f64()
            );
        } else {
            tracing::warn!(
                session = %this.name_index(),
                num_checked,
                "Could not read historical data in {:.2} sec",
                elapsed.as_secs_f64()
            );
        }
        Ok(())
    }

    fn spawn_worker(this: &Arc<Self>, wait_set: Arc<dyn WaitSet>) -> Result<mpsc::Sender<WaitRequest>> {
        let (tx, mut rx) = mpsc::channel::<WaitRequest>(1);
        let domain = this.domain.clone();
        domain.read_loop_started();
        let spawned = std::thread::Builder::new()
            .name(format!("telebus-wait-{}", this.name_index()))
            .spawn({
                let domain = domain.clone();
                move || {
                    while let Some(request) = rx.blocking_recv() {
                        let _ = request.reply.send(wait_set.wait(request.timeout));
                    }
                    domain.read_loop_stopped();
                }
            });
        match spawned {
            Ok(handle) => {
                *this.worker.lock() = Some(handle);
                Ok(tx)
            }
            Err(e) => {
                domain.read_loop_stopped();
                Err(Error::Transport(format!("cannot spawn wait worker: {e}")))
            }
        }
    }

    pub(crate) async fn close(this: &Arc<Self>) {
        if !this.is_open.swap(false, Ordering::SeqCst) {
            let mut status = this.status.subscribe();
            let _ = status.wait_for(|s| *s == SessionStatus::Closed).await;
            return;
        }
        tracing::debug!(session = %this.name_index(), "Closing session");

        if let Some(read_loop) = this.read_loop.lock().take() {
            read_loop.abort();
        }
        let wait_set = this.wait_set.lock().take();
        if let Some(wait_set) = &wait_set {
            wait_set.wake();
        }
        let worker = this.worker.lock().take();
        if let Some(worker) = worker {
            let joined = tokio::task::spawn_blocking(move || worker.join());
            if tokio::time::timeout(defaults::CLOSE_GRACE, joined).await.is_err() {
                tracing::warn!(session = %this.name_index(), "Wait worker did not stop in time");
            }
        }
        drop(wait_set);

        let transport = this.domain.transport();
        let readers: Vec<Arc<ReadTopicInner>> =
            this.readers.lock().drain().map(|(_, reader)| reader).collect();
        for reader in readers {
            reader.close();
            transport.close_reader(reader.reader_id());
        }
        this.ack_reader.lock().take();
        this.ack_writer.lock().take();
        let writers: Vec<WriterId> = this.writers.lock().drain(..).collect();
        for writer in writers {
            transport.close_writer(writer);
        }
        this.commands.abort_all("shutting down");
        this.status.send_replace(SessionStatus::Closed);
    }
}

async fn read_loop(
    session: Weak<SessionInner>,
    requests: mpsc::Sender<WaitRequest>,
    wait_timeout: Duration,
) {
    let mut wait_failed = false;
    loop {
        let (reply, response) = oneshot::channel();
        let request = WaitRequest {
            timeout: wait_timeout,
            reply,
        };
        if requests.send(request).await.is_err() {
            break;
        }
        let Ok(ready) = response.await else {
            break;
        };
        let Some(this) = session.upgrade() else {
            break;
        };
        if !this.is_open() {
            break;
        }
        let ready = match ready {
            Ok(ready) => {
                wait_failed = false;
                ready
            }
            Err(e) if !wait_failed => {
                tracing::warn!(error = %e, "Wait failed; retrying");
                wait_failed = true;
                tokio::time::sleep(defaults::TAKE_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                this.fail(format!("giving up waiting for data: {e}"));
                break;
            }
        };

        for reader_id in ready {
            let Some(reader) = this.reader(reader_id) else {
                continue;
            };
            match this.take_with_retry(&reader).await {
                Ok(deliveries) => {
                    let samples = this.to_samples(&reader, deliveries);
                    reader.queue_samples(samples);
                }
                Err(e) => {
                    this.fail(e.to_string());
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Routes received acknowledgments to the command tracker.
struct AckRouter {
    session: Weak<SessionInner>,
}

impl SampleHook for AckRouter {
    fn on_sample(&self, sample: &Sample) -> HookAction {
        let Some(session) = self.session.upgrade() else {
            return HookAction::Consume;
        };
        match Ack::from_sample(sample) {
            Ok(ack) => {
                if session.accepts_ack_identity(&ack.identity) {
                    session.commands.route(ack);
                } else {
                    tracing::trace!(identity = %ack.identity, "Ignoring ack for another commander");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed ack"),
        }
        HookAction::Consume
    }
}

/// Session of one component instance.
///
/// Topics must be created before [`Session::start`]; [`Session::close`]
/// must be called to release the transport resources.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session for component `name` with instance `index`
    /// (0 means "any instance" for readers).
    pub fn new(
        domain: &Domain,
        name: &str,
        index: u32,
        metadata: &dyn MetadataSource,
        config: SessionConfig,
    ) -> Result<Self> {
        let metadata = metadata.load(name)?;
        if index > defaults::MAX_SAL_INDEX {
            return Err(Error::Config(format!(
                "index {index} exceeds {}",
                defaults::MAX_SAL_INDEX
            )));
        }
        if index != 0 && !metadata.indexed {
            return Err(Error::Config(format!(
                "{name} is not indexed; index must be 0, not {index}"
            )));
        }
        let identity = config
            .identity
            .clone()
            .unwrap_or_else(|| domain.default_identity().to_string());
        let initial_seq_num = rand::thread_rng().gen_range(1..=i64::from(i32::MAX / 2));
        let (status, _) = watch::channel(SessionStatus::Created);
        let inner = Arc::new(SessionInner {
            domain: domain.clone(),
            name: name.to_string(),
            index,
            metadata,
            config,
            identity,
            readers: Mutex::new(HashMap::new()),
            writers: Mutex::new(Vec::new()),
            commands: CommandTracker::new(),
            next_seq_num: Mutex::new(initial_seq_num),
            ack_reader: Mutex::new(None),
            ack_writer: Mutex::new(None),
            is_open: AtomicBool::new(true),
            start_called: AtomicBool::new(false),
            status,
            failure: Mutex::new(None),
            wait_set: Mutex::new(None),
            read_loop: Mutex::new(None),
            worker: Mutex::new(None),
        });
        domain.register_session(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// `name` or `name:index`.
    pub fn name_index(&self) -> String {
        self.inner.name_index()
    }

    /// Identity stamped on outgoing messages.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn metadata(&self) -> &ComponentMetadata {
        &self.inner.metadata
    }

    pub fn domain(&self) -> &Domain {
        &self.inner.domain
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch lifecycle changes, including dispatch failures.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Message of the fatal error that stopped the dispatch loop, if any.
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    /// Number of issued commands still being tracked.
    pub fn num_running_commands(&self) -> usize {
        self.inner.commands.len()
    }

    /// Deliver historical data and start the dispatch loop. May be called
    /// once.
    pub async fn start(&self) -> Result<()> {
        SessionInner::start(&self.inner).await
    }

    /// Stop the dispatch loop, close every topic and abort running
    /// commands. Concurrent and repeated calls all return once closed.
    pub async fn close(&self) {
        SessionInner::close(&self.inner).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("index", &self.inner.index)
            .field("identity", &self.inner.identity)
            .finish()
    }
}
