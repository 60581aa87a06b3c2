//! In-process transport.
//!
//! Every reader has a keep-last queue; non-volatile writers retain their
//! output so readers created later receive it as historical data. Wait sets
//! block on a condition variable shared with the writers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::defaults;
use crate::error::{Error, Result};
use crate::sample::{Delivery, Fields, Message, Origin};
use crate::time::utc_now_unix;
use crate::transport::{ReaderId, ReaderSpec, TopicKey, Transport, WaitSet, WriterId, WriterSpec};

struct MemReader {
    spec: ReaderSpec,
    queue: VecDeque<Delivery>,
}

impl MemReader {
    fn accepts(&self, partition: &str, key: &TopicKey, sal_index: u32) -> bool {
        self.spec.partition == partition
            && &self.spec.key == key
            && (self.spec.index == 0 || self.spec.index == sal_index)
    }

    fn push(&mut self, delivery: Delivery, depth: usize) {
        if self.queue.len() >= depth {
            self.queue.pop_front();
        }
        self.queue.push_back(delivery);
    }
}

#[derive(Default)]
struct WaitSetState {
    readers: Vec<ReaderId>,
    woken: bool,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    readers: HashMap<ReaderId, MemReader>,
    writers: HashMap<WriterId, WriterSpec>,
    retained: HashMap<(String, TopicKey), VecDeque<Message>>,
    wait_sets: HashMap<u64, WaitSetState>,
    failing_takes: usize,
    history_unavailable: bool,
}

impl BusState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Shared {
    state: Mutex<BusState>,
    cond: Condvar,
    depth: usize,
}

/// In-process [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_depth(defaults::READ_QUEUE_LEN)
    }

    /// Create a transport whose reader queues and retained history hold
    /// `depth` messages.
    pub fn with_depth(depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                cond: Condvar::new(),
                depth: depth.max(1),
            }),
        }
    }

    /// Make the next `count` takes fail.
    pub fn fail_next_takes(&self, count: usize) {
        self.shared.state.lock().failing_takes = count;
    }

    /// When false, historical data waits time out.
    pub fn set_history_available(&self, available: bool) {
        self.shared.state.lock().history_unavailable = !available;
    }

    /// Deliver an invalid (metadata-only) sample to every matching reader.
    pub fn write_invalid(&self, partition: &str, key: &TopicKey, sal_index: u32) {
        let delivery = Delivery {
            message: Message {
                sal_index,
                seq_num: 0,
                origin: Origin::default(),
                snd_stamp: 0.0,
                fields: Fields::new(),
            },
            reception_utc: utc_now_unix(),
            valid: false,
        };
        let depth = self.shared.depth;
        let mut state = self.shared.state.lock();
        for reader in state.readers.values_mut() {
            if reader.accepts(partition, key, sal_index) {
                reader.push(delivery.clone(), depth);
            }
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Number of open readers.
    pub fn num_readers(&self) -> usize {
        self.shared.state.lock().readers.len()
    }

    /// Number of open writers.
    pub fn num_writers(&self) -> usize {
        self.shared.state.lock().writers.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn create_reader(&self, spec: &ReaderSpec) -> Result<ReaderId> {
        let depth = self.shared.depth;
        let mut state = self.shared.state.lock();
        let id = state.allocate_id();
        let mut reader = MemReader {
            spec: spec.clone(),
            queue: VecDeque::new(),
        };
        if !spec.volatile {
            let now = utc_now_unix();
            if let Some(history) = state.retained.get(&(spec.partition.clone(), spec.key.clone())) {
                for message in history {
                    if spec.index == 0 || spec.index == message.sal_index {
                        reader.push(
                            Delivery {
                                message: message.clone(),
                                reception_utc: now,
                                valid: true,
                            },
                            depth,
                        );
                    }
                }
            }
        }
        state.readers.insert(id, reader);
        Ok(id)
    }

    fn create_writer(&self, spec: &WriterSpec) -> Result<WriterId> {
        let mut state = self.shared.state.lock();
        let id = state.allocate_id();
        state.writers.insert(id, spec.clone());
        Ok(id)
    }

    fn write(&self, writer: WriterId, message: Message) -> Result<()> {
        let depth = self.shared.depth;
        let mut state = self.shared.state.lock();
        let spec = state
            .writers
            .get(&writer)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("writer {writer} is closed")))?;

        let delivery = Delivery {
            message: message.clone(),
            reception_utc: utc_now_unix(),
            valid: true,
        };
        for reader in state.readers.values_mut() {
            if reader.accepts(&spec.partition, &spec.key, message.sal_index) {
                reader.push(delivery.clone(), depth);
            }
        }
        if !spec.volatile {
            let history = state.retained.entry((spec.partition, spec.key)).or_default();
            if history.len() >= depth {
                history.pop_front();
            }
            history.push_back(message);
        }
        drop(state);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn take(&self, reader: ReaderId, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.shared.state.lock();
        if state.failing_takes > 0 {
            state.failing_takes -= 1;
            return Err(Error::Transport("injected take failure".into()));
        }
        let reader = state
            .readers
            .get_mut(&reader)
            .ok_or_else(|| Error::Transport(format!("reader {reader} is closed")))?;
        let count = max.min(reader.queue.len());
        Ok(reader.queue.drain(..count).collect())
    }

    fn wait_for_historical_data(&self, reader: ReaderId, timeout: Duration) -> bool {
        let available = {
            let state = self.shared.state.lock();
            state.readers.contains_key(&reader) && !state.history_unavailable
        };
        if !available {
            std::thread::sleep(timeout);
        }
        available
    }

    fn create_wait_set(&self, readers: &[ReaderId]) -> Result<Arc<dyn WaitSet>> {
        let mut state = self.shared.state.lock();
        let id = state.allocate_id();
        state.wait_sets.insert(
            id,
            WaitSetState {
                readers: readers.to_vec(),
                woken: false,
            },
        );
        Ok(Arc::new(MemWaitSet {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close_reader(&self, reader: ReaderId) {
        self.shared.state.lock().readers.remove(&reader);
    }

    fn close_writer(&self, writer: WriterId) {
        self.shared.state.lock().writers.remove(&writer);
    }
}

struct MemWaitSet {
    id: u64,
    shared: Arc<Shared>,
}

impl WaitSet for MemWaitSet {
    fn wait(&self, timeout: Duration) -> Result<Vec<ReaderId>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            let Some(wait_set) = state.wait_sets.get(&self.id) else {
                return Err(Error::Transport("wait set is closed".into()));
            };
            if wait_set.woken {
                if let Some(wait_set) = state.wait_sets.get_mut(&self.id) {
                    wait_set.woken = false;
                }
                return Ok(Vec::new());
            }
            let ready: Vec<ReaderId> = wait_set
                .readers
                .iter()
                .copied()
                .filter(|id| state.readers.get(id).is_some_and(|r| !r.queue.is_empty()))
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(Vec::new());
            }
        }
    }

    fn wake(&self) {
        if let Some(wait_set) = self.shared.state.lock().wait_sets.get_mut(&self.id) {
            wait_set.woken = true;
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for MemWaitSet {
    fn drop(&mut self) {
        self.shared.state.lock().wait_sets.remove(&self.id);
    }
}
