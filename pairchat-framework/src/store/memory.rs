//! Message store that keeps every channel log in process memory, with hooks to simulate
//! transport and write failures

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};

use super::{MessageStore, Snapshot, SnapshotStream, StoreError};
use crate::model::{ChannelId, Message, NewMessage};

/// Pending change notifications buffered per channel before slow subscribers start lagging
const DEFAULT_FANOUT_CAPACITY: usize = 64;

/// Message store holding all channel logs in memory. Cloning the store yields another handle
/// to the same logs
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Debug)]
struct MemoryStoreInner {
    /// Log and change notifier of every channel that has been written to or subscribed
    logs: DashMap<ChannelId, ChannelLog>,
    /// Counter used to assign the insertion order of appended messages
    next_seq: AtomicU64,
    /// Last timestamp handed out, timestamps never run backwards even if the system clock does
    clock: Mutex<DateTime<Utc>>,
    fanout_capacity: usize,
    /// Bumped to cut every live subscription at once
    severed: watch::Sender<u64>,
    offline: AtomicBool,
    failing_appends: AtomicUsize,
    writes: AtomicUsize,
}

#[derive(Debug)]
struct ChannelLog {
    messages: Vec<Message>,
    fanout: broadcast::Sender<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_fanout_capacity(DEFAULT_FANOUT_CAPACITY)
    }

    /// Create a store that buffers up to `capacity` change notifications per channel
    pub fn with_fanout_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                logs: DashMap::new(),
                next_seq: AtomicU64::new(1),
                clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
                fanout_capacity: capacity.max(1),
                severed: watch::channel(0).0,
                offline: AtomicBool::new(false),
                failing_appends: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Drop every live subscription with a transport error, as if the connection to the store
    /// was lost
    pub fn sever_subscriptions(&self) {
        log::debug!("Severing all live subscriptions");
        self.inner.severed.send_modify(|generation| *generation += 1);
    }

    /// While offline, new subscriptions fail with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject the next `count` appends
    pub fn fail_next_appends(&self, count: usize) {
        self.inner.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Number of messages successfully appended to any channel
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions to `channel`
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.inner
            .logs
            .get(channel)
            .map(|log| log.fanout.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn snapshot_of(&self, channel: &ChannelId) -> Snapshot {
        self.logs
            .get(channel)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Consume one injected append failure, if any are left
    fn take_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock();
        *clock = (*clock).max(Utc::now());
        *clock
    }
}

impl ChannelLog {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            fanout: broadcast::channel(capacity).0,
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn subscribe_ordered(&self, channel: &ChannelId) -> Result<SnapshotStream, StoreError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("store is offline".to_owned()));
        }

        let (initial, mut changes) = {
            let log = self
                .inner
                .logs
                .entry(channel.clone())
                .or_insert_with(|| ChannelLog::new(self.inner.fanout_capacity));
            (log.messages.clone(), log.fanout.subscribe())
        };
        let mut severed = self.inner.severed.subscribe();
        let inner = self.inner.clone();
        let channel = channel.clone();

        log::trace!("New memory subscription to channel {}", channel.short());

        Ok(Box::pin(stream! {
            yield Ok(initial);

            loop {
                let changed = tokio::select! {
                    _ = severed.changed() => None,
                    changed = changes.recv() => Some(changed),
                };

                match changed {
                    Some(Ok(())) | Some(Err(RecvError::Lagged(_))) => {
                        yield Ok(inner.snapshot_of(&channel));
                    }
                    Some(Err(RecvError::Closed)) => {
                        yield Err(StoreError::Transport("channel fan-out closed".to_owned()));
                        break;
                    }
                    None => {
                        yield Err(StoreError::Transport("subscription severed".to_owned()));
                        break;
                    }
                }
            }
        }))
    }

    async fn append(&self, channel: &ChannelId, msg: NewMessage) -> Result<Message, StoreError> {
        if self.inner.take_failure() {
            return Err(StoreError::Rejected("append failure injected".to_owned()));
        }

        let mut log = self
            .inner
            .logs
            .entry(channel.clone())
            .or_insert_with(|| ChannelLog::new(self.inner.fanout_capacity));

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let message = msg.stamp(seq, self.inner.tick());
        log.messages.push(message.clone());
        self.inner.writes.fetch_add(1, Ordering::SeqCst);

        // No receivers is not an error, the message is still persisted
        let _ = log.fanout.send(());
        log::trace!("Appended message {} to channel {}", seq, channel.short());

        Ok(message)
    }
}
