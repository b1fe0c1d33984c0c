//! Live, ordered view of one channel with write-through sends
//!
//! A [ChannelSynchronizer] is one chat surface: it holds at most one live subscription at a
//! time. Every snapshot pushed by the [MessageStore] replaces the view in full, and sent messages
//! only appear once the store echoes them back in a snapshot.

mod config;
mod pump;
mod surface;

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc;

pub use config::{ResubscribePolicy, SyncConfig};

use self::surface::{PendingOpen, Surface};
use crate::{
    model::{AddressError, ChannelId, ChannelView, Message, NewMessage, Participant},
    store::{MessageStore, StoreError},
};

/// Lifecycle of the subscription held by a [ChannelSynchronizer]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No channel is open
    #[default]
    Closed,
    /// A subscription was established but the first snapshot has not arrived
    Subscribing,
    /// The view reflects the most recent snapshot from the store
    Live,
    /// The subscription was lost, the last view is kept while resubscribing
    Degraded,
}

/// Notifications pushed to the [ChannelHandle] of an open channel
#[derive(Debug)]
pub enum SyncEvent {
    State(SyncState),
    /// The view was replaced by a new snapshot from the store
    Snapshot(ChannelView),
    /// Resubscription was given up, the channel stays degraded until it is opened again
    SubscriptionLost(SyncError),
}

/// Result of a successful [ChannelSynchronizer::send]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The text was blank, nothing was written
    Empty,
    /// The message was accepted by the store, it becomes visible with the next snapshot
    Sent(Message),
}

/// Any error that may occur when operating a [ChannelSynchronizer]
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Cannot address channel: {0}")]
    InvalidIdentity(#[from] AddressError),
    #[error("Failed to subscribe to channel: {0}")]
    Subscription(#[source] StoreError),
    #[error("Failed to write message: {0}")]
    Write(#[source] StoreError),
    #[error("No channel is open")]
    NotOpen,
    #[error("Channel {requested} is not the open channel {open}")]
    ChannelMismatch { requested: ChannelId, open: ChannelId },
    #[error("{0:?} is not a participant of channel {1}")]
    NotParticipant(String, ChannelId),
    #[error("Gave up resubscribing after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Owns the lifecycle of a live subscription to one channel at a time and writes sent messages
/// through to the store
#[derive(Debug)]
pub struct ChannelSynchronizer<S: MessageStore> {
    store: Arc<S>,
    cfg: SyncConfig,
    surface: Arc<Surface>,
}

/// Receiving end of the events of one opened channel. The stream ends once the channel is closed
/// or replaced by another
#[derive(Debug)]
pub struct ChannelHandle {
    channel: ChannelId,
    events: mpsc::UnboundedReceiver<SyncEvent>,
}

impl<S: MessageStore> ChannelSynchronizer<S> {
    /// Create a new synchronizer with no channel open
    pub fn new(store: Arc<S>, cfg: SyncConfig) -> Self {
        Self {
            store,
            cfg,
            surface: Arc::new(Surface::default()),
        }
    }

    /// Open the channel between `me` and `peer`, see [open](Self::open)
    pub async fn open_between(
        &self,
        me: &Participant,
        peer: &Participant,
    ) -> Result<ChannelHandle, SyncError> {
        let channel = ChannelId::between(me, peer)?;
        self.open(channel).await
    }

    /// Subscribe to the ordered log of `channel`, releasing any channel that was open before.
    ///
    /// Snapshots are pushed to the returned handle as they arrive. Fails if the store refuses
    /// the initial subscription, in which case no channel is left open
    pub async fn open(&self, channel: ChannelId) -> Result<ChannelHandle, SyncError> {
        let (generation, events) = self.surface.begin(channel.clone());
        log::debug!("Opening channel {}", channel.short());

        // Releases the channel on failure, or if this future is dropped while subscribing
        let pending = PendingOpen::new(&self.surface, generation);
        let stream = match self.store.subscribe_ordered(&channel).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Failed to subscribe to channel {}: {}", channel.short(), e);
                return Err(SyncError::Subscription(e));
            }
        };

        let pump = tokio::spawn(pump::run(
            self.surface.clone(),
            self.store.clone(),
            self.cfg.resubscribe.clone(),
            channel.clone(),
            generation,
            stream,
        ));
        self.surface.attach(generation, pump);
        pending.disarm();

        Ok(ChannelHandle { channel, events })
    }

    /// Write a message from `author` to `channel`.
    ///
    /// Blank text is not sent. Sending is only allowed to the open channel, including while it
    /// is still waiting for its first snapshot. The view is not touched, the message appears once
    /// the store pushes a snapshot containing it. A failed write is not retried
    pub async fn send(
        &self,
        channel: &ChannelId,
        author: &Participant,
        text: &str,
    ) -> Result<SendOutcome, SyncError> {
        let Some(msg) = NewMessage::compose(author, text) else {
            log::trace!("Ignoring blank message for channel {}", channel.short());
            return Ok(SendOutcome::Empty);
        };

        match self.surface.channel() {
            None => return Err(SyncError::NotOpen),
            Some(open) if open != *channel => {
                return Err(SyncError::ChannelMismatch {
                    requested: channel.clone(),
                    open,
                })
            }
            Some(_) => (),
        }

        if !channel.involves(&author.identity) {
            return Err(SyncError::NotParticipant(author.identity.clone(), channel.clone()));
        }

        match self.store.append(channel, msg).await {
            Ok(stored) => Ok(SendOutcome::Sent(stored)),
            Err(e) => {
                log::warn!("Failed to send message to channel {}: {}", channel.short(), e);
                Err(SyncError::Write(e))
            }
        }
    }

    /// Release the open channel, if any. Safe to call any number of times
    pub fn close(&self) {
        if let Some(channel) = self.surface.release() {
            log::debug!("Closed channel {}", channel.short());
        }
    }

    pub fn state(&self) -> SyncState {
        self.surface.state()
    }

    /// Get the channel that is currently open
    pub fn channel(&self) -> Option<ChannelId> {
        self.surface.channel()
    }

    /// Get a copy of the current view of the open channel
    pub fn view(&self) -> Option<ChannelView> {
        self.surface.view()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: MessageStore> Drop for ChannelSynchronizer<S> {
    fn drop(&mut self) {
        self.surface.release();
    }
}

impl ChannelHandle {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Wait for the next event, returns `None` once the channel was released
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Wait for the next snapshot, skipping any other events
    pub async fn next_snapshot(&mut self) -> Option<ChannelView> {
        loop {
            if let SyncEvent::Snapshot(view) = self.next_event().await? {
                return Some(view);
            }
        }
    }
}

impl Stream for ChannelHandle {
    type Item = SyncEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
