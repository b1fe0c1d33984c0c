//! State of one chat surface, shared between the synchronizer and the task pumping snapshots
//! into it

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use super::{SyncError, SyncEvent, SyncState};
use crate::{
    model::{ChannelId, ChannelView},
    store::Snapshot,
};

/// Every transition is made under one lock. The generation counter is bumped whenever the
/// active channel is released, so a pump that was cancelled can never touch the view of the
/// channel that replaced it
#[derive(Debug, Default)]
pub(crate) struct Surface {
    inner: Mutex<SurfaceInner>,
}

#[derive(Debug, Default)]
struct SurfaceInner {
    generation: u64,
    state: SyncState,
    active: Option<ActiveChannel>,
}

/// Abandons the channel of one generation when dropped, unless it was disarmed once the channel
/// was fully opened
pub(crate) struct PendingOpen<'a> {
    surface: &'a Surface,
    generation: u64,
    armed: bool,
}

#[derive(Debug)]
struct ActiveChannel {
    channel: ChannelId,
    view: ChannelView,
    events: mpsc::UnboundedSender<SyncEvent>,
    pump: Option<JoinHandle<()>>,
}

impl Surface {
    /// Release any open channel and start subscribing to `channel`, returning the generation
    /// that owns the new channel and the receiving end of its events
    pub fn begin(&self, channel: ChannelId) -> (u64, mpsc::UnboundedReceiver<SyncEvent>) {
        let mut inner = self.inner.lock();
        inner.release();

        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(SyncEvent::State(SyncState::Subscribing));

        inner.state = SyncState::Subscribing;
        inner.active = Some(ActiveChannel {
            view: ChannelView::empty(channel.clone()),
            channel,
            events,
            pump: None,
        });

        (inner.generation, rx)
    }

    /// Hand the pump task of `generation` to the surface so it is aborted on release. If the
    /// generation was already released the task is aborted immediately
    pub fn attach(&self, generation: u64, pump: JoinHandle<()>) -> bool {
        let mut inner = self.inner.lock();
        match inner.current_mut(generation) {
            Some(active) => {
                active.pump = Some(pump);
                true
            }
            None => {
                pump.abort();
                false
            }
        }
    }

    /// Replace the view with `snapshot` if `generation` still owns the surface. Returns `false`
    /// if the snapshot was discarded
    pub fn apply(&self, generation: u64, snapshot: Snapshot) -> bool {
        let mut inner = self.inner.lock();
        let was_live = inner.state == SyncState::Live;

        let Some(active) = inner.current_mut(generation) else {
            return false;
        };

        active.view = ChannelView::new(active.channel.clone(), snapshot);
        let view = active.view.clone();
        let events = active.events.clone();

        if !was_live {
            log::debug!("Channel {} is live", view.channel().short());
            inner.state = SyncState::Live;
            let _ = events.send(SyncEvent::State(SyncState::Live));
        }
        let _ = events.send(SyncEvent::Snapshot(view));

        true
    }

    /// Mark the channel of `generation` as degraded, keeping its last view
    pub fn degrade(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.current_mut(generation).is_none() {
            return false;
        }

        inner.state = SyncState::Degraded;
        inner.emit(SyncEvent::State(SyncState::Degraded));
        true
    }

    /// Report that the channel of `generation` could not be recovered
    pub fn lose(&self, generation: u64, error: SyncError) {
        let mut inner = self.inner.lock();
        if inner.current_mut(generation).is_some() {
            inner.emit(SyncEvent::SubscriptionLost(error));
        }
    }

    /// Release the channel of `generation` if it still owns the surface
    pub fn abandon(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.release();
        }
    }

    /// Release the active channel, if any. Returns the channel that was released
    pub fn release(&self) -> Option<ChannelId> {
        self.inner.lock().release()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && inner.active.is_some()
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|active| active.channel.clone())
    }

    pub fn view(&self) -> Option<ChannelView> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|active| active.view.clone())
    }
}

impl<'a> PendingOpen<'a> {
    pub fn new(surface: &'a Surface, generation: u64) -> Self {
        Self {
            surface,
            generation,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("Open of generation {} did not complete", self.generation);
            self.surface.abandon(self.generation);
        }
    }
}

impl SurfaceInner {
    fn current_mut(&mut self, generation: u64) -> Option<&mut ActiveChannel> {
        match self.generation == generation {
            true => self.active.as_mut(),
            false => None,
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(active) = &self.active {
            let _ = active.events.send(event);
        }
    }

    fn release(&mut self) -> Option<ChannelId> {
        self.generation += 1;
        self.state = SyncState::Closed;

        let active = self.active.take()?;
        if let Some(pump) = active.pump {
            pump.abort();
        }
        log::debug!("Released channel {}", active.channel.short());

        Some(active.channel)
    }
}
