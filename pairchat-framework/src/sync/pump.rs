use std::sync::Arc;

use futures::StreamExt;

use super::{surface::Surface, ResubscribePolicy, SyncError};
use crate::{
    model::ChannelId,
    store::{MessageStore, SnapshotStream},
};

/// Feed snapshots of `channel` into the surface for as long as `generation` owns it,
/// resubscribing whenever the store drops the subscription
pub(super) async fn run<S: MessageStore>(
    surface: Arc<Surface>,
    store: Arc<S>,
    policy: ResubscribePolicy,
    channel: ChannelId,
    generation: u64,
    mut stream: SnapshotStream,
) {
    loop {
        while let Some(snapshot) = stream.next().await {
            match snapshot {
                Ok(snapshot) => {
                    if !surface.apply(generation, snapshot) {
                        log::trace!("Discarding snapshot of released channel {}", channel.short());
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("Subscription to channel {} failed: {}", channel.short(), e);
                    break;
                }
            }
        }

        drop(stream);
        if !surface.degrade(generation) {
            return;
        }

        stream = match resubscribe(&surface, &*store, &policy, &channel, generation).await {
            Some(stream) => stream,
            None => return,
        };
    }
}

async fn resubscribe<S: MessageStore>(
    surface: &Surface,
    store: &S,
    policy: &ResubscribePolicy,
    channel: &ChannelId,
    generation: u64,
) -> Option<SnapshotStream> {
    let mut attempt = 0;

    while policy.allows(attempt) {
        tokio::time::sleep(policy.backoff(attempt)).await;
        if !surface.is_current(generation) {
            return None;
        }

        match store.subscribe_ordered(channel).await {
            Ok(stream) => {
                log::debug!(
                    "Resubscribed to channel {} after {} attempt(s)",
                    channel.short(),
                    attempt + 1
                );
                return Some(stream);
            }
            Err(e) => {
                log::debug!(
                    "Resubscription attempt {} to channel {} failed: {}",
                    attempt + 1,
                    channel.short(),
                    e
                );
                attempt += 1;
            }
        }
    }

    log::error!("Giving up on channel {} after {} attempts", channel.short(), attempt);
    surface.lose(generation, SyncError::RetriesExhausted { attempts: attempt });
    None
}
