//! Shared helpers for the end-to-end channel tests

use std::time::Duration;

use pairchat_framework::{model::ChannelView, ChannelHandle, SyncEvent, SyncState};

/// Default timeout for operations that are expected to finish
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Run an async operation, panicking if it does not finish within [TEST_TIMEOUT]
pub async fn with_timeout<T, F>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("Test operation timed out")
}

/// Wait until a snapshot holding exactly `len` messages is delivered to `handle`
pub async fn snapshot_with_len(handle: &mut ChannelHandle, len: usize) -> ChannelView {
    with_timeout(async {
        loop {
            match handle.next_snapshot().await {
                Some(view) if view.len() == len => return view,
                Some(_) => continue,
                None => panic!("channel was released before reaching {} messages", len),
            }
        }
    })
    .await
}

/// Wait until `handle` reports a transition to `state`
pub async fn state_reached(handle: &mut ChannelHandle, state: SyncState) {
    with_timeout(async {
        loop {
            match handle.next_event().await {
                Some(SyncEvent::State(s)) if s == state => return,
                Some(_) => continue,
                None => panic!("channel was released before reaching {:?}", state),
            }
        }
    })
    .await
}
