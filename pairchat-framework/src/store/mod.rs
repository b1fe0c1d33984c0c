//! Traits modelling the durable, ordered, append-only message log that every channel is
//! persisted in and fanned out from

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};

use crate::model::{ChannelId, Message, NewMessage};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreConfig};

/// Every message of a channel in ascending `(timestamp, seq)` order
pub type Snapshot = Vec<Message>;

/// Push-based stream of full snapshots for one channel. Dropping the stream unsubscribes.
///
/// A transport failure is yielded as an `Err` item, after which the stream ends
pub type SnapshotStream = BoxStream<'static, Result<Snapshot, StoreError>>;

/// Any error that may occur when operating on a message store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Store rejected the write: {0}")]
    Rejected(String),
    #[error("Failed to execute database operation: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("Failed to apply database migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Corrupt message record {seq}: {reason}")]
    CorruptRecord { seq: i64, reason: String },
}

/// A store of channel logs that is the single authority on message ordering.
///
/// Implementations assign each appended message a timestamp that never decreases within a
/// channel and a sequence number that breaks ties between equal timestamps
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Subscribe to the ordered log of `channel`. The returned stream first yields the current
    /// snapshot, then a new snapshot after every write to the channel
    async fn subscribe_ordered(&self, channel: &ChannelId) -> Result<SnapshotStream, StoreError>;

    /// Assign a timestamp and sequence to `msg`, persist it in the log of `channel`, and notify
    /// every subscriber of the channel
    async fn append(&self, channel: &ChannelId, msg: NewMessage) -> Result<Message, StoreError>;

    /// Read the current snapshot of `channel` once
    async fn snapshot(&self, channel: &ChannelId) -> Result<Snapshot, StoreError> {
        let mut stream = self.subscribe_ordered(channel).await?;
        match stream.next().await {
            Some(snapshot) => snapshot,
            None => Err(StoreError::Transport(
                "subscription ended before the initial snapshot".to_owned(),
            )),
        }
    }
}
