//! Durable message store backed by an sqlite database

use async_stream::stream;
use async_trait::async_trait;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{Instant, MissedTickBehavior},
};

use super::{MessageStore, Snapshot, SnapshotStream, StoreError};
use crate::model::{ChannelId, Message, NewMessage};

/// Configuration options for an [SqliteStore]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Change notifications buffered per channel before a slow subscriber skips to the latest
    /// snapshot
    pub fanout_capacity: usize,
    /// Interval at which subscriptions check the database for writes made by other processes
    pub poll_interval_ms: u64,
}

/// Row count and highest sequence number of a channel, changes with every append
type Watermark = (i64, Option<i64>);

/// What woke up a subscription
enum Wake {
    Notified,
    Poll,
    Closed,
}

/// A container for all channel logs persisted in an sqlite database. Writes made through this
/// store are fanned out to its subscriptions immediately, writes made by any other connection
/// to the same database are picked up on the next poll
#[derive(Debug)]
pub struct SqliteStore {
    /// Connection to an sqlite database used to store all messages
    db: SqlitePool,
    /// Change notifiers of all channels with live subscriptions
    fanout: DashMap<ChannelId, broadcast::Sender<()>>,
    cfg: SqliteStoreConfig,
}

impl SqliteStore {
    /// Create a new store over the given database connection pool, applying migrations
    pub async fn new(db: SqlitePool, cfg: SqliteStoreConfig) -> Result<Self, StoreError> {
        sqlx::migrate!("../migrations").run(&db).await.map_err(|e| {
            log::error!("Failed to apply database migrations: {}", e);
            e
        })?;

        Ok(Self {
            db,
            fanout: DashMap::new(),
            cfg,
        })
    }

    /// Subscribe to change notifications of `channel`, dropping notifiers that nobody listens
    /// to anymore
    fn notifications(&self, channel: &ChannelId) -> broadcast::Receiver<()> {
        self.fanout.retain(|_, tx| tx.receiver_count() > 0);
        self.fanout
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.cfg.fanout_capacity.max(1)).0)
            .subscribe()
    }

    /// Read the current watermark of `channel` without loading its messages
    async fn watermark(db: &SqlitePool, channel: &ChannelId) -> Result<Watermark, StoreError> {
        Ok(sqlx::query_as::<_, (i64, Option<i64>)>(
            "select count(*), max(seq) from messages where channelid=?",
        )
        .bind(channel.as_str())
        .fetch_one(db)
        .await?)
    }

    /// Load the full ordered log of the given channel
    async fn load(db: &SqlitePool, channel: &ChannelId) -> Result<Snapshot, StoreError> {
        let rows = sqlx::query(
            "select seq, sender, sender_name, body, timestamp_us from messages where channelid=? order by timestamp_us asc, seq asc",
        )
        .bind(channel.as_str())
        .fetch_all(db)
        .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    fn decode_row(row: &SqliteRow) -> Result<Message, StoreError> {
        let seq = row.try_get::<i64, _>("seq")?;
        let micros = row.try_get::<i64, _>("timestamp_us")?;
        let timestamp = from_micros(micros).ok_or_else(|| StoreError::CorruptRecord {
            seq,
            reason: format!("timestamp {} out of range", micros),
        })?;

        Ok(Message {
            seq: u64::try_from(seq).map_err(|_| StoreError::CorruptRecord {
                seq,
                reason: "negative sequence number".to_owned(),
            })?,
            sender: row.try_get("sender")?,
            sender_name: row.try_get("sender_name")?,
            body: row.try_get("body")?,
            timestamp,
        })
    }
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            fanout_capacity: 64,
            poll_interval_ms: 500,
        }
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn subscribe_ordered(&self, channel: &ChannelId) -> Result<SnapshotStream, StoreError> {
        // Subscribe before loading so that no write between the two is missed
        let mut changes = self.notifications(channel);
        let initial = Self::load(&self.db, channel).await?;

        let db = self.db.clone();
        let channel = channel.clone();
        let period = Duration::from_millis(self.cfg.poll_interval_ms.max(1));

        Ok(Box::pin(stream! {
            let mut seen = watermark_of(&initial);
            let mut poll = tokio::time::interval_at(Instant::now() + period, period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

            yield Ok(initial);

            loop {
                let wake = tokio::select! {
                    changed = changes.recv() => match changed {
                        Ok(()) | Err(RecvError::Lagged(_)) => Wake::Notified,
                        Err(RecvError::Closed) => Wake::Closed,
                    },
                    _ = poll.tick() => Wake::Poll,
                };

                match wake {
                    Wake::Notified => (),
                    Wake::Poll => match Self::watermark(&db, &channel).await {
                        Ok(mark) if mark == seen => continue,
                        Ok(_) => log::trace!("Channel {} was written to externally", channel.short()),
                        Err(e) => {
                            log::warn!("Failed to poll channel {}: {}", channel.short(), e);
                            yield Err(StoreError::Transport(e.to_string()));
                            break;
                        }
                    },
                    Wake::Closed => {
                        yield Err(StoreError::Transport("channel fan-out closed".to_owned()));
                        break;
                    }
                }

                match Self::load(&db, &channel).await {
                    Ok(snapshot) => {
                        seen = watermark_of(&snapshot);
                        yield Ok(snapshot);
                    }
                    Err(e) => {
                        log::warn!("Failed to reload channel {}: {}", channel.short(), e);
                        yield Err(StoreError::Transport(e.to_string()));
                        break;
                    }
                }
            }
        }))
    }

    async fn append(&self, channel: &ChannelId, msg: NewMessage) -> Result<Message, StoreError> {
        let mut tx = self.db.begin().await?;

        let last = sqlx::query_scalar::<_, Option<i64>>(
            "select max(timestamp_us) from messages where channelid=?",
        )
        .bind(channel.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let micros = Utc::now().timestamp_micros().max(last.unwrap_or(i64::MIN));
        let timestamp = from_micros(micros).ok_or_else(|| {
            StoreError::Rejected(format!("timestamp {} out of range", micros))
        })?;

        let seq = sqlx::query(
            "insert into messages (channelid, sender, sender_name, body, timestamp_us) values (?, ?, ?, ?, ?)",
        )
        .bind(channel.as_str())
        .bind(&msg.sender)
        .bind(&msg.sender_name)
        .bind(&msg.body)
        .bind(micros)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        if let Some(notifier) = self.fanout.get(channel) {
            let _ = notifier.send(());
        }
        self.fanout.remove_if(channel, |_, tx| tx.receiver_count() == 0);
        log::trace!("Stored message {} in channel {}", seq, channel.short());

        Ok(msg.stamp(seq as u64, timestamp))
    }
}

fn watermark_of(snapshot: &Snapshot) -> Watermark {
    (
        snapshot.len() as i64,
        snapshot.iter().map(|msg| msg.seq as i64).max(),
    )
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
    .single()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::model::{derive_channel_id, Participant};

    async fn store() -> SqliteStore {
        store_with(SqliteStoreConfig::default()).await
    }

    async fn store_with(cfg: SqliteStoreConfig) -> SqliteStore {
        // Every connection to an in-memory database sees a different database
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::new(db, cfg).await.unwrap()
    }

    fn draft(sender: &Participant, body: &str) -> NewMessage {
        NewMessage::compose(sender, body).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_snapshot_in_order() {
        let store = store().await;
        let alice = Participant::new("alice@u.edu", "Alice");
        let bob = Participant::new("bob@u.edu", "Bob");
        let channel = ChannelId::between(&alice, &bob).unwrap();

        let first = store.append(&channel, draft(&alice, "hi")).await.unwrap();
        let second = store.append(&channel, draft(&bob, "hey!")).await.unwrap();
        assert!(first.order_key() < second.order_key());

        let snapshot = store.snapshot(&channel).await.unwrap();
        assert_eq!(snapshot, vec![first, second]);
        assert_eq!(snapshot[1].sender_name.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_missing_sender_name_roundtrips() {
        let store = store().await;
        let anon = Participant::new("anon@u.edu", "");
        let channel = derive_channel_id("anon@u.edu", "bob@u.edu").unwrap();

        store.append(&channel, draft(&anon, "who am i")).await.unwrap();
        assert_eq!(store.snapshot(&channel).await.unwrap()[0].sender_name, None);
    }

    #[tokio::test]
    async fn test_subscription_receives_writes_of_its_channel_only() {
        let store = store().await;
        let alice = Participant::new("alice@u.edu", "Alice");
        let x = derive_channel_id("alice@u.edu", "bob@u.edu").unwrap();
        let y = derive_channel_id("alice@u.edu", "carol@u.edu").unwrap();

        let mut on_x = store.subscribe_ordered(&x).await.unwrap();
        let mut on_y = store.subscribe_ordered(&y).await.unwrap();
        assert!(on_x.next().await.unwrap().unwrap().is_empty());
        assert!(on_y.next().await.unwrap().unwrap().is_empty());

        store.append(&x, draft(&alice, "only for bob")).await.unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(1), on_x.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);

        assert!(tokio::time::timeout(Duration::from_millis(50), on_y.next()).await.is_err());
        assert!(store.snapshot(&y).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reload_ends_subscription() {
        let store = store_with(SqliteStoreConfig {
            poll_interval_ms: 10,
            ..Default::default()
        })
        .await;
        let channel = derive_channel_id("alice@u.edu", "bob@u.edu").unwrap();

        let mut stream = store.subscribe_ordered(&channel).await.unwrap();
        assert!(stream.next().await.unwrap().unwrap().is_empty());

        store.db.close().await;

        let failed = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(matches!(failed, Some(Err(StoreError::Transport(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unused_notifiers_are_dropped() {
        let store = store().await;
        let alice = Participant::new("alice@u.edu", "Alice");
        let x = derive_channel_id("alice@u.edu", "bob@u.edu").unwrap();
        let y = derive_channel_id("alice@u.edu", "carol@u.edu").unwrap();

        let on_x = store.subscribe_ordered(&x).await.unwrap();
        assert_eq!(store.fanout.len(), 1);
        drop(on_x);

        store.append(&x, draft(&alice, "nobody listening")).await.unwrap();
        assert_eq!(store.fanout.len(), 0);

        // Subscribing elsewhere sweeps notifiers of channels that were never written to
        drop(store.subscribe_ordered(&y).await.unwrap());
        let _on_x = store.subscribe_ordered(&x).await.unwrap();
        assert_eq!(store.fanout.len(), 1);
        assert!(store.fanout.contains_key(&x));
    }

    #[test]
    fn test_from_micros() {
        let ts = from_micros(1_700_000_000_123_456).unwrap();
        assert_eq!(ts.timestamp_micros(), 1_700_000_000_123_456);
        assert_eq!(from_micros(-1).unwrap().timestamp_micros(), -1);
    }
}
