use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::address::Participant;

/// Insertion order assigned by a message store, breaks ties between equal timestamps
pub type MessageSeq = u64;

/// An entry in a channel's ordered log, as persisted by a message store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Insertion order of the message in its store
    pub seq: MessageSeq,
    /// Identity token of the author
    pub sender: String,
    /// Display name of the author at the time the message was written
    pub sender_name: Option<String>,
    /// Content of the message in UTF-8
    pub body: String,
    /// Time assigned by the store when the message was appended
    pub timestamp: DateTime<Utc>,
}

/// A message as it is submitted to a store, before the store assigns its timestamp and sequence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub sender_name: Option<String>,
    pub body: String,
}

impl NewMessage {
    /// Compose a message written by `author`, returning `None` if there is nothing to send
    /// because `text` is blank after trimming
    pub fn compose(author: &Participant, text: &str) -> Option<Self> {
        if text.trim().is_empty() {
            return None;
        }

        let name = author.display_name.trim();
        Some(Self {
            sender: author.identity.clone(),
            sender_name: (!name.is_empty()).then(|| name.to_owned()),
            body: text.to_owned(),
        })
    }

    /// Attach the ordering values assigned by a store
    pub fn stamp(self, seq: MessageSeq, timestamp: DateTime<Utc>) -> Message {
        Message {
            seq,
            sender: self.sender,
            sender_name: self.sender_name,
            body: self.body,
            timestamp,
        }
    }
}

impl Message {
    /// Key that stores order a channel's log by: timestamp first, then insertion order
    #[inline]
    pub fn order_key(&self) -> (DateTime<Utc>, MessageSeq) {
        (self.timestamp, self.seq)
    }
}
