//! The locally materialized state of one channel

use chrono::{DateTime, Utc};

use super::{
    address::{ChannelId, Participant},
    message::Message,
};

/// Ordered sequence of messages for one channel, always a full copy of the most recent snapshot
/// delivered by the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelView {
    channel: ChannelId,
    messages: Vec<Message>,
}

/// Who a rendered message is attributed to from the point of view of one participant
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribution {
    /// Written by the viewing participant
    Own,
    /// Written by someone else, with the name to show for them
    Peer(String),
}

/// A message prepared for display to one participant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedMessage<'a> {
    pub attribution: Attribution,
    pub body: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl ChannelView {
    /// Create a view of `channel` holding the given snapshot, in the order it was delivered
    pub fn new(channel: ChannelId, messages: Vec<Message>) -> Self {
        Self { channel, messages }
    }

    /// Create an empty view, used before the first snapshot arrives
    pub fn empty(channel: ChannelId) -> Self {
        Self::new(channel, Vec::new())
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Prepare every message for display to `viewer`, attributing messages written by anyone
    /// else to the name captured when they were written or, failing that, to `peer`
    pub fn render<'a>(&'a self, viewer: &str, peer: &Participant) -> Vec<RenderedMessage<'a>> {
        self.messages
            .iter()
            .map(|msg| RenderedMessage {
                attribution: match msg.sender == viewer {
                    true => Attribution::Own,
                    false => Attribution::Peer(
                        msg.sender_name
                            .clone()
                            .unwrap_or_else(|| peer.display_name.clone()),
                    ),
                },
                body: &msg.body,
                timestamp: msg.timestamp,
            })
            .collect()
    }
}
