//! Modelling the participants, addresses, and messages exchanged over a channel

pub mod address;
pub mod message;
pub mod profile;
pub mod view;

pub use address::{derive_channel_id, AddressError, ChannelId, Participant};
pub use message::{Message, MessageSeq, NewMessage};
pub use view::{Attribution, ChannelView, RenderedMessage};
