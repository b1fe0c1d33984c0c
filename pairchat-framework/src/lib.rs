//! # Pairchat
//!
//! A crate for the realtime direct-message channel between two matched users: every pair of
//! participants is addressed by a deterministic [ChannelId](model::ChannelId), and a
//! [ChannelSynchronizer] keeps a live, ordered view of one channel at a time on top of any
//! [MessageStore](store::MessageStore).
//!
//! The store is the single authority on ordering. Each snapshot it pushes replaces the view in
//! full, and sent messages become visible when the store echoes them back.

pub mod model;
pub mod store;
pub mod sync;

pub use sync::{
    ChannelHandle, ChannelSynchronizer, ResubscribePolicy, SendOutcome, SyncConfig, SyncError,
    SyncEvent, SyncState,
};
