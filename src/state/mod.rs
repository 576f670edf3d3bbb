//! The replicated entity graph.
//!
//! Clients, servers and channels live in generational arenas owned by
//! the engine task; memberships are joint-owned by a channel and a
//! client, and destruction of either endpoint walks the membership
//! list and unlinks the other side.

pub mod arena;
pub mod channel;
pub mod client;
pub mod server;
pub mod store;

#[cfg(test)]
pub mod testutil;

pub use arena::{Arena, Handle};
pub use channel::{ChanBan, Channel, MemberFlags, Membership};
pub use client::{Client, OperPrivs, UserModes};
pub use server::{ServerEnt, ServerFlags};
pub use store::Store;

/// Handle aliases for the four arenas.
pub type ClientId = Handle<Client>;
pub type ServerId = Handle<ServerEnt>;
pub type ChannelId = Handle<Channel>;
pub type MemberId = Handle<Membership>;
