//! tenthd - a P10 mesh IRC daemon.
//!
//! Each node accepts local users, keeps the replicated entity graph
//! (clients, servers, channels, memberships) in agreement with its
//! peers through timestamped updates and the netburst protocol, and
//! enforces the G-line/jupe/BADCHAN control planes with lamport-style
//! `lastmod` ordering.
//!
//! All protocol state lives in one engine task; connection reader and
//! writer tasks only move bytes. See `engine` for the event loop and
//! `handlers` for the command table.

pub mod bans;
pub mod burst;
pub mod collision;
pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod modebuf;
pub mod net;
pub mod route;
pub mod send;
pub mod state;
pub mod stats;
pub mod timer;
