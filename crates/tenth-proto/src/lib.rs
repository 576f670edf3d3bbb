//! tenth-proto - the P10 wire layer.
//!
//! Everything a server needs to speak the compact server-to-server token
//! protocol and the classic client protocol on the same port: line
//! parsing and formatting, the base-64 numnick codec, RFC-1459 case
//! folding, wildcard and CIDR mask matching, and mode-string scanning.
//!
//! The crate is almost entirely pure functions; the only I/O lives in
//! [`transport`] (behind the `tokio` feature), which provides the
//! length-capped line reader the daemon frames inbound bytes with.

pub mod casemap;
pub mod error;
pub mod matching;
pub mod message;
pub mod mode;
pub mod numnick;
pub mod token;

#[cfg(feature = "tokio")]
pub mod transport;

pub use casemap::{fold_byte, hash_folded, irc_eq, irc_to_lower};
pub use error::{ParseError, ProtocolError, Result};
pub use matching::{collapse, ipmask_parse, mask_contains, match_cidr, match_mask};
pub use message::{format_line, ParsedLine, MAX_LINE_LEN, MAX_PARAMS};
pub use mode::{ChannelFlag, ChannelFlags, ModeChange, ModeSign, MAXMODEPARAMS};
pub use numnick::{ClientNumeric, ServerNumeric};
pub use token::{name_for_token, token_for};
