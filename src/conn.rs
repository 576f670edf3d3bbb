//! Per-connection state.
//!
//! A `Connection` owns protocol bookkeeping only; bytes move in the
//! reader/writer tasks, which know nothing but the connection id and
//! the shared outbound queue.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::PortKind;
use crate::send::SendQueue;
use crate::state::{ClientId, ServerId};

/// Opaque connection identifier, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a connection stands in the registration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// We dialed out and are waiting to finish the TCP/TLS setup.
    Connecting,
    /// We sent our PASS/SERVER pair, awaiting the peer's.
    Handshake,
    /// Port-marked user, no NICK/USER yet.
    UnknownUser,
    /// Port-marked server, no SERVER yet.
    UnknownServer,
    /// On a WebIRC port, awaiting the WEBIRC introduction.
    Webirc,
    /// Registered user connection.
    User(ClientId),
    /// Registered server link.
    Server(ServerId),
}

impl ConnState {
    pub fn is_registered(&self) -> bool {
        matches!(self, ConnState::User(_) | ConnState::Server(_))
    }

    pub fn is_server_link(&self) -> bool {
        matches!(self, ConnState::Server(_))
    }
}

/// Registration scratch collected before a connection becomes a user
/// or a server.
#[derive(Debug, Default)]
pub struct PendingReg {
    pub pass: Option<String>,
    /// NICK seen (order-independent with USER).
    pub nick: Option<String>,
    /// USER seen: (username, realname).
    pub user: Option<(String, String)>,
    /// For outgoing links: the link block this dial belongs to.
    pub link_name: Option<String>,
}

/// One accepted or dialed connection.
pub struct Connection {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub kind: PortKind,
    pub state: ConnState,
    /// Outbound queue shared with the writer task.
    pub sendq: Arc<SendQueue>,
    /// Class parameters resolved at accept time.
    pub class: String,
    pub ping_freq: i64,
    /// Wall-clock seconds, engine clock.
    pub first_seen: i64,
    pub last_data: i64,
    /// A PING probe is outstanding.
    pub ping_sent: bool,
    pub pending: PendingReg,
    /// IP after any WEBIRC spoof.
    pub ip: IpAddr,
    /// Hostname after any WEBIRC spoof (no resolver here otherwise).
    pub host: String,
    /// Capabilities negotiated before registration.
    pub caps: HashSet<String>,
    /// Peer protocol violations seen on this link.
    pub violations: u32,
    /// True when we dialed this connection.
    pub outgoing: bool,
    /// Rate accounting: lines seen in the current window.
    pub rate_count: u32,
    pub rate_window_start: i64,
}

impl Connection {
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        kind: PortKind,
        sendq: Arc<SendQueue>,
        now: i64,
    ) -> Self {
        let state = match kind {
            PortKind::Client => ConnState::UnknownUser,
            PortKind::Server => ConnState::UnknownServer,
            PortKind::Webirc => ConnState::Webirc,
        };
        Connection {
            id,
            addr,
            kind,
            state,
            sendq,
            class: "default".to_string(),
            ping_freq: 90,
            first_seen: now,
            last_data: now,
            ping_sent: false,
            pending: PendingReg::default(),
            ip: addr.ip(),
            host: addr.ip().to_string(),
            caps: HashSet::new(),
            violations: 0,
            outgoing: false,
            rate_count: 0,
            rate_window_start: now,
        }
    }

    /// Note one inbound line for flood accounting. Returns the count
    /// within the current ten-second window.
    pub fn account_line(&mut self, now: i64) -> u32 {
        if now - self.rate_window_start >= 10 {
            self.rate_window_start = now;
            self.rate_count = 0;
        }
        self.rate_count += 1;
        self.rate_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::SendQueue;

    fn conn() -> Connection {
        Connection::new(
            ConnId(1),
            "127.0.0.1:50000".parse().unwrap(),
            PortKind::Client,
            SendQueue::new(1024),
            1000,
        )
    }

    #[test]
    fn test_initial_state_follows_port_kind() {
        assert_eq!(conn().state, ConnState::UnknownUser);
        let c = Connection::new(
            ConnId(2),
            "127.0.0.1:50001".parse().unwrap(),
            PortKind::Server,
            SendQueue::new(1024),
            1000,
        );
        assert_eq!(c.state, ConnState::UnknownServer);
    }

    #[test]
    fn test_rate_window_resets() {
        let mut c = conn();
        for _ in 0..5 {
            c.account_line(1000);
        }
        assert_eq!(c.rate_count, 5);
        assert_eq!(c.account_line(1011), 1);
    }
}
