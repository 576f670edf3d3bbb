//! Client (user) entities.

use std::net::IpAddr;

use tenth_proto::ClientNumeric;

use crate::conn::ConnId;
use crate::state::{ChannelId, MemberId, ServerId};

/// User mode flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UserModes {
    /// `+i`, hidden from casual WHO-style matching.
    pub invisible: bool,
    /// `+o`, IRC operator.
    pub oper: bool,
    /// `+d`, deaf: channel traffic is not delivered.
    pub deaf: bool,
    /// `+w`, receives WALLOPS.
    pub wallops: bool,
    /// `+k`, network service; immune to KICK/KILL/deop.
    pub service: bool,
}

impl UserModes {
    /// Render as `+...` (empty set renders as `+`).
    pub fn as_mode_string(&self) -> String {
        let mut s = String::from("+");
        if self.invisible {
            s.push('i');
        }
        if self.oper {
            s.push('o');
        }
        if self.deaf {
            s.push('d');
        }
        if self.wallops {
            s.push('w');
        }
        if self.service {
            s.push('k');
        }
        s
    }

    /// Apply a signed user-mode string.
    pub fn apply(&mut self, modes: &str) {
        let mut adding = true;
        for c in modes.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                'i' => self.invisible = adding,
                'o' => self.oper = adding,
                'd' => self.deaf = adding,
                'w' => self.wallops = adding,
                'k' => self.service = adding,
                _ => {}
            }
        }
    }
}

/// Operator privilege bitset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OperPrivs(u64);

impl OperPrivs {
    pub const KILL: OperPrivs = OperPrivs(1 << 0);
    pub const GLINE: OperPrivs = OperPrivs(1 << 1);
    pub const JUPE: OperPrivs = OperPrivs(1 << 2);
    pub const OPMODE: OperPrivs = OperPrivs(1 << 3);
    pub const SQUIT: OperPrivs = OperPrivs(1 << 4);
    pub const SETTIME: OperPrivs = OperPrivs(1 << 5);
    /// May set G-lines wider than the two-component minimum.
    pub const WIDE_GLINE: OperPrivs = OperPrivs(1 << 6);
    /// Privileges act on this server only.
    pub const LOCAL: OperPrivs = OperPrivs(1 << 7);

    pub fn empty() -> Self {
        OperPrivs(0)
    }

    pub fn has(self, priv_bit: OperPrivs) -> bool {
        self.0 & priv_bit.0 != 0
    }

    pub fn grant(&mut self, priv_bit: OperPrivs) {
        self.0 |= priv_bit.0;
    }

    /// Parse a config privilege name.
    pub fn from_name(name: &str) -> Option<OperPrivs> {
        match name {
            "kill" => Some(Self::KILL),
            "gline" => Some(Self::GLINE),
            "jupe" => Some(Self::JUPE),
            "opmode" => Some(Self::OPMODE),
            "squit" => Some(Self::SQUIT),
            "settime" => Some(Self::SETTIME),
            "wide_gline" => Some(Self::WIDE_GLINE),
            "local" => Some(Self::LOCAL),
            _ => None,
        }
    }
}

/// A user somewhere on the network. Local iff `conn` is set.
#[derive(Debug)]
pub struct Client {
    /// Globally unique wire address.
    pub numeric: ClientNumeric,
    pub nick: String,
    pub username: String,
    pub hostname: String,
    /// Account-based hidden host, if applied.
    pub hidden_host: Option<String>,
    pub realname: String,
    pub ip: IpAddr,
    /// Time of the last nick change; authoritative for collisions.
    pub lastnick: i64,
    pub away: Option<String>,
    pub account: Option<String>,
    /// Silence masks this user asked for.
    pub silence: Vec<String>,
    pub modes: UserModes,
    pub privs: OperPrivs,
    /// Owning server.
    pub server: ServerId,
    /// Direct connection when local.
    pub conn: Option<ConnId>,
    /// Memberships, jointly owned with each channel.
    pub members: Vec<MemberId>,
    /// Channels this user holds an invite to.
    pub invites: Vec<ChannelId>,
}

impl Client {
    /// `user@host` with the visible host.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.username, self.visible_host())
    }

    /// The host shown to other users.
    pub fn visible_host(&self) -> &str {
        self.hidden_host.as_deref().unwrap_or(&self.hostname)
    }

    /// `nick!user@host` prefix for client-protocol lines.
    pub fn prefix(&self) -> String {
        format!("{}!{}@{}", self.nick, self.username, self.visible_host())
    }

    pub fn is_local(&self) -> bool {
        self.conn.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_modes_round_trip() {
        let mut m = UserModes::default();
        m.apply("+iwo");
        assert!(m.invisible && m.wallops && m.oper);
        assert_eq!(m.as_mode_string(), "+iow");
        m.apply("-o+d");
        assert!(!m.oper && m.deaf);
    }

    #[test]
    fn test_oper_privs() {
        let mut p = OperPrivs::empty();
        p.grant(OperPrivs::KILL);
        p.grant(OperPrivs::from_name("gline").unwrap());
        assert!(p.has(OperPrivs::KILL));
        assert!(p.has(OperPrivs::GLINE));
        assert!(!p.has(OperPrivs::SQUIT));
        assert_eq!(OperPrivs::from_name("nope"), None);
    }
}
