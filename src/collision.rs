//! Collision and timestamp resolution.
//!
//! Pure decision functions: every server seeing the same collision
//! with the same parameters must reach the identical verdict, or the
//! network tears itself apart killing different sides. Keep these free
//! of local state.

use std::net::IpAddr;

use tenth_proto::irc_eq;

/// Seconds after a ghost kill during which further collisions from the
/// same introducing server are treated as ghosts and dropped outright,
/// preventing kill oscillation. Wall-clock based; a SETTIME shift moves
/// the window.
pub const GHOST_WINDOW: i64 = 20;

/// One side of a nick collision.
#[derive(Debug, Clone)]
pub struct NickParty {
    /// Time of the last nick change.
    pub lastnick: i64,
    pub username: String,
    pub ip: IpAddr,
}

/// What to do about a nick collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NickVerdict {
    /// Both sides die; KILLs go out for each.
    KillBoth,
    /// The arriving client loses; the resident stays.
    KillIncoming,
    /// The resident loses; the arriving client is installed.
    KillExisting,
}

/// Decide a collision between a resident client and an incoming
/// introduction or nick change.
///
/// Same user@ip on both sides means the same person raced themselves
/// across a split: both die. Otherwise the newer `lastnick` lost the
/// race; equal timestamps kill both.
pub fn resolve_nick_collision(existing: &NickParty, incoming: &NickParty) -> NickVerdict {
    let same_ident =
        existing.ip == incoming.ip && irc_eq(&existing.username, &incoming.username);

    if same_ident {
        return NickVerdict::KillBoth;
    }
    if incoming.lastnick == existing.lastnick {
        NickVerdict::KillBoth
    } else if incoming.lastnick > existing.lastnick {
        NickVerdict::KillIncoming
    } else {
        NickVerdict::KillExisting
    }
}

/// True when an introduction from a server falls inside its ghost
/// window; the incoming side is then dropped unconditionally.
pub fn within_ghost_window(now: i64, server_ghost_ts: i64) -> bool {
    server_ghost_ts != 0 && now - server_ghost_ts < GHOST_WINDOW
}

/// What to do about a duplicate server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVerdict {
    /// Refuse/SQUIT the side that linked later (the incoming one).
    SquitIncoming,
    /// The resident path linked later; SQUIT it and admit the new one.
    SquitExisting,
}

/// Duplicate server names: the younger link is the bogus path. On a
/// tie the incoming introduction loses, so both sides agree.
pub fn resolve_server_name_collision(
    existing_link_ts: i64,
    incoming_link_ts: i64,
) -> ServerVerdict {
    if incoming_link_ts >= existing_link_ts {
        ServerVerdict::SquitIncoming
    } else {
        ServerVerdict::SquitExisting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party(lastnick: i64, user: &str, ip: &str) -> NickParty {
        NickParty {
            lastnick,
            username: user.into(),
            ip: ip.parse().unwrap(),
        }
    }

    #[test]
    fn test_newer_nick_loses() {
        // Resident foo has lastnick 1100; a NICK with 1000 arrives.
        let existing = party(1100, "alice", "192.0.2.1");
        let incoming = party(1000, "bob", "192.0.2.2");
        assert_eq!(
            resolve_nick_collision(&existing, &incoming),
            NickVerdict::KillExisting
        );

        // Mirrored parameters give the mirrored verdict.
        assert_eq!(
            resolve_nick_collision(&incoming, &existing),
            NickVerdict::KillIncoming
        );
    }

    #[test]
    fn test_equal_timestamps_kill_both() {
        let a = party(1000, "alice", "192.0.2.1");
        let b = party(1000, "bob", "192.0.2.2");
        assert_eq!(resolve_nick_collision(&a, &b), NickVerdict::KillBoth);
    }

    #[test]
    fn test_same_ident_kills_both() {
        let a = party(900, "alice", "192.0.2.1");
        let b = party(1500, "Alice", "192.0.2.1");
        assert_eq!(resolve_nick_collision(&a, &b), NickVerdict::KillBoth);
    }

    #[test]
    fn test_determinism_both_orders() {
        // Every pair of peers seeing the same collision reaches a
        // consistent conclusion about who dies.
        let a = party(1000, "alice", "192.0.2.1");
        let b = party(1200, "bob", "192.0.2.2");
        let ab = resolve_nick_collision(&a, &b);
        let ba = resolve_nick_collision(&b, &a);
        assert_eq!(ab, NickVerdict::KillIncoming);
        assert_eq!(ba, NickVerdict::KillExisting);
    }

    #[test]
    fn test_ghost_window() {
        assert!(within_ghost_window(1010, 1000));
        assert!(!within_ghost_window(1020, 1000));
        assert!(!within_ghost_window(1010, 0));
    }

    #[test]
    fn test_server_name_collision() {
        assert_eq!(
            resolve_server_name_collision(500, 700),
            ServerVerdict::SquitIncoming
        );
        assert_eq!(
            resolve_server_name_collision(700, 500),
            ServerVerdict::SquitExisting
        );
        assert_eq!(
            resolve_server_name_collision(500, 500),
            ServerVerdict::SquitIncoming
        );
    }
}
