//! Command handlers and the dispatch table.
//!
//! Every verb has a four-entry row: what to do for an unregistered
//! connection, a user, a server link, and an operator. A command
//! arriving in a state whose entry is `m_unregistered` or `m_not_oper`
//! gets a numeric and mutates nothing. Verbs resolve from either the
//! full name (users) or the peer token (links); both land on one row.

pub mod channel;
pub mod connection;
pub mod gline;
pub mod jupe;
pub mod kill;
pub mod messaging;
pub mod mode;
pub mod nick;
pub mod replies;
pub mod server;

use tenth_proto::{name_for_token, ParsedLine, ServerNumeric};

use crate::conn::{ConnId, ConnState};
use crate::engine::Context;
use crate::send;
use crate::state::{ChannelId, ClientId, ServerId};
use crate::stats;

pub use replies::*;

/// What the dispatcher does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Keep reading from the connection.
    Continue,
    /// The inbound connection no longer exists; touch nothing.
    SourceExited,
}

/// Who a line is from, resolved from the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// An unregistered connection speaking for itself.
    Unregistered,
    Client(ClientId),
    Server(ServerId),
}

impl Origin {
    pub fn client(&self) -> Option<ClientId> {
        match self {
            Origin::Client(id) => Some(*id),
            _ => None,
        }
    }

    pub fn server(&self) -> Option<ServerId> {
        match self {
            Origin::Server(id) => Some(*id),
            _ => None,
        }
    }
}

pub type HandlerFn = fn(&mut Context, ConnId, &Origin, &ParsedLine<'_>) -> HandlerOutcome;

/// One verb's dispatch row.
pub struct CommandRow {
    pub name: &'static str,
    pub unregistered: HandlerFn,
    pub user: HandlerFn,
    pub server: HandlerFn,
    pub oper: HandlerFn,
}

macro_rules! row {
    ($name:literal, $unreg:path, $user:path, $server:path, $oper:path) => {
        CommandRow {
            name: $name,
            unregistered: $unreg,
            user: $user,
            server: $server,
            oper: $oper,
        }
    };
}

/// The command table. Kept static; per-verb behavior differences live
/// in the handlers, not here.
pub static TABLE: &[CommandRow] = &[
    row!("PASS", connection::m_pass, m_registered_err, m_ignore, m_registered_err),
    row!("CAP", connection::m_cap, connection::m_cap, m_ignore, connection::m_cap),
    row!("SERVER", server::mr_server, m_registered_err, server::ms_server, m_registered_err),
    row!("NICK", nick::m_nick, nick::m_nick, nick::ms_nick, nick::m_nick),
    row!("USER", nick::m_user, m_registered_err, m_ignore, m_registered_err),
    row!("WEBIRC", nick::m_webirc, m_registered_err, m_ignore, m_registered_err),
    row!("OPER", m_unregistered, connection::m_oper, m_ignore, connection::m_oper),
    row!("QUIT", connection::m_quit, connection::m_quit, connection::ms_quit, connection::m_quit),
    row!("SQUIT", m_unregistered, m_not_oper, server::ms_squit, server::mo_squit),
    row!("KILL", m_unregistered, m_not_oper, kill::ms_kill, kill::mo_kill),
    row!("JOIN", m_unregistered, channel::m_join, channel::ms_join, channel::m_join),
    row!("CREATE", m_unregistered, m_ignore, channel::ms_create, m_ignore),
    row!("PART", m_unregistered, channel::m_part, channel::ms_part, channel::m_part),
    row!("KICK", m_unregistered, channel::m_kick, channel::ms_kick, channel::m_kick),
    row!("TOPIC", m_unregistered, channel::m_topic, channel::ms_topic, channel::m_topic),
    row!("MODE", m_unregistered, mode::m_mode, mode::ms_mode, mode::m_mode),
    row!("INVITE", m_unregistered, channel::m_invite, channel::ms_invite, channel::m_invite),
    row!("NAMES", m_unregistered, channel::m_names, m_ignore, channel::m_names),
    row!("BURST", m_unregistered, m_ignore, server::ms_burst, m_ignore),
    row!("EOB", m_unregistered, m_ignore, server::ms_eob, m_ignore),
    row!("EOB_ACK", m_unregistered, m_ignore, server::ms_eob_ack, m_ignore),
    row!("PRIVMSG", m_unregistered, messaging::m_privmsg, messaging::ms_privmsg, messaging::m_privmsg),
    row!("NOTICE", m_unregistered, messaging::m_notice, messaging::ms_notice, messaging::m_notice),
    row!("WALLCHOPS", m_unregistered, messaging::m_wallchops, messaging::ms_wallchops, messaging::m_wallchops),
    row!("WALLOPS", m_unregistered, m_not_oper, messaging::ms_wallops, messaging::mo_wallops),
    row!("GLINE", m_unregistered, gline::m_gline, gline::ms_gline, gline::mo_gline),
    row!("JUPE", m_unregistered, m_not_oper, jupe::ms_jupe, jupe::mo_jupe),
    row!("CLEARMODE", m_unregistered, m_not_oper, mode::ms_clearmode, mode::mo_clearmode),
    row!("OPMODE", m_unregistered, m_not_oper, mode::ms_opmode, mode::mo_opmode),
    row!("PING", connection::m_ping, connection::m_ping, connection::ms_ping, connection::m_ping),
    row!("PONG", m_ignore, connection::m_pong, connection::ms_pong, connection::m_pong),
    row!("SETTIME", m_unregistered, m_not_oper, connection::ms_settime, connection::mo_settime),
    row!("AWAY", m_unregistered, connection::m_away, connection::ms_away, connection::m_away),
    row!("SILENCE", m_unregistered, connection::m_silence, connection::ms_silence, connection::m_silence),
    row!("ERROR", connection::mr_error, m_ignore, connection::ms_error, m_ignore),
];

fn lookup(name: &str) -> Option<&'static CommandRow> {
    TABLE.iter().find(|r| r.name == name)
}

/// Resolve the origin of a peer line from its prefix. A known numnick
/// rewrites the origin; an unknown one discards the line.
fn resolve_peer_origin(ctx: &mut Context, peer: ServerId, prefix: Option<&str>) -> Option<Origin> {
    let Some(prefix) = prefix else {
        return Some(Origin::Server(peer));
    };
    match prefix.len() {
        5 => ctx
            .store
            .find_client_by_numnick(prefix)
            .map(Origin::Client),
        2 => ServerNumeric::decode(prefix)
            .and_then(|n| ctx.store.find_server_by_numnick(n))
            .map(Origin::Server),
        _ => None,
    }
}

/// Parse-to-handler glue: pick the row and column for this line.
pub fn dispatch(ctx: &mut Context, conn_id: ConnId, msg: &ParsedLine<'_>) -> HandlerOutcome {
    let Some(state) = ctx.conns.get(&conn_id).map(|c| c.state) else {
        return HandlerOutcome::SourceExited;
    };

    let (origin, verb_name) = match state {
        ConnState::Server(peer) => {
            let Some(origin) = resolve_peer_origin(ctx, peer, msg.prefix) else {
                stats::bump(&ctx.stats.unknown_prefix);
                tracing::debug!(conn = %conn_id, prefix = ?msg.prefix, "unknown prefix, line dropped");
                return HandlerOutcome::Continue;
            };
            let name = name_for_token(msg.verb)
                .map(str::to_string)
                .unwrap_or_else(|| msg.verb.to_ascii_uppercase());
            (origin, name)
        }
        ConnState::User(client) => (Origin::Client(client), msg.verb.to_ascii_uppercase()),
        _ => (Origin::Unregistered, msg.verb.to_ascii_uppercase()),
    };

    let Some(row) = lookup(&verb_name) else {
        match state {
            ConnState::User(_) => {
                send::numeric(ctx, conn_id, ERR_UNKNOWNCOMMAND, &[&verb_name], "Unknown command");
            }
            ConnState::Server(_) => {
                tracing::debug!(conn = %conn_id, verb = %msg.verb, "unknown verb from peer");
            }
            _ => {}
        }
        return HandlerOutcome::Continue;
    };

    let handler = match state {
        ConnState::Server(_) => row.server,
        ConnState::User(client) => {
            let is_oper = ctx
                .store
                .clients
                .get(client)
                .is_some_and(|c| c.modes.oper);
            if is_oper {
                row.oper
            } else {
                row.user
            }
        }
        _ => row.unregistered,
    };

    handler(ctx, conn_id, &origin, msg)
}

// --- default handlers ---

/// The command needs registration first.
pub fn m_unregistered(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    send::numeric(ctx, conn, ERR_NOTREGISTERED, &[], "You have not registered");
    HandlerOutcome::Continue
}

/// The command may only be used before registration.
pub fn m_registered_err(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    send::numeric(
        ctx,
        conn,
        ERR_ALREADYREGISTRED,
        &[],
        "You may not reregister",
    );
    HandlerOutcome::Continue
}

/// Silently drop.
pub fn m_ignore(
    _ctx: &mut Context,
    _conn: ConnId,
    _origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    HandlerOutcome::Continue
}

/// Operator privilege required.
pub fn m_not_oper(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    send::numeric(
        ctx,
        conn,
        ERR_NOPRIVILEGES,
        &[],
        "Permission Denied: Insufficient privileges",
    );
    HandlerOutcome::Continue
}

// --- shared helpers ---

/// Reply 461 and continue.
pub fn need_more_params(ctx: &mut Context, conn: ConnId, cmd: &str) -> HandlerOutcome {
    send::numeric(ctx, conn, ERR_NEEDMOREPARAMS, &[cmd], "Not enough parameters");
    HandlerOutcome::Continue
}

/// Is this client a channel operator on the channel?
pub fn is_chanop(ctx: &Context, client: ClientId, channel: ChannelId) -> bool {
    ctx.store
        .membership(client, channel)
        .and_then(|m| ctx.store.members.get(m))
        .is_some_and(|m| m.flags.chanop && !m.flags.zombie)
}

/// Channel-name validity: `#` or `&` prefix, sane length, no
/// separators or control bytes.
pub fn valid_channel_name(name: &str) -> bool {
    if !(name.starts_with('#') || name.starts_with('&')) {
        return false;
    }
    if name.len() < 2 || name.len() > 200 {
        return false;
    }
    !name
        .bytes()
        .any(|b| b == b' ' || b == b',' || b == 0x07 || b < 0x20)
}

/// Nickname validity per the classic grammar.
pub fn valid_nick(nick: &str) -> bool {
    const NICKLEN: usize = 15;
    if nick.is_empty() || nick.len() > NICKLEN {
        return false;
    }
    let mut bytes = nick.bytes();
    let first = bytes.next().unwrap_or(0);
    let first_ok = first.is_ascii_alphabetic() || matches!(first, b'[' | b']' | b'\\' | b'`' | b'^' | b'{' | b'|' | b'}' | b'_' | b'~');
    if !first_ok {
        return false;
    }
    bytes.all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(b, b'[' | b']' | b'\\' | b'`' | b'^' | b'{' | b'|' | b'}' | b'_' | b'~' | b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_no_duplicate_names() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for row in TABLE {
            assert!(seen.insert(row.name), "duplicate row {}", row.name);
        }
    }

    #[test]
    fn test_every_row_verb_has_a_token() {
        for row in TABLE {
            assert!(
                tenth_proto::token_for(row.name).is_some(),
                "no token mapping for {}",
                row.name
            );
        }
    }

    #[test]
    fn test_valid_nick() {
        assert!(valid_nick("foo"));
        assert!(valid_nick("[a]b-c"));
        assert!(!valid_nick("1abc"));
        assert!(!valid_nick("-abc"));
        assert!(!valid_nick(""));
        assert!(!valid_nick("waytoolongforanickname"));
        assert!(!valid_nick("with space"));
    }

    #[test]
    fn test_valid_channel_name() {
        assert!(valid_channel_name("#chat"));
        assert!(valid_channel_name("&local"));
        assert!(!valid_channel_name("chat"));
        assert!(!valid_channel_name("#"));
        assert!(!valid_channel_name("#with space"));
        assert!(!valid_channel_name("#with,comma"));
    }
}
