//! Connection-plane handlers: PASS, PING/PONG, QUIT, ERROR, SETTIME,
//! AWAY, SILENCE, OPER.

use tenth_proto::ParsedLine;

use crate::conn::ConnId;
use crate::engine::{self, Context};
use crate::handlers::{
    need_more_params, replies::*, HandlerOutcome, Origin,
};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::OperPrivs;

/// Silence masks one client may hold.
const MAXSILES: usize = 15;

/// PASS: remember the handshake password.
pub fn m_pass(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(pass) = msg.param(0) else {
        return need_more_params(ctx, conn, "PASS");
    };
    if let Some(c) = ctx.conns.get_mut(&conn) {
        c.pending.pass = Some(pass.to_string());
    }
    HandlerOutcome::Continue
}

/// PING from a user (or unregistered): answer directly.
pub fn m_ping(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(payload) = msg.param(0) else {
        return need_more_params(ctx, conn, "PING");
    };
    let me = ctx.me_name();
    let line = MessageBuilder::to_clients(&me, "PONG")
        .arg(&me)
        .trailing(payload)
        .render();
    send::enqueue(ctx, conn, Priority::High, &line);
    HandlerOutcome::Continue
}

/// PING on a link: answer with a high-priority PONG.
pub fn ms_ping(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let payload = msg.param(0).unwrap_or("");
    let me_nn = ctx.me_numnick();
    let line = MessageBuilder::to_servers(&me_nn, "PONG")
        .arg(&me_nn)
        .trailing(payload)
        .render();
    send::enqueue(ctx, conn, Priority::High, &line);
    HandlerOutcome::Continue
}

/// PONG: the inbound data itself already reset the ping state.
pub fn m_pong(
    _ctx: &mut Context,
    _conn: ConnId,
    _origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    HandlerOutcome::Continue
}

pub fn ms_pong(
    _ctx: &mut Context,
    _conn: ConnId,
    _origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    HandlerOutcome::Continue
}

/// QUIT from a local connection.
pub fn m_quit(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let reason = msg.param(0).unwrap_or("");
    match origin.client() {
        Some(client) => {
            let reason = if reason.is_empty() {
                "Quit".to_string()
            } else {
                format!("Quit: {}", reason)
            };
            engine::exit_client(ctx, client, None, &reason, true);
        }
        None => engine::close_conn(ctx, conn, "Quit"),
    }
    HandlerOutcome::SourceExited
}

/// QUIT for a remote client.
pub fn ms_quit(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return engine::protocol_violation(ctx, conn, "QUIT without a client source");
    };
    let reason = msg.param(0).unwrap_or("");
    engine::exit_client(ctx, client, Some(conn), reason, true);
    HandlerOutcome::Continue
}

/// ERROR before registration: give up on the connection.
pub fn mr_error(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let text = msg.param(0).unwrap_or("unknown");
    tracing::warn!(conn = %conn, error = %text, "ERROR during handshake");
    engine::close_conn(ctx, conn, "ERROR from peer");
    HandlerOutcome::SourceExited
}

/// ERROR on a live link: the peer is tearing the link down.
pub fn ms_error(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let text = msg.param(0).unwrap_or("unknown");
    tracing::warn!(conn = %conn, error = %text, "ERROR from peer");
    engine::exit_connection(ctx, conn, &format!("ERROR: {}", text));
    HandlerOutcome::SourceExited
}

fn apply_settime(ctx: &mut Context, ts: i64) -> i64 {
    let wall = chrono::Utc::now().timestamp();
    let delta = ts - wall - ctx.ts_offset;
    ctx.ts_offset = ts - wall;
    delta
}

/// SETTIME from an operator: adjust the network clock and tell the
/// mesh.
pub fn mo_settime(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let privileged = ctx
        .store
        .clients
        .get(client)
        .is_some_and(|c| c.privs.has(OperPrivs::SETTIME));
    if !privileged {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "Permission Denied: Insufficient privileges");
        return HandlerOutcome::Continue;
    }
    let Some(ts) = msg.param(0).and_then(|p| p.parse::<i64>().ok()) else {
        return need_more_params(ctx, conn, "SETTIME");
    };
    if ts < ctx.features.oldest_ts {
        send::numeric(ctx, conn, ERR_NEEDMOREPARAMS, &["SETTIME"], "Bogus timestamp");
        return HandlerOutcome::Continue;
    }

    let delta = apply_settime(ctx, ts);
    send::to_local_opers(ctx, &format!("SETTIME: clock adjusted by {}s", delta));

    let nn = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.numeric.encode())
        .unwrap_or_default();
    let line = MessageBuilder::to_servers(&nn, "SETTIME").ts(ts).render();
    for peer in route::server_conns(ctx, None) {
        send::enqueue(ctx, peer, Priority::High, &line);
    }
    HandlerOutcome::Continue
}

/// SETTIME from the mesh.
pub fn ms_settime(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(ts) = msg.param(0).and_then(|p| p.parse::<i64>().ok()) else {
        return engine::protocol_violation(ctx, conn, "SETTIME without timestamp");
    };
    if ts < ctx.features.oldest_ts {
        return engine::protocol_violation(ctx, conn, "SETTIME with bogus timestamp");
    }
    let delta = apply_settime(ctx, ts);
    if delta != 0 {
        send::to_local_opers(ctx, &format!("SETTIME: clock adjusted by {}s", delta));
    }

    let prefix = origin_prefix(ctx, origin);
    let line = MessageBuilder::to_servers(&prefix, "SETTIME").ts(ts).render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::High, &line);
    }
    HandlerOutcome::Continue
}

/// Numnick prefix for re-propagating a line from this origin.
pub fn origin_prefix(ctx: &Context, origin: &Origin) -> String {
    match origin {
        Origin::Client(id) => ctx
            .store
            .clients
            .get(*id)
            .map(|c| c.numeric.encode())
            .unwrap_or_default(),
        Origin::Server(id) => ctx
            .store
            .servers
            .get(*id)
            .map(|s| s.numeric.encode())
            .unwrap_or_default(),
        Origin::Unregistered => String::new(),
    }
}

/// AWAY: set or clear the away text.
pub fn m_away(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let text = msg.param(0).filter(|t| !t.is_empty());

    let nn = match ctx.store.clients.get_mut(client) {
        Some(c) => {
            c.away = text.map(str::to_string);
            c.numeric.encode()
        }
        None => return HandlerOutcome::Continue,
    };

    let mut b = MessageBuilder::to_servers(&nn, "AWAY");
    if let Some(t) = text {
        b = b.trailing(t);
        send::numeric(ctx, conn, RPL_NOWAWAY, &[], "You have been marked as being away");
    } else {
        send::numeric(ctx, conn, RPL_UNAWAY, &[], "You are no longer marked as being away");
    }
    let line = b.render();
    for peer in route::server_conns(ctx, None) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}

/// AWAY from the mesh.
pub fn ms_away(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return engine::protocol_violation(ctx, conn, "AWAY without a client source");
    };
    let text = msg.param(0).filter(|t| !t.is_empty());
    if let Some(c) = ctx.store.clients.get_mut(client) {
        c.away = text.map(str::to_string);
    }

    let prefix = origin_prefix(ctx, origin);
    let mut b = MessageBuilder::to_servers(&prefix, "AWAY");
    if let Some(t) = text {
        b = b.trailing(t);
    }
    let line = b.render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}

/// SILENCE: list, add (`+mask` or bare) or remove (`-mask`) silence
/// masks.
pub fn m_silence(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };

    let Some(arg) = msg.param(0).filter(|a| !a.is_empty()) else {
        let masks: Vec<String> = ctx
            .store
            .clients
            .get(client)
            .map(|c| c.silence.clone())
            .unwrap_or_default();
        let nick = ctx
            .store
            .clients
            .get(client)
            .map(|c| c.nick.clone())
            .unwrap_or_default();
        for mask in masks {
            send::numeric(ctx, conn, RPL_SILELIST, &[&nick], &mask);
        }
        send::numeric(ctx, conn, RPL_ENDOFSILELIST, &[&nick], "End of Silence List");
        return HandlerOutcome::Continue;
    };

    let (removing, mask) = match arg.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, arg.strip_prefix('+').unwrap_or(arg)),
    };
    let mask = tenth_proto::collapse(mask);

    let mut list_full = false;
    let changed = {
        let Some(c) = ctx.store.clients.get_mut(client) else {
            return HandlerOutcome::Continue;
        };
        if removing {
            let before = c.silence.len();
            c.silence.retain(|m| !tenth_proto::irc_eq(m, &mask));
            before != c.silence.len()
        } else if c.silence.len() >= MAXSILES {
            list_full = true;
            false
        } else if c.silence.iter().any(|m| tenth_proto::irc_eq(m, &mask)) {
            false
        } else {
            c.silence.push(mask.clone());
            true
        }
    };
    if list_full {
        send::numeric(ctx, conn, ERR_SILELISTFULL, &[&mask], "Your silence list is full");
        return HandlerOutcome::Continue;
    }

    if changed {
        let prefix = origin_prefix(ctx, origin);
        let sign = if removing { "-" } else { "+" };
        let line = MessageBuilder::to_servers(&prefix, "SILENCE")
            .arg("*")
            .arg(format!("{}{}", sign, mask))
            .render();
        for peer in route::server_conns(ctx, None) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
    }
    HandlerOutcome::Continue
}

/// SILENCE from the mesh: keep remote silence lists mirrored.
pub fn ms_silence(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let Some(arg) = msg.param(1).or_else(|| msg.param(0)) else {
        return HandlerOutcome::Continue;
    };

    let (removing, mask) = match arg.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, arg.strip_prefix('+').unwrap_or(arg)),
    };
    let mask = tenth_proto::collapse(mask);

    if let Some(c) = ctx.store.clients.get_mut(client) {
        if removing {
            c.silence.retain(|m| !tenth_proto::irc_eq(m, &mask));
        } else if !c.silence.iter().any(|m| tenth_proto::irc_eq(m, &mask))
            && c.silence.len() < MAXSILES
        {
            c.silence.push(mask.clone());
        }
    }

    let prefix = origin_prefix(ctx, origin);
    let sign = if removing { "-" } else { "+" };
    let line = MessageBuilder::to_servers(&prefix, "SILENCE")
        .arg("*")
        .arg(format!("{}{}", sign, mask))
        .render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}

/// Capabilities this server can negotiate.
const SUPPORTED_CAPS: &[&str] = &["multi-prefix"];

/// CAP: capability negotiation. Registration is not gated on CAP END
/// here; the set is recorded per connection and consulted at send
/// time.
pub fn m_cap(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(sub) = msg.param(0) else {
        return need_more_params(ctx, conn, "CAP");
    };
    let me = ctx.me_name();
    let target = match ctx.conns.get(&conn).map(|c| c.state) {
        Some(crate::conn::ConnState::User(id)) => ctx
            .store
            .clients
            .get(id)
            .map(|c| c.nick.clone())
            .unwrap_or_else(|| "*".to_string()),
        _ => "*".to_string(),
    };

    match sub.to_ascii_uppercase().as_str() {
        "LS" => {
            let line = MessageBuilder::to_clients(&me, "CAP")
                .arg(&target)
                .arg("LS")
                .trailing(SUPPORTED_CAPS.join(" "))
                .render();
            send::enqueue(ctx, conn, Priority::Normal, &line);
        }
        "LIST" => {
            let caps = ctx
                .conns
                .get(&conn)
                .map(|c| c.caps.iter().cloned().collect::<Vec<_>>().join(" "))
                .unwrap_or_default();
            let line = MessageBuilder::to_clients(&me, "CAP")
                .arg(&target)
                .arg("LIST")
                .trailing(caps)
                .render();
            send::enqueue(ctx, conn, Priority::Normal, &line);
        }
        "REQ" => {
            let requested: Vec<&str> = msg
                .param(1)
                .map(|r| r.split_whitespace().collect())
                .unwrap_or_default();
            let all_known = requested
                .iter()
                .all(|c| SUPPORTED_CAPS.contains(&c.trim_start_matches('-')));
            let verb = if all_known { "ACK" } else { "NAK" };
            if all_known {
                if let Some(c) = ctx.conns.get_mut(&conn) {
                    for cap in &requested {
                        match cap.strip_prefix('-') {
                            Some(removed) => {
                                c.caps.remove(removed);
                            }
                            None => {
                                c.caps.insert(cap.to_string());
                            }
                        }
                    }
                }
            }
            let line = MessageBuilder::to_clients(&me, "CAP")
                .arg(&target)
                .arg(verb)
                .trailing(requested.join(" "))
                .render();
            send::enqueue(ctx, conn, Priority::Normal, &line);
        }
        "END" => {}
        other => {
            send::numeric(ctx, conn, ERR_INVALIDCAPCMD, &[other], "Invalid CAP command");
        }
    }
    HandlerOutcome::Continue
}

/// OPER: authenticate against an oper block.
pub fn m_oper(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let (Some(name), Some(password)) = (msg.param(0), msg.param(1)) else {
        return need_more_params(ctx, conn, "OPER");
    };

    let block = ctx
        .config
        .oper
        .iter()
        .find(|o| o.name == name && o.password == password)
        .cloned();
    let Some(block) = block else {
        send::numeric(ctx, conn, ERR_PASSWDMISMATCH, &[], "Password incorrect");
        return HandlerOutcome::Continue;
    };

    let nick = {
        let Some(c) = ctx.store.clients.get_mut(client) else {
            return HandlerOutcome::Continue;
        };
        c.modes.oper = true;
        for p in &block.privileges {
            if let Some(bit) = OperPrivs::from_name(p) {
                c.privs.grant(bit);
            }
        }
        c.nick.clone()
    };

    send::numeric(ctx, conn, RPL_YOUREOPER, &[], "You are now an IRC operator");
    send::to_local_opers(ctx, &format!("{} is now an operator", nick));

    // The mesh learns the mode change.
    let nn = origin_prefix(ctx, origin);
    let line = MessageBuilder::to_servers(&nn, "MODE")
        .arg(&nick)
        .arg("+o")
        .render();
    for peer in route::server_conns(ctx, None) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}
