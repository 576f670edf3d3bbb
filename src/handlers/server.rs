//! Server-plane handlers: link handshake, remote introductions,
//! SQUIT, and the EOB/EOB_ACK burst barrier.

use tenth_proto::{numnick, ParsedLine, ServerNumeric};

use crate::burst;
use crate::collision::{resolve_server_name_collision, ServerVerdict};
use crate::conn::{ConnId, ConnState};
use crate::engine::{self, Context};
use crate::handlers::{replies::*, HandlerOutcome, Origin};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{OperPrivs, ServerEnt, ServerId};

/// Send our side of the link handshake (outgoing dials, and the reply
/// half on inbound links).
pub fn send_pass_server(ctx: &mut Context, conn: ConnId) {
    let password = ctx
        .conns
        .get(&conn)
        .and_then(|c| c.pending.link_name.as_deref())
        .and_then(|name| ctx.config.find_link(name))
        .map(|l| l.password.clone());

    if let Some(password) = password {
        // The handshake pair travels bare, without a prefix.
        let line = bytes::Bytes::from(format!("PASS :{}\r\n", password));
        send::enqueue(ctx, conn, Priority::Normal, &line);
    }

    let me = ctx.store.me;
    let Some(ent) = ctx.store.servers.get(me) else {
        return;
    };
    let field = format!(
        "{}{}",
        ent.numeric.encode(),
        numnick::encode(ent.capacity, 3)
    );
    let line = format!(
        "SERVER {} 1 {} {} J{} {} 0 :{}\r\n",
        ent.name,
        ent.start_ts,
        ctx.now(),
        ent.protocol,
        field,
        ent.description
    );
    send::enqueue(ctx, conn, Priority::Normal, &bytes::Bytes::from(line));
}

/// Parse `<nn><capacity>` from the SERVER numeric field.
fn parse_numeric_field(field: &str) -> Option<(ServerNumeric, u32)> {
    match field.len() {
        5 => {
            let nn = ServerNumeric::decode(&field[..2])?;
            let cap = numnick::decode(&field[2..], 3)?;
            Some((nn, cap))
        }
        // Short form: numeric only, default capacity.
        2 => ServerNumeric::decode(field).map(|nn| (nn, numnick::MAX_CLIENT)),
        _ => None,
    }
}

struct ServerIntro {
    name: String,
    hop: u32,
    start_ts: i64,
    link_ts: i64,
    protocol: u16,
    numeric: ServerNumeric,
    capacity: u32,
    description: String,
}

fn parse_server_params(msg: &ParsedLine<'_>) -> Option<ServerIntro> {
    if msg.param_count() < 8 {
        return None;
    }
    let name = msg.param(0)?.to_string();
    let hop = msg.param(1)?.parse().ok()?;
    let start_ts = msg.param(2)?.parse().ok()?;
    let link_ts = msg.param(3)?.parse().ok()?;
    let protocol = msg
        .param(4)?
        .trim_start_matches(['J', 'P'])
        .parse()
        .unwrap_or(10);
    let (numeric, capacity) = parse_numeric_field(msg.param(5)?)?;
    let description = msg.params.last()?.to_string();
    Some(ServerIntro {
        name,
        hop,
        start_ts,
        link_ts,
        protocol,
        numeric,
        capacity,
        description,
    })
}

/// SERVER during a handshake: the peer introduces itself.
pub fn mr_server(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let acceptable_state = ctx.conns.get(&conn).is_some_and(|c| {
        matches!(c.state, ConnState::UnknownServer | ConnState::Handshake)
    });
    if !acceptable_state {
        send::numeric(ctx, conn, ERR_ALREADYREGISTRED, &[], "You may not reregister");
        return HandlerOutcome::Continue;
    }

    let Some(intro) = parse_server_params(msg) else {
        engine::close_conn(ctx, conn, "Bad SERVER parameters");
        return HandlerOutcome::SourceExited;
    };
    if intro.start_ts < ctx.features.oldest_ts || intro.link_ts < ctx.features.oldest_ts {
        engine::close_conn(ctx, conn, "Bogus timestamps in SERVER");
        return HandlerOutcome::SourceExited;
    }

    // A link block must authorize this peer.
    let Some(link) = ctx.config.find_link(&intro.name).cloned() else {
        tracing::warn!(conn = %conn, server = %intro.name, "no link block for peer");
        engine::close_conn(ctx, conn, "No Connect block");
        return HandlerOutcome::SourceExited;
    };
    let pass_ok = ctx
        .conns
        .get(&conn)
        .and_then(|c| c.pending.pass.as_deref())
        .is_some_and(|p| p == link.password);
    if !pass_ok {
        crate::stats::bump(&ctx.stats.refused);
        engine::close_conn(ctx, conn, "Bad password");
        return HandlerOutcome::SourceExited;
    }

    // A juped name may not link.
    let now = ctx.now();
    if let Some(jupe) = ctx.jupes.check_server(&intro.name, now) {
        let reason = format!("Juped: {}", jupe.reason);
        crate::stats::bump(&ctx.stats.refused);
        engine::close_conn(ctx, conn, &reason);
        return HandlerOutcome::SourceExited;
    }

    // Duplicate server name: the younger link is the bogus one.
    if let Some(existing) = ctx.store.find_server_by_name(&intro.name) {
        let existing_ts = ctx
            .store
            .servers
            .get(existing)
            .map(|s| s.link_ts)
            .unwrap_or(0);
        match resolve_server_name_collision(existing_ts, intro.link_ts) {
            ServerVerdict::SquitIncoming => {
                engine::close_conn(ctx, conn, "Server name already in use");
                return HandlerOutcome::SourceExited;
            }
            ServerVerdict::SquitExisting => {
                engine::squit_server(ctx, existing, None, "Replaced by new link", true);
            }
        }
    }
    // Duplicate numeric is a configuration error on the introducer.
    if ctx.store.find_server_by_numnick(intro.numeric).is_some() {
        engine::close_conn(ctx, conn, "Server numeric collision");
        return HandlerOutcome::SourceExited;
    }

    let me = ctx.store.me;
    let mut ent = ServerEnt::new(
        intro.name.clone(),
        intro.numeric,
        intro.description.clone(),
        intro.capacity,
        Some(me),
    );
    ent.start_ts = intro.start_ts;
    ent.link_ts = intro.link_ts;
    ent.protocol = intro.protocol;
    ent.conn = Some(conn);
    ent.flags.hub = link.hub;
    ent.flags.burst = true;
    ent.flags.junction = true;

    let id = match ctx.store.insert_server(ent) {
        Ok(id) => id,
        Err(err) => {
            engine::close_conn(ctx, conn, &err);
            return HandlerOutcome::SourceExited;
        }
    };

    let was_inbound = {
        let Some(c) = ctx.conns.get_mut(&conn) else {
            return HandlerOutcome::SourceExited;
        };
        let inbound = !c.outgoing;
        c.state = ConnState::Server(id);
        c.pending.link_name = Some(link.name.clone());
        c.violations = 0;
        inbound
    };
    if let Some(class) = ctx.config.find_class(&link.class) {
        if let Some(c) = ctx.conns.get(&conn) {
            c.sendq.set_cap(class.max_sendq);
        }
        if let Some(c) = ctx.conns.get_mut(&conn) {
            c.ping_freq = class.ping_freq;
            c.class = class.name.clone();
        }
    }

    tracing::info!(conn = %conn, server = %intro.name, "server link registered");
    send::to_local_opers(ctx, &format!("Link with {} established", intro.name));

    if was_inbound {
        send_pass_server(ctx, conn);
    }
    burst::send_netburst(ctx, conn, id);

    // The rest of the mesh learns about the new server.
    let me_nn = ctx.me_numnick();
    let field = format!(
        "{}{}",
        intro.numeric.encode(),
        numnick::encode(intro.capacity, 3)
    );
    let line = MessageBuilder::to_servers(&me_nn, "SERVER")
        .arg(&intro.name)
        .arg("2")
        .ts(intro.start_ts)
        .ts(intro.link_ts)
        .arg(format!("J{}", intro.protocol))
        .arg(field)
        .arg("0")
        .trailing(&intro.description)
        .render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }

    HandlerOutcome::Continue
}

/// SERVER from a registered link: a peer introduces a server behind it.
pub fn ms_server(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(src) = origin.server() else {
        return engine::protocol_violation(ctx, conn, "SERVER without a server source");
    };
    let Some(intro) = parse_server_params(msg) else {
        return engine::protocol_violation(ctx, conn, "SERVER with bad parameters");
    };

    let now = ctx.now();
    if let Some(jupe) = ctx.jupes.check_server(&intro.name, now) {
        // Refuse by cutting the introduced server off, not the link.
        let reason = format!("Juped: {}", jupe.reason);
        let line = MessageBuilder::to_servers(&ctx.me_numnick(), "SQUIT")
            .arg(&intro.name)
            .ts(intro.link_ts)
            .trailing(&reason)
            .render();
        send::enqueue(ctx, conn, Priority::High, &line);
        return HandlerOutcome::Continue;
    }

    if let Some(existing) = ctx.store.find_server_by_name(&intro.name) {
        let existing_ts = ctx
            .store
            .servers
            .get(existing)
            .map(|s| s.link_ts)
            .unwrap_or(0);
        match resolve_server_name_collision(existing_ts, intro.link_ts) {
            ServerVerdict::SquitIncoming => {
                let line = MessageBuilder::to_servers(&ctx.me_numnick(), "SQUIT")
                    .arg(&intro.name)
                    .ts(intro.link_ts)
                    .trailing("Server name already in use")
                    .render();
                send::enqueue(ctx, conn, Priority::High, &line);
                return HandlerOutcome::Continue;
            }
            ServerVerdict::SquitExisting => {
                engine::squit_server(ctx, existing, None, "Replaced by new path", true);
            }
        }
    }
    if ctx.store.find_server_by_numnick(intro.numeric).is_some() {
        // Same numeric, different name: the introducing link is
        // misconfigured and cannot be trusted.
        engine::exit_connection(ctx, conn, "Server numeric collision");
        return HandlerOutcome::SourceExited;
    }

    let mut ent = ServerEnt::new(
        intro.name.clone(),
        intro.numeric,
        intro.description.clone(),
        intro.capacity,
        Some(src),
    );
    ent.start_ts = intro.start_ts;
    ent.link_ts = intro.link_ts;
    ent.protocol = intro.protocol;

    if let Err(err) = ctx.store.insert_server(ent) {
        return engine::protocol_violation(ctx, conn, &err);
    }

    let src_nn = ctx
        .store
        .servers
        .get(src)
        .map(|s| s.numeric.encode())
        .unwrap_or_default();
    let field = format!(
        "{}{}",
        intro.numeric.encode(),
        numnick::encode(intro.capacity, 3)
    );
    let line = MessageBuilder::to_servers(&src_nn, "SERVER")
        .arg(&intro.name)
        .arg((intro.hop + 1).to_string())
        .ts(intro.start_ts)
        .ts(intro.link_ts)
        .arg(format!("J{}", intro.protocol))
        .arg(field)
        .arg("0")
        .trailing(&intro.description)
        .render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }

    HandlerOutcome::Continue
}

/// SQUIT from an operator.
pub fn mo_squit(
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
        .is_some_and(|c| c.privs.has(OperPrivs::SQUIT));
    if !privileged {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "Permission Denied: Insufficient privileges");
        return HandlerOutcome::Continue;
    }

    let Some(target) = msg.param(0) else {
        return crate::handlers::need_more_params(ctx, conn, "SQUIT");
    };
    let reason = msg
        .param(1)
        .filter(|r| !r.is_empty())
        .unwrap_or("Operator requested disconnect");

    let Some(server) = ctx.store.find_server_by_name(target) else {
        send::numeric(ctx, conn, ERR_NOSUCHSERVER, &[target], "No such server");
        return HandlerOutcome::Continue;
    };
    if server == ctx.store.me {
        send::numeric(ctx, conn, ERR_NOSUCHSERVER, &[target], "Cannot SQUIT myself");
        return HandlerOutcome::Continue;
    }

    let direct = ctx
        .store
        .servers
        .get(server)
        .is_some_and(|s| s.conn.is_some());
    if direct {
        engine::squit_server(ctx, server, None, reason, true);
    } else {
        // Not our link: pass the request toward the server's uplink.
        let (name, link_ts) = match ctx.store.servers.get(server) {
            Some(s) => (s.name.clone(), s.link_ts),
            None => return HandlerOutcome::Continue,
        };
        let nn = crate::handlers::connection::origin_prefix(ctx, origin);
        let line = MessageBuilder::to_servers(&nn, "SQUIT")
            .arg(&name)
            .ts(link_ts)
            .trailing(reason)
            .render();
        if let Some(next_hop) = route::conn_toward(ctx, server) {
            send::enqueue(ctx, next_hop, Priority::High, &line);
        }
    }
    HandlerOutcome::Continue
}

/// SQUIT from the mesh.
pub fn ms_squit(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(target), Some(ts_str)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "SQUIT with too few parameters");
    };
    let ts: i64 = ts_str.parse().unwrap_or(0);
    let reason = msg.param(2).unwrap_or("");

    let Some(server) = ctx.store.find_server_by_name(target) else {
        return HandlerOutcome::Continue; // already gone
    };

    if server == ctx.store.me {
        // The peer is cutting the link between us.
        engine::exit_connection(ctx, conn, reason);
        return HandlerOutcome::SourceExited;
    }

    // A stale SQUIT names an older incarnation of the link.
    let link_ts = ctx.store.servers.get(server).map(|s| s.link_ts).unwrap_or(0);
    if ts != 0 && ts != link_ts {
        tracing::debug!(server = %target, "stale SQUIT ignored");
        return HandlerOutcome::Continue;
    }

    let squitting_self_conn = ctx
        .store
        .servers
        .get(server)
        .is_some_and(|s| s.conn == Some(conn));
    engine::squit_server(ctx, server, Some(conn), reason, true);
    if squitting_self_conn {
        return HandlerOutcome::SourceExited;
    }
    HandlerOutcome::Continue
}

/// BURST: one channel's worth of netburst state.
pub fn ms_burst(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(src) = origin.server() else {
        return engine::protocol_violation(ctx, conn, "BURST without a server source");
    };
    burst::apply_burst(ctx, conn, src, msg)
}

/// EOB: the origin server finished describing itself.
pub fn ms_eob(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(src) = origin.server() else {
        return engine::protocol_violation(ctx, conn, "EOB without a server source");
    };

    let (name, was_direct) = {
        let Some(s) = ctx.store.servers.get_mut(src) else {
            return HandlerOutcome::Continue;
        };
        s.flags.burst = false;
        (s.name.clone(), s.conn == Some(conn))
    };
    send::to_local_opers(ctx, &format!("Completed net.burst from {}", name));

    // Acknowledge our direct peer; the barrier is now behind it.
    if was_direct {
        let line = MessageBuilder::to_servers(&ctx.me_numnick(), "EOB_ACK").render();
        send::enqueue(ctx, conn, Priority::Normal, &line);
    }

    let prefix = crate::handlers::connection::origin_prefix(ctx, origin);
    let line = MessageBuilder::to_servers(&prefix, "EOB").render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}

/// EOB_ACK: our own burst has been acknowledged.
pub fn ms_eob_ack(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let direct_peer = match ctx.conns.get(&conn).map(|c| c.state) {
        Some(ConnState::Server(id)) => id,
        _ => return HandlerOutcome::Continue,
    };
    if origin.server() == Some(direct_peer) {
        if let Some(s) = ctx.store.servers.get_mut(direct_peer) {
            s.flags.burst_ack = false;
        }
    }
    HandlerOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_field() {
        let (nn, cap) = parse_numeric_field("AB]]]").unwrap();
        assert_eq!(nn, ServerNumeric(1));
        assert_eq!(cap, numnick::MAX_CLIENT);

        let (nn, cap) = parse_numeric_field("AC").unwrap();
        assert_eq!(nn, ServerNumeric(2));
        assert_eq!(cap, numnick::MAX_CLIENT);

        assert!(parse_numeric_field("toolong").is_none());
    }
}
