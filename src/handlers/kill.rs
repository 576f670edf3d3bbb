//! KILL: forcibly disconnect a client anywhere on the network.

use tenth_proto::ParsedLine;

use crate::conn::ConnId;
use crate::engine::{self, Context};
use crate::handlers::{need_more_params, replies::*, HandlerOutcome, Origin};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{ClientId, OperPrivs};
use crate::stats;

/// Remove the victim everywhere: KILL to every other link, a QUIT
/// locally. The kill path accumulates the servers it crossed.
pub fn do_kill(
    ctx: &mut Context,
    victim: ClientId,
    from_conn: Option<ConnId>,
    path: &str,
    reason: &str,
) {
    stats::bump(&ctx.stats.kills);

    let victim_conn = match ctx.store.clients.get(victim) {
        Some(c) => c.conn,
        None => return,
    };

    let line = MessageBuilder::to_servers(&ctx.me_numnick(), "KILL")
        .client(&ctx.store, victim)
        .trailing(format!("{} ({})", path, reason))
        .render();
    for peer in route::server_conns(ctx, from_conn) {
        send::enqueue(ctx, peer, Priority::High, &line);
    }

    // A local victim sees the KILL before the link closes.
    if victim_conn.is_some() {
        let prefix = ctx.me_name();
        let victim_nick = ctx
            .store
            .clients
            .get(victim)
            .map(|c| c.nick.clone())
            .unwrap_or_default();
        let kill_line = MessageBuilder::to_clients(&prefix, "KILL")
            .arg(&victim_nick)
            .trailing(format!("{} ({})", path, reason))
            .render();
        send::to_client(ctx, victim, Priority::High, &kill_line);
    }

    engine::exit_client(
        ctx,
        victim,
        from_conn,
        &format!("Killed ({} ({}))", path, reason),
        false,
    );
}

/// KILL from an operator.
pub fn mo_kill(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(oper) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let privileged = ctx
        .store
        .clients
        .get(oper)
        .is_some_and(|c| c.privs.has(OperPrivs::KILL));
    if !privileged {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "Permission Denied: Insufficient privileges");
        return HandlerOutcome::Continue;
    }

    let (Some(target), Some(reason)) = (msg.param(0), msg.param(1)) else {
        return need_more_params(ctx, conn, "KILL");
    };
    let Some(victim) = ctx.store.find_client_by_name(target) else {
        send::numeric(ctx, conn, ERR_NOSUCHNICK, &[target], "No such nick");
        return HandlerOutcome::Continue;
    };

    // Network services are not killable by opers.
    let is_service = ctx
        .store
        .clients
        .get(victim)
        .is_some_and(|c| c.modes.service);
    if is_service {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "You may not KILL a network service");
        return HandlerOutcome::Continue;
    }

    let oper_nick = ctx
        .store
        .clients
        .get(oper)
        .map(|c| c.nick.clone())
        .unwrap_or_default();
    let victim_nick = ctx
        .store
        .clients
        .get(victim)
        .map(|c| c.nick.clone())
        .unwrap_or_default();
    let path = format!("{}!{}", ctx.me_name(), oper_nick);

    send::to_local_opers(
        ctx,
        &format!("{} killed {} ({})", oper_nick, victim_nick, reason),
    );
    do_kill(ctx, victim, None, &path, reason);
    HandlerOutcome::Continue
}

/// KILL from the mesh: remove locally, pass it on.
pub fn ms_kill(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(target), Some(path_reason)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "KILL with too few parameters");
    };

    let Some(victim) = ctx
        .store
        .find_client_by_numnick(target)
        .or_else(|| ctx.store.find_client_by_name(target))
    else {
        // Already gone; the network resolved it before we did.
        stats::bump(&ctx.stats.unknown_prefix);
        return HandlerOutcome::Continue;
    };

    // Split "path (reason)" back out; tolerate a bare path.
    let (path, reason) = match path_reason.split_once(" (") {
        Some((p, rest)) => (p, rest.trim_end_matches(')')),
        None => (path_reason, "Killed"),
    };

    let local_path = format!("{}!{}", ctx.me_name(), path);
    do_kill(ctx, victim, Some(conn), &local_path, reason);
    HandlerOutcome::Continue
}
