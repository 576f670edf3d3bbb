//! JUPE: the server-name ban plane.
//!
//! Same `lastmod` ordering as G-lines. An active jupe matching a live
//! server SQUITs it, and a juped name is refused at link time.

use tenth_proto::{match_mask, ParsedLine};

use crate::bans::ControlFlags;
use crate::conn::{ConnId, ConnState};
use crate::engine::{self, Context};
use crate::handlers::{replies::*, HandlerOutcome, Origin};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::OperPrivs;

/// Default jupe duration when the operator gives none.
const DEFAULT_DURATION: i64 = 3600;

/// Longest acceptable jupe (one week, as the original clamps it).
const MAX_DURATION: i64 = 7 * 24 * 3600;

fn propagate_jupe(
    ctx: &mut Context,
    except: Option<ConnId>,
    source_nn: &str,
    mask: &str,
    active: bool,
    expire_offset: i64,
    lastmod: i64,
    reason: &str,
) {
    let sign = if active { "+" } else { "-" };
    let line = MessageBuilder::to_servers(source_nn, "JUPE")
        .arg("*")
        .arg(format!("{}{}", sign, mask))
        .ts(expire_offset)
        .ts(lastmod)
        .trailing(reason)
        .render();
    for peer in route::server_conns(ctx, except) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
}

/// A fresh active jupe cuts off any matching live server.
fn enforce_jupe(ctx: &mut Context, mask: &str, reason: &str) {
    let me = ctx.store.me;
    let matching: Vec<_> = ctx
        .store
        .servers
        .iter()
        .filter(|(id, s)| *id != me && match_mask(mask, &s.name))
        .map(|(id, _)| id)
        .collect();
    for server in matching {
        engine::squit_server(ctx, server, None, &format!("Juped: {}", reason), true);
    }
}

fn list_jupes(ctx: &mut Context, conn: ConnId) {
    let now = ctx.now();
    let entries: Vec<(String, i64, i64, bool, String)> = ctx
        .jupes
        .iter()
        .map(|j| (j.mask.clone(), j.expire, j.lastmod, j.is_active(now), j.reason.clone()))
        .collect();
    for (mask, expire, lastmod, active, reason) in entries {
        let state = if active { "+" } else { "-" };
        send::numeric(
            ctx,
            conn,
            RPL_JUPELIST,
            &[&mask, &expire.to_string(), &lastmod.to_string(), state],
            &reason,
        );
    }
    send::numeric(ctx, conn, RPL_ENDOFJUPELIST, &[], "End of Jupe List");
}

/// JUPE from an operator.
pub fn mo_jupe(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(oper) = origin.client() else {
        return HandlerOutcome::Continue;
    };

    let Some(raw_mask) = msg.param(0) else {
        list_jupes(ctx, conn);
        return HandlerOutcome::Continue;
    };

    let (privs, oper_nn) = match ctx.store.clients.get(oper) {
        Some(c) => (c.privs, c.numeric.encode()),
        None => return HandlerOutcome::Continue,
    };
    if !privs.has(OperPrivs::JUPE) {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "Permission Denied: Insufficient privileges");
        return HandlerOutcome::Continue;
    }
    let local_only = privs.has(OperPrivs::LOCAL);

    let (deactivating, mask) = match raw_mask.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw_mask.strip_prefix('+').unwrap_or(raw_mask)),
    };
    let now = ctx.now();

    if deactivating {
        let Some(idx) = ctx.jupes.find_exact(mask, now) else {
            send::numeric(ctx, conn, ERR_NOSUCHSERVER, &[mask], "No such jupe");
            return HandlerOutcome::Continue;
        };
        let lastmod = now;
        let (reason, expire, was_local) = {
            let j = ctx.jupes.get(idx).expect("found above");
            (j.reason.clone(), j.expire, j.flags.local)
        };
        let freed = ctx.jupes.deactivate(idx, lastmod, local_only);
        send::to_local_opers(ctx, &format!("deactivating JUPE for {}", mask));
        // A local entry's removal stays local.
        if !local_only && !was_local {
            let lastmod = if freed {
                lastmod
            } else {
                ctx.jupes.get(idx).map(|j| j.lastmod).unwrap_or(lastmod)
            };
            propagate_jupe(ctx, None, &oper_nn, mask, false, expire - now, lastmod, &reason);
        }
        return HandlerOutcome::Continue;
    }

    let duration = msg
        .param(1)
        .and_then(|p| p.parse::<i64>().ok())
        .unwrap_or(DEFAULT_DURATION)
        .clamp(1, MAX_DURATION);
    let reason = msg.param(2).unwrap_or("No reason given").to_string();
    let lastmod = now;

    if let Some(idx) = ctx.jupes.find_exact(mask, now) {
        ctx.jupes.activate(idx, lastmod, local_only);
        let (expire, lastmod, reason) = {
            let j = ctx.jupes.get(idx).expect("found above");
            (j.expire, j.lastmod, j.reason.clone())
        };
        send::to_local_opers(ctx, &format!("activating JUPE for {}", mask));
        if !local_only {
            propagate_jupe(ctx, None, &oper_nn, mask, true, expire - now, lastmod, &reason);
        }
        enforce_jupe(ctx, mask, &reason);
        return HandlerOutcome::Continue;
    }

    let flags = ControlFlags {
        active: true,
        local: local_only,
        ldeact: false,
    };
    if ctx
        .jupes
        .add(mask.to_string(), reason.clone(), now + duration, lastmod, flags, now)
        .is_some()
    {
        send::to_local_opers(ctx, &format!(
            "adding JUPE for {}, expiring in {}s: {}",
            mask, duration, reason
        ));
        if !local_only {
            propagate_jupe(ctx, None, &oper_nn, mask, true, duration, lastmod, &reason);
        }
        enforce_jupe(ctx, mask, &reason);
    }
    HandlerOutcome::Continue
}

/// JUPE from the mesh: the lamport decision tree.
pub fn ms_jupe(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(_target), Some(signed_mask)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "JUPE with too few parameters");
    };
    let (active, mask) = match signed_mask.strip_prefix('-') {
        Some(rest) => (false, rest),
        None => (true, signed_mask.strip_prefix('+').unwrap_or(signed_mask)),
    };
    let expire_offset = msg.param(2).and_then(|p| p.parse::<i64>().ok()).unwrap_or(0);
    let lastmod = msg.param(3).and_then(|p| p.parse::<i64>().ok()).unwrap_or(0);
    let reason = msg.params.last().copied().unwrap_or("No reason").to_string();

    let now = ctx.now();
    let source_nn = crate::handlers::connection::origin_prefix(ctx, origin);
    let peer_bursting = match ctx.conns.get(&conn).map(|c| c.state) {
        Some(ConnState::Server(peer)) => ctx
            .store
            .servers
            .get(peer)
            .is_some_and(|s| s.flags.burst || s.flags.burst_ack),
        _ => false,
    };

    if let Some(idx) = ctx.jupes.find_exact(mask, now) {
        let (existing_lastmod, existing_local) = {
            let j = ctx.jupes.get(idx).expect("found above");
            (j.lastmod, j.flags.local)
        };

        if existing_local {
            ctx.jupes.deactivate(idx, 0, false);
        } else if lastmod == 0 || existing_lastmod < lastmod {
            if active {
                ctx.jupes.activate(idx, lastmod, false);
            } else {
                ctx.jupes.deactivate(idx, lastmod, false);
            }
            let new_lastmod = ctx.jupes.get(idx).map(|j| j.lastmod).unwrap_or(lastmod);
            propagate_jupe(
                ctx,
                Some(conn),
                &source_nn,
                mask,
                active,
                expire_offset,
                new_lastmod,
                &reason,
            );
            if active {
                enforce_jupe(ctx, mask, &reason);
            }
            return HandlerOutcome::Continue;
        } else if existing_lastmod == lastmod || peer_bursting {
            return HandlerOutcome::Continue;
        } else {
            // Resynchronize the out-of-date peer.
            let (j_active, j_expire, j_lastmod, j_reason) = {
                let j = ctx.jupes.get(idx).expect("found above");
                (j.flags.active, j.expire, j.lastmod, j.reason.clone())
            };
            let line = MessageBuilder::to_servers(&ctx.me_numnick(), "JUPE")
                .arg("*")
                .arg(format!("{}{}", if j_active { "+" } else { "-" }, mask))
                .ts(j_expire - now)
                .ts(j_lastmod)
                .trailing(&j_reason)
                .render();
            send::enqueue(ctx, conn, Priority::Normal, &line);
            return HandlerOutcome::Continue;
        }
    }

    if !active {
        return HandlerOutcome::Continue;
    }

    let flags = ControlFlags {
        active: true,
        local: false,
        ldeact: false,
    };
    if ctx
        .jupes
        .add(mask.to_string(), reason.clone(), now + expire_offset, lastmod, flags, now)
        .is_some()
    {
        propagate_jupe(
            ctx,
            Some(conn),
            &source_nn,
            mask,
            true,
            expire_offset,
            lastmod,
            &reason,
        );
        enforce_jupe(ctx, mask, &reason);
    }
    HandlerOutcome::Continue
}

