//! GLINE: the distributed user/channel ban plane.
//!
//! The remote handler is the lamport decision tree: a strictly newer
//! `lastmod` wins, an equal one (or any version during burst) is a
//! no-op, and an older one means the peer is desynced and gets our
//! version resent.

use tenth_proto::ParsedLine;

use crate::bans::{check_mask, AddOutcome, ControlFlags, GlineMask, MaskCheck};
use crate::conn::{ConnId, ConnState};
use crate::engine::{self, Context};
use crate::handlers::{replies::*, HandlerOutcome, Origin};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::OperPrivs;

/// Default G-line duration when an operator gives none.
const DEFAULT_DURATION: i64 = 3600;

/// Longest acceptable duration (the original's one-year clamp).
const MAX_DURATION: i64 = 365 * 24 * 3600;

/// Exit every local client matched by a newly active user G-line.
fn enforce_gline(ctx: &mut Context, mask: &GlineMask, reason: &str) {
    if matches!(mask, GlineMask::BadChan(_)) {
        return;
    }
    let now = ctx.now();
    let victims: Vec<_> = ctx
        .store
        .clients_snapshot()
        .into_iter()
        .filter(|id| {
            ctx.store.clients.get(*id).is_some_and(|c| {
                c.is_local()
                    && ctx
                        .glines
                        .iter()
                        .any(|g| {
                            g.is_active(now)
                                && g.mask.same_as(mask)
                                && g.matches_user(&c.username, &c.hostname, c.ip, &c.realname)
                        })
            })
        })
        .collect();

    for victim in victims {
        let name = ctx
            .store
            .clients
            .get(victim)
            .map(|c| c.nick.clone())
            .unwrap_or_default();
        send::to_local_opers(ctx, &format!("G-line active for {}", name));
        if let Some(conn) = ctx.store.clients.get(victim).and_then(|c| c.conn) {
            send::numeric(ctx, conn, ERR_YOUREBANNEDCREEP, &[], reason);
        }
        engine::exit_client(ctx, victim, None, &format!("G-lined ({})", reason), true);
    }
}

/// Send one G-line's state down a set of links.
fn propagate_gline(
    ctx: &mut Context,
    except: Option<ConnId>,
    source_nn: &str,
    mask: &GlineMask,
    active: bool,
    expire_offset: i64,
    lastmod: i64,
    reason: &str,
) {
    let sign = if active { "+" } else { "-" };
    let line = MessageBuilder::to_servers(source_nn, "GLINE")
        .arg("*")
        .arg(format!("{}{}", sign, mask.render()))
        .ts(expire_offset)
        .ts(lastmod)
        .trailing(reason)
        .render();
    for peer in route::server_conns(ctx, except) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
}

/// GLINE from a plain user: list only.
pub fn m_gline(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    _msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    list_glines(ctx, conn);
    HandlerOutcome::Continue
}

fn list_glines(ctx: &mut Context, conn: ConnId) {
    let now = ctx.now();
    let entries: Vec<(String, i64, i64, bool, String)> = ctx
        .glines
        .iter()
        .map(|g| {
            (
                g.mask.render(),
                g.expire,
                g.lastmod,
                g.is_active(now),
                g.reason.clone(),
            )
        })
        .collect();
    for (mask, expire, lastmod, active, reason) in entries {
        let state = if active { "+" } else { "-" };
        send::numeric(
            ctx,
            conn,
            RPL_GLIST,
            &[&mask, &expire.to_string(), &lastmod.to_string(), state],
            &reason,
        );
    }
    send::numeric(ctx, conn, RPL_ENDOFGLIST, &[], "End of G-line List");
}

/// GLINE from an operator.
///
/// `GLINE` lists; `GLINE [!][+|-]<mask> [<duration> [:<reason>]]`
/// creates, activates or deactivates.
pub fn mo_gline(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(oper) = origin.client() else {
        return HandlerOutcome::Continue;
    };

    let Some(raw_mask) = msg.param(0) else {
        list_glines(ctx, conn);
        return HandlerOutcome::Continue;
    };

    let (privs, oper_nn) = match ctx.store.clients.get(oper) {
        Some(c) => (c.privs, c.numeric.encode()),
        None => return HandlerOutcome::Continue,
    };
    if !privs.has(OperPrivs::GLINE) {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "Permission Denied: Insufficient privileges");
        return HandlerOutcome::Continue;
    }
    // Without global privileges the ban stays on this server.
    let local_only = privs.has(OperPrivs::LOCAL);

    let (force, rest) = match raw_mask.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw_mask),
    };
    let (deactivating, mask_str) = match rest.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, rest.strip_prefix('+').unwrap_or(rest)),
    };
    let mask = GlineMask::parse(mask_str);
    let now = ctx.now();

    if deactivating {
        let Some(idx) = ctx.glines.find_exact(&mask, now) else {
            send::numeric(ctx, conn, ERR_NOSUCHNICK, &[mask_str], "No such G-line");
            return HandlerOutcome::Continue;
        };
        let lastmod = now;
        let (reason, expire, was_local) = {
            let g = ctx.glines.get(idx).expect("found above");
            (g.reason.clone(), g.expire, g.flags.local)
        };
        let freed = ctx.glines.deactivate(idx, lastmod, local_only);
        send::to_local_opers(ctx, &format!("deactivating G-line for {}", mask_str));
        // A local entry's removal stays local.
        if !local_only && !was_local {
            let lastmod = if freed {
                lastmod
            } else {
                ctx.glines.get(idx).map(|g| g.lastmod).unwrap_or(lastmod)
            };
            propagate_gline(ctx, None, &oper_nn, &mask, false, expire - now, lastmod, &reason);
        }
        return HandlerOutcome::Continue;
    }

    // Activation or a new entry. Masks wide enough to be dangerous are
    // rejected; wild-but-legal ones need the override.
    if !matches!(mask, GlineMask::BadChan(_) | GlineMask::Realname(_)) {
        match check_mask(mask_str) {
            MaskCheck::Rejected => {
                send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[mask_str], "Mask is too wide");
                return HandlerOutcome::Continue;
            }
            MaskCheck::Overridable if !force && !privs.has(OperPrivs::WIDE_GLINE) => {
                send::numeric(
                    ctx,
                    conn,
                    ERR_NOPRIVILEGES,
                    &[mask_str],
                    "Wide mask needs ! override",
                );
                return HandlerOutcome::Continue;
            }
            _ => {}
        }
    }

    let duration = msg
        .param(1)
        .and_then(|p| p.parse::<i64>().ok())
        .unwrap_or(DEFAULT_DURATION)
        .clamp(1, MAX_DURATION);
    let reason = msg.param(2).unwrap_or("No reason given").to_string();
    let lastmod = now;

    if let Some(idx) = ctx.glines.find_exact(&mask, now) {
        ctx.glines.activate(idx, lastmod, local_only);
        let (expire, lastmod, reason) = {
            let g = ctx.glines.get(idx).expect("found above");
            (g.expire, g.lastmod, g.reason.clone())
        };
        send::to_local_opers(ctx, &format!("activating G-line for {}", mask_str));
        if !local_only {
            propagate_gline(ctx, None, &oper_nn, &mask, true, expire - now, lastmod, &reason);
        }
        enforce_gline(ctx, &mask, &reason);
        return HandlerOutcome::Continue;
    }

    let flags = ControlFlags {
        active: true,
        local: local_only,
        ldeact: false,
    };
    match ctx.glines.add(
        mask.clone(),
        reason.clone(),
        now + duration,
        lastmod,
        flags,
        now,
    ) {
        AddOutcome::Overlapped => {
            // Swallowed by a wider, longer-lived ban: silently done.
        }
        AddOutcome::Added(_) => {
            send::to_local_opers(ctx, &format!(
                "adding G-line for {}, expiring in {}s: {}",
                mask_str, duration, reason
            ));
            if !local_only {
                propagate_gline(ctx, None, &oper_nn, &mask, true, duration, lastmod, &reason);
            }
            enforce_gline(ctx, &mask, &reason);
        }
    }
    HandlerOutcome::Continue
}

/// GLINE from the mesh: `<target> <±mask> [<expire-offset> <lastmod>
/// :<reason>]`.
pub fn ms_gline(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(_target), Some(signed_mask)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "GLINE with too few parameters");
    };

    let (active, mask_str) = match signed_mask.strip_prefix('-') {
        Some(rest) => (false, rest),
        None => (true, signed_mask.strip_prefix('+').unwrap_or(signed_mask)),
    };
    let mask = GlineMask::parse(mask_str);
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

    if let Some(idx) = ctx.glines.find_exact(&mask, now) {
        let (existing_lastmod, existing_local) = {
            let g = ctx.glines.get(idx).expect("found above");
            (g.lastmod, g.flags.local)
        };

        if existing_local {
            // A global entry for a mask we only had locally replaces it.
            ctx.glines.deactivate(idx, 0, false);
        } else if lastmod == 0 || existing_lastmod < lastmod {
            // Strictly newer version: apply and pass it on.
            if active {
                ctx.glines.activate(idx, lastmod, false);
            } else {
                ctx.glines.deactivate(idx, lastmod, false);
            }
            let new_lastmod = ctx.glines.get(idx).map(|g| g.lastmod).unwrap_or(lastmod);
            propagate_gline(
                ctx,
                Some(conn),
                &source_nn,
                &mask,
                active,
                expire_offset,
                new_lastmod,
                &reason,
            );
            if active {
                enforce_gline(ctx, &mask, &reason);
            }
            return HandlerOutcome::Continue;
        } else if existing_lastmod == lastmod || peer_bursting {
            // Same version (or any version mid-burst): a no-op.
            return HandlerOutcome::Continue;
        } else {
            // The peer is desynced; resynchronize it with our state.
            let (g_active, g_expire, g_lastmod, g_reason) = {
                let g = ctx.glines.get(idx).expect("found above");
                (g.flags.active, g.expire, g.lastmod, g.reason.clone())
            };
            let line = MessageBuilder::to_servers(&ctx.me_numnick(), "GLINE")
                .arg("*")
                .arg(format!(
                    "{}{}",
                    if g_active { "+" } else { "-" },
                    mask.render()
                ))
                .ts(g_expire - now)
                .ts(g_lastmod)
                .trailing(&g_reason)
                .render();
            send::enqueue(ctx, conn, Priority::Normal, &line);
            return HandlerOutcome::Continue;
        }
    }

    if !active {
        // Deactivating something we never had.
        return HandlerOutcome::Continue;
    }

    let flags = ControlFlags {
        active: true,
        local: false,
        ldeact: false,
    };
    match ctx.glines.add(
        mask.clone(),
        reason.clone(),
        now + expire_offset,
        lastmod,
        flags,
        now,
    ) {
        AddOutcome::Overlapped => HandlerOutcome::Continue,
        AddOutcome::Added(_) => {
            propagate_gline(
                ctx,
                Some(conn),
                &source_nn,
                &mask,
                true,
                expire_offset,
                lastmod,
                &reason,
            );
            enforce_gline(ctx, &mask, &reason);
            HandlerOutcome::Continue
        }
    }
}
