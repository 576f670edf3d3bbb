//! MODE, OPMODE and CLEARMODE handlers.
//!
//! Parsing is the proto crate's job; permission policy is here; the
//! mechanics and emission batching live in the mode engine.

use tenth_proto::mode::parse_mode_string;
use tenth_proto::{ModeChange, ParsedLine};

use crate::conn::ConnId;
use crate::engine::{self, Context};
use crate::handlers::{
    is_chanop, need_more_params, replies::*, HandlerOutcome, Origin,
};
use crate::modebuf::{self, ApplyOpts, MemberMode, ModeBuf, OwnedChange};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{ChannelId, ClientId};

/// Resolution of a raw change list against the store.
struct Resolved {
    changes: Vec<OwnedChange>,
    unknown: Vec<char>,
    missing: Vec<String>,
}

/// Turn parsed changes into store-resolved ones. Member arguments are
/// nicks from users and numnicks from peers; both are accepted.
fn resolve_changes(ctx: &mut Context, raw: &[ModeChange<'_>]) -> Resolved {
    let mut out = Resolved {
        changes: Vec::new(),
        unknown: Vec::new(),
        missing: Vec::new(),
    };

    for change in raw {
        match change {
            ModeChange::Flag(sign, flag) => out.changes.push(OwnedChange::Flag(*sign, *flag)),
            ModeChange::Key(sign, key) => {
                out.changes.push(OwnedChange::Key(*sign, key.to_string()))
            }
            ModeChange::Limit(sign, limit) => out.changes.push(OwnedChange::Limit(*sign, *limit)),
            ModeChange::Ban(sign, mask) => {
                out.changes.push(OwnedChange::Ban(*sign, mask.to_string()))
            }
            ModeChange::Op(sign, who) | ModeChange::Voice(sign, who) => {
                let target = ctx
                    .store
                    .find_client_by_numnick(who)
                    .or_else(|| ctx.store.find_client_by_name(who));
                match target {
                    Some(id) => {
                        let mode = if matches!(change, ModeChange::Op(..)) {
                            MemberMode::Op
                        } else {
                            MemberMode::Voice
                        };
                        out.changes.push(OwnedChange::Member(*sign, id, mode));
                    }
                    None => out.missing.push(who.to_string()),
                }
            }
            ModeChange::AdminPass(..) | ModeChange::UserPass(..) => {
                // Channel passwords change only through OPMODE.
            }
            ModeChange::Unknown(_, c) => out.unknown.push(*c),
        }
    }
    out
}

fn send_channel_mode_reply(ctx: &mut Context, conn: ConnId, channel: ChannelId) {
    let Some(chan) = ctx.store.channels.get(channel) else {
        return;
    };
    let name = chan.name.clone();
    let creation = chan.creation;
    let (letters, params) = chan.mode_string(false);
    let mut args: Vec<&str> = vec![name.as_str(), letters.as_str()];
    for p in &params {
        args.push(p);
    }
    send::numeric(ctx, conn, RPL_CHANNELMODEIS, &args, "");
    send::numeric(ctx, conn, RPL_CREATIONTIME, &[&name, &creation.to_string()], "");
}

fn send_ban_list(ctx: &mut Context, conn: ConnId, channel: ChannelId) {
    let Some(chan) = ctx.store.channels.get(channel) else {
        return;
    };
    let name = chan.name.clone();
    let bans: Vec<(String, String, i64)> = chan
        .bans
        .iter()
        .map(|b| (b.mask.clone(), b.who.clone(), b.when))
        .collect();
    for (mask, who, when) in bans {
        send::numeric(
            ctx,
            conn,
            RPL_BANLIST,
            &[&name, &mask, &who, &when.to_string()],
            "",
        );
    }
    send::numeric(ctx, conn, RPL_ENDOFBANLIST, &[&name], "End of Channel Ban List");
}

/// MODE from a local user: user modes or channel modes.
pub fn m_mode(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let Some(target) = msg.param(0) else {
        return need_more_params(ctx, conn, "MODE");
    };

    if target.starts_with('#') || target.starts_with('&') {
        m_mode_channel(ctx, conn, client, target, msg)
    } else {
        m_mode_user(ctx, conn, client, target, msg)
    }
}

fn m_mode_channel(
    ctx: &mut Context,
    conn: ConnId,
    client: ClientId,
    target: &str,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(channel) = ctx.store.find_channel(target) else {
        send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[target], "No such channel");
        return HandlerOutcome::Continue;
    };

    let Some(mode_str) = msg.param(1) else {
        send_channel_mode_reply(ctx, conn, channel);
        return HandlerOutcome::Continue;
    };

    // A bare `+b` asks for the ban list.
    let args: Vec<&str> = msg.params[2..].to_vec();
    let stripped = mode_str.trim_start_matches(['+', '-']);
    if !stripped.is_empty() && stripped.chars().all(|c| c == 'b') && args.is_empty() {
        send_ban_list(ctx, conn, channel);
        return HandlerOutcome::Continue;
    }

    if !is_chanop(ctx, client, channel) {
        send::numeric(ctx, conn, ERR_CHANOPRIVSNEEDED, &[target], "You're not channel operator");
        return HandlerOutcome::Continue;
    }

    let (raw, _used) = parse_mode_string(mode_str, &args);
    let resolved = resolve_changes(ctx, &raw);
    for c in &resolved.unknown {
        send::numeric(
            ctx,
            conn,
            ERR_UNKNOWNMODE,
            &[&c.to_string()],
            "is unknown mode char to me",
        );
    }
    for who in &resolved.missing {
        send::numeric(ctx, conn, ERR_NOSUCHNICK, &[who], "No such nick");
    }

    let prefix = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.prefix())
        .unwrap_or_default();
    let nn = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.numeric.encode())
        .unwrap_or_default();

    let now = ctx.now();
    let mut mbuf = ModeBuf::new(channel, prefix, nn);
    modebuf::apply_changes(
        ctx,
        channel,
        &resolved.changes,
        &mut mbuf,
        ApplyOpts::default(),
        now,
    );
    mbuf.flush(ctx, None);
    HandlerOutcome::Continue
}

fn m_mode_user(
    ctx: &mut Context,
    conn: ConnId,
    client: ClientId,
    target: &str,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let is_self = ctx
        .store
        .clients
        .get(client)
        .is_some_and(|c| tenth_proto::irc_eq(&c.nick, target));
    if !is_self {
        send::numeric(ctx, conn, ERR_USERSDONTMATCH, &[], "Cannot change mode for other users");
        return HandlerOutcome::Continue;
    }

    let Some(mode_str) = msg.param(1) else {
        let modes = ctx
            .store
            .clients
            .get(client)
            .map(|c| c.modes.as_mode_string())
            .unwrap_or_default();
        send::numeric(ctx, conn, RPL_UMODEIS, &[&modes], "");
        return HandlerOutcome::Continue;
    };

    // +o is earned through OPER, never set directly.
    let was_oper = ctx
        .store
        .clients
        .get(client)
        .is_some_and(|c| c.modes.oper);
    let nick = {
        let Some(c) = ctx.store.clients.get_mut(client) else {
            return HandlerOutcome::Continue;
        };
        c.modes.apply(mode_str);
        if !was_oper {
            c.modes.oper = false;
        }
        c.nick.clone()
    };

    let nn = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.numeric.encode())
        .unwrap_or_default();
    let line = MessageBuilder::to_servers(&nn, "MODE")
        .arg(&nick)
        .arg(mode_str)
        .render();
    for peer in route::server_conns(ctx, None) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}

/// MODE from the mesh.
pub fn ms_mode(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(target) = msg.param(0) else {
        return engine::protocol_violation(ctx, conn, "MODE without a target");
    };

    if target.starts_with('#') || target.starts_with('&') {
        apply_remote_channel_mode(ctx, conn, origin, target, msg, false)
    } else {
        // A remote user adjusting its own modes.
        let Some(client) = origin.client() else {
            return HandlerOutcome::Continue;
        };
        let Some(mode_str) = msg.param(1) else {
            return HandlerOutcome::Continue;
        };
        if let Some(c) = ctx.store.clients.get_mut(client) {
            c.modes.apply(mode_str);
        }
        let nn = crate::handlers::connection::origin_prefix(ctx, origin);
        let line = MessageBuilder::to_servers(&nn, "MODE")
            .arg(target)
            .arg(mode_str)
            .render();
        for peer in route::server_conns(ctx, Some(conn)) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
        HandlerOutcome::Continue
    }
}

/// Shared remote channel-mode application for MODE and OPMODE.
fn apply_remote_channel_mode(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    target: &str,
    msg: &ParsedLine<'_>,
    opmode: bool,
) -> HandlerOutcome {
    let Some(channel) = ctx.store.find_channel(target) else {
        return HandlerOutcome::Continue;
    };
    let Some(mode_str) = msg.param(1) else {
        return engine::protocol_violation(ctx, conn, "MODE without a mode string");
    };

    let args: Vec<&str> = msg.params[2..].to_vec();
    let (raw, used) = parse_mode_string(mode_str, &args);

    // One unconsumed numeric tail argument is the channel timestamp;
    // a mode from a younger incarnation of the channel is stale.
    if args.len() == used + 1 {
        if let Ok(ts) = args[used].parse::<i64>() {
            let stale = ctx
                .store
                .channels
                .get(channel)
                .is_some_and(|c| c.creation != 0 && ts > c.creation);
            if stale && !opmode {
                return HandlerOutcome::Continue;
            }
        }
    }

    let resolved = resolve_changes(ctx, &raw);

    let (local_prefix, peer_prefix) = match origin {
        Origin::Client(id) => match ctx.store.clients.get(*id) {
            Some(c) => (c.prefix(), c.numeric.encode()),
            None => return HandlerOutcome::Continue,
        },
        Origin::Server(id) => match ctx.store.servers.get(*id) {
            Some(s) => (s.name.clone(), s.numeric.encode()),
            None => return HandlerOutcome::Continue,
        },
        Origin::Unregistered => return HandlerOutcome::Continue,
    };

    let now = ctx.now();
    let mut mbuf = ModeBuf::new(channel, local_prefix, peer_prefix);
    if opmode {
        mbuf = mbuf.as_opmode();
    }
    modebuf::apply_changes(
        ctx,
        channel,
        &resolved.changes,
        &mut mbuf,
        ApplyOpts { force: opmode },
        now,
    );
    mbuf.flush(ctx, Some(conn));
    HandlerOutcome::Continue
}

/// OPMODE from an operator: forced modes, logged and announced.
pub fn mo_opmode(
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
        .is_some_and(|c| c.privs.has(crate::state::OperPrivs::OPMODE));
    if !privileged {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "Permission Denied: Insufficient privileges");
        return HandlerOutcome::Continue;
    }
    let (Some(target), Some(modes)) = (msg.param(0), msg.param(1)) else {
        return need_more_params(ctx, conn, "OPMODE");
    };

    let nick = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.nick.clone())
        .unwrap_or_default();
    tracing::info!(oper = %nick, channel = %target, modes = %modes, "OPMODE");
    send::to_local_opers(ctx, &format!("{} used OPMODE {} {}", nick, target, modes));

    apply_remote_channel_mode(ctx, conn, origin, target, msg, true)
}

/// OPMODE from the mesh.
pub fn ms_opmode(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(target), Some(modes)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "OPMODE with too few parameters");
    };
    tracing::info!(channel = %target, modes = %modes, "remote OPMODE");
    send::to_local_opers(ctx, &format!("OPMODE {} {}", target, modes));
    apply_remote_channel_mode(ctx, conn, origin, target, msg, true)
}

/// CLEARMODE from an operator: wipe named modes in one batch.
pub fn mo_clearmode(
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
        .is_some_and(|c| c.privs.has(crate::state::OperPrivs::OPMODE));
    if !privileged {
        send::numeric(ctx, conn, ERR_NOPRIVILEGES, &[], "Permission Denied: Insufficient privileges");
        return HandlerOutcome::Continue;
    }
    let (Some(target), Some(control)) = (msg.param(0), msg.param(1)) else {
        return need_more_params(ctx, conn, "CLEARMODE");
    };

    let nick = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.nick.clone())
        .unwrap_or_default();
    tracing::info!(oper = %nick, channel = %target, control = %control, "CLEARMODE");
    send::to_local_opers(ctx, &format!("{} used CLEARMODE {} {}", nick, target, control));

    do_clearmode(ctx, None, origin, target, control)
}

/// CLEARMODE from the mesh.
pub fn ms_clearmode(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(target), Some(control)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "CLEARMODE with too few parameters");
    };
    send::to_local_opers(ctx, &format!("CLEARMODE {} {}", target, control));
    do_clearmode(ctx, Some(conn), origin, target, control)
}

fn do_clearmode(
    ctx: &mut Context,
    except: Option<ConnId>,
    origin: &Origin,
    target: &str,
    control: &str,
) -> HandlerOutcome {
    let Some(channel) = ctx.store.find_channel(target) else {
        return HandlerOutcome::Continue;
    };

    let (local_prefix, peer_prefix) = match origin {
        Origin::Client(id) => match ctx.store.clients.get(*id) {
            Some(c) => (c.prefix(), c.numeric.encode()),
            None => return HandlerOutcome::Continue,
        },
        Origin::Server(id) => match ctx.store.servers.get(*id) {
            Some(s) => (s.name.clone(), s.numeric.encode()),
            None => return HandlerOutcome::Continue,
        },
        Origin::Unregistered => return HandlerOutcome::Continue,
    };

    let mut mbuf = ModeBuf::new(channel, local_prefix, peer_prefix).as_opmode();
    modebuf::clear_modes(ctx, channel, control, &mut mbuf);
    mbuf.flush(ctx, except);
    HandlerOutcome::Continue
}
