//! PRIVMSG, NOTICE, WALLCHOPS and WALLOPS relay.

use tenth_proto::{match_mask, ChannelFlag, ParsedLine};

use crate::conn::ConnId;
use crate::engine::Context;
use crate::handlers::{need_more_params, replies::*, HandlerOutcome, Origin};
use crate::route::{self, LocalFilter};
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{ChannelId, ClientId};

/// Does the target's silence list drop this source?
fn silenced(ctx: &Context, target: ClientId, source: ClientId) -> bool {
    let Some(t) = ctx.store.clients.get(target) else {
        return false;
    };
    let Some(s) = ctx.store.clients.get(source) else {
        return false;
    };
    let prefix = s.prefix();
    t.silence.iter().any(|mask| match_mask(mask, &prefix))
}

/// May this member speak on the channel right now?
fn can_send(ctx: &mut Context, source: ClientId, channel: ChannelId) -> bool {
    let member = ctx.store.membership(source, channel);

    let Some(chan) = ctx.store.channels.get(channel) else {
        return false;
    };
    let (is_member, has_voice, zombie) = match member
        .and_then(|m| ctx.store.members.get(m))
    {
        Some(m) => (true, m.flags.chanop || m.flags.voice, m.flags.zombie),
        None => (false, false, false),
    };

    if zombie {
        return false;
    }
    if !is_member && chan.flags.contains(ChannelFlag::NoPrivmsgs) {
        return false;
    }
    if chan.flags.contains(ChannelFlag::Moderated) && !has_voice {
        return false;
    }
    if has_voice {
        return true;
    }

    // Banned members stay silent; the verdict is cached on the
    // membership until the ban list changes.
    if let Some(m) = member {
        let cached = ctx
            .store
            .members
            .get(m)
            .filter(|mm| mm.flags.ban_valid)
            .map(|mm| mm.flags.banned);
        let banned = match cached {
            Some(b) => b,
            None => {
                let verdict = ctx.store.clients.get(source).is_some_and(|c| {
                    let full = c.prefix();
                    ctx.store
                        .channels
                        .get(channel)
                        .is_some_and(|ch| ch.bans.iter().any(|b| match_mask(&b.mask, &full)))
                });
                if let Some(mm) = ctx.store.members.get_mut(m) {
                    mm.flags.ban_valid = true;
                    mm.flags.banned = verdict;
                }
                verdict
            }
        };
        if banned {
            return false;
        }
    }
    true
}

/// Deliver one channel message locally and toward interested peers.
fn relay_to_channel(
    ctx: &mut Context,
    channel: ChannelId,
    source: ClientId,
    verb: &'static str,
    text: &str,
    except: Option<ConnId>,
    filter: LocalFilter,
) {
    let (prefix, nn) = match ctx.store.clients.get(source) {
        Some(c) => (c.prefix(), c.numeric.encode()),
        None => return,
    };
    let chan_name = match ctx.store.channels.get(channel) {
        Some(c) => c.name.clone(),
        None => return,
    };

    let local_line = MessageBuilder::to_clients(&prefix, verb)
        .arg(&chan_name)
        .trailing(text)
        .render();
    for member in route::local_members(ctx, channel, filter, Some(source)) {
        if !silenced(ctx, member, source) {
            send::to_client(ctx, member, Priority::Normal, &local_line);
        }
    }

    let peer_line = MessageBuilder::to_servers(&nn, verb)
        .arg(&chan_name)
        .trailing(text)
        .render();
    for peer in route::channel_peer_conns(ctx, channel, except) {
        send::enqueue(ctx, peer, Priority::Normal, &peer_line);
    }
}

/// Deliver one private message to a client, local or remote.
fn relay_to_client(
    ctx: &mut Context,
    target: ClientId,
    source: ClientId,
    verb: &'static str,
    text: &str,
    reply_conn: Option<ConnId>,
) {
    if silenced(ctx, target, source) {
        return;
    }
    let target_local = ctx
        .store
        .clients
        .get(target)
        .is_some_and(|c| c.is_local());

    if target_local {
        let prefix = match ctx.store.clients.get(source) {
            Some(c) => c.prefix(),
            None => return,
        };
        let target_nick = ctx
            .store
            .clients
            .get(target)
            .map(|c| c.nick.clone())
            .unwrap_or_default();
        let line = MessageBuilder::to_clients(&prefix, verb)
            .arg(&target_nick)
            .trailing(text)
            .render();
        send::to_client(ctx, target, Priority::Normal, &line);

        // Away text goes back to a local asker, for PRIVMSG only.
        if verb == "PRIVMSG" {
            if let Some(conn) = reply_conn {
                let away = ctx
                    .store
                    .clients
                    .get(target)
                    .and_then(|c| c.away.clone());
                if let Some(away) = away {
                    send::numeric(ctx, conn, RPL_AWAY, &[&target_nick], &away);
                }
            }
        }
    } else {
        let nn = ctx
            .store
            .clients
            .get(source)
            .map(|c| c.numeric.encode())
            .unwrap_or_default();
        let target_nn = ctx
            .store
            .clients
            .get(target)
            .map(|c| c.numeric.encode())
            .unwrap_or_default();
        let line = MessageBuilder::to_servers(&nn, verb)
            .arg(&target_nn)
            .trailing(text)
            .render();
        if let Some(next_hop) = route::conn_for_client(ctx, target) {
            send::enqueue(ctx, next_hop, Priority::Normal, &line);
        }
    }
}

/// Broadcast to every local client whose server matches a `$mask`
/// target, and pass it toward matching peers.
fn relay_to_server_mask(
    ctx: &mut Context,
    mask: &str,
    source: ClientId,
    verb: &'static str,
    text: &str,
    except: Option<ConnId>,
) {
    let prefix = match ctx.store.clients.get(source) {
        Some(c) => c.prefix(),
        None => return,
    };
    let line = MessageBuilder::to_clients(&prefix, verb)
        .arg(format!("${}", mask))
        .trailing(text)
        .render();
    for client in route::local_clients_matching(ctx, mask, true) {
        send::to_client(ctx, client, Priority::Normal, &line);
    }

    let nn = ctx
        .store
        .clients
        .get(source)
        .map(|c| c.numeric.encode())
        .unwrap_or_default();
    let peer_line = MessageBuilder::to_servers(&nn, verb)
        .arg(format!("${}", mask))
        .trailing(text)
        .render();
    for peer in route::server_conns_matching(ctx, mask, except) {
        send::enqueue(ctx, peer, Priority::Normal, &peer_line);
    }
}

fn relay(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
    verb: &'static str,
    from_peer: bool,
) -> HandlerOutcome {
    let Some(source) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let notice = verb == "NOTICE";

    let Some(targets) = msg.param(0) else {
        if !from_peer && !notice {
            send::numeric(ctx, conn, ERR_NORECIPIENT, &[], "No recipient given (PRIVMSG)");
        }
        return HandlerOutcome::Continue;
    };
    let Some(text) = msg.param(1).filter(|t| !t.is_empty()) else {
        if !from_peer && !notice {
            send::numeric(ctx, conn, ERR_NOTEXTTOSEND, &[], "No text to send");
        }
        return HandlerOutcome::Continue;
    };

    let except = from_peer.then_some(conn);
    for target in targets.split(',').filter(|t| !t.is_empty()) {
        if target.starts_with('#') || target.starts_with('&') {
            let Some(channel) = ctx.store.find_channel(target) else {
                if !from_peer && !notice {
                    send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[target], "No such channel");
                }
                continue;
            };
            // Remote sources were policed at their own server.
            if !from_peer && !can_send(ctx, source, channel) {
                if !notice {
                    send::numeric(ctx, conn, ERR_CANNOTSENDTOCHAN, &[target], "Cannot send to channel");
                }
                continue;
            }
            relay_to_channel(
                ctx,
                channel,
                source,
                verb,
                text,
                except,
                LocalFilter {
                    skip_deaf: true,
                    ..Default::default()
                },
            );
        } else if let Some(mask) = target.strip_prefix('$') {
            // Server-mask broadcast; an operator tool.
            let allowed = from_peer
                || ctx
                    .store
                    .clients
                    .get(source)
                    .is_some_and(|c| c.modes.oper);
            if allowed {
                relay_to_server_mask(ctx, mask, source, verb, text, except);
            }
            continue;
        } else {
            let found = ctx
                .store
                .find_client_by_numnick(target)
                .or_else(|| ctx.store.find_client_by_name(target));
            let Some(target_client) = found else {
                if !from_peer && !notice {
                    send::numeric(ctx, conn, ERR_NOSUCHNICK, &[target], "No such nick");
                }
                continue;
            };
            let reply_conn = (!from_peer).then_some(conn);
            relay_to_client(ctx, target_client, source, verb, text, reply_conn);
        }
    }
    HandlerOutcome::Continue
}

/// PRIVMSG from a local user.
pub fn m_privmsg(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    relay(ctx, conn, origin, msg, "PRIVMSG", false)
}

/// PRIVMSG from the mesh.
pub fn ms_privmsg(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    relay(ctx, conn, origin, msg, "PRIVMSG", true)
}

/// NOTICE from a local user.
pub fn m_notice(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    relay(ctx, conn, origin, msg, "NOTICE", false)
}

/// NOTICE from the mesh.
pub fn ms_notice(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    relay(ctx, conn, origin, msg, "NOTICE", true)
}

fn wallchops(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
    from_peer: bool,
) -> HandlerOutcome {
    let Some(source) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
        if !from_peer {
            return need_more_params(ctx, conn, "WALLCHOPS");
        }
        return HandlerOutcome::Continue;
    };
    let Some(channel) = ctx.store.find_channel(target) else {
        if !from_peer {
            send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[target], "No such channel");
        }
        return HandlerOutcome::Continue;
    };
    if !from_peer && ctx.store.membership(source, channel).is_none() {
        send::numeric(ctx, conn, ERR_NOTONCHANNEL, &[target], "You're not on that channel");
        return HandlerOutcome::Continue;
    }

    relay_to_channel(
        ctx,
        channel,
        source,
        "WALLCHOPS",
        text,
        from_peer.then_some(conn),
        LocalFilter {
            ops_only: true,
            ..Default::default()
        },
    );
    HandlerOutcome::Continue
}

/// WALLCHOPS from a local user.
pub fn m_wallchops(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    wallchops(ctx, conn, origin, msg, false)
}

/// WALLCHOPS from the mesh.
pub fn ms_wallchops(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    wallchops(ctx, conn, origin, msg, true)
}

fn wallops(ctx: &mut Context, origin: &Origin, text: &str, except: Option<ConnId>) {
    let prefix = match origin {
        Origin::Client(id) => ctx.store.clients.get(*id).map(|c| c.prefix()),
        Origin::Server(id) => ctx.store.servers.get(*id).map(|s| s.name.clone()),
        Origin::Unregistered => None,
    };
    let Some(prefix) = prefix else {
        return;
    };

    let line = MessageBuilder::to_clients(&prefix, "WALLOPS")
        .trailing(text)
        .render();
    let receivers: Vec<ClientId> = ctx
        .store
        .clients_snapshot()
        .into_iter()
        .filter(|id| {
            ctx.store
                .clients
                .get(*id)
                .is_some_and(|c| c.is_local() && c.modes.wallops)
        })
        .collect();
    for r in receivers {
        send::to_client(ctx, r, Priority::Normal, &line);
    }

    let nn = crate::handlers::connection::origin_prefix(ctx, origin);
    let peer_line = MessageBuilder::to_servers(&nn, "WALLOPS")
        .trailing(text)
        .render();
    for peer in route::server_conns(ctx, except) {
        send::enqueue(ctx, peer, Priority::Normal, &peer_line);
    }
}

/// WALLOPS from an operator.
pub fn mo_wallops(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(text) = msg.param(0).filter(|t| !t.is_empty()) else {
        return need_more_params(ctx, conn, "WALLOPS");
    };
    wallops(ctx, origin, text, None);
    HandlerOutcome::Continue
}

/// WALLOPS from the mesh.
pub fn ms_wallops(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(text) = msg.param(0) else {
        return HandlerOutcome::Continue;
    };
    wallops(ctx, origin, text, Some(conn));
    HandlerOutcome::Continue
}
