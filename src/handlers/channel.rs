//! Channel-plane handlers: JOIN/CREATE, PART, KICK, TOPIC, INVITE,
//! NAMES.

use tenth_proto::{ChannelFlag, ParsedLine};

use crate::conn::ConnId;
use crate::engine::{self, Context};
use crate::handlers::{
    is_chanop, need_more_params, replies::*, valid_channel_name, HandlerOutcome, Origin,
};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{ChannelId, ClientId, MemberFlags};

/// Channels one user may occupy.
const MAXCHANNELS: usize = 20;

/// Why a local join is refused, mapped to its numeric.
fn join_refusal(ctx: &mut Context, client: ClientId, channel: ChannelId, key: Option<&str>) -> Option<(u16, &'static str)> {
    let Some(chan) = ctx.store.channels.get(channel) else {
        return None;
    };

    if chan.flags.contains(ChannelFlag::InviteOnly) {
        let invited = chan.invites.contains(&client);
        if !invited {
            return Some((ERR_INVITEONLYCHAN, "Cannot join channel (+i)"));
        }
    }
    if let Some(ref chan_key) = chan.key {
        if key != Some(chan_key.as_str()) {
            return Some((ERR_BADCHANNELKEY, "Cannot join channel (+k)"));
        }
    }
    if let Some(limit) = chan.limit {
        if chan.members.len() >= limit as usize {
            return Some((ERR_CHANNELISFULL, "Cannot join channel (+l)"));
        }
    }

    let (user_at_host, ip) = match ctx.store.clients.get(client) {
        Some(c) => (format!("{}!{}", c.nick, c.user_at_host()), c.ip),
        None => return None,
    };
    let banned = chan.bans.iter().any(|b| {
        tenth_proto::match_mask(&b.mask, &user_at_host)
            || b.mask
                .rsplit_once('@')
                .and_then(|(_, host)| tenth_proto::match_cidr(host, ip))
                .unwrap_or(false)
    });
    if banned {
        return Some((ERR_BANNEDFROMCHAN, "Cannot join channel (+b)"));
    }
    None
}

/// Tell local members about a join and the joiner about the channel.
fn announce_join(ctx: &mut Context, client: ClientId, channel: ChannelId) {
    let (prefix, chan_name) = {
        let Some(c) = ctx.store.clients.get(client) else {
            return;
        };
        let Some(chan) = ctx.store.channels.get(channel) else {
            return;
        };
        (c.prefix(), chan.name.clone())
    };
    let line = MessageBuilder::to_clients(&prefix, "JOIN")
        .arg(&chan_name)
        .render();
    for member in route::local_members(ctx, channel, route::LocalFilter::default(), None) {
        send::to_client(ctx, member, Priority::Normal, &line);
    }
}

fn send_topic_numerics(ctx: &mut Context, conn: ConnId, channel: ChannelId) {
    let Some(chan) = ctx.store.channels.get(channel) else {
        return;
    };
    let name = chan.name.clone();
    if chan.topic.is_empty() {
        return;
    }
    let topic = chan.topic.clone();
    let who = chan.topic_who.clone();
    let ts = chan.topic_ts;
    send::numeric(ctx, conn, RPL_TOPIC, &[&name], &topic);
    send::numeric(ctx, conn, RPL_TOPICWHOTIME, &[&name, &who, &ts.to_string()], "");
}

fn send_names_reply(ctx: &mut Context, conn: ConnId, channel: ChannelId) {
    let Some(chan) = ctx.store.channels.get(channel) else {
        return;
    };
    let name = chan.name.clone();

    let mut entries: Vec<String> = Vec::new();
    for member_id in &chan.members {
        let Some(member) = ctx.store.members.get(*member_id) else {
            continue;
        };
        if member.flags.zombie {
            continue;
        }
        let Some(c) = ctx.store.clients.get(member.client) else {
            continue;
        };
        let sigil = if member.flags.chanop {
            "@"
        } else if member.flags.voice {
            "+"
        } else {
            ""
        };
        entries.push(format!("{}{}", sigil, c.nick));
    }

    for chunk in entries.chunks(16) {
        let list = chunk.join(" ");
        send::numeric(ctx, conn, RPL_NAMREPLY, &["=", &name], &list);
    }
    send::numeric(ctx, conn, RPL_ENDOFNAMES, &[&name], "End of /NAMES list");
}

/// JOIN from a local user.
pub fn m_join(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let Some(targets) = msg.param(0) else {
        return need_more_params(ctx, conn, "JOIN");
    };

    if targets == "0" {
        part_all(ctx, client);
        return HandlerOutcome::Continue;
    }

    let keys: Vec<&str> = msg.param(1).map(|k| k.split(',').collect()).unwrap_or_default();

    for (i, name) in targets.split(',').filter(|n| !n.is_empty()).enumerate() {
        if !valid_channel_name(name) {
            send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[name], "No such channel");
            continue;
        }
        let now = ctx.now();
        if ctx.glines.check_channel(name, now).is_some() {
            send::numeric(ctx, conn, ERR_BADCHANNAME, &[name], "Channel is closed");
            continue;
        }
        let at_limit = ctx
            .store
            .clients
            .get(client)
            .is_some_and(|c| c.members.len() >= MAXCHANNELS);
        if at_limit {
            send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[name], "You have joined too many channels");
            continue;
        }

        let (channel, created) = ctx.store.get_or_create_channel(name, now);
        if ctx.store.membership(client, channel).is_some() {
            continue;
        }

        if !created {
            if let Some((code, text)) = join_refusal(ctx, client, channel, keys.get(i).copied()) {
                send::numeric(ctx, conn, code, &[name], text);
                engine::destroy_channel_if_empty(ctx, channel);
                continue;
            }
        }

        let flags = MemberFlags {
            chanop: created,
            ..Default::default()
        };
        ctx.store.join(client, channel, flags);

        // A used invite is spent.
        if let Some(chan) = ctx.store.channels.get_mut(channel) {
            chan.invites.retain(|c| *c != client);
        }
        if let Some(c) = ctx.store.clients.get_mut(client) {
            c.invites.retain(|ch| *ch != channel);
        }

        announce_join(ctx, client, channel);
        send_topic_numerics(ctx, conn, channel);
        send_names_reply(ctx, conn, channel);

        // Local channels stay local; new ones travel as CREATE so the
        // founder's op survives the trip.
        let is_local = ctx
            .store
            .channels
            .get(channel)
            .is_some_and(|c| c.is_local());
        if !is_local {
            let nn = ctx
                .store
                .clients
                .get(client)
                .map(|c| c.numeric.encode())
                .unwrap_or_default();
            let creation = ctx
                .store
                .channels
                .get(channel)
                .map(|c| c.creation)
                .unwrap_or(now);
            let verb = if created { "CREATE" } else { "JOIN" };
            let line = MessageBuilder::to_servers(&nn, verb)
                .arg(name)
                .ts(creation)
                .render();
            for peer in route::server_conns(ctx, None) {
                send::enqueue(ctx, peer, Priority::Normal, &line);
            }
        }
    }
    HandlerOutcome::Continue
}

fn part_all(ctx: &mut Context, client: ClientId) {
    let member_ids: Vec<_> = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.members.clone())
        .unwrap_or_default();
    for m in member_ids {
        let Some(channel) = ctx.store.members.get(m).map(|mm| mm.channel) else {
            continue;
        };
        do_part(ctx, client, channel, None, "");
    }
}

/// Remove one membership with announcements. `except` suppresses the
/// echo toward the link a remote PART arrived on.
fn do_part(
    ctx: &mut Context,
    client: ClientId,
    channel: ChannelId,
    except: Option<ConnId>,
    reason: &str,
) {
    let Some(member) = ctx.store.membership(client, channel) else {
        return;
    };
    let zombie = ctx
        .store
        .members
        .get(member)
        .is_some_and(|m| m.flags.zombie);

    let (prefix, chan_name, is_local_chan) = {
        let Some(c) = ctx.store.clients.get(client) else {
            return;
        };
        let Some(chan) = ctx.store.channels.get(channel) else {
            return;
        };
        (c.prefix(), chan.name.clone(), chan.is_local())
    };

    // Zombies are already invisible locally; only the network side
    // needs the membership record gone.
    if !zombie {
        let mut b = MessageBuilder::to_clients(&prefix, "PART").arg(&chan_name);
        if !reason.is_empty() {
            b = b.trailing(reason);
        }
        let line = b.render();
        for m in route::local_members(ctx, channel, route::LocalFilter::default(), None) {
            send::to_client(ctx, m, Priority::Normal, &line);
        }
    }

    ctx.store.part(member);
    engine::destroy_channel_if_empty(ctx, channel);

    if !is_local_chan {
        let nn = ctx
            .store
            .clients
            .get(client)
            .map(|c| c.numeric.encode())
            .unwrap_or_default();
        let mut b = MessageBuilder::to_servers(&nn, "PART").arg(&chan_name);
        if !reason.is_empty() {
            b = b.trailing(reason);
        }
        let line = b.render();
        for peer in route::server_conns(ctx, except) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
    }
}

/// PART from a local user.
pub fn m_part(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let Some(targets) = msg.param(0) else {
        return need_more_params(ctx, conn, "PART");
    };
    let reason = msg.param(1).unwrap_or("");

    for name in targets.split(',').filter(|n| !n.is_empty()) {
        let Some(channel) = ctx.store.find_channel(name) else {
            send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[name], "No such channel");
            continue;
        };
        if ctx.store.membership(client, channel).is_none() {
            send::numeric(ctx, conn, ERR_NOTONCHANNEL, &[name], "You're not on that channel");
            continue;
        }
        do_part(ctx, client, channel, None, reason);
    }
    HandlerOutcome::Continue
}

/// PART from the mesh.
pub fn ms_part(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return engine::protocol_violation(ctx, conn, "PART without a client source");
    };
    let Some(targets) = msg.param(0) else {
        return engine::protocol_violation(ctx, conn, "PART without a channel");
    };
    let reason = msg.param(1).unwrap_or("");

    for name in targets.split(',').filter(|n| !n.is_empty()) {
        let Some(channel) = ctx.store.find_channel(name) else {
            continue;
        };
        do_part(ctx, client, channel, Some(conn), reason);
    }
    HandlerOutcome::Continue
}

/// JOIN from the mesh.
pub fn ms_join(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return engine::protocol_violation(ctx, conn, "JOIN without a client source");
    };
    let Some(targets) = msg.param(0) else {
        return engine::protocol_violation(ctx, conn, "JOIN without a channel");
    };

    if targets == "0" {
        part_all(ctx, client);
        let nn = crate::handlers::connection::origin_prefix(ctx, origin);
        let line = MessageBuilder::to_servers(&nn, "JOIN").arg("0").render();
        for peer in route::server_conns(ctx, Some(conn)) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
        return HandlerOutcome::Continue;
    }

    let ts = msg.param(1).and_then(|p| p.parse::<i64>().ok());

    for name in targets.split(',').filter(|n| !n.is_empty()) {
        let now = ctx.now();
        let (channel, _created) = ctx
            .store
            .get_or_create_channel(name, ts.unwrap_or(now));

        // A rejoin resurrects a zombie membership.
        if let Some(m) = ctx.store.membership(client, channel) {
            if let Some(mm) = ctx.store.members.get_mut(m) {
                if mm.flags.zombie {
                    mm.flags = MemberFlags::default();
                    announce_join(ctx, client, channel);
                }
            }
            continue;
        }

        ctx.store.join(client, channel, MemberFlags::default());
        announce_join(ctx, client, channel);

        let nn = ctx
            .store
            .clients
            .get(client)
            .map(|c| c.numeric.encode())
            .unwrap_or_default();
        let creation = ctx
            .store
            .channels
            .get(channel)
            .map(|c| c.creation)
            .unwrap_or(now);
        let line = MessageBuilder::to_servers(&nn, "JOIN")
            .arg(name)
            .ts(creation)
            .render();
        for peer in route::server_conns(ctx, Some(conn)) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
    }
    HandlerOutcome::Continue
}

/// CREATE from the mesh: a remote user opened a channel.
pub fn ms_create(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return engine::protocol_violation(ctx, conn, "CREATE without a client source");
    };
    let (Some(targets), Some(ts_str)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "CREATE with too few parameters");
    };
    let Ok(ts) = ts_str.parse::<i64>() else {
        return engine::protocol_violation(ctx, conn, "CREATE with unparseable timestamp");
    };
    if ts < ctx.features.oldest_ts {
        return engine::protocol_violation(ctx, conn, "CREATE with bogus timestamp");
    }

    for name in targets.split(',').filter(|n| !n.is_empty()) {
        let (channel, created) = ctx.store.get_or_create_channel(name, ts);

        // Two CREATEs raced across a split: the earlier timestamp owns
        // the channel, the later founder walks in without op.
        let lost_race = !created
            && ctx
                .store
                .channels
                .get(channel)
                .is_some_and(|c| c.creation <= ts && c.creation != 0);

        if ctx.store.membership(client, channel).is_none() {
            let flags = MemberFlags {
                chanop: !lost_race,
                deopped: lost_race,
                ..Default::default()
            };
            ctx.store.join(client, channel, flags);
            announce_join(ctx, client, channel);
            if !lost_race {
                // Local members see the founder's op arrive.
                let me = ctx.me_name();
                let nick = ctx
                    .store
                    .clients
                    .get(client)
                    .map(|c| c.nick.clone())
                    .unwrap_or_default();
                let chan_name = ctx
                    .store
                    .channels
                    .get(channel)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let line = MessageBuilder::to_clients(&me, "MODE")
                    .arg(&chan_name)
                    .arg("+o")
                    .arg(&nick)
                    .render();
                for m in route::local_members(ctx, channel, route::LocalFilter::default(), Some(client)) {
                    send::to_client(ctx, m, Priority::Normal, &line);
                }
            }
        }

        // The earlier creation time always wins.
        if let Some(chan) = ctx.store.channels.get_mut(channel) {
            if chan.creation == 0 || ts < chan.creation {
                chan.creation = ts;
            }
        }
    }

    let nn = crate::handlers::connection::origin_prefix(ctx, origin);
    let line = MessageBuilder::to_servers(&nn, "CREATE")
        .arg(targets)
        .ts(ts)
        .render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}

/// KICK from a local user.
pub fn m_kick(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(kicker) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let (Some(chan_name), Some(target_nick)) = (msg.param(0), msg.param(1)) else {
        return need_more_params(ctx, conn, "KICK");
    };
    let reason = msg.param(2).unwrap_or(target_nick);

    let Some(channel) = ctx.store.find_channel(chan_name) else {
        send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[chan_name], "No such channel");
        return HandlerOutcome::Continue;
    };
    if !is_chanop(ctx, kicker, channel) {
        send::numeric(ctx, conn, ERR_CHANOPRIVSNEEDED, &[chan_name], "You're not channel operator");
        return HandlerOutcome::Continue;
    }
    let Some(target) = ctx.store.find_client_by_name(target_nick) else {
        send::numeric(ctx, conn, ERR_NOSUCHNICK, &[target_nick], "No such nick");
        return HandlerOutcome::Continue;
    };
    if ctx.store.membership(target, channel).is_none() {
        send::numeric(
            ctx,
            conn,
            ERR_USERNOTINCHANNEL,
            &[target_nick, chan_name],
            "They aren't on that channel",
        );
        return HandlerOutcome::Continue;
    }

    let kicker_prefix = ctx
        .store
        .clients
        .get(kicker)
        .map(|c| c.prefix())
        .unwrap_or_default();
    do_kick(ctx, channel, target, &kicker_prefix, origin, reason, None);
    HandlerOutcome::Continue
}

/// Shared kick mechanics: local announce, membership removal or
/// zombification, peer propagation.
fn do_kick(
    ctx: &mut Context,
    channel: ChannelId,
    target: ClientId,
    kicker_prefix: &str,
    origin: &Origin,
    reason: &str,
    except: Option<ConnId>,
) {
    let (chan_name, is_local_chan) = match ctx.store.channels.get(channel) {
        Some(c) => (c.name.clone(), c.is_local()),
        None => return,
    };
    let (target_nick, target_nn, target_local) = match ctx.store.clients.get(target) {
        Some(c) => (c.nick.clone(), c.numeric.encode(), c.is_local()),
        None => return,
    };

    let line = MessageBuilder::to_clients(kicker_prefix, "KICK")
        .arg(&chan_name)
        .arg(&target_nick)
        .trailing(reason)
        .render();
    for m in route::local_members(ctx, channel, route::LocalFilter::default(), None) {
        send::to_client(ctx, m, Priority::Normal, &line);
    }
    // The kicked local user hears it even though zombies are filtered.
    if target_local {
        send::to_client(ctx, target, Priority::Normal, &line);
    }

    if let Some(member) = ctx.store.membership(target, channel) {
        let target_direction = route::conn_for_client(ctx, target);
        if target_local || target_direction == except {
            // Us, or resolved on the target's own side: drop it now.
            ctx.store.part(member);
            engine::destroy_channel_if_empty(ctx, channel);
        } else if let Some(mm) = ctx.store.members.get_mut(member) {
            // Crossing window: keep a zombie until the member's server
            // acknowledges.
            mm.flags.zombie = true;
        }
    }

    if !is_local_chan {
        let nn = crate::handlers::connection::origin_prefix(ctx, origin);
        let line = MessageBuilder::to_servers(&nn, "KICK")
            .arg(&chan_name)
            .arg(&target_nn)
            .trailing(reason)
            .render();
        for peer in route::server_conns(ctx, except) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
    }
}

/// KICK from the mesh.
pub fn ms_kick(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(chan_name), Some(target_field)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "KICK with too few parameters");
    };
    let reason = msg.param(2).unwrap_or("");

    let Some(channel) = ctx.store.find_channel(chan_name) else {
        return HandlerOutcome::Continue;
    };
    let Some(target) = ctx
        .store
        .find_client_by_numnick(target_field)
        .or_else(|| ctx.store.find_client_by_name(target_field))
    else {
        return HandlerOutcome::Continue;
    };

    let kicker_prefix = match origin {
        Origin::Client(id) => ctx
            .store
            .clients
            .get(*id)
            .map(|c| c.prefix())
            .unwrap_or_default(),
        Origin::Server(id) => ctx
            .store
            .servers
            .get(*id)
            .map(|s| s.name.clone())
            .unwrap_or_default(),
        Origin::Unregistered => return HandlerOutcome::Continue,
    };
    do_kick(ctx, channel, target, &kicker_prefix, origin, reason, Some(conn));
    HandlerOutcome::Continue
}

/// TOPIC from a local user: query or set.
pub fn m_topic(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let Some(chan_name) = msg.param(0) else {
        return need_more_params(ctx, conn, "TOPIC");
    };
    let Some(channel) = ctx.store.find_channel(chan_name) else {
        send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[chan_name], "No such channel");
        return HandlerOutcome::Continue;
    };

    let Some(new_topic) = msg.param(1) else {
        // Query.
        let empty = ctx
            .store
            .channels
            .get(channel)
            .is_some_and(|c| c.topic.is_empty());
        if empty {
            send::numeric(ctx, conn, RPL_NOTOPIC, &[chan_name], "No topic is set");
        } else {
            send_topic_numerics(ctx, conn, channel);
        }
        return HandlerOutcome::Continue;
    };

    if ctx.store.membership(client, channel).is_none() {
        send::numeric(ctx, conn, ERR_NOTONCHANNEL, &[chan_name], "You're not on that channel");
        return HandlerOutcome::Continue;
    }
    let topic_locked = ctx
        .store
        .channels
        .get(channel)
        .is_some_and(|c| c.flags.contains(ChannelFlag::TopicLimit));
    if topic_locked && !is_chanop(ctx, client, channel) {
        send::numeric(ctx, conn, ERR_CHANOPRIVSNEEDED, &[chan_name], "You're not channel operator");
        return HandlerOutcome::Continue;
    }

    let now = ctx.now();
    let (nick, prefix) = match ctx.store.clients.get(client) {
        Some(c) => (c.nick.clone(), c.prefix()),
        None => return HandlerOutcome::Continue,
    };
    let creation = {
        let Some(chan) = ctx.store.channels.get_mut(channel) else {
            return HandlerOutcome::Continue;
        };
        chan.topic = new_topic.to_string();
        chan.topic_who = nick;
        chan.topic_ts = now;
        chan.creation
    };

    let line = MessageBuilder::to_clients(&prefix, "TOPIC")
        .arg(chan_name)
        .trailing(new_topic)
        .render();
    for m in route::local_members(ctx, channel, route::LocalFilter::default(), None) {
        send::to_client(ctx, m, Priority::Normal, &line);
    }

    let is_local_chan = ctx
        .store
        .channels
        .get(channel)
        .is_some_and(|c| c.is_local());
    if !is_local_chan {
        let nn = crate::handlers::connection::origin_prefix(ctx, origin);
        let line = MessageBuilder::to_servers(&nn, "TOPIC")
            .arg(chan_name)
            .ts(creation)
            .ts(now)
            .trailing(new_topic)
            .render();
        for peer in route::server_conns(ctx, None) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
    }
    HandlerOutcome::Continue
}

/// TOPIC from the mesh, with creation/set timestamps for ordering.
pub fn ms_topic(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(chan_name) = msg.param(0) else {
        return engine::protocol_violation(ctx, conn, "TOPIC without a channel");
    };
    let Some(channel) = ctx.store.find_channel(chan_name) else {
        return HandlerOutcome::Continue;
    };
    let Some(new_topic) = msg.params.last().copied() else {
        return HandlerOutcome::Continue;
    };

    // Extended form carries <creation> <topic_ts>; without them the
    // topic is taken as fresh.
    let (creation_ts, topic_ts) = if msg.param_count() >= 4 {
        (
            msg.param(1).and_then(|p| p.parse::<i64>().ok()).unwrap_or(0),
            msg.param(2)
                .and_then(|p| p.parse::<i64>().ok())
                .unwrap_or_else(|| ctx.now()),
        )
    } else {
        (0, ctx.now())
    };

    let stale = {
        let Some(chan) = ctx.store.channels.get(channel) else {
            return HandlerOutcome::Continue;
        };
        // A topic from a younger channel incarnation, or older than
        // what we display, loses.
        (creation_ts != 0 && chan.creation != 0 && creation_ts > chan.creation)
            || topic_ts < chan.topic_ts
    };
    if stale {
        return HandlerOutcome::Continue;
    }

    let setter = match origin {
        Origin::Client(id) => ctx
            .store
            .clients
            .get(*id)
            .map(|c| (c.nick.clone(), c.prefix())),
        Origin::Server(id) => ctx
            .store
            .servers
            .get(*id)
            .map(|s| (s.name.clone(), s.name.clone())),
        Origin::Unregistered => None,
    };
    let Some((setter_nick, setter_prefix)) = setter else {
        return HandlerOutcome::Continue;
    };

    if let Some(chan) = ctx.store.channels.get_mut(channel) {
        chan.topic = new_topic.to_string();
        chan.topic_who = setter_nick;
        chan.topic_ts = topic_ts;
    }

    let line = MessageBuilder::to_clients(&setter_prefix, "TOPIC")
        .arg(chan_name)
        .trailing(new_topic)
        .render();
    for m in route::local_members(ctx, channel, route::LocalFilter::default(), None) {
        send::to_client(ctx, m, Priority::Normal, &line);
    }

    let nn = crate::handlers::connection::origin_prefix(ctx, origin);
    let creation = ctx
        .store
        .channels
        .get(channel)
        .map(|c| c.creation)
        .unwrap_or(0);
    let line = MessageBuilder::to_servers(&nn, "TOPIC")
        .arg(chan_name)
        .ts(creation)
        .ts(topic_ts)
        .trailing(new_topic)
        .render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}

/// INVITE from a local user.
pub fn m_invite(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(source) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let (Some(target_nick), Some(chan_name)) = (msg.param(0), msg.param(1)) else {
        return need_more_params(ctx, conn, "INVITE");
    };

    let Some(target) = ctx.store.find_client_by_name(target_nick) else {
        send::numeric(ctx, conn, ERR_NOSUCHNICK, &[target_nick], "No such nick");
        return HandlerOutcome::Continue;
    };
    let Some(channel) = ctx.store.find_channel(chan_name) else {
        send::numeric(ctx, conn, ERR_NOSUCHCHANNEL, &[chan_name], "No such channel");
        return HandlerOutcome::Continue;
    };
    if ctx.store.membership(source, channel).is_none() {
        send::numeric(ctx, conn, ERR_NOTONCHANNEL, &[chan_name], "You're not on that channel");
        return HandlerOutcome::Continue;
    }
    if ctx.store.membership(target, channel).is_some() {
        send::numeric(
            ctx,
            conn,
            ERR_USERONCHANNEL,
            &[target_nick, chan_name],
            "is already on channel",
        );
        return HandlerOutcome::Continue;
    }
    let invite_only = ctx
        .store
        .channels
        .get(channel)
        .is_some_and(|c| c.flags.contains(ChannelFlag::InviteOnly));
    if invite_only && !is_chanop(ctx, source, channel) {
        send::numeric(ctx, conn, ERR_CHANOPRIVSNEEDED, &[chan_name], "You're not channel operator");
        return HandlerOutcome::Continue;
    }

    deliver_invite(ctx, source, target, channel, Some(conn));
    HandlerOutcome::Continue
}

/// Record and deliver an invite; forwards toward remote targets.
fn deliver_invite(
    ctx: &mut Context,
    source: ClientId,
    target: ClientId,
    channel: ChannelId,
    reply_conn: Option<ConnId>,
) {
    let (target_nick, target_local) = match ctx.store.clients.get(target) {
        Some(c) => (c.nick.clone(), c.is_local()),
        None => return,
    };
    let chan_name = match ctx.store.channels.get(channel) {
        Some(c) => c.name.clone(),
        None => return,
    };

    if target_local {
        if let Some(chan) = ctx.store.channels.get_mut(channel) {
            if !chan.invites.contains(&target) {
                chan.invites.push(target);
            }
        }
        if let Some(c) = ctx.store.clients.get_mut(target) {
            if !c.invites.contains(&channel) {
                c.invites.push(channel);
            }
        }
        let prefix = ctx
            .store
            .clients
            .get(source)
            .map(|c| c.prefix())
            .unwrap_or_default();
        let line = MessageBuilder::to_clients(&prefix, "INVITE")
            .arg(&target_nick)
            .trailing(&chan_name)
            .render();
        send::to_client(ctx, target, Priority::Normal, &line);
    } else {
        let nn = ctx
            .store
            .clients
            .get(source)
            .map(|c| c.numeric.encode())
            .unwrap_or_default();
        let line = MessageBuilder::to_servers(&nn, "INVITE")
            .arg(&target_nick)
            .trailing(&chan_name)
            .render();
        if let Some(next_hop) = route::conn_for_client(ctx, target) {
            send::enqueue(ctx, next_hop, Priority::Normal, &line);
        }
    }

    if let Some(conn) = reply_conn {
        send::numeric(ctx, conn, RPL_INVITING, &[&target_nick, &chan_name], "");
    }
}

/// INVITE from the mesh: deliver if the target is ours, else forward.
pub fn ms_invite(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(source) = origin.client() else {
        return engine::protocol_violation(ctx, conn, "INVITE without a client source");
    };
    let (Some(target_nick), Some(chan_name)) = (msg.param(0), msg.param(1)) else {
        return HandlerOutcome::Continue;
    };
    let Some(target) = ctx.store.find_client_by_name(target_nick) else {
        return HandlerOutcome::Continue;
    };
    let Some(channel) = ctx.store.find_channel(chan_name) else {
        return HandlerOutcome::Continue;
    };
    deliver_invite(ctx, source, target, channel, None);
    HandlerOutcome::Continue
}

/// NAMES from a local user.
pub fn m_names(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(client) = origin.client() else {
        return HandlerOutcome::Continue;
    };
    let Some(targets) = msg.param(0) else {
        send::numeric(ctx, conn, RPL_ENDOFNAMES, &["*"], "End of /NAMES list");
        return HandlerOutcome::Continue;
    };

    for name in targets.split(',').filter(|n| !n.is_empty()) {
        let Some(channel) = ctx.store.find_channel(name) else {
            send::numeric(ctx, conn, RPL_ENDOFNAMES, &[name], "End of /NAMES list");
            continue;
        };
        let visible = ctx.store.membership(client, channel).is_some()
            || ctx.store.channels.get(channel).is_some_and(|c| {
                !c.flags.contains(ChannelFlag::Secret)
                    && !c.flags.contains(ChannelFlag::Private)
            });
        if visible {
            send_names_reply(ctx, conn, channel);
        } else {
            send::numeric(ctx, conn, RPL_ENDOFNAMES, &[name], "End of /NAMES list");
        }
    }
    HandlerOutcome::Continue
}

