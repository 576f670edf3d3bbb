//! The netburst engine.
//!
//! On link-up each side streams its view of the network: the server
//! tree, every client, one BURST line per channel (split when long),
//! the versioned control-plane entries, then EOB. The receive side
//! reconciles channel state by creation timestamp: earlier wins and
//! wipes, later is ignored (members still join, flagged), equal
//! merges. The anti-net-ride kick protects `+i`/`+k` channels from
//! members who slipped in on the other side of the split.

use std::net::IpAddr;

use tenth_proto::numnick;
use tenth_proto::{ModeSign, ParsedLine};

use crate::conn::ConnId;
use crate::engine::{self, Context};
use crate::handlers::HandlerOutcome;
use crate::modebuf::{MemberMode, ModeBuf};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{ChannelId, ClientId, MemberFlags, ServerId};

/// Wire form of an IP address: 6 base-64 digits for v4, 24 (eight
/// 3-digit groups) for v6. Both directions are pure and total, so the
/// collision rules see identical bytes on every server.
pub fn ip_to_base64(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => numnick::encode(u32::from(v4), 6),
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(24);
            for group in v6.segments() {
                out.push_str(&numnick::encode(group as u32, 3));
            }
            out
        }
    }
}

/// Reverse of [`ip_to_base64`]; `None` on malformed fields.
pub fn base64_to_ip(s: &str) -> Option<IpAddr> {
    match s.len() {
        6 => numnick::decode(s, 6).map(|v| IpAddr::V4(v.into())),
        24 => {
            let mut groups = [0u16; 8];
            for (i, chunk) in s.as_bytes().chunks(3).enumerate() {
                let part = std::str::from_utf8(chunk).ok()?;
                groups[i] = numnick::decode(part, 3)? as u16;
            }
            Some(IpAddr::V6(groups.into()))
        }
        _ => None,
    }
}

/// Stream our entire state down a freshly registered link.
pub fn send_netburst(ctx: &mut Context, conn: ConnId, peer: ServerId) {
    let now = ctx.now();
    let me = ctx.store.me;
    let me_nn = ctx.me_numnick();

    // 1. The server tree, parents before children, the new peer's own
    //    subtree excluded (it knows itself).
    let mut queue = vec![(me, 1u32)];
    let mut servers: Vec<(ServerId, u32)> = Vec::new();
    while let Some((sid, hop)) = queue.pop() {
        if let Some(ent) = ctx.store.servers.get(sid) {
            if sid != me && sid != peer {
                servers.push((sid, hop));
            }
            for d in &ent.downlinks {
                if *d != peer {
                    queue.push((*d, hop + 1));
                }
            }
        }
    }
    for (sid, hop) in servers {
        let Some(ent) = ctx.store.servers.get(sid) else {
            continue;
        };
        let uplink_nn = ent
            .uplink
            .and_then(|u| ctx.store.servers.get(u))
            .map(|u| u.numeric.encode())
            .unwrap_or_else(|| me_nn.clone());
        let field = format!(
            "{}{}",
            ent.numeric.encode(),
            numnick::encode(ent.capacity, 3)
        );
        let line = MessageBuilder::to_servers(&uplink_nn, "SERVER")
            .arg(&ent.name)
            .arg((hop + 1).to_string())
            .ts(ent.start_ts)
            .ts(ent.link_ts)
            .arg(format!("J{}", ent.protocol))
            .arg(field)
            .arg("0")
            .trailing(&ent.description)
            .render();
        send::enqueue(ctx, conn, Priority::Normal, &line);
    }

    // 2. Every client, introduced from its owning server.
    for client_id in ctx.store.clients_snapshot() {
        let Some(c) = ctx.store.clients.get(client_id) else {
            continue;
        };
        let Some(srv) = ctx.store.servers.get(c.server) else {
            continue;
        };
        let line = MessageBuilder::to_servers(&srv.numeric.encode(), "NICK")
            .arg(&c.nick)
            .arg("1")
            .ts(c.lastnick)
            .arg(&c.username)
            .arg(&c.hostname)
            .arg(c.modes.as_mode_string())
            .arg(ip_to_base64(c.ip))
            .arg(c.numeric.encode())
            .trailing(&c.realname)
            .render();
        send::enqueue(ctx, conn, Priority::Normal, &line);
    }

    // 3. One BURST per channel; long channels split across lines.
    for (chan_id, _) in ctx
        .store
        .channels
        .iter()
        .map(|(h, c)| (h, c.name.clone()))
        .collect::<Vec<_>>()
    {
        send_channel_burst(ctx, conn, chan_id);
    }

    // 4. Control planes: versioned, non-local entries.
    let glines: Vec<(String, bool, i64, i64, String)> = ctx
        .glines
        .burstable(now)
        .into_iter()
        .map(|g| {
            (
                g.mask.render(),
                g.flags.active,
                g.expire - now,
                g.lastmod,
                g.reason.clone(),
            )
        })
        .collect();
    for (mask, active, life, lastmod, reason) in glines {
        let sign = if active { "+" } else { "-" };
        let line = MessageBuilder::to_servers(&me_nn, "GLINE")
            .arg("*")
            .arg(format!("{}{}", sign, mask))
            .ts(life)
            .ts(lastmod)
            .trailing(&reason)
            .render();
        send::enqueue(ctx, conn, Priority::Normal, &line);
    }

    let jupes: Vec<(String, bool, i64, i64, String)> = ctx
        .jupes
        .burstable(now)
        .into_iter()
        .map(|j| {
            (
                j.mask.clone(),
                j.flags.active,
                j.expire - now,
                j.lastmod,
                j.reason.clone(),
            )
        })
        .collect();
    for (mask, active, life, lastmod, reason) in jupes {
        let sign = if active { "+" } else { "-" };
        let line = MessageBuilder::to_servers(&me_nn, "JUPE")
            .arg("*")
            .arg(format!("{}{}", sign, mask))
            .ts(life)
            .ts(lastmod)
            .trailing(&reason)
            .render();
        send::enqueue(ctx, conn, Priority::Normal, &line);
    }

    // 5. End of burst; we now await the EOB_ACK barrier.
    let line = MessageBuilder::to_servers(&me_nn, "EOB").render();
    send::enqueue(ctx, conn, Priority::Normal, &line);
    if let Some(p) = ctx.store.servers.get_mut(peer) {
        p.flags.burst_ack = true;
    }
}

/// Emit the BURST line(s) for one channel.
fn send_channel_burst(ctx: &mut Context, conn: ConnId, chan_id: ChannelId) {
    // Member lists longer than this split the line.
    const MEMBER_BUDGET: usize = 6 * 60;

    let Some(chan) = ctx.store.channels.get(chan_id) else {
        return;
    };
    if chan.is_local() || chan.members.is_empty() {
        return;
    }

    let name = chan.name.clone();
    let creation = chan.creation;
    let (mode_letters, mode_args) = chan.mode_string(true);

    let members: Vec<(ClientId, &'static str)> = chan
        .members
        .iter()
        .filter_map(|m| ctx.store.members.get(*m))
        .filter(|m| !m.flags.zombie)
        .map(|m| (m.client, m.flags.burst_tag()))
        .collect();

    let bans: Vec<String> = chan.bans.iter().map(|b| b.mask.clone()).collect();

    let mut first_line = true;
    let mut idx = 0;
    while idx < members.len() || first_line {
        let mut b = MessageBuilder::to_servers(&ctx.me_numnick(), "BURST")
            .arg(&name)
            .ts(creation);
        if first_line && mode_letters != "+" {
            b = b.arg(&mode_letters);
            for a in &mode_args {
                b = b.arg(a);
            }
        }

        let mut list = String::new();
        while idx < members.len() && list.len() < MEMBER_BUDGET {
            let (client, tag) = members[idx];
            let Some(c) = ctx.store.clients.get(client) else {
                idx += 1;
                continue;
            };
            if !list.is_empty() {
                list.push(',');
            }
            list.push_str(&c.numeric.encode());
            if !tag.is_empty() {
                list.push(':');
                list.push_str(tag);
            }
            idx += 1;
        }
        if !list.is_empty() {
            b = b.arg(&list);
        }

        let done = idx >= members.len();
        if done && !bans.is_empty() {
            b = b.trailing(format!("%{}", bans.join(" ")));
        }

        let line = b.render();
        send::enqueue(ctx, conn, Priority::Normal, &line);
        first_line = false;
        if done {
            break;
        }
    }
}

/// Apply one inbound BURST line (the §4.F receive algorithm).
pub fn apply_burst(
    ctx: &mut Context,
    conn: ConnId,
    source: ServerId,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let bursting = ctx
        .store
        .servers
        .get(source)
        .is_some_and(|s| s.flags.burst);
    if !bursting {
        // BURST outside of net.burst is a structural offense.
        engine::exit_connection(ctx, conn, "HACK: BURST outside net.burst");
        return HandlerOutcome::SourceExited;
    }

    let (Some(chan_name), Some(ts_str)) = (msg.param(0), msg.param(1)) else {
        return engine::protocol_violation(ctx, conn, "BURST with too few parameters");
    };
    let Ok(timestamp) = ts_str.parse::<i64>() else {
        return engine::protocol_violation(ctx, conn, "BURST with unparseable timestamp");
    };
    if timestamp < ctx.features.oldest_ts {
        return engine::protocol_violation(ctx, conn, "BURST with bogus timestamp");
    }

    let now = ctx.now();
    let (chan_id, created) = ctx.store.get_or_create_channel(chan_name, timestamp);
    let local_ts = if created {
        0
    } else {
        ctx.store.channels.get(chan_id).map(|c| c.creation).unwrap_or(0)
    };

    let incoming_wins = local_ts == 0 || local_ts > timestamp;
    let equal_ts = local_ts == timestamp;
    // SET: we accept incoming modes/bans. WIPEOUT additionally clears
    // what we had.
    let set = incoming_wins || equal_ts;
    let wipeout = incoming_wins && !created && local_ts != 0;

    // Anti net-ride: our side was younger and restrictive modes are in
    // the incoming state; members who got in under our timeline would
    // be riding the split.
    if wipeout {
        let incoming_restrictive = msg.params.iter().skip(2).any(|p| {
            p.starts_with('+') && (p.contains('i') || p.contains('k'))
        });
        let local_restrictive = ctx.store.channels.get(chan_id).is_some_and(|c| {
            c.flags.contains(tenth_proto::ChannelFlag::InviteOnly) || c.key.is_some()
        });
        if incoming_restrictive || local_restrictive {
            net_ride_kick(ctx, conn, chan_id);
        }
    }

    let mut mbuf = ModeBuf::new(
        chan_id,
        ctx.me_name(),
        ctx.me_numnick(),
    )
    .local_only()
    .hide_key();

    if wipeout {
        wipe_channel(ctx, chan_id, &mut mbuf);
    }
    if incoming_wins {
        if let Some(chan) = ctx.store.channels.get_mut(chan_id) {
            chan.creation = timestamp;
        }
    }

    // Existing burst-joined marks are from an earlier line pair; reset.
    clear_burst_marks(ctx, chan_id);

    // Parse the positional parameters by their lead character.
    let mut accepted_members: Vec<(ClientId, MemberFlags)> = Vec::new();
    let mut accepted_bans: Vec<String> = Vec::new();
    let mut accepted_modes: Vec<String> = Vec::new();

    for param in msg.params.iter().skip(2) {
        match param.as_bytes().first() {
            Some(b'+') => {
                if set {
                    apply_burst_modes(ctx, chan_id, param, msg, &mut accepted_modes);
                }
            }
            Some(b'%') => {
                if set {
                    apply_burst_bans(ctx, chan_id, &param[1..], now, &mut accepted_bans);
                }
            }
            _ => {
                apply_burst_members(ctx, conn, chan_id, param, set, &mut accepted_members);
            }
        }
    }

    // Re-emit onward with what we accepted.
    reemit_burst(
        ctx,
        conn,
        source,
        chan_id,
        &accepted_modes,
        &accepted_members,
        &accepted_bans,
    );

    if !accepted_bans.is_empty() || wipeout {
        ctx.store.invalidate_ban_cache(chan_id);
    }

    if set {
        finish_burst_apply(ctx, chan_id, wipeout, &mut mbuf);
    }
    mbuf.flush(ctx, Some(conn));

    HandlerOutcome::Continue
}

/// Kick every local member ("Net Rider") ahead of a restrictive wipe.
fn net_ride_kick(ctx: &mut Context, from_conn: ConnId, chan_id: ChannelId) {
    let locals = route::local_members(ctx, chan_id, route::LocalFilter::default(), None);
    let chan_name = match ctx.store.channels.get(chan_id) {
        Some(c) => c.name.clone(),
        None => return,
    };
    let me_name = ctx.me_name();
    let me_nn = ctx.me_numnick();

    for client in locals {
        let Some(c) = ctx.store.clients.get(client) else {
            continue;
        };
        let nick = c.nick.clone();
        let nn = c.numeric.encode();

        let peer_line = MessageBuilder::to_servers(&me_nn, "KICK")
            .arg(&chan_name)
            .arg(&nn)
            .trailing("Net Rider")
            .render();
        for peer in route::server_conns(ctx, Some(from_conn)) {
            send::enqueue(ctx, peer, Priority::Normal, &peer_line);
        }

        let local_line = MessageBuilder::to_clients(&me_name, "KICK")
            .arg(&chan_name)
            .arg(&nick)
            .trailing("Net Rider")
            .render();
        for member in route::local_members(ctx, chan_id, route::LocalFilter::default(), None) {
            send::to_client(ctx, member, Priority::Normal, &local_line);
        }

        if let Some(m) = ctx.store.membership(client, chan_id) {
            ctx.store.part(m);
        }
    }
}

/// Record removals for everything we had (TS wipe).
fn wipe_channel(ctx: &mut Context, chan_id: ChannelId, mbuf: &mut ModeBuf) {
    let Some(chan) = ctx.store.channels.get_mut(chan_id) else {
        return;
    };
    for flag in chan.flags.iter().collect::<Vec<_>>() {
        mbuf.flag(ModeSign::Minus, flag);
    }
    chan.flags = tenth_proto::ChannelFlags::empty();
    if let Some(key) = chan.key.take() {
        mbuf.key(ModeSign::Minus, key);
    }
    if chan.limit.take().is_some() {
        mbuf.limit(ModeSign::Minus, None);
    }
    chan.apass = None;
    chan.upass = None;
    for ban in chan.bans.iter_mut() {
        ban.wipeout = true;
    }
}

fn clear_burst_marks(ctx: &mut Context, chan_id: ChannelId) {
    let members = match ctx.store.channels.get(chan_id) {
        Some(c) => c.members.clone(),
        None => return,
    };
    for m in members {
        if let Some(mm) = ctx.store.members.get_mut(m) {
            mm.flags.burst_joined = false;
        }
    }
}

/// `+modes` parameter: adopt flags/key/limit. Key conflicts keep the
/// greater string so both sides converge without a third message.
fn apply_burst_modes(
    ctx: &mut Context,
    chan_id: ChannelId,
    letters: &str,
    msg: &ParsedLine<'_>,
    accepted: &mut Vec<String>,
) {
    // Arguments for this mode string: the following params that are
    // consumed positionally by k/l.
    let pos = msg
        .params
        .iter()
        .position(|p| std::ptr::eq(p.as_ptr(), letters.as_ptr()))
        .unwrap_or(0);
    let args: Vec<&str> = msg.params[pos + 1..]
        .iter()
        .take_while(|p| !p.starts_with('+') && !p.starts_with('%'))
        .copied()
        .collect();

    let (changes, _used) = tenth_proto::mode::parse_mode_string(letters, &args);
    let Some(chan) = ctx.store.channels.get_mut(chan_id) else {
        return;
    };

    accepted.push(letters.to_string());
    for change in changes {
        match change {
            tenth_proto::ModeChange::Flag(ModeSign::Plus, flag) => {
                chan.flags.insert(flag);
            }
            tenth_proto::ModeChange::Key(ModeSign::Plus, key) => {
                let adopt = match &chan.key {
                    Some(existing) => key > existing.as_str(),
                    None => true,
                };
                if adopt {
                    chan.key = Some(key.to_string());
                }
                accepted.push(key.to_string());
            }
            tenth_proto::ModeChange::Limit(ModeSign::Plus, Some(limit)) => {
                chan.limit = Some(limit);
                accepted.push(limit.to_string());
            }
            tenth_proto::ModeChange::AdminPass(ModeSign::Plus, pass) => {
                chan.apass = Some(pass.to_string());
                accepted.push(pass.to_string());
            }
            tenth_proto::ModeChange::UserPass(ModeSign::Plus, pass) => {
                chan.upass = Some(pass.to_string());
                accepted.push(pass.to_string());
            }
            _ => {} // burst modes are additive only
        }
    }
}

/// `%ban ban ...` parameter: union with overlap bookkeeping.
fn apply_burst_bans(
    ctx: &mut Context,
    chan_id: ChannelId,
    list: &str,
    now: i64,
    accepted: &mut Vec<String>,
) {
    let source_name = ctx.me_name();
    let Some(chan) = ctx.store.channels.get_mut(chan_id) else {
        return;
    };

    'next_ban: for raw in list.split(' ').filter(|b| !b.is_empty()) {
        let mask = tenth_proto::collapse(raw);

        for existing in chan.bans.iter_mut() {
            if tenth_proto::irc_eq(&existing.mask, &mask) {
                // Already here; it survives the wipe and is not
                // re-propagated.
                existing.wipeout = false;
                continue 'next_ban;
            }
            if !existing.wipeout && tenth_proto::mask_contains(&existing.mask, &mask) {
                continue 'next_ban;
            }
            if tenth_proto::mask_contains(&mask, &existing.mask) {
                existing.overlapped = true;
            }
        }

        let mut ban = crate::state::ChanBan::new(mask.clone(), source_name.clone(), now);
        ban.burst = true;
        chan.bans.push(ban);
        accepted.push(mask);
    }
}

/// Member-list parameter: `nn[:flags],nn,...`; a tag covers only the
/// member it is attached to.
fn apply_burst_members(
    ctx: &mut Context,
    conn: ConnId,
    chan_id: ChannelId,
    list: &str,
    set: bool,
    accepted: &mut Vec<(ClientId, MemberFlags)>,
) {
    for entry in list.split(',').filter(|e| !e.is_empty()) {
        let (field, tag) = match entry.split_once(':') {
            Some((f, t)) => (f, t),
            None => (entry, ""),
        };

        let mut flags = MemberFlags {
            deopped: true,
            burst_joined: true,
            ..Default::default()
        };
        // Status is honored only when the incoming side won or tied.
        if set {
            for c in tag.chars() {
                match c {
                    'o' => {
                        flags.chanop = true;
                        flags.deopped = false;
                    }
                    'v' => flags.voice = true,
                    _ => break,
                }
            }
        }

        let Some(client) = ctx.store.find_client_by_numnick(field) else {
            continue;
        };
        // Only accept members routed through the bursting link.
        if route::conn_for_client(ctx, client) != Some(conn) {
            continue;
        }
        if ctx.store.membership(client, chan_id).is_some() {
            continue;
        }

        ctx.store.join(client, chan_id, flags);
        accepted.push((client, flags));

        // Local members see the join.
        announce_burst_join(ctx, chan_id, client);
    }
}

fn announce_burst_join(ctx: &mut Context, chan_id: ChannelId, client: ClientId) {
    let (prefix, chan_name) = {
        let Some(c) = ctx.store.clients.get(client) else {
            return;
        };
        let Some(chan) = ctx.store.channels.get(chan_id) else {
            return;
        };
        (c.prefix(), chan.name.clone())
    };
    let line = MessageBuilder::to_clients(&prefix, "JOIN")
        .arg(&chan_name)
        .render();
    for member in route::local_members(ctx, chan_id, route::LocalFilter::default(), Some(client))
    {
        send::to_client(ctx, member, Priority::Normal, &line);
    }
}

/// Forward the accepted slice of the burst to every other server.
fn reemit_burst(
    ctx: &mut Context,
    from_conn: ConnId,
    source: ServerId,
    chan_id: ChannelId,
    modes: &[String],
    members: &[(ClientId, MemberFlags)],
    bans: &[String],
) {
    let Some(chan) = ctx.store.channels.get(chan_id) else {
        return;
    };
    let chan_name = chan.name.clone();
    let creation = chan.creation;
    let source_nn = ctx
        .store
        .servers
        .get(source)
        .map(|s| s.numeric.encode())
        .unwrap_or_default();

    let mut b = MessageBuilder::to_servers(&source_nn, "BURST")
        .arg(&chan_name)
        .ts(creation);
    for m in modes {
        b = b.arg(m);
    }

    let mut list = String::new();
    for (client, flags) in members {
        let Some(c) = ctx.store.clients.get(*client) else {
            continue;
        };
        if !list.is_empty() {
            list.push(',');
        }
        list.push_str(&c.numeric.encode());
        let tag = flags.burst_tag();
        if !tag.is_empty() {
            list.push(':');
            list.push_str(tag);
        }
    }
    if !list.is_empty() {
        b = b.arg(&list);
    }
    if !bans.is_empty() {
        b = b.trailing(format!("%{}", bans.join(" ")));
    }

    let line = b.render();
    for peer in route::server_conns(ctx, Some(from_conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
}

/// Post-pass over members and bans once the whole line is applied.
fn finish_burst_apply(
    ctx: &mut Context,
    chan_id: ChannelId,
    wipeout: bool,
    mbuf: &mut ModeBuf,
) {
    let member_ids = match ctx.store.channels.get(chan_id) {
        Some(c) => c.members.clone(),
        None => return,
    };

    for m in member_ids {
        let Some(mm) = ctx.store.members.get_mut(m) else {
            continue;
        };
        let client = mm.client;
        if mm.flags.burst_joined {
            // Newly arrived status is announced to our local members.
            if mm.flags.chanop {
                mbuf.member(ModeSign::Plus, client, MemberMode::Op);
            }
            if mm.flags.voice {
                mbuf.member(ModeSign::Plus, client, MemberMode::Voice);
            }
        } else if wipeout {
            // Losers of the TS comparison lose their status.
            if mm.flags.chanop {
                mm.flags.chanop = false;
                mm.flags.deopped = true;
                mbuf.member(ModeSign::Minus, client, MemberMode::Op);
            }
            if mm.flags.voice {
                mm.flags.voice = false;
                mbuf.member(ModeSign::Minus, client, MemberMode::Voice);
            }
        }
    }

    // Ban list: drop what was wiped or overlapped, announce the new.
    let Some(chan) = ctx.store.channels.get_mut(chan_id) else {
        return;
    };
    let mut removed: Vec<String> = Vec::new();
    chan.bans.retain(|ban| {
        if ban.wipeout || ban.overlapped {
            removed.push(ban.mask.clone());
            false
        } else {
            true
        }
    });
    let added: Vec<String> = chan
        .bans
        .iter_mut()
        .filter(|b| b.burst)
        .map(|b| {
            b.burst = false;
            b.mask.clone()
        })
        .collect();

    for mask in removed {
        mbuf.ban(ModeSign::Minus, mask);
    }
    for mask in added {
        mbuf.ban(ModeSign::Plus, mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_base64_round_trip() {
        for ip in ["127.0.0.1", "192.0.2.42", "2001:db8::1", "::1"] {
            let addr: IpAddr = ip.parse().unwrap();
            let encoded = ip_to_base64(addr);
            assert_eq!(base64_to_ip(&encoded), Some(addr), "ip {ip}");
        }
    }

    #[test]
    fn test_ip_base64_rejects_garbage() {
        assert_eq!(base64_to_ip("x"), None);
        assert_eq!(base64_to_ip("!!!!!!"), None);
    }
}
