//! The router: who gets a message.
//!
//! Given a source and a target kind, these functions enumerate the
//! peer connections that must carry a line onward and the local
//! clients interested in it. Everything here is read-only over the
//! store; the send layer does the queueing.

use tenth_proto::match_mask;

use crate::conn::ConnId;
use crate::engine::Context;
use crate::state::{ChannelId, ClientId, ServerId};

/// Filters applied when enumerating a channel's local members.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilter {
    /// Skip users with the deaf mode (channel traffic).
    pub skip_deaf: bool,
    /// Only channel operators (WALLCHOPS).
    pub ops_only: bool,
    /// Only ops and voiced members (moderated notices).
    pub voiced_only: bool,
}

/// Every directly linked, registered server connection except `skip`.
pub fn server_conns(ctx: &Context, skip: Option<ConnId>) -> Vec<ConnId> {
    ctx.conns
        .values()
        .filter(|c| c.state.is_server_link() && Some(c.id) != skip)
        .map(|c| c.id)
        .collect()
}

/// The next hop toward a server: its own link if direct, otherwise the
/// link of the first ancestor that has one.
pub fn conn_toward(ctx: &Context, mut server: ServerId) -> Option<ConnId> {
    loop {
        if server == ctx.store.me {
            return None;
        }
        let ent = ctx.store.servers.get(server)?;
        if let Some(conn) = ent.conn {
            return Some(conn);
        }
        server = ent.uplink?;
    }
}

/// The connection a message to this client must leave on: the client's
/// own socket when local, else the next hop toward its server.
pub fn conn_for_client(ctx: &Context, client: ClientId) -> Option<ConnId> {
    let c = ctx.store.clients.get(client)?;
    if let Some(conn) = c.conn {
        return Some(conn);
    }
    conn_toward(ctx, c.server)
}

/// Local members of a channel, after filters. Zombies never receive.
pub fn local_members(
    ctx: &Context,
    channel: ChannelId,
    filter: LocalFilter,
    skip: Option<ClientId>,
) -> Vec<ClientId> {
    let Some(chan) = ctx.store.channels.get(channel) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for member_id in &chan.members {
        let Some(member) = ctx.store.members.get(*member_id) else {
            continue;
        };
        if member.flags.zombie {
            continue;
        }
        if filter.ops_only && !member.flags.chanop {
            continue;
        }
        if filter.voiced_only && !(member.flags.chanop || member.flags.voice) {
            continue;
        }
        let Some(client) = ctx.store.clients.get(member.client) else {
            continue;
        };
        if !client.is_local() {
            continue;
        }
        if Some(member.client) == skip {
            continue;
        }
        if filter.skip_deaf && client.modes.deaf {
            continue;
        }
        out.push(member.client);
    }
    out
}

/// Peer links that must carry a channel message: every link with at
/// least one member on the far side, minus the origin, minus links
/// still bursting (they are still defining this channel and must not
/// see echoes). Local (`&`) channels have no peers by definition.
pub fn channel_peer_conns(
    ctx: &Context,
    channel: ChannelId,
    except: Option<ConnId>,
) -> Vec<ConnId> {
    let Some(chan) = ctx.store.channels.get(channel) else {
        return Vec::new();
    };
    if chan.is_local() {
        return Vec::new();
    }

    let mut out: Vec<ConnId> = Vec::new();
    for member_id in &chan.members {
        let Some(member) = ctx.store.members.get(*member_id) else {
            continue;
        };
        if member.flags.zombie {
            continue;
        }
        let Some(client) = ctx.store.clients.get(member.client) else {
            continue;
        };
        if client.is_local() {
            continue;
        }
        let Some(conn) = conn_toward(ctx, client.server) else {
            continue;
        };
        if Some(conn) == except || out.contains(&conn) {
            continue;
        }
        // Do not echo channel traffic toward a link mid-burst.
        if let Some(crate::conn::ConnState::Server(peer)) =
            ctx.conns.get(&conn).map(|c| c.state)
        {
            if ctx
                .store
                .servers
                .get(peer)
                .is_some_and(|s| s.flags.is_bursting())
            {
                continue;
            }
        }
        out.push(conn);
    }
    out
}

/// Union of local members across every channel the source is on,
/// deduplicated, source excluded. Used for QUIT and NICK fan-out.
pub fn common_channel_locals(ctx: &Context, source: ClientId) -> Vec<ClientId> {
    let Some(client) = ctx.store.clients.get(source) else {
        return Vec::new();
    };
    let mut out: Vec<ClientId> = Vec::new();
    for member_id in &client.members {
        let Some(member) = ctx.store.members.get(*member_id) else {
            continue;
        };
        for peer in local_members(ctx, member.channel, LocalFilter::default(), Some(source)) {
            if !out.contains(&peer) {
                out.push(peer);
            }
        }
    }
    out
}

/// Local clients whose visible host or server name matches a mask.
pub fn local_clients_matching(ctx: &Context, mask: &str, by_server: bool) -> Vec<ClientId> {
    let mut out = Vec::new();
    for id in ctx.store.clients_snapshot() {
        let Some(client) = ctx.store.clients.get(id) else {
            continue;
        };
        if !client.is_local() {
            continue;
        }
        let matched = if by_server {
            ctx.store
                .servers
                .get(client.server)
                .is_some_and(|s| match_mask(mask, &s.name))
        } else {
            match_mask(mask, client.visible_host())
        };
        if matched {
            out.push(id);
        }
    }
    out
}

/// Peer links toward every server whose name matches a mask, except
/// the origin. Used for server-mask targets and broadcast commands.
pub fn server_conns_matching(ctx: &Context, mask: &str, except: Option<ConnId>) -> Vec<ConnId> {
    let mut out: Vec<ConnId> = Vec::new();
    for (id, server) in ctx.store.servers.iter() {
        if id == ctx.store.me || !match_mask(mask, &server.name) {
            continue;
        }
        if let Some(conn) = conn_toward(ctx, id) {
            if Some(conn) != except && !out.contains(&conn) {
                out.push(conn);
            }
        }
    }
    out
}
