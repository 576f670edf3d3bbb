//! Exit paths: the only ways entities and connections die.
//!
//! Clients are destroyed through `exit_client` (QUIT, KILL, G-line,
//! SendQ, ping timeout); servers through `squit_server`, which
//! cascades over every descendant and its users. Connections close as
//! a side effect, never the other way around.

use crate::conn::{ConnId, ConnState};
use crate::engine::Context;
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{ChannelId, ClientId, ServerId};

/// Exit whatever lives on a connection.
pub fn exit_connection(ctx: &mut Context, id: ConnId, reason: &str) {
    let Some(conn) = ctx.conns.get(&id) else {
        return;
    };
    match conn.state {
        ConnState::User(client) => {
            exit_client(ctx, client, None, reason, true);
        }
        ConnState::Server(server) => {
            squit_server(ctx, server, Some(id), reason, true);
        }
        _ => {
            close_conn(ctx, id, reason);
        }
    }
}

/// Tear down the socket side of a connection.
pub fn close_conn(ctx: &mut Context, id: ConnId, reason: &str) {
    if let Some(conn) = ctx.conns.remove(&id) {
        let line = MessageBuilder::to_clients(&ctx.me_name(), "ERROR")
            .trailing(format!("Closing Link: {}", reason))
            .render();
        let _ = conn.sendq.push(Priority::High, line);
        conn.sendq.close();
    }
}

/// Remove a client everywhere.
///
/// `from_conn` is the link the removal arrived on (not told again);
/// `announce` is false during a netsplit, where peers infer the quits
/// from the SQUIT itself.
pub fn exit_client(
    ctx: &mut Context,
    client: ClientId,
    from_conn: Option<ConnId>,
    reason: &str,
    announce: bool,
) {
    let Some(c) = ctx.store.clients.get(client) else {
        return;
    };
    let prefix = c.prefix();
    let numnick = c.numeric.encode();
    let conn = c.conn;
    let member_ids: Vec<_> = c.members.clone();

    // Local watchers on shared channels hear the quit before the
    // memberships disappear.
    let watchers = route::common_channel_locals(ctx, client);
    let quit_line = MessageBuilder::to_clients(&prefix, "QUIT")
        .trailing(reason)
        .render();
    for w in watchers {
        send::to_client(ctx, w, Priority::Normal, &quit_line);
    }

    if announce {
        let line = MessageBuilder::to_servers(&numnick, "QUIT")
            .trailing(reason)
            .render();
        for peer in route::server_conns(ctx, from_conn) {
            send::enqueue(ctx, peer, Priority::Normal, &line);
        }
    }

    let mut touched: Vec<ChannelId> = Vec::new();
    for m in member_ids {
        if let Some(membership) = ctx.store.part(m) {
            touched.push(membership.channel);
        }
    }
    for chan in touched {
        destroy_channel_if_empty(ctx, chan);
    }

    ctx.store.remove_client(client);

    if let Some(conn_id) = conn {
        close_conn(ctx, conn_id, reason);
    }
}

/// A channel with zero members is destroyed.
pub fn destroy_channel_if_empty(ctx: &mut Context, channel: ChannelId) {
    let empty = ctx
        .store
        .channels
        .get(channel)
        .is_some_and(|c| c.members.is_empty());
    if empty {
        ctx.store.remove_channel(channel);
    }
}

/// Delink a server: every descendant and every client beneath the cut
/// goes away, peers on the other side are told once via SQUIT.
pub fn squit_server(
    ctx: &mut Context,
    server: ServerId,
    from_conn: Option<ConnId>,
    reason: &str,
    announce: bool,
) {
    let Some(top) = ctx.store.servers.get(server) else {
        return;
    };
    let top_name = top.name.clone();
    let top_link_ts = top.link_ts;
    let direct_conn = top.conn;
    let uplink_name = top
        .uplink
        .and_then(|u| ctx.store.servers.get(u))
        .map(|u| u.name.clone())
        .unwrap_or_else(|| ctx.me_name());

    send::to_local_opers(
        ctx,
        &format!("Net break: {} {} ({})", uplink_name, top_name, reason),
    );

    // Depth-first, children before parents.
    let mut order: Vec<ServerId> = Vec::new();
    let mut stack = vec![server];
    while let Some(s) = stack.pop() {
        order.push(s);
        if let Some(ent) = ctx.store.servers.get(s) {
            stack.extend(ent.downlinks.iter().copied());
        }
    }
    order.reverse();

    // The netsplit quit reason both sides display.
    let split_reason = format!("{} {}", uplink_name, top_name);
    for s in &order {
        let clients: Vec<ClientId> = ctx
            .store
            .clients_snapshot()
            .into_iter()
            .filter(|id| ctx.store.clients.get(*id).map(|c| c.server) == Some(*s))
            .collect();
        for client in clients {
            exit_client(ctx, client, from_conn, &split_reason, false);
        }
    }

    if announce {
        let line = MessageBuilder::to_servers(&ctx.me_numnick(), "SQUIT")
            .arg(&top_name)
            .ts(top_link_ts)
            .trailing(reason)
            .render();
        for peer in route::server_conns(ctx, from_conn.or(direct_conn)) {
            send::enqueue(ctx, peer, Priority::High, &line);
        }
    }

    for s in order {
        ctx.store.remove_server(s);
    }

    if let Some(conn_id) = direct_conn {
        close_conn(ctx, conn_id, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil;

    fn context() -> Context {
        let config: crate::config::Config = toml::from_str(
            r#"
            [server]
            name = "me.example.net"
            numeric = 1
            description = "self"

            [[listen]]
            addr = "127.0.0.1:6667"
            "#,
        )
        .unwrap();
        Context::new(config, std::sync::Arc::new(crate::stats::ServerStats::new()))
    }

    #[test]
    fn test_exit_client_destroys_empty_channel() {
        let mut ctx = context();
        let c = testutil::add_client(&mut ctx.store, "foo", 0);
        let (chan, _) = ctx.store.get_or_create_channel("#x", 1000);
        ctx.store.join(c, chan, Default::default());

        exit_client(&mut ctx, c, None, "bye", true);
        assert!(ctx.store.find_channel("#x").is_none());
        assert!(ctx.store.find_client_by_name("foo").is_none());
    }

    #[test]
    fn test_squit_cascades_to_descendants() {
        let mut ctx = context();
        let peer = testutil::add_peer_server(&mut ctx.store, "peer.example.net", 2);
        let leaf = {
            let mut ent = crate::state::ServerEnt::new(
                "leaf.example.net".into(),
                tenth_proto::ServerNumeric(3),
                "leaf".into(),
                63,
                Some(peer),
            );
            ent.link_ts = 6000;
            ctx.store.insert_server(ent).unwrap()
        };
        let remote = testutil::add_remote_client(&mut ctx.store, leaf, "ghost", 0);
        let (chan, _) = ctx.store.get_or_create_channel("#x", 1000);
        ctx.store.join(remote, chan, Default::default());

        squit_server(&mut ctx, peer, None, "link broken", true);

        assert!(ctx.store.find_server_by_name("peer.example.net").is_none());
        assert!(ctx.store.find_server_by_name("leaf.example.net").is_none());
        assert!(ctx.store.find_client_by_name("ghost").is_none());
        assert!(ctx.store.find_channel("#x").is_none());
    }
}
