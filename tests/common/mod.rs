//! Shared scaffolding: an engine context with fake connections whose
//! outbound queues can be inspected.

use std::sync::Arc;

use tenthd::config::{Config, PortKind};
use tenthd::conn::{ConnId, ConnState, Connection};
use tenthd::engine::{self, Context};
use tenthd::send::SendQueue;
use tenthd::state::{ServerEnt, ServerId};
use tenthd::stats::ServerStats;

pub const CONFIG: &str = r#"
    [server]
    name = "hub.test.example"
    numeric = 1
    description = "test hub"
    hub = true

    [[listen]]
    addr = "127.0.0.1:0"

    [[class]]
    name = "links"
    max_sendq = 9000000

    [[link]]
    name = "peer.test.example"
    password = "linkpw"
    host = "127.0.0.1"
    port = 4400
    class = "links"
"#;

pub fn test_context() -> Context {
    let config: Config = toml::from_str(CONFIG).unwrap();
    Context::new(config, Arc::new(ServerStats::new()))
}

/// Attach a fake socket in the given state; returns its id.
pub fn fake_conn(ctx: &mut Context, id: u64, kind: PortKind) -> ConnId {
    let conn_id = ConnId(id);
    let now = ctx.now();
    let conn = Connection::new(
        conn_id,
        format!("127.0.0.{}:50000", id).parse().unwrap(),
        kind,
        SendQueue::new(1 << 20),
        now,
    );
    ctx.conns.insert(conn_id, conn);
    conn_id
}

/// Link a registered peer server on a fake connection, mid-burst.
pub fn fake_peer(ctx: &mut Context, id: u64, name: &str, numeric: u16) -> (ConnId, ServerId) {
    let conn_id = fake_conn(ctx, id, PortKind::Server);

    let me = ctx.store.me;
    let mut ent = ServerEnt::new(
        name.to_string(),
        tenth_proto::ServerNumeric(numeric),
        "test peer".to_string(),
        262_143,
        Some(me),
    );
    ent.start_ts = 1_000_000_000;
    ent.link_ts = 1_000_000_100;
    ent.conn = Some(conn_id);
    ent.flags.burst = true;
    let server = ctx.store.insert_server(ent).unwrap();

    if let Some(c) = ctx.conns.get_mut(&conn_id) {
        c.state = ConnState::Server(server);
    }
    (conn_id, server)
}

/// Feed one line through the engine as if it arrived on the socket.
pub fn line(ctx: &mut Context, conn: ConnId, text: &str) {
    engine::process_line(ctx, conn, text);
    engine::drain_pending_exits(ctx);
}

/// Everything queued toward a connection, decoded.
pub fn drain(ctx: &Context, conn: ConnId) -> Vec<String> {
    let Some(c) = ctx.conns.get(&conn) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    while let Some(bytes) = c.sendq.try_pop() {
        out.push(String::from_utf8_lossy(&bytes).trim_end().to_string());
    }
    out
}

/// Register a local user the long way, through NICK/USER.
pub fn register_user(ctx: &mut Context, id: u64, nick: &str) -> ConnId {
    let conn = fake_conn(ctx, id, PortKind::Client);
    line(ctx, conn, &format!("NICK {}", nick));
    line(ctx, conn, &format!("USER {} 0 * :Test User", nick));
    assert!(
        ctx.store.find_client_by_name(nick).is_some(),
        "registration failed for {}",
        nick
    );
    drain(ctx, conn); // discard the welcome burst
    conn
}
