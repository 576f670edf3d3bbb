//! The event loop.
//!
//! One task owns the [`Context`] and drains a single event queue fed
//! by the connection reader tasks and the listeners. A handler runs to
//! completion before the next event is read; the only suspension
//! points are the queue itself and the timer sleep. This is the whole
//! concurrency story: no locks around protocol state, ever.

pub mod context;
pub mod exit;

pub use context::Context;
pub use exit::{close_conn, destroy_channel_if_empty, exit_client, exit_connection, squit_server};

use std::net::SocketAddr;
use std::sync::Arc;

use tenth_proto::message::ParsedLine;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PortKind;
use crate::conn::{ConnId, ConnState, Connection};
use crate::handlers::{self, HandlerOutcome};
use crate::send::{MessageBuilder, Priority, SendQueue};
use crate::stats;
use crate::timer::TimerKind;

/// Everything the engine reacts to.
pub enum Event {
    /// A socket was accepted (or an outgoing dial completed).
    Accepted {
        id: ConnId,
        addr: SocketAddr,
        kind: PortKind,
        sendq: Arc<SendQueue>,
        /// Set when we dialed: the link block name.
        outgoing_link: Option<String>,
    },
    /// One framed line.
    Line { id: ConnId, line: String },
    /// The framer discarded an over-long line.
    OverlongLine { id: ConnId },
    /// The socket died.
    Closed { id: ConnId, reason: String },
}

/// Run the engine until the event queue closes.
pub async fn run(mut ctx: Context, mut events: mpsc::Receiver<Event>) {
    let now = ctx.now();
    ctx.timers.periodic(now, 5, TimerKind::PingSweep);
    ctx.timers.periodic(now, 60, TimerKind::ExpireSweep);
    ctx.timers.periodic(now, 30, TimerKind::ConnectSweep);
    // First dial round happens right away.
    connect_sweep(&mut ctx);

    loop {
        let deadline = ctx.timers.next_deadline();
        let sleep_for = deadline
            .map(|d| Duration::from_secs((d - ctx.now()).max(0) as u64))
            .unwrap_or(Duration::from_secs(3600));

        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => handle_event(&mut ctx, event),
                    None => {
                        info!("event queue closed, engine stopping");
                        break;
                    }
                }
            }
            _ = sleep_until(Instant::now() + sleep_for) => {
                fire_timers(&mut ctx);
            }
        }

        drain_pending_exits(&mut ctx);
    }
}

/// Process one event.
pub fn handle_event(ctx: &mut Context, event: Event) {
    match event {
        Event::Accepted {
            id,
            addr,
            kind,
            sendq,
            outgoing_link,
        } => on_accepted(ctx, id, addr, kind, sendq, outgoing_link),
        Event::Line { id, line } => process_line(ctx, id, &line),
        Event::OverlongLine { id } => on_overlong(ctx, id),
        Event::Closed { id, reason } => exit_connection(ctx, id, &reason),
    }
}

/// Exits scheduled mid-handler (SendQ overflow) happen between events.
pub fn drain_pending_exits(ctx: &mut Context) {
    // Exiting one connection can condemn another (fan-out into a full
    // queue); bound the cascade to the connection population.
    let mut rounds = ctx.conns.len() + 1;
    loop {
        let pending = ctx.take_pending_exits();
        if pending.is_empty() || rounds == 0 {
            break;
        }
        rounds -= 1;
        for (conn, reason) in pending {
            exit_connection(ctx, conn, &reason);
        }
    }
}

fn on_accepted(
    ctx: &mut Context,
    id: ConnId,
    addr: SocketAddr,
    kind: PortKind,
    sendq: Arc<SendQueue>,
    outgoing_link: Option<String>,
) {
    if ctx.conns.len() >= ctx.features.maxconnections {
        stats::bump(&ctx.stats.refused);
        let line = MessageBuilder::to_clients(&ctx.me_name(), "ERROR")
            .trailing("Closing Link: Connection limit reached")
            .render();
        let _ = sendq.push(Priority::High, line);
        sendq.close();
        return;
    }

    let now = ctx.now();
    let mut conn = Connection::new(id, addr, kind, sendq, now);

    match kind {
        PortKind::Client | PortKind::Webirc => {
            let class = ctx
                .config
                .class_for_client(&conn.host, &conn.ip.to_string());
            conn.ping_freq = class.ping_freq;
            conn.sendq.set_cap(class.max_sendq);
            conn.class = class.name;
        }
        PortKind::Server => {
            // Class resolves at SERVER time; give links room meanwhile.
            conn.sendq.set_cap(1 << 20);
        }
    }

    if let Some(link_name) = outgoing_link {
        conn.outgoing = true;
        conn.state = ConnState::Handshake;
        conn.pending.link_name = Some(link_name.clone());
        debug!(conn = %id, link = %link_name, "outgoing link dialed");
    } else {
        debug!(conn = %id, %addr, ?kind, "connection accepted");
    }

    let send_hello = conn.outgoing;
    ctx.conns.insert(id, conn);

    if send_hello {
        handlers::server::send_pass_server(ctx, id);
    }
}

fn on_overlong(ctx: &mut Context, id: ConnId) {
    stats::bump(&ctx.stats.parse_errors);
    let Some(conn) = ctx.conns.get_mut(&id) else {
        return;
    };
    if conn.state.is_server_link() {
        conn.violations += 1;
        let over = conn.violations > ctx.features.max_violations;
        if over {
            exit_connection(ctx, id, "Too many protocol violations");
        }
    } else {
        crate::send::numeric(
            ctx,
            id,
            handlers::ERR_INPUTTOOLONG,
            &[],
            "Input line was too long",
        );
    }
}

/// Parse, resolve origin, dispatch.
pub fn process_line(ctx: &mut Context, id: ConnId, line: &str) {
    let now = ctx.now();
    let (is_user, flooded) = match ctx.conns.get_mut(&id) {
        Some(conn) => {
            conn.last_data = now;
            conn.ping_sent = false;
            let count = conn.account_line(now);
            (
                matches!(conn.state, ConnState::User(_)),
                count > ctx.features.client_flood,
            )
        }
        None => return, // stale event for a dead connection
    };
    if is_user && flooded {
        exit_connection(ctx, id, "Excess Flood");
        return;
    }

    stats::bump(&ctx.stats.lines_in);

    match ParsedLine::parse(line) {
        Ok(None) => {}
        Ok(Some(msg)) => {
            let _ = handlers::dispatch(ctx, id, &msg);
        }
        Err(err) => on_parse_error(ctx, id, line, err),
    }
}

fn on_parse_error(ctx: &mut Context, id: ConnId, line: &str, err: tenth_proto::ParseError) {
    stats::bump(&ctx.stats.parse_errors);
    let Some(conn) = ctx.conns.get_mut(&id) else {
        return;
    };
    if conn.state.is_server_link() {
        conn.violations += 1;
        let over = conn.violations > ctx.features.max_violations;
        warn!(conn = %id, %err, line, "peer sent malformed protocol");
        if over {
            exit_connection(ctx, id, "Too many protocol violations");
        }
    } else {
        crate::send::numeric(
            ctx,
            id,
            handlers::ERR_UNKNOWNCOMMAND,
            &["*"],
            "Unparseable command",
        );
    }
}

/// A peer did something structurally wrong; count it and escalate to
/// SQUIT when the line is crossed. Returns the handler outcome.
pub fn protocol_violation(ctx: &mut Context, id: ConnId, what: &str) -> HandlerOutcome {
    stats::bump(&ctx.stats.parse_errors);
    let Some(conn) = ctx.conns.get_mut(&id) else {
        return HandlerOutcome::SourceExited;
    };
    conn.violations += 1;
    let over = conn.violations > ctx.features.max_violations;
    warn!(conn = %id, what, "protocol violation");
    if over {
        exit_connection(ctx, id, "Protocol violation");
        return HandlerOutcome::SourceExited;
    }
    HandlerOutcome::Continue
}

fn fire_timers(ctx: &mut Context) {
    let now = ctx.now();
    for (_, kind) in ctx.timers.pop_due(now) {
        match kind {
            TimerKind::PingSweep => ping_sweep(ctx),
            TimerKind::ExpireSweep => expire_sweep(ctx),
            TimerKind::ConnectSweep => connect_sweep(ctx),
        }
    }
    drain_pending_exits(ctx);
}

/// Probe quiet registered connections; reap the unresponsive and the
/// never-registered.
fn ping_sweep(ctx: &mut Context) {
    let now = ctx.now();
    let ids: Vec<ConnId> = ctx.conns.keys().copied().collect();
    for id in ids {
        let Some(conn) = ctx.conns.get(&id) else {
            continue;
        };
        if conn.state.is_registered() {
            let quiet_for = now - conn.last_data;
            if conn.ping_sent && quiet_for >= 2 * conn.ping_freq {
                stats::bump(&ctx.stats.ping_timeouts);
                exit_connection(ctx, id, "Ping timeout");
            } else if !conn.ping_sent && quiet_for >= conn.ping_freq {
                let me_name = ctx.me_name();
                let line = if conn.state.is_server_link() {
                    MessageBuilder::to_servers(&ctx.me_numnick(), "PING")
                        .trailing(&me_name)
                        .render()
                } else {
                    MessageBuilder::to_clients(&me_name, "PING")
                        .trailing(&me_name)
                        .render()
                };
                crate::send::enqueue(ctx, id, Priority::High, &line);
                if let Some(conn) = ctx.conns.get_mut(&id) {
                    conn.ping_sent = true;
                }
            }
        } else if now - conn.first_seen >= ctx.features.connect_timeout {
            stats::bump(&ctx.stats.refused);
            exit_connection(ctx, id, "Connection timed out");
        }
    }
}

fn expire_sweep(ctx: &mut Context) {
    let now = ctx.now();
    ctx.glines.expire_sweep(now);
    ctx.jupes.expire_sweep(now);
}

/// Dial autoconnect links that are absent from the network.
fn connect_sweep(ctx: &mut Context) {
    let Some(net) = ctx.net.clone() else {
        return;
    };
    let now = ctx.now();
    let links: Vec<crate::config::LinkBlock> = ctx
        .config
        .link
        .iter()
        .filter(|l| l.autoconnect)
        .cloned()
        .collect();

    for link in links {
        if ctx.store.find_server_by_name(&link.name).is_some() {
            continue;
        }
        let dialing = ctx.conns.values().any(|c| {
            c.pending.link_name.as_deref() == Some(link.name.as_str())
                && !c.state.is_registered()
        });
        if dialing {
            continue;
        }
        let connect_freq = ctx
            .config
            .find_class(&link.class)
            .map(|c| c.connect_freq)
            .unwrap_or(600);
        let last = ctx.connect_attempts.get(&link.name).copied().unwrap_or(0);
        if now - last < connect_freq {
            continue;
        }
        ctx.connect_attempts.insert(link.name.clone(), now);
        info!(link = %link.name, host = %link.host, port = link.port, "dialing link");
        crate::net::spawn_outgoing(&net, &link);
    }
}
