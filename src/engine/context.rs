//! The engine context: every piece of process-wide mutable state,
//! owned by the event loop and passed to handlers by mutable
//! reference. No globals, no locks.

use std::collections::HashMap;
use std::sync::Arc;

use tenth_proto::ServerNumeric;

use crate::bans::{ControlFlags, GlineList, GlineMask, JupeList};
use crate::config::{Config, Features};
use crate::conn::{ConnId, Connection};
use crate::net::NetHandle;
use crate::state::{ServerEnt, Store};
use crate::stats::ServerStats;
use crate::timer::TimerHeap;

/// Seed entries from the config live until shutdown.
const SEED_EXPIRE: i64 = i64::MAX / 2;

/// The shared state of one daemon instance.
pub struct Context {
    pub config: Config,
    pub features: Features,
    pub store: Store,
    pub conns: HashMap<ConnId, Connection>,
    pub glines: GlineList,
    pub jupes: JupeList,
    pub timers: TimerHeap,
    pub stats: Arc<ServerStats>,
    /// Network clock adjustment applied by SETTIME.
    pub ts_offset: i64,
    pub start_time: i64,
    /// Last outgoing dial per link name (engine clock).
    pub connect_attempts: HashMap<String, i64>,
    /// Connections condemned mid-handler (SendQ overflow); the loop
    /// exits them once the handler returns.
    pending_exits: Vec<(ConnId, String)>,
    /// Handle into the network layer; absent in unit tests.
    pub net: Option<NetHandle>,
}

impl Context {
    /// Build the context around our own server entity and seed the
    /// control planes from the config.
    pub fn new(config: Config, stats: Arc<ServerStats>) -> Self {
        let now = chrono::Utc::now().timestamp();

        let mut me = ServerEnt::new(
            config.server.name.clone(),
            ServerNumeric(config.server.numeric),
            config.server.description.clone(),
            tenth_proto::numnick::MAX_CLIENT,
            None,
        );
        me.start_ts = now;
        me.link_ts = now;
        me.flags.hub = config.server.hub;

        let features = Features::from_table(&config.features);
        let store = Store::new(me);

        let mut glines = GlineList::new();
        for q in &config.quarantine {
            glines.add(
                GlineMask::BadChan(q.channel.clone()),
                q.reason.clone(),
                SEED_EXPIRE,
                0,
                ControlFlags {
                    active: true,
                    local: true,
                    ldeact: false,
                },
                now,
            );
        }

        let mut jupes = JupeList::new();
        for j in &config.jupe {
            jupes.add(
                j.mask.clone(),
                j.reason.clone(),
                SEED_EXPIRE,
                0,
                ControlFlags {
                    active: true,
                    local: true,
                    ldeact: false,
                },
                now,
            );
        }

        Context {
            config,
            features,
            store,
            conns: HashMap::new(),
            glines,
            jupes,
            timers: TimerHeap::new(),
            stats,
            ts_offset: 0,
            start_time: now,
            connect_attempts: HashMap::new(),
            pending_exits: Vec::new(),
            net: None,
        }
    }

    /// The engine clock: wall time plus the SETTIME offset.
    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.ts_offset
    }

    pub fn me_name(&self) -> String {
        self.store
            .servers
            .get(self.store.me)
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    /// Our 2-character numnick prefix.
    pub fn me_numnick(&self) -> String {
        self.store
            .servers
            .get(self.store.me)
            .map(|s| s.numeric.encode())
            .unwrap_or_default()
    }

    /// Condemn a connection; processed after the current handler.
    pub fn schedule_exit(&mut self, conn: ConnId, reason: &str) {
        if !self.pending_exits.iter().any(|(c, _)| *c == conn) {
            self.pending_exits.push((conn, reason.to_string()));
        }
    }

    pub fn take_pending_exits(&mut self) -> Vec<(ConnId, String)> {
        std::mem::take(&mut self.pending_exits)
    }
}
