//! The network layer: listeners, dials, and per-connection byte
//! pumps. Nothing here understands the protocol beyond line framing;
//! every parsed decision belongs to the engine.

pub mod listener;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::conn::ConnId;
use crate::engine::Event;

pub use listener::{spawn_outgoing, start_listeners};

/// Shared handle into the network layer. Cloned into the engine so it
/// can dial links; cloned into accept loops so they can mint ids.
#[derive(Clone)]
pub struct NetHandle {
    pub event_tx: mpsc::Sender<Event>,
    next_conn_id: Arc<AtomicU64>,
    pub tls: Option<TlsAcceptor>,
}

impl NetHandle {
    pub fn new(event_tx: mpsc::Sender<Event>, tls: Option<TlsAcceptor>) -> Self {
        NetHandle {
            event_tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            tls,
        }
    }

    pub fn next_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }
}
