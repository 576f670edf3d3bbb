//! The send layer: formatted message building and per-connection
//! outbound queues.
//!
//! Handlers render a line once per wire dialect (numnick form toward
//! peers, name form toward local users) and enqueue the same `Bytes`
//! for every recipient. Two priorities exist; the high band is for
//! PING, KILL, SQUIT and SETTIME, which must jump a congested queue.
//! A queue growing past its cap kills the connection.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::conn::ConnId;
use crate::engine::Context;
use crate::state::{ChannelId, ClientId, Store};
use crate::stats;

/// Queue band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

/// Returned when a push would exceed the queue cap.
#[derive(Debug)]
pub struct SendqExceeded {
    pub queued: usize,
}

struct QueueInner {
    high: VecDeque<Bytes>,
    normal: VecDeque<Bytes>,
    queued_bytes: usize,
    closed: bool,
}

/// The outbound byte queue shared between the engine (producer) and a
/// connection's writer task (consumer).
///
/// The cap is adjusted when the connection resolves to a class.
pub struct SendQueue {
    max_bytes: std::sync::atomic::AtomicUsize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SendQueue {
    pub fn new(max_bytes: usize) -> Arc<Self> {
        Arc::new(SendQueue {
            max_bytes: std::sync::atomic::AtomicUsize::new(max_bytes),
            inner: Mutex::new(QueueInner {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                queued_bytes: 0,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Adopt a class-defined cap.
    pub fn set_cap(&self, max_bytes: usize) {
        self.max_bytes
            .store(max_bytes, std::sync::atomic::Ordering::Relaxed);
    }

    /// Enqueue a rendered line. Fails when the cap would be exceeded;
    /// the caller kills the connection ("SendQ exceeded").
    pub fn push(&self, priority: Priority, line: Bytes) -> Result<(), SendqExceeded> {
        {
            let max = self.max_bytes.load(std::sync::atomic::Ordering::Relaxed);
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(()); // writer is gone; bytes go nowhere
            }
            if inner.queued_bytes + line.len() > max {
                return Err(SendqExceeded {
                    queued: inner.queued_bytes,
                });
            }
            inner.queued_bytes += line.len();
            match priority {
                Priority::High => inner.high.push_back(line),
                Priority::Normal => inner.normal.push_back(line),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue one line if any is ready (high band first).
    pub fn try_pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let line = inner.high.pop_front().or_else(|| inner.normal.pop_front());
        if let Some(ref l) = line {
            inner.queued_bytes -= l.len();
        }
        line
    }

    /// Next line to write; `None` once closed and drained. Writer side.
    pub async fn next(&self) -> Option<Bytes> {
        loop {
            if let Some(line) = self.try_pop() {
                return Some(line);
            }
            if self.inner.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop the queue; the writer drains what is left and exits.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().queued_bytes
    }
}

/// Which dialect a line is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireProto {
    /// Tokens and numnicks.
    Server,
    /// Full names.
    Client,
}

/// Typed line builder. One builder renders one dialect; the entity
/// argument methods pick numnick or name accordingly.
pub struct MessageBuilder {
    proto: WireProto,
    line: String,
    trailing: Option<String>,
}

impl MessageBuilder {
    /// A line in the peer dialect. The verb is given by name and
    /// rendered as its token.
    pub fn to_servers(prefix: &str, verb: &str) -> Self {
        let token = tenth_proto::token_for(verb).unwrap_or(verb);
        let mut line = String::with_capacity(64);
        line.push(':');
        line.push_str(prefix);
        line.push(' ');
        line.push_str(token);
        MessageBuilder {
            proto: WireProto::Server,
            line,
            trailing: None,
        }
    }

    /// A line in the local-user dialect.
    pub fn to_clients(prefix: &str, verb: &str) -> Self {
        let mut line = String::with_capacity(64);
        line.push(':');
        line.push_str(prefix);
        line.push(' ');
        line.push_str(verb);
        MessageBuilder {
            proto: WireProto::Client,
            line,
            trailing: None,
        }
    }

    /// A numeric reply from us to a target.
    pub fn numeric(server_name: &str, code: u16, target: &str) -> Self {
        let b = MessageBuilder {
            proto: WireProto::Client,
            line: format!(":{} {:03}", server_name, code),
            trailing: None,
        };
        b.arg(target)
    }

    /// Append a plain argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.line.push(' ');
        self.line.push_str(arg.as_ref());
        self
    }

    /// Append a timestamp argument.
    pub fn ts(self, ts: i64) -> Self {
        self.arg(ts.to_string())
    }

    /// Append a client: numnick toward peers, nick toward users.
    pub fn client(self, store: &Store, id: ClientId) -> Self {
        let text = match store.clients.get(id) {
            Some(c) => match self.proto {
                WireProto::Server => c.numeric.encode(),
                WireProto::Client => c.nick.clone(),
            },
            None => "*".to_string(),
        };
        self.arg(text)
    }

    /// Append a channel by name (both dialects).
    pub fn channel(self, store: &Store, id: ChannelId) -> Self {
        let text = store
            .channels
            .get(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "*".to_string());
        self.arg(text)
    }

    /// Set the trailing argument (always rendered with `:`).
    pub fn trailing(mut self, text: impl AsRef<str>) -> Self {
        self.trailing = Some(text.as_ref().to_string());
        self
    }

    /// Render with CR-LF, clamped to the 512-byte wire limit.
    pub fn render(self) -> Bytes {
        let mut line = self.line;
        if let Some(trailing) = self.trailing {
            line.push_str(" :");
            line.push_str(&trailing);
        }
        if line.len() > 510 {
            let mut cut = 510;
            while cut > 0 && !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
        line.push_str("\r\n");
        Bytes::from(line)
    }
}

// --- enqueue helpers over the engine context ---

/// Push a rendered line to one connection. SendQ overflow schedules
/// the connection for exit after the current handler finishes.
pub fn enqueue(ctx: &mut Context, conn: ConnId, priority: Priority, line: &Bytes) {
    let Some(connection) = ctx.conns.get(&conn) else {
        return;
    };
    stats::bump(&ctx.stats.lines_out);
    if connection.sendq.push(priority, line.clone()).is_err() {
        stats::bump(&ctx.stats.sendq_kills);
        ctx.schedule_exit(conn, "SendQ exceeded");
    }
}

/// Deliver to a client if it is local.
pub fn to_client(ctx: &mut Context, client: ClientId, priority: Priority, line: &Bytes) {
    let Some(conn) = ctx.store.clients.get(client).and_then(|c| c.conn) else {
        return;
    };
    enqueue(ctx, conn, priority, line);
}

/// Send a numeric reply to a connection; the target field is the
/// registered nick or `*` before registration.
pub fn numeric(ctx: &mut Context, conn: ConnId, code: u16, args: &[&str], trailing: &str) {
    let target = match ctx.conns.get(&conn).map(|c| c.state) {
        Some(crate::conn::ConnState::User(id)) => ctx
            .store
            .clients
            .get(id)
            .map(|c| c.nick.clone())
            .unwrap_or_else(|| "*".to_string()),
        _ => "*".to_string(),
    };
    let mut b = MessageBuilder::numeric(&ctx.me_name(), code, &target);
    for a in args {
        b = b.arg(a);
    }
    let line = b.trailing(trailing).render();
    enqueue(ctx, conn, Priority::Normal, &line);
}

/// Server-notice broadcast to local operators.
pub fn to_local_opers(ctx: &mut Context, text: &str) {
    let me_name = ctx.me_name();
    let line = MessageBuilder::to_clients(&me_name, "NOTICE")
        .arg("*")
        .trailing(format!("*** Notice -- {}", text))
        .render();
    let opers: Vec<ClientId> = ctx
        .store
        .clients_snapshot()
        .into_iter()
        .filter(|id| {
            ctx.store
                .clients
                .get(*id)
                .is_some_and(|c| c.is_local() && c.modes.oper)
        })
        .collect();
    for oper in opers {
        to_client(ctx, oper, Priority::Normal, &line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendq_priority_order() {
        let q = SendQueue::new(1024);
        q.push(Priority::Normal, Bytes::from_static(b"first\r\n"))
            .unwrap();
        q.push(Priority::Normal, Bytes::from_static(b"second\r\n"))
            .unwrap();
        q.push(Priority::High, Bytes::from_static(b"urgent\r\n"))
            .unwrap();

        assert_eq!(q.try_pop().unwrap(), Bytes::from_static(b"urgent\r\n"));
        assert_eq!(q.try_pop().unwrap(), Bytes::from_static(b"first\r\n"));
        assert_eq!(q.try_pop().unwrap(), Bytes::from_static(b"second\r\n"));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_sendq_cap() {
        let q = SendQueue::new(10);
        q.push(Priority::Normal, Bytes::from_static(b"12345")).unwrap();
        let err = q
            .push(Priority::Normal, Bytes::from_static(b"123456"))
            .unwrap_err();
        assert_eq!(err.queued, 5);
        // freeing space lets traffic flow again
        q.try_pop().unwrap();
        q.push(Priority::Normal, Bytes::from_static(b"123456")).unwrap();
    }

    #[test]
    fn test_closed_queue_swallows() {
        let q = SendQueue::new(10);
        q.close();
        q.push(Priority::Normal, Bytes::from_static(b"data")).unwrap();
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn test_builder_server_dialect_uses_tokens() {
        let line = MessageBuilder::to_servers("AB", "PRIVMSG")
            .arg("#chan")
            .trailing("hello world")
            .render();
        assert_eq!(&line[..], &b":AB P #chan :hello world\r\n"[..]);
    }

    #[test]
    fn test_builder_numeric() {
        let line = MessageBuilder::numeric("me.example.net", 461, "nick")
            .arg("JOIN")
            .trailing("Not enough parameters")
            .render();
        assert_eq!(
            &line[..],
            &b":me.example.net 461 nick JOIN :Not enough parameters\r\n"[..]
        );
    }

    #[test]
    fn test_builder_clamps_to_wire_limit() {
        let long = "x".repeat(600);
        let line = MessageBuilder::to_clients("server", "NOTICE")
            .arg("target")
            .trailing(long)
            .render();
        assert!(line.len() <= 512);
        assert!(line.ends_with(b"\r\n"));
    }

    #[tokio::test]
    async fn test_next_returns_none_after_close_and_drain() {
        let q = SendQueue::new(64);
        q.push(Priority::Normal, Bytes::from_static(b"line\r\n")).unwrap();
        q.close();
        assert_eq!(q.next().await.unwrap(), Bytes::from_static(b"line\r\n"));
        assert!(q.next().await.is_none());
    }
}
