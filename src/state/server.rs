//! Server entities and the per-server client table.

use tenth_proto::numnick;
use tenth_proto::ServerNumeric;

use crate::conn::ConnId;
use crate::state::{ClientId, ServerId};

/// Server status flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerFlags {
    /// May carry more than one server link.
    pub hub: bool,
    /// Network service; exempt from some checks.
    pub service: bool,
    /// Announced IPv6 support.
    pub ipv6: bool,
    /// Still sending us its burst (cleared by EOB).
    pub burst: bool,
    /// Sent EOB, awaiting our EOB_ACK barrier.
    pub burst_ack: bool,
    /// This link caused a netburst; cascaded bursts attribute to it.
    pub junction: bool,
}

impl ServerFlags {
    /// True while the peer's channel state is still arriving.
    pub fn is_bursting(&self) -> bool {
        self.burst
    }
}

/// A server node in the mesh.
#[derive(Debug)]
pub struct ServerEnt {
    /// Unique, case-insensitive, DNS-shaped.
    pub name: String,
    pub numeric: ServerNumeric,
    pub description: String,
    /// When the link to this server was established.
    pub link_ts: i64,
    /// When the server process started.
    pub start_ts: i64,
    /// Protocol minor version.
    pub protocol: u16,
    /// Numnick capacity mask: max local clients minus one, a power of
    /// two minus one. Client slots index as `local & capacity`.
    pub capacity: u32,
    /// Toward us; `None` only for ourselves.
    pub uplink: Option<ServerId>,
    /// Directly attached servers on the far side.
    pub downlinks: Vec<ServerId>,
    pub flags: ServerFlags,
    /// The physical link when directly connected.
    pub conn: Option<ConnId>,
    /// Local-numnick-indexed client table; `O(1)` numnick lookup.
    clients: Vec<Option<ClientId>>,
    /// Allocation cursor for our own client numerics.
    next_numeric: u32,
    /// When this server last caused a ghost kill (0 = never).
    pub ghost_ts: i64,
}

impl ServerEnt {
    pub fn new(
        name: String,
        numeric: ServerNumeric,
        description: String,
        capacity: u32,
        uplink: Option<ServerId>,
    ) -> Self {
        let capacity = capacity.min(numnick::MAX_CLIENT).max(63);
        ServerEnt {
            name,
            numeric,
            description,
            link_ts: 0,
            start_ts: 0,
            protocol: 10,
            capacity,
            uplink,
            downlinks: Vec::new(),
            flags: ServerFlags::default(),
            conn: None,
            clients: vec![None; capacity as usize + 1],
            next_numeric: 0,
            ghost_ts: 0,
        }
    }

    fn slot(&self, local: u32) -> usize {
        (local & self.capacity) as usize
    }

    /// Client registered under a local numeric, if any.
    pub fn client_by_numeric(&self, local: u32) -> Option<ClientId> {
        self.clients[self.slot(local)]
    }

    /// Record a client under its local numeric.
    pub fn attach_client(&mut self, local: u32, id: ClientId) {
        let slot = self.slot(local);
        self.clients[slot] = Some(id);
    }

    /// Clear a client's slot.
    pub fn detach_client(&mut self, local: u32) {
        let slot = self.slot(local);
        self.clients[slot] = None;
    }

    /// Allocate a free local numeric for one of our own clients.
    pub fn allocate_numeric(&mut self) -> Option<u32> {
        let span = self.capacity as u64 + 1;
        for probe in 0..span {
            let candidate = ((self.next_numeric as u64 + probe) % span) as u32;
            if self.clients[candidate as usize].is_none() {
                self.next_numeric = ((candidate as u64 + 1) % span) as u32;
                return Some(candidate);
            }
        }
        None
    }

    /// Live clients on this server.
    pub fn client_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Arena, Client, ClientId, UserModes};
    use tenth_proto::ClientNumeric;

    fn sample() -> ServerEnt {
        ServerEnt::new(
            "test.example.net".into(),
            ServerNumeric(7),
            "A test server".into(),
            63,
            None,
        )
    }

    fn dummy_client(server: ServerId) -> Client {
        Client {
            numeric: ClientNumeric {
                server: ServerNumeric(7),
                local: 0,
            },
            nick: "dummy".into(),
            username: "d".into(),
            hostname: "h.example".into(),
            hidden_host: None,
            realname: "dummy".into(),
            ip: "127.0.0.1".parse().unwrap(),
            lastnick: 0,
            away: None,
            account: None,
            silence: Vec::new(),
            modes: UserModes::default(),
            privs: Default::default(),
            server,
            conn: None,
            members: Vec::new(),
            invites: Vec::new(),
        }
    }

    fn fixture() -> (ServerEnt, ClientId) {
        let mut servers: Arena<ServerEnt> = Arena::new();
        let sid = servers.insert(sample());
        let mut clients: Arena<Client> = Arena::new();
        let cid = clients.insert(dummy_client(sid));
        (servers.remove(sid).unwrap(), cid)
    }

    #[test]
    fn test_numeric_allocation_skips_taken_slots() {
        let (mut s, cid) = fixture();

        let first = s.allocate_numeric().unwrap();
        assert_eq!(first, 0);
        s.attach_client(first, cid);

        let second = s.allocate_numeric().unwrap();
        assert_eq!(second, 1);
    }

    #[test]
    fn test_client_table_masks_low_bits() {
        let (mut s, cid) = fixture();

        s.attach_client(64, cid); // 64 & 63 == 0
        assert_eq!(s.client_by_numeric(0), Some(cid));
        s.detach_client(0);
        assert_eq!(s.client_by_numeric(64), None);
    }
}
