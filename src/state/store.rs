//! The entity registry and its case-folded name index.
//!
//! Lookup tables use fixed-size bucket chains with move-to-front, so a
//! name that was just resolved is cheap to resolve again (handlers
//! habitually look the same target up several times per line). The
//! per-server client tables give O(1) numnick resolution.

use tenth_proto::{hash_folded, irc_to_lower, ClientNumeric, ServerNumeric};

use crate::state::{
    Arena, Channel, ChannelId, Client, ClientId, MemberFlags, MemberId, Membership,
    ServerEnt, ServerId,
};

/// Bucket count for the name tables. Prime, so the rotation factor of
/// the hash walks every bucket.
const HASH_BUCKETS: usize = 1021;

/// A case-folded name index with move-to-front chains.
struct NameTable<T> {
    buckets: Vec<Vec<(String, T)>>,
}

impl<T: Copy + PartialEq> NameTable<T> {
    fn new() -> Self {
        let mut buckets = Vec::with_capacity(HASH_BUCKETS);
        buckets.resize_with(HASH_BUCKETS, Vec::new);
        NameTable { buckets }
    }

    fn bucket_index(folded: &str) -> usize {
        hash_folded(folded) as usize % HASH_BUCKETS
    }

    fn insert(&mut self, name: &str, value: T) {
        let folded = irc_to_lower(name);
        let bucket = &mut self.buckets[Self::bucket_index(&folded)];
        bucket.insert(0, (folded, value));
    }

    fn remove(&mut self, name: &str) -> Option<T> {
        let folded = irc_to_lower(name);
        let bucket = &mut self.buckets[Self::bucket_index(&folded)];
        let pos = bucket.iter().position(|(n, _)| *n == folded)?;
        Some(bucket.remove(pos).1)
    }

    /// Find and move the hit to the front of its chain.
    fn find(&mut self, name: &str) -> Option<T> {
        let folded = irc_to_lower(name);
        let bucket = &mut self.buckets[Self::bucket_index(&folded)];
        let pos = bucket.iter().position(|(n, _)| *n == folded)?;
        if pos != 0 {
            let entry = bucket.remove(pos);
            bucket.insert(0, entry);
        }
        Some(bucket[0].1)
    }
}

/// The process-wide entity store. Owned by the engine task; handlers
/// receive it by mutable reference and never hold entity borrows
/// across suspension points.
pub struct Store {
    pub clients: Arena<Client>,
    pub servers: Arena<ServerEnt>,
    pub channels: Arena<Channel>,
    pub members: Arena<Membership>,

    nick_index: NameTable<ClientId>,
    channel_index: NameTable<ChannelId>,
    server_index: NameTable<ServerId>,
    numerics: std::collections::HashMap<u16, ServerId>,
    /// Global client list for match iteration.
    global_clients: Vec<ClientId>,

    /// Ourselves.
    pub me: ServerId,
}

impl Store {
    /// Build a store around our own server entity.
    pub fn new(mut me: ServerEnt) -> Self {
        me.uplink = None;
        let numeric = me.numeric;
        let name = me.name.clone();

        let mut servers = Arena::new();
        let me_id = servers.insert(me);

        let mut server_index = NameTable::new();
        server_index.insert(&name, me_id);
        let mut numerics = std::collections::HashMap::new();
        numerics.insert(numeric.0, me_id);

        Store {
            clients: Arena::new(),
            servers,
            channels: Arena::new(),
            members: Arena::new(),
            nick_index: NameTable::new(),
            channel_index: NameTable::new(),
            server_index,
            numerics,
            global_clients: Vec::new(),
            me: me_id,
        }
    }

    // --- lookups ---

    pub fn find_client_by_name(&mut self, name: &str) -> Option<ClientId> {
        self.nick_index.find(name)
    }

    pub fn find_channel(&mut self, name: &str) -> Option<ChannelId> {
        self.channel_index.find(name)
    }

    pub fn find_server_by_name(&mut self, name: &str) -> Option<ServerId> {
        self.server_index.find(name)
    }

    pub fn find_server_by_numnick(&self, numeric: ServerNumeric) -> Option<ServerId> {
        self.numerics.get(&numeric.0).copied()
    }

    /// Resolve a 5-character global client address.
    pub fn find_client_by_numnick(&self, field: &str) -> Option<ClientId> {
        let numeric = ClientNumeric::decode(field)?;
        let server = self.find_server_by_numnick(numeric.server)?;
        let server = self.servers.get(server)?;
        let id = server.client_by_numeric(numeric.local)?;
        // The table is masked; confirm the occupant is who was asked for.
        let client = self.clients.get(id)?;
        (client.numeric == numeric).then_some(id)
    }

    // --- clients ---

    /// Register a client; indexes nick, global list, and the owning
    /// server's numnick table.
    pub fn insert_client(&mut self, client: Client) -> ClientId {
        let nick = client.nick.clone();
        let server = client.server;
        let local = client.numeric.local;

        let id = self.clients.insert(client);
        self.nick_index.insert(&nick, id);
        self.global_clients.push(id);
        if let Some(srv) = self.servers.get_mut(server) {
            srv.attach_client(local, id);
        }
        id
    }

    /// Change a client's nickname, keeping the index consistent.
    pub fn rename_client(&mut self, id: ClientId, new_nick: &str, when: i64) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let old = std::mem::replace(&mut client.nick, new_nick.to_string());
        client.lastnick = when;
        self.nick_index.remove(&old);
        self.nick_index.insert(new_nick, id);
    }

    /// Drop a client entity. Memberships must already be gone; invites
    /// held by the client are withdrawn here.
    pub fn remove_client(&mut self, id: ClientId) -> Option<Client> {
        let client = self.clients.remove(id)?;
        debug_assert!(client.members.is_empty(), "client removed with memberships");

        self.nick_index.remove(&client.nick);
        if let Some(pos) = self.global_clients.iter().position(|c| *c == id) {
            self.global_clients.swap_remove(pos);
        }
        if let Some(srv) = self.servers.get_mut(client.server) {
            srv.detach_client(client.numeric.local);
        }
        for chan in &client.invites {
            if let Some(channel) = self.channels.get_mut(*chan) {
                channel.invites.retain(|c| *c != id);
            }
        }
        Some(client)
    }

    /// All clients, for host-mask matching and sweeps.
    pub fn clients_snapshot(&self) -> Vec<ClientId> {
        self.global_clients.clone()
    }

    // --- servers ---

    /// Register a server under its uplink. Fails on a duplicate
    /// numeric or name; the caller turns that into the §collision
    /// disconnect.
    pub fn insert_server(&mut self, server: ServerEnt) -> Result<ServerId, String> {
        if self.numerics.contains_key(&server.numeric.0) {
            return Err(format!("duplicate server numeric {}", server.numeric));
        }
        if self.server_index.find(&server.name).is_some() {
            return Err(format!("duplicate server name {}", server.name));
        }

        let name = server.name.clone();
        let numeric = server.numeric;
        let uplink = server.uplink;

        let id = self.servers.insert(server);
        self.server_index.insert(&name, id);
        self.numerics.insert(numeric.0, id);
        if let Some(up) = uplink {
            if let Some(up_ent) = self.servers.get_mut(up) {
                up_ent.downlinks.push(id);
            }
        }
        Ok(id)
    }

    /// Drop a server entity. Its clients and downlinks must already be
    /// gone; the exit path cascades before calling this.
    pub fn remove_server(&mut self, id: ServerId) -> Option<ServerEnt> {
        let server = self.servers.remove(id)?;
        debug_assert!(server.downlinks.is_empty(), "server removed with downlinks");

        self.server_index.remove(&server.name);
        self.numerics.remove(&server.numeric.0);
        if let Some(up) = server.uplink {
            if let Some(up_ent) = self.servers.get_mut(up) {
                up_ent.downlinks.retain(|d| *d != id);
            }
        }
        Some(server)
    }

    // --- channels ---

    /// Find or create a channel. Returns the handle and whether it was
    /// created now.
    pub fn get_or_create_channel(&mut self, name: &str, creation: i64) -> (ChannelId, bool) {
        if let Some(id) = self.channel_index.find(name) {
            return (id, false);
        }
        let id = self.channels.insert(Channel::new(name.to_string(), creation));
        self.channel_index.insert(name, id);
        (id, true)
    }

    /// Destroy a channel; invites pointing at it are withdrawn.
    pub fn remove_channel(&mut self, id: ChannelId) -> Option<Channel> {
        let channel = self.channels.remove(id)?;
        debug_assert!(channel.members.is_empty(), "channel removed with members");

        self.channel_index.remove(&channel.name);
        for client in &channel.invites {
            if let Some(c) = self.clients.get_mut(*client) {
                c.invites.retain(|chan| *chan != id);
            }
        }
        Some(channel)
    }

    // --- memberships ---

    /// Add a client to a channel. Membership symmetry is maintained
    /// here and only here.
    pub fn join(&mut self, client: ClientId, channel: ChannelId, flags: MemberFlags) -> MemberId {
        let member = self.members.insert(Membership {
            client,
            channel,
            flags,
        });
        if let Some(c) = self.clients.get_mut(client) {
            c.members.push(member);
        }
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.members.push(member);
        }
        member
    }

    /// Remove one membership from both endpoints.
    pub fn part(&mut self, member: MemberId) -> Option<Membership> {
        let membership = self.members.remove(member)?;
        if let Some(c) = self.clients.get_mut(membership.client) {
            c.members.retain(|m| *m != member);
        }
        if let Some(chan) = self.channels.get_mut(membership.channel) {
            chan.members.retain(|m| *m != member);
        }
        Some(membership)
    }

    /// The membership linking a client and a channel, if any.
    pub fn membership(&self, client: ClientId, channel: ChannelId) -> Option<MemberId> {
        let c = self.clients.get(client)?;
        c.members
            .iter()
            .copied()
            .find(|m| self.members.get(*m).map(|mm| mm.channel) == Some(channel))
    }

    /// Invalidate every member's cached ban-check result.
    pub fn invalidate_ban_cache(&mut self, channel: ChannelId) {
        let members = match self.channels.get(channel) {
            Some(chan) => chan.members.clone(),
            None => return,
        };
        for m in members {
            if let Some(mm) = self.members.get_mut(m) {
                mm.flags.ban_valid = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil::{add_client, test_store};

    #[test]
    fn test_nick_lookup_is_case_folded() {
        let mut store = test_store();
        let id = add_client(&mut store, "Foo[1]", 0);
        assert_eq!(store.find_client_by_name("foo{1}"), Some(id));
        assert_eq!(store.find_client_by_name("bar"), None);
    }

    #[test]
    fn test_numnick_lookup() {
        let mut store = test_store();
        let id = add_client(&mut store, "foo", 5);
        let field = store.clients.get(id).unwrap().numeric.encode();
        assert_eq!(store.find_client_by_numnick(&field), Some(id));
        assert_eq!(store.find_client_by_numnick("zzzzz"), None);
    }

    #[test]
    fn test_rename_keeps_index_consistent() {
        let mut store = test_store();
        let id = add_client(&mut store, "foo", 0);
        store.rename_client(id, "bar", 2000);
        assert_eq!(store.find_client_by_name("foo"), None);
        assert_eq!(store.find_client_by_name("BAR"), Some(id));
        assert_eq!(store.clients.get(id).unwrap().lastnick, 2000);
    }

    #[test]
    fn test_membership_symmetry() {
        let mut store = test_store();
        let c = add_client(&mut store, "foo", 0);
        let (chan, created) = store.get_or_create_channel("#x", 1000);
        assert!(created);

        let m = store.join(c, chan, MemberFlags::default());
        assert!(store.clients.get(c).unwrap().members.contains(&m));
        assert!(store.channels.get(chan).unwrap().members.contains(&m));
        assert_eq!(store.membership(c, chan), Some(m));

        store.part(m);
        assert!(store.clients.get(c).unwrap().members.is_empty());
        assert!(store.channels.get(chan).unwrap().members.is_empty());
        assert_eq!(store.membership(c, chan), None);
    }

    #[test]
    fn test_remove_client_clears_everything() {
        let mut store = test_store();
        let c = add_client(&mut store, "foo", 3);
        let (chan, _) = store.get_or_create_channel("#x", 1000);
        store.channels.get_mut(chan).unwrap().invites.push(c);
        store.clients.get_mut(c).unwrap().invites.push(chan);

        let field = store.clients.get(c).unwrap().numeric.encode();
        store.remove_client(c).unwrap();

        assert_eq!(store.find_client_by_name("foo"), None);
        assert_eq!(store.find_client_by_numnick(&field), None);
        assert!(store.channels.get(chan).unwrap().invites.is_empty());
        assert!(store.clients_snapshot().is_empty());
    }

    #[test]
    fn test_duplicate_server_numeric_rejected() {
        let mut store = test_store();
        let dup = ServerEnt::new(
            "other.example.net".into(),
            ServerNumeric(1),
            "dup".into(),
            63,
            Some(store.me),
        );
        assert!(store.insert_server(dup).is_err());
    }

    #[test]
    fn test_channel_destroy_withdraws_invites() {
        let mut store = test_store();
        let c = add_client(&mut store, "foo", 0);
        let (chan, _) = store.get_or_create_channel("#x", 1000);
        store.channels.get_mut(chan).unwrap().invites.push(c);
        store.clients.get_mut(c).unwrap().invites.push(chan);

        store.remove_channel(chan).unwrap();
        assert!(store.clients.get(c).unwrap().invites.is_empty());
        assert_eq!(store.find_channel("#x"), None);
    }
}
