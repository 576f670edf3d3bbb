//! Shared fixtures for state and engine tests.

use tenth_proto::{ClientNumeric, ServerNumeric};

use crate::state::{Client, ClientId, ServerEnt, ServerId, Store, UserModes};

/// A store with only ourselves (numeric 1, full-width client table).
pub fn test_store() -> Store {
    let me = ServerEnt::new(
        "me.example.net".into(),
        ServerNumeric(1),
        "self".into(),
        262_143,
        None,
    );
    Store::new(me)
}

/// Add a plain local client with the given nick and local numeric.
pub fn add_client(store: &mut Store, nick: &str, local: u32) -> ClientId {
    let me = store.me;
    add_remote_client(store, me, nick, local)
}

/// Add a client owned by an arbitrary server.
pub fn add_remote_client(
    store: &mut Store,
    server: ServerId,
    nick: &str,
    local: u32,
) -> ClientId {
    let numeric = store.servers.get(server).unwrap().numeric;
    store.insert_client(Client {
        numeric: ClientNumeric {
            server: numeric,
            local,
        },
        nick: nick.into(),
        username: "u".into(),
        hostname: "host.example".into(),
        hidden_host: None,
        realname: "r".into(),
        ip: "127.0.0.1".parse().unwrap(),
        lastnick: 1000,
        away: None,
        account: None,
        silence: Vec::new(),
        modes: UserModes::default(),
        privs: Default::default(),
        server,
        conn: None,
        members: Vec::new(),
        invites: Vec::new(),
    })
}

/// Link a directly-connected peer server under ourselves.
pub fn add_peer_server(store: &mut Store, name: &str, numeric: u16) -> ServerId {
    let me = store.me;
    let mut ent = ServerEnt::new(
        name.into(),
        ServerNumeric(numeric),
        "peer".into(),
        262_143,
        Some(me),
    );
    ent.link_ts = 5000;
    ent.start_ts = 4000;
    store.insert_server(ent).unwrap()
}
