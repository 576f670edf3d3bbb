//! Nick-collision behavior through the wire: the deterministic
//! kill/keep decisions of the timestamp rules.

mod common;

use common::{drain, fake_peer, line, register_user, test_context};
use tenthd::burst::ip_to_base64;

fn intro_line(peer_nn: &str, nick: &str, local: u32, lastnick: i64, user: &str, ip: &str) -> String {
    let numnick = format!("{}{}", peer_nn, tenth_proto::numnick::encode(local, 3));
    format!(
        ":{} N {} 1 {} {} host.remote + {} {} :Remote User",
        peer_nn,
        nick,
        lastnick,
        user,
        ip_to_base64(ip.parse().unwrap()),
        numnick
    )
}

/// Different idents, the resident nick is newer: the resident dies and
/// the incoming client is installed, with a KILL toward other links.
#[test]
fn collision_kills_newer_resident() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    let (other_conn, _other) = fake_peer(&mut ctx, 11, "third.test.example", 3);

    let foo_conn = register_user(&mut ctx, 1, "foo");
    {
        let id = ctx.store.find_client_by_name("foo").unwrap();
        ctx.store.clients.get_mut(id).unwrap().lastnick = 1_000_001_100;
    }
    drain(&ctx, other_conn);

    // A's foo is older (1000).
    line(
        &mut ctx,
        peer_conn,
        &intro_line("AC", "foo", 1, 1_000_001_000, "alice", "192.0.2.1"),
    );

    let survivor = ctx.store.find_client_by_name("foo").unwrap();
    let c = ctx.store.clients.get(survivor).unwrap();
    assert_eq!(c.lastnick, 1_000_001_000, "the older nick wins");
    assert!(!c.is_local(), "the remote side is installed");
    assert!(!ctx.conns.contains_key(&foo_conn), "resident was exited");

    // The kill went everywhere except the link that won.
    let other_lines = drain(&ctx, other_conn);
    assert!(
        other_lines.iter().any(|l| l.contains(" D ")),
        "KILL must reach other links: {:?}",
        other_lines
    );
}

/// Equal timestamps, different idents: both sides die.
#[test]
fn collision_equal_timestamps_kills_both() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    register_user(&mut ctx, 1, "foo");
    {
        let id = ctx.store.find_client_by_name("foo").unwrap();
        ctx.store.clients.get_mut(id).unwrap().lastnick = 1_000_001_000;
    }

    line(
        &mut ctx,
        peer_conn,
        &intro_line("AC", "foo", 1, 1_000_001_000, "alice", "192.0.2.1"),
    );

    assert!(
        ctx.store.find_client_by_name("foo").is_none(),
        "equal timestamps kill both sides"
    );
}

/// The incoming side is newer: it is ignored; the resident survives.
#[test]
fn collision_ignores_newer_incoming() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    register_user(&mut ctx, 1, "foo");
    {
        let id = ctx.store.find_client_by_name("foo").unwrap();
        ctx.store.clients.get_mut(id).unwrap().lastnick = 1_000_001_000;
    }

    line(
        &mut ctx,
        peer_conn,
        &intro_line("AC", "foo", 1, 1_000_001_500, "alice", "192.0.2.1"),
    );

    let survivor = ctx.store.find_client_by_name("foo").unwrap();
    assert!(ctx.store.clients.get(survivor).unwrap().is_local());
}

/// Same user@ip on both sides: the same person raced themselves
/// across a split, so both die regardless of timestamps.
#[test]
fn collision_same_ident_kills_both() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let conn = common::fake_conn(&mut ctx, 1, tenthd::config::PortKind::Client);
    line(&mut ctx, conn, "NICK foo");
    line(&mut ctx, conn, "USER alice 0 * :Someone");
    {
        let id = ctx.store.find_client_by_name("foo").unwrap();
        let c = ctx.store.clients.get_mut(id).unwrap();
        c.lastnick = 1_000_000_900;
        c.ip = "192.0.2.1".parse().unwrap();
    }

    line(
        &mut ctx,
        peer_conn,
        &intro_line("AC", "foo", 1, 1_000_001_500, "alice", "192.0.2.1"),
    );

    assert!(ctx.store.find_client_by_name("foo").is_none());
}

/// An unregistered local connection holding the nick is simply
/// overridden by the remote introduction.
#[test]
fn unregistered_holder_is_overridden() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let pending = common::fake_conn(&mut ctx, 1, tenthd::config::PortKind::Client);
    line(&mut ctx, pending, "NICK foo");

    line(
        &mut ctx,
        peer_conn,
        &intro_line("AC", "foo", 1, 1_000_001_000, "alice", "192.0.2.1"),
    );

    assert!(!ctx.conns.contains_key(&pending), "pending holder dropped");
    let id = ctx.store.find_client_by_name("foo").unwrap();
    assert!(!ctx.store.clients.get(id).unwrap().is_local());
}

/// A remote nick change that collides resolves by the same rules.
#[test]
fn remote_nick_change_collision() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    register_user(&mut ctx, 1, "taken");
    {
        let id = ctx.store.find_client_by_name("taken").unwrap();
        ctx.store.clients.get_mut(id).unwrap().lastnick = 1_000_001_000;
    }

    line(
        &mut ctx,
        peer_conn,
        &intro_line("AC", "other", 1, 1_000_000_500, "bob", "192.0.2.9"),
    );
    let other_nn = {
        let id = ctx.store.find_client_by_name("other").unwrap();
        ctx.store.clients.get(id).unwrap().numeric.encode()
    };

    // The change is newer than the resident: the changer loses.
    line(
        &mut ctx,
        peer_conn,
        &format!(":{} N taken 1000001200", other_nn),
    );

    let survivor = ctx.store.find_client_by_name("taken").unwrap();
    assert!(ctx.store.clients.get(survivor).unwrap().is_local());
    assert!(ctx.store.find_client_by_name("other").is_none(), "changer killed");
}
