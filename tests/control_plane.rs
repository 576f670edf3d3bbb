//! G-line and jupe replication: overlap absorption, lamport ordering,
//! resynchronization, and enforcement.

mod common;

use common::{drain, fake_peer, line, register_user, test_context};
use tenthd::bans::GlineMask;

/// A narrower G-line that expires no later than a wider one already in
/// force is refused and nothing propagates.
#[test]
fn gline_narrower_with_earlier_expiry_rejected() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    let (other_conn, _other) = fake_peer(&mut ctx, 11, "third.test.example", 3);
    // Not mid-burst: lastmod rules apply in full.
    for name in ["peer.test.example", "third.test.example"] {
        let id = ctx.store.find_server_by_name(name).unwrap();
        ctx.store.servers.get_mut(id).unwrap().flags.burst = false;
    }

    line(&mut ctx, peer_conn, ":AC GL * +*@192.0.2.0/24 1900 10 :wide ban");
    assert_eq!(ctx.glines.len(), 1);
    drain(&ctx, other_conn);

    line(&mut ctx, peer_conn, ":AC GL * +*@192.0.2.42 1400 11 :narrow ban");
    assert_eq!(ctx.glines.len(), 1, "narrower ban must be absorbed");
    assert_eq!(
        ctx.glines.get(0).unwrap().mask.render(),
        "*@192.0.2.0/24"
    );
    let forwarded = drain(&ctx, other_conn);
    assert!(
        forwarded.is_empty(),
        "a swallowed ban must not propagate: {:?}",
        forwarded
    );
}

/// A wider, longer-lived G-line absorbs the narrower ones.
#[test]
fn gline_wider_absorbs() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    line(&mut ctx, peer_conn, ":AC GL * +*@192.0.2.42 1400 10 :one host");
    line(&mut ctx, peer_conn, ":AC GL * +*@192.0.2.0/24 1900 11 :the net");
    assert_eq!(ctx.glines.len(), 1);
    assert_eq!(ctx.glines.get(0).unwrap().mask.render(), "*@192.0.2.0/24");
}

/// A deactivation carrying an older version changes nothing and the
/// peer is resynchronized with our version.
#[test]
fn gline_stale_deactivation_resyncs_peer() {
    let mut ctx = test_context();
    let (peer_conn, peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    ctx.store.servers.get_mut(peer).unwrap().flags.burst = false;

    line(&mut ctx, peer_conn, ":AC GL * +*@bad.example.com 1900 10 :spam");
    drain(&ctx, peer_conn);

    line(&mut ctx, peer_conn, ":AC GL * -*@bad.example.com 1900 9 :spam");

    let g = ctx.glines.get(0).unwrap();
    assert!(g.flags.active, "stale version must not deactivate");
    assert_eq!(g.lastmod, 10);

    let resync = drain(&ctx, peer_conn);
    assert!(
        resync.iter().any(|l| l.contains("GL") && l.contains("+*@bad.example.com")),
        "desynced peer must get our version back: {:?}",
        resync
    );
}

/// A strictly newer deactivation wins and propagates onward.
#[test]
fn gline_newer_deactivation_applies() {
    let mut ctx = test_context();
    let (peer_conn, peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    let (other_conn, other) = fake_peer(&mut ctx, 11, "third.test.example", 3);
    ctx.store.servers.get_mut(peer).unwrap().flags.burst = false;
    ctx.store.servers.get_mut(other).unwrap().flags.burst = false;

    line(&mut ctx, peer_conn, ":AC GL * +*@bad.example.com 1900 10 :spam");
    drain(&ctx, other_conn);

    line(&mut ctx, peer_conn, ":AC GL * -*@bad.example.com 1900 12 :spam");
    let g = ctx.glines.get(0).unwrap();
    assert!(!g.flags.active);
    assert!(g.lastmod >= 12);

    let forwarded = drain(&ctx, other_conn);
    assert!(
        forwarded.iter().any(|l| l.contains("-*@bad.example.com")),
        "the newer version must travel: {:?}",
        forwarded
    );
}

/// During burst an equal version is a no-op rather than a resync.
#[test]
fn gline_equal_lastmod_during_burst_is_noop() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    // fake_peer leaves the link mid-burst.

    line(&mut ctx, peer_conn, ":AC GL * +*@bad.example.com 1900 10 :spam");
    drain(&ctx, peer_conn);

    line(&mut ctx, peer_conn, ":AC GL * +*@bad.example.com 1900 10 :different reason");
    let resync = drain(&ctx, peer_conn);
    assert!(resync.is_empty(), "burst no-op must stay silent: {:?}", resync);
    // The accepted limitation: the divergent reason is not detected.
    assert_eq!(ctx.glines.get(0).unwrap().reason, "spam");
}

/// A matching local user is exited the moment an active G-line lands.
#[test]
fn gline_enforces_on_local_users() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let victim_conn = register_user(&mut ctx, 1, "victim");
    {
        let id = ctx.store.find_client_by_name("victim").unwrap();
        ctx.store.clients.get_mut(id).unwrap().ip = "192.0.2.42".parse().unwrap();
    }

    line(&mut ctx, peer_conn, ":AC GL * +*@192.0.2.0/24 1900 10 :go away");

    assert!(ctx.store.find_client_by_name("victim").is_none());
    assert!(!ctx.conns.contains_key(&victim_conn));
}

/// A BADCHAN refuses joins without touching existing users.
#[test]
fn badchan_refuses_joins() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    line(&mut ctx, peer_conn, ":AC GL * +#forbidden 1900 10 :closed");

    let user_conn = register_user(&mut ctx, 1, "joe");
    line(&mut ctx, user_conn, "JOIN #forbidden");

    assert!(ctx.store.find_channel("#forbidden").is_none());
    let replies = drain(&ctx, user_conn);
    assert!(
        replies.iter().any(|l| l.contains(" 479 ")),
        "join must be refused with a numeric: {:?}",
        replies
    );
    assert!(ctx.store.find_client_by_name("joe").is_some(), "no exit on badchan");
}

/// Realname G-lines overlap only on exact equality.
#[test]
fn gline_realname_masks_do_not_contain() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    line(&mut ctx, peer_conn, ":AC GL * +$Rbad person 1900 10 :bad");
    line(&mut ctx, peer_conn, ":AC GL * +$Rbad* 2900 11 :wider");
    assert_eq!(ctx.glines.len(), 2);
    assert!(matches!(
        ctx.glines.get(0).unwrap().mask,
        GlineMask::Realname(_)
    ));
}

/// Jupes follow the same version ordering and cut matching servers.
#[test]
fn jupe_enforcement_and_ordering() {
    let mut ctx = test_context();
    let (peer_conn, peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    let (_third_conn, third) = fake_peer(&mut ctx, 11, "third.test.example", 3);
    ctx.store.servers.get_mut(peer).unwrap().flags.burst = false;
    ctx.store.servers.get_mut(third).unwrap().flags.burst = false;

    line(
        &mut ctx,
        peer_conn,
        ":AC JU * +third.test.example 1900 10 :rogue server",
    );

    assert_eq!(ctx.jupes.len(), 1);
    assert!(
        ctx.store.find_server_by_name("third.test.example").is_none(),
        "juped server must be cut"
    );

    // Older version cannot reactivate.
    line(
        &mut ctx,
        peer_conn,
        ":AC JU * -third.test.example 1900 8 :oops",
    );
    assert!(ctx.jupes.get(0).unwrap().flags.active);
}
