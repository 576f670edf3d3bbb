//! Channel-state reconciliation across a server link: the timestamped
//! wipe/merge/ignore rules, burst idempotence, and the net-ride kick.

mod common;

use common::{drain, fake_peer, line, register_user, test_context};
use tenth_proto::ChannelFlag;
use tenthd::burst::ip_to_base64;
use tenthd::state::MemberFlags;

/// Introduce a remote client over the wire and return its numnick.
fn introduce(
    ctx: &mut tenthd::engine::Context,
    conn: tenthd::conn::ConnId,
    peer_nn: &str,
    nick: &str,
    local: u32,
    lastnick: i64,
) -> String {
    let numnick = format!(
        "{}{}",
        peer_nn,
        tenth_proto::numnick::encode(local, 3)
    );
    let ip = ip_to_base64("192.0.2.77".parse().unwrap());
    line(
        ctx,
        conn,
        &format!(
            ":{} N {} 1 {} remote host.remote + {} {} :Remote User",
            peer_nn, nick, lastnick, ip, numnick
        ),
    );
    assert!(
        ctx.store.find_client_by_name(nick).is_some(),
        "introduction failed for {}",
        nick
    );
    numnick
}

/// An earlier creation timestamp wipes local modes and status, adopts
/// the incoming state, and keeps members from both sides.
#[test]
fn burst_with_earlier_ts_wipes_local_state() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    // Local u1 creates #x and holds op.
    let u1_conn = register_user(&mut ctx, 1, "u1");
    line(&mut ctx, u1_conn, "JOIN #x");
    let chan = ctx.store.find_channel("#x").unwrap();
    ctx.store.channels.get_mut(chan).unwrap().creation = 1_000_000_500;

    let u2 = introduce(&mut ctx, peer_conn, "AC", "u2", 1, 1_000_000_100);
    let u3 = introduce(&mut ctx, peer_conn, "AC", "u3", 2, 1_000_000_100);

    line(
        &mut ctx,
        peer_conn,
        &format!(":AC B #x 1000000400 +nt {}:o,{} :%*!*@evil", u2, u3),
    );

    let chan_ent = ctx.store.channels.get(chan).unwrap();
    assert_eq!(chan_ent.creation, 1_000_000_400);
    assert!(chan_ent.flags.contains(ChannelFlag::NoPrivmsgs));
    assert!(chan_ent.flags.contains(ChannelFlag::TopicLimit));
    assert_eq!(chan_ent.members.len(), 3);
    assert_eq!(chan_ent.bans.len(), 1);
    assert_eq!(chan_ent.bans[0].mask, "*!*@evil");

    // u1 lost op to the wipe; u2 keeps op; u3 is plain.
    let u1_id = ctx.store.find_client_by_name("u1").unwrap();
    let m1 = ctx.store.membership(u1_id, chan).unwrap();
    let f1 = ctx.store.members.get(m1).unwrap().flags;
    assert!(!f1.chanop && f1.deopped);

    let u2_id = ctx.store.find_client_by_name("u2").unwrap();
    let m2 = ctx.store.membership(u2_id, chan).unwrap();
    assert!(ctx.store.members.get(m2).unwrap().flags.chanop);

    let u3_id = ctx.store.find_client_by_name("u3").unwrap();
    let m3 = ctx.store.membership(u3_id, chan).unwrap();
    let f3 = ctx.store.members.get(m3).unwrap().flags;
    assert!(!f3.chanop && !f3.voice);
}

/// A later creation timestamp is ignored: members still arrive (they
/// exist on the other side of the split) but status and modes do not.
#[test]
fn burst_with_later_ts_is_ignored() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let u1_conn = register_user(&mut ctx, 1, "u1");
    line(&mut ctx, u1_conn, "JOIN #x");
    let chan = ctx.store.find_channel("#x").unwrap();
    ctx.store.channels.get_mut(chan).unwrap().creation = 1_000_000_400;

    let u4 = introduce(&mut ctx, peer_conn, "AC", "u4", 1, 1_000_000_100);
    line(
        &mut ctx,
        peer_conn,
        &format!(":AC B #x 1000000500 +i {}:o", u4),
    );

    let chan_ent = ctx.store.channels.get(chan).unwrap();
    assert_eq!(chan_ent.creation, 1_000_000_400);
    assert!(!chan_ent.flags.contains(ChannelFlag::InviteOnly));

    let u4_id = ctx.store.find_client_by_name("u4").unwrap();
    let m4 = ctx.store.membership(u4_id, chan).unwrap();
    let f4 = ctx.store.members.get(m4).unwrap().flags;
    assert!(f4.burst_joined);
    assert!(!f4.chanop, "burst op must be discarded on the losing side");

    // u1's op survives.
    let u1_id = ctx.store.find_client_by_name("u1").unwrap();
    let m1 = ctx.store.membership(u1_id, chan).unwrap();
    assert!(ctx.store.members.get(m1).unwrap().flags.chanop);
}

/// Applying the same BURST line twice leaves the same channel state as
/// applying it once.
#[test]
fn burst_is_idempotent() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let u2 = introduce(&mut ctx, peer_conn, "AC", "u2", 1, 1_000_000_100);
    let burst_line = format!(":AC B #y 1000000400 +nt {}:o :%*!*@evil", u2);

    line(&mut ctx, peer_conn, &burst_line);
    let chan = ctx.store.find_channel("#y").unwrap();
    let snapshot = |ctx: &tenthd::engine::Context| {
        let c = ctx.store.channels.get(chan).unwrap();
        (
            c.creation,
            c.flags,
            c.members.len(),
            c.bans.iter().map(|b| b.mask.clone()).collect::<Vec<_>>(),
        )
    };
    let first = snapshot(&ctx);

    line(&mut ctx, peer_conn, &burst_line);
    assert_eq!(snapshot(&ctx), first);
}

/// Equal timestamps merge: flags union, members keep status from both
/// sides, nothing is wiped.
#[test]
fn burst_with_equal_ts_merges() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let u1_conn = register_user(&mut ctx, 1, "u1");
    line(&mut ctx, u1_conn, "JOIN #x");
    let chan = ctx.store.find_channel("#x").unwrap();
    ctx.store.channels.get_mut(chan).unwrap().creation = 1_000_000_400;
    {
        let c = ctx.store.channels.get_mut(chan).unwrap();
        c.flags.insert(ChannelFlag::Secret);
    }

    let u2 = introduce(&mut ctx, peer_conn, "AC", "u2", 1, 1_000_000_100);
    line(
        &mut ctx,
        peer_conn,
        &format!(":AC B #x 1000000400 +n {}", u2),
    );

    let chan_ent = ctx.store.channels.get(chan).unwrap();
    assert_eq!(chan_ent.creation, 1_000_000_400);
    assert!(chan_ent.flags.contains(ChannelFlag::Secret), "merge never clears");
    assert!(chan_ent.flags.contains(ChannelFlag::NoPrivmsgs));

    let u1_id = ctx.store.find_client_by_name("u1").unwrap();
    let m1 = ctx.store.membership(u1_id, chan).unwrap();
    assert!(ctx.store.members.get(m1).unwrap().flags.chanop, "merge keeps ops");
}

/// The net-rider kick: our side was younger with +i in the incoming
/// state, so local members who slipped in during the split are kicked.
#[test]
fn burst_net_ride_kick() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let u1_conn = register_user(&mut ctx, 1, "u1");
    line(&mut ctx, u1_conn, "JOIN #locked");
    let chan = ctx.store.find_channel("#locked").unwrap();
    ctx.store.channels.get_mut(chan).unwrap().creation = 1_000_000_500;
    drain(&ctx, u1_conn);

    let u2 = introduce(&mut ctx, peer_conn, "AC", "u2", 1, 1_000_000_100);
    line(
        &mut ctx,
        peer_conn,
        &format!(":AC B #locked 1000000400 +ni {}:o", u2),
    );

    // u1 was kicked off as a net rider; u2 remains.
    let u1_id = ctx.store.find_client_by_name("u1").unwrap();
    assert!(ctx.store.membership(u1_id, chan).is_none());
    let kick = drain(&ctx, u1_conn)
        .into_iter()
        .find(|l| l.contains("KICK") && l.contains("Net Rider"));
    assert!(kick.is_some(), "local rider must see the kick");
}

/// BURST outside of a net.burst is a structural protocol offense.
#[test]
fn burst_outside_netburst_exits_link() {
    let mut ctx = test_context();
    let (peer_conn, peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    ctx.store.servers.get_mut(peer).unwrap().flags.burst = false;

    line(&mut ctx, peer_conn, ":AC B #x 1000000400 +nt");
    assert!(!ctx.conns.contains_key(&peer_conn), "link must be dropped");
}

/// The send side: a netburst carries clients, channel state and the
/// end-of-burst marker in order.
#[test]
fn netburst_emission_describes_local_state() {
    let mut ctx = test_context();

    let u1_conn = register_user(&mut ctx, 1, "u1");
    line(&mut ctx, u1_conn, "JOIN #x");
    line(&mut ctx, u1_conn, "MODE #x +nt");
    line(&mut ctx, u1_conn, "MODE #x +b *!*@spam.example");

    let (peer_conn, peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);
    tenthd::burst::send_netburst(&mut ctx, peer_conn, peer);

    let lines = drain(&ctx, peer_conn);
    let nick = lines.iter().find(|l| l.contains(" N u1 "));
    assert!(nick.is_some(), "burst must introduce u1: {:?}", lines);

    let burst = lines
        .iter()
        .find(|l| l.contains(" B #x "))
        .expect("burst line for #x");
    assert!(burst.contains("+tn"), "channel modes travel: {}", burst);
    assert!(burst.contains(":o"), "u1's op travels: {}", burst);
    assert!(burst.contains("%*!*@spam.example"), "bans travel: {}", burst);

    assert!(
        lines.iter().any(|l| l.ends_with(" EB") || l.contains(" EB")),
        "burst ends with EOB: {:?}",
        lines
    );

    // Waiting on the ack barrier now.
    assert!(ctx.store.servers.get(peer).unwrap().flags.burst_ack);
}

/// A member tag covers only the member it is attached to; untagged
/// members arrive without status.
#[test]
fn burst_member_tags_are_per_member() {
    let mut ctx = test_context();
    let (peer_conn, _peer) = fake_peer(&mut ctx, 10, "peer.test.example", 2);

    let a = introduce(&mut ctx, peer_conn, "AC", "ua", 1, 1_000_000_100);
    let b = introduce(&mut ctx, peer_conn, "AC", "ub", 2, 1_000_000_100);
    let c = introduce(&mut ctx, peer_conn, "AC", "uc", 3, 1_000_000_100);

    line(
        &mut ctx,
        peer_conn,
        &format!(":AC B #z 1000000400 {},{}:ov,{}", a, b, c),
    );
    let chan = ctx.store.find_channel("#z").unwrap();

    let flags = |ctx: &tenthd::engine::Context, nick: &str| -> MemberFlags {
        let id = ctx
            .store
            .clients
            .iter()
            .find(|(_, cl)| cl.nick == nick)
            .map(|(h, _)| h)
            .unwrap();
        let m = ctx.store.membership(id, chan).unwrap();
        ctx.store.members.get(m).unwrap().flags
    };

    let fa = flags(&ctx, "ua");
    assert!(!fa.chanop && !fa.voice);
    let fb = flags(&ctx, "ub");
    assert!(fb.chanop && fb.voice);
    let fc = flags(&ctx, "uc");
    assert!(!fc.chanop && !fc.voice);
}
