//! NICK, USER, WEBIRC: registration and the nick-collision rules.

use tenth_proto::{irc_eq, ClientNumeric, ParsedLine};

use crate::burst::{base64_to_ip, ip_to_base64};
use crate::collision::{
    resolve_nick_collision, within_ghost_window, NickParty, NickVerdict,
};
use crate::conn::{ConnId, ConnState};
use crate::engine::{self, Context};
use crate::handlers::{need_more_params, replies::*, valid_nick, HandlerOutcome, Origin};
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{Client, ClientId, ServerId, UserModes};
use crate::stats;

/// NICK from a local connection: pick or change a nickname.
pub fn m_nick(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(nick) = msg.param(0).filter(|n| !n.is_empty()) else {
        send::numeric(ctx, conn, ERR_NONICKNAMEGIVEN, &[], "No nickname given");
        return HandlerOutcome::Continue;
    };
    if !valid_nick(nick) {
        send::numeric(ctx, conn, ERR_ERRONEUSNICKNAME, &[nick], "Erroneous nickname");
        return HandlerOutcome::Continue;
    }

    match origin.client() {
        // Registered: a nick change.
        Some(client) => {
            if let Some(existing) = ctx.store.find_client_by_name(nick) {
                if existing != client {
                    send::numeric(ctx, conn, ERR_NICKNAMEINUSE, &[nick], "Nickname is already in use");
                    return HandlerOutcome::Continue;
                }
                let same_spelling = ctx
                    .store
                    .clients
                    .get(client)
                    .is_some_and(|c| c.nick == nick);
                if same_spelling {
                    return HandlerOutcome::Continue;
                }
            }
            let now = ctx.now();
            do_local_rename(ctx, client, nick, now);
            HandlerOutcome::Continue
        }
        // Unregistered: half of the NICK/USER pair.
        None => {
            if ctx.store.find_client_by_name(nick).is_some() {
                send::numeric(ctx, conn, ERR_NICKNAMEINUSE, &[nick], "Nickname is already in use");
                return HandlerOutcome::Continue;
            }
            if let Some(c) = ctx.conns.get_mut(&conn) {
                c.pending.nick = Some(nick.to_string());
            }
            try_register(ctx, conn)
        }
    }
}

fn do_local_rename(ctx: &mut Context, client: ClientId, nick: &str, now: i64) {
    let (old_prefix, nn) = match ctx.store.clients.get(client) {
        Some(c) => (c.prefix(), c.numeric.encode()),
        None => return,
    };

    // Watchers on common channels and the user itself hear it.
    let line = MessageBuilder::to_clients(&old_prefix, "NICK")
        .arg(nick)
        .render();
    send::to_client(ctx, client, Priority::Normal, &line);
    for w in route::common_channel_locals(ctx, client) {
        send::to_client(ctx, w, Priority::Normal, &line);
    }

    ctx.store.rename_client(client, nick, now);

    let peer_line = MessageBuilder::to_servers(&nn, "NICK")
        .arg(nick)
        .ts(now)
        .render();
    for peer in route::server_conns(ctx, None) {
        send::enqueue(ctx, peer, Priority::Normal, &peer_line);
    }
}

/// USER: the other half of local registration.
pub fn m_user(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let (Some(username), Some(realname)) = (msg.param(0), msg.param(3)) else {
        return need_more_params(ctx, conn, "USER");
    };
    if let Some(c) = ctx.conns.get_mut(&conn) {
        c.pending.user = Some((username.to_string(), realname.to_string()));
    }
    try_register(ctx, conn)
}

/// WEBIRC: a trusted gateway presents the real client address.
pub fn m_webirc(
    ctx: &mut Context,
    conn: ConnId,
    _origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let on_webirc_port = ctx
        .conns
        .get(&conn)
        .is_some_and(|c| c.state == ConnState::Webirc);
    if !on_webirc_port {
        send::numeric(ctx, conn, ERR_ALREADYREGISTRED, &[], "You may not reregister");
        return HandlerOutcome::Continue;
    }

    let (Some(password), Some(_gateway), Some(host), Some(ip)) =
        (msg.param(0), msg.param(1), msg.param(2), msg.param(3))
    else {
        engine::close_conn(ctx, conn, "WEBIRC handshake failed");
        return HandlerOutcome::SourceExited;
    };

    let peer_host = ctx
        .conns
        .get(&conn)
        .map(|c| c.host.clone())
        .unwrap_or_default();
    let authorized = ctx.config.webirc.iter().any(|block| {
        block.password == password && tenth_proto::match_mask(&block.host, &peer_host)
    });
    let parsed_ip: Option<std::net::IpAddr> = ip.parse().ok();

    match (authorized, parsed_ip) {
        (true, Some(addr)) => {
            if let Some(c) = ctx.conns.get_mut(&conn) {
                c.ip = addr;
                c.host = host.to_string();
                c.state = ConnState::UnknownUser;
            }
            HandlerOutcome::Continue
        }
        _ => {
            stats::bump(&ctx.stats.refused);
            engine::close_conn(ctx, conn, "WEBIRC authorization failed");
            HandlerOutcome::SourceExited
        }
    }
}

/// Complete registration once NICK and USER have both arrived.
fn try_register(ctx: &mut Context, conn: ConnId) -> HandlerOutcome {
    let now = ctx.now();
    let (nick, username, realname, ip, host) = {
        let Some(c) = ctx.conns.get(&conn) else {
            return HandlerOutcome::SourceExited;
        };
        if c.state != ConnState::UnknownUser {
            return HandlerOutcome::Continue;
        }
        let (Some(nick), Some((username, realname))) =
            (c.pending.nick.clone(), c.pending.user.clone())
        else {
            return HandlerOutcome::Continue;
        };
        (nick, username, realname, c.ip, c.host.clone())
    };

    // Registration races a remote introduction for the same nick.
    if ctx.store.find_client_by_name(&nick).is_some() {
        if let Some(c) = ctx.conns.get_mut(&conn) {
            c.pending.nick = None;
        }
        send::numeric(ctx, conn, ERR_NICKNAMEINUSE, &[&nick], "Nickname is already in use");
        return HandlerOutcome::Continue;
    }

    // The ban plane gets the first word.
    if let Some(hit) = ctx.glines.check_user(&username, &host, ip, &realname, now) {
        let reason = hit.reason.clone();
        stats::bump(&ctx.stats.refused);
        send::numeric(ctx, conn, ERR_YOUREBANNEDCREEP, &[], &reason);
        engine::close_conn(ctx, conn, &format!("G-lined ({})", reason));
        return HandlerOutcome::SourceExited;
    }

    if ctx.store.clients.len() >= ctx.features.maxclients {
        stats::bump(&ctx.stats.refused);
        engine::close_conn(ctx, conn, "Sorry, server is full");
        return HandlerOutcome::SourceExited;
    }

    let me = ctx.store.me;
    let me_numeric = {
        let Some(srv) = ctx.store.servers.get_mut(me) else {
            return HandlerOutcome::Continue;
        };
        match srv.allocate_numeric() {
            Some(local) => ClientNumeric {
                server: srv.numeric,
                local,
            },
            None => {
                stats::bump(&ctx.stats.refused);
                engine::close_conn(ctx, conn, "Sorry, server is full");
                return HandlerOutcome::SourceExited;
            }
        }
    };

    let client = ctx.store.insert_client(Client {
        numeric: me_numeric,
        nick: nick.clone(),
        username: username.clone(),
        hostname: host.clone(),
        hidden_host: None,
        realname: realname.clone(),
        ip,
        lastnick: now,
        away: None,
        account: None,
        silence: Vec::new(),
        modes: UserModes::default(),
        privs: Default::default(),
        server: me,
        conn: Some(conn),
        members: Vec::new(),
        invites: Vec::new(),
    });
    if let Some(c) = ctx.conns.get_mut(&conn) {
        c.state = ConnState::User(client);
    }

    welcome(ctx, conn, &nick, &username, &host);

    // Introduce the new client to the mesh.
    let me_nn = ctx.me_numnick();
    let line = MessageBuilder::to_servers(&me_nn, "NICK")
        .arg(&nick)
        .arg("1")
        .ts(now)
        .arg(&username)
        .arg(&host)
        .arg("+")
        .arg(ip_to_base64(ip))
        .arg(me_numeric.encode())
        .trailing(&realname)
        .render();
    for peer in route::server_conns(ctx, None) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }

    tracing::info!(conn = %conn, nick = %nick, "user registered");
    HandlerOutcome::Continue
}

fn welcome(ctx: &mut Context, conn: ConnId, nick: &str, username: &str, host: &str) {
    let me = ctx.me_name();
    send::numeric(
        ctx,
        conn,
        RPL_WELCOME,
        &[],
        &format!("Welcome to the Internet Relay Network {}!{}@{}", nick, username, host),
    );
    send::numeric(
        ctx,
        conn,
        RPL_YOURHOST,
        &[],
        &format!("Your host is {}, running tenthd", me),
    );
    let started = chrono::DateTime::from_timestamp(ctx.start_time, 0)
        .map(|t| t.to_rfc2822())
        .unwrap_or_default();
    send::numeric(ctx, conn, RPL_CREATED, &[], &format!("This server was created {}", started));
    send::numeric(ctx, conn, RPL_MYINFO, &[&me, "tenthd", "diowk", "psmtinklbvoAU"], "");
    send::numeric(ctx, conn, ERR_NOMOTD, &[], "MOTD File is missing");
}

/// NICK on a server link: a remote introduction (server origin) or a
/// remote nick change (client origin).
pub fn ms_nick(
    ctx: &mut Context,
    conn: ConnId,
    origin: &Origin,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    match origin {
        Origin::Server(src) => ms_nick_intro(ctx, conn, *src, msg),
        Origin::Client(client) => ms_nick_change(ctx, conn, *client, msg),
        Origin::Unregistered => HandlerOutcome::Continue,
    }
}

/// Issue a KILL for a numnick toward a set of links.
fn send_kill(ctx: &mut Context, numnick: &str, reason: &str, except: Option<ConnId>) {
    stats::bump(&ctx.stats.kills);
    let me_nn = ctx.me_numnick();
    let me_name = ctx.me_name();
    let line = MessageBuilder::to_servers(&me_nn, "KILL")
        .arg(numnick)
        .trailing(format!("{} ({})", me_name, reason))
        .render();
    for peer in route::server_conns(ctx, except) {
        send::enqueue(ctx, peer, Priority::High, &line);
    }
}

fn ms_nick_intro(
    ctx: &mut Context,
    conn: ConnId,
    src: ServerId,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    // <nick> <hop> <lastnick> <user> <host> [+modes] <ip64> <numnick> :<realname>
    if msg.param_count() < 8 {
        return engine::protocol_violation(ctx, conn, "NICK introduction with too few parameters");
    }
    let nick = msg.param(0).unwrap_or_default();
    let has_modes = msg.param(5).is_some_and(|p| p.starts_with('+'));
    let (modes_str, ip_idx) = if has_modes { (msg.param(5), 6) } else { (None, 5) };
    let Some(lastnick) = msg.param(2).and_then(|p| p.parse::<i64>().ok()) else {
        return engine::protocol_violation(ctx, conn, "NICK with unparseable timestamp");
    };
    if lastnick < ctx.features.oldest_ts {
        return engine::protocol_violation(ctx, conn, "NICK with bogus timestamp");
    }
    let username = msg.param(3).unwrap_or_default().to_string();
    let hostname = msg.param(4).unwrap_or_default().to_string();
    let ip64 = msg.param(ip_idx).unwrap_or_default();
    let numnick_field = msg.param(ip_idx + 1).unwrap_or_default();
    let realname = msg.params.last().copied().unwrap_or_default().to_string();

    let Some(numeric) = ClientNumeric::decode(numnick_field) else {
        return engine::protocol_violation(ctx, conn, "NICK with bad numnick");
    };
    let ip = base64_to_ip(ip64)
        .unwrap_or_else(|| std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    if !valid_nick(nick) {
        // A bad nick from a server is answered with a KILL for it.
        send_kill(ctx, numnick_field, "Bad Nick", None);
        return HandlerOutcome::Continue;
    }

    let owner = match ctx.store.find_server_by_numnick(numeric.server) {
        Some(s) => s,
        None => {
            return engine::protocol_violation(ctx, conn, "NICK for unknown server");
        }
    };

    // An unregistered local connection holding this nick is overridden.
    let overridden: Vec<ConnId> = ctx
        .conns
        .values()
        .filter(|c| {
            !c.state.is_registered()
                && c.pending
                    .nick
                    .as_deref()
                    .is_some_and(|n| irc_eq(n, nick))
        })
        .map(|c| c.id)
        .collect();
    for id in overridden {
        stats::bump(&ctx.stats.refused);
        engine::close_conn(ctx, id, "Overridden by other sign on");
    }

    if let Some(existing) = ctx.store.find_client_by_name(nick) {
        let now = ctx.now();

        // Oscillation guard: a recent ghost from this introducer means
        // the incoming side is the ghost.
        let ghost = ctx
            .store
            .servers
            .get(src)
            .is_some_and(|s| within_ghost_window(now, s.ghost_ts));
        if ghost {
            // The kill goes back toward the introducer, whose server
            // removes its own side.
            stats::bump(&ctx.stats.kills);
            let line = MessageBuilder::to_servers(&ctx.me_numnick(), "KILL")
                .arg(numnick_field)
                .trailing(format!("{} (Ghost)", ctx.me_name()))
                .render();
            send::enqueue(ctx, conn, Priority::High, &line);
            return HandlerOutcome::Continue;
        }

        let existing_party = {
            let Some(c) = ctx.store.clients.get(existing) else {
                return HandlerOutcome::Continue;
            };
            NickParty {
                lastnick: c.lastnick,
                username: c.username.clone(),
                ip: c.ip,
            }
        };
        let incoming_party = NickParty {
            lastnick,
            username: username.clone(),
            ip,
        };

        match resolve_nick_collision(&existing_party, &incoming_party) {
            NickVerdict::KillIncoming => {
                // The introducer's own path resolves identically and
                // kills its client; the introduction is ignored here.
                return HandlerOutcome::Continue;
            }
            NickVerdict::KillExisting => {
                kill_collided(ctx, existing, conn, "older nick overruled");
                if let Some(s) = ctx.store.servers.get_mut(src) {
                    s.ghost_ts = now;
                }
            }
            NickVerdict::KillBoth => {
                kill_collided(ctx, existing, conn, "nick collision from same user@host");
                if let Some(s) = ctx.store.servers.get_mut(src) {
                    s.ghost_ts = now;
                }
                return HandlerOutcome::Continue;
            }
        }
    }

    let modes = {
        let mut m = UserModes::default();
        if let Some(s) = modes_str {
            m.apply(s);
        }
        m
    };

    ctx.store.insert_client(Client {
        numeric,
        nick: nick.to_string(),
        username,
        hostname,
        hidden_host: None,
        realname,
        ip,
        lastnick,
        away: None,
        account: None,
        silence: Vec::new(),
        modes,
        privs: Default::default(),
        server: owner,
        conn: None,
        members: Vec::new(),
        invites: Vec::new(),
    });

    // Pass the introduction on, from the owning server.
    let src_nn = ctx
        .store
        .servers
        .get(owner)
        .map(|s| s.numeric.encode())
        .unwrap_or_default();
    let hop: u32 = msg
        .param(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);
    let mut b = MessageBuilder::to_servers(&src_nn, "NICK")
        .arg(nick)
        .arg((hop + 1).to_string())
        .ts(lastnick);
    for p in &msg.params[3..msg.params.len() - 1] {
        b = b.arg(p);
    }
    let line = b
        .trailing(msg.params.last().copied().unwrap_or_default())
        .render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }

    HandlerOutcome::Continue
}

/// Kill our resident client after it lost a collision.
fn kill_collided(ctx: &mut Context, client: ClientId, from_conn: ConnId, why: &str) {
    let nn = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.numeric.encode())
        .unwrap_or_default();
    send_kill(ctx, &nn, why, Some(from_conn));

    let me_name = ctx.me_name();
    if let Some(conn_id) = ctx.store.clients.get(client).and_then(|c| c.conn) {
        send::numeric(
            ctx,
            conn_id,
            ERR_NICKCOLLISION,
            &[],
            "Nickname collision KILL",
        );
    }
    engine::exit_client(
        ctx,
        client,
        Some(from_conn),
        &format!("Killed ({} ({}))", me_name, why),
        false,
    );
}

fn ms_nick_change(
    ctx: &mut Context,
    conn: ConnId,
    client: ClientId,
    msg: &ParsedLine<'_>,
) -> HandlerOutcome {
    let Some(nick) = msg.param(0) else {
        return engine::protocol_violation(ctx, conn, "NICK change without nickname");
    };
    let lastnick = msg
        .param(1)
        .and_then(|p| p.parse::<i64>().ok())
        .unwrap_or_else(|| ctx.now());

    if !valid_nick(nick) {
        let nn = ctx
            .store
            .clients
            .get(client)
            .map(|c| c.numeric.encode())
            .unwrap_or_default();
        send_kill(ctx, &nn, "Bad Nick", None);
        engine::exit_client(ctx, client, Some(conn), "Killed (Bad Nick)", false);
        return HandlerOutcome::Continue;
    }

    if let Some(existing) = ctx.store.find_client_by_name(nick) {
        if existing != client {
            let existing_party = {
                let Some(c) = ctx.store.clients.get(existing) else {
                    return HandlerOutcome::Continue;
                };
                NickParty {
                    lastnick: c.lastnick,
                    username: c.username.clone(),
                    ip: c.ip,
                }
            };
            let incoming_party = {
                let Some(c) = ctx.store.clients.get(client) else {
                    return HandlerOutcome::Continue;
                };
                NickParty {
                    lastnick,
                    username: c.username.clone(),
                    ip: c.ip,
                }
            };

            match resolve_nick_collision(&existing_party, &incoming_party) {
                NickVerdict::KillIncoming => {
                    kill_collided(ctx, client, conn, "older nick overruled");
                    return HandlerOutcome::Continue;
                }
                NickVerdict::KillExisting => {
                    kill_collided(ctx, existing, conn, "older nick overruled");
                }
                NickVerdict::KillBoth => {
                    kill_collided(ctx, existing, conn, "nick collision from same user@host");
                    kill_collided(ctx, client, conn, "nick collision from same user@host");
                    return HandlerOutcome::Continue;
                }
            }
        }
    }

    // Watchers hear the rename; then pass it on.
    let old_prefix = match ctx.store.clients.get(client) {
        Some(c) => c.prefix(),
        None => return HandlerOutcome::Continue,
    };
    let local_line = MessageBuilder::to_clients(&old_prefix, "NICK")
        .arg(nick)
        .render();
    for w in route::common_channel_locals(ctx, client) {
        send::to_client(ctx, w, Priority::Normal, &local_line);
    }

    ctx.store.rename_client(client, nick, lastnick);

    let nn = ctx
        .store
        .clients
        .get(client)
        .map(|c| c.numeric.encode())
        .unwrap_or_default();
    let line = MessageBuilder::to_servers(&nn, "NICK")
        .arg(nick)
        .ts(lastnick)
        .render();
    for peer in route::server_conns(ctx, Some(conn)) {
        send::enqueue(ctx, peer, Priority::Normal, &line);
    }
    HandlerOutcome::Continue
}
