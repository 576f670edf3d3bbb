//! The channel mode engine.
//!
//! Handlers declare mode additions and removals against a [`ModeBuf`];
//! one `flush` emits at most a handful of MODE/OPMODE lines, packed
//! under the 512-byte wire limit with no more than `MAXMODEPARAMS`
//! parameterized modes per line. The same batch renders twice: name
//! form for local members, numnick form (with the channel timestamp)
//! for peers.

use tenth_proto::{collapse, mask_contains, ChannelFlag, ModeSign, MAXMODEPARAMS};

use crate::conn::ConnId;
use crate::engine::Context;
use crate::route;
use crate::send::{self, MessageBuilder, Priority};
use crate::state::{ChanBan, ChannelId, ClientId};

/// Member mode letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberMode {
    Op,
    Voice,
}

impl MemberMode {
    fn letter(self) -> char {
        match self {
            MemberMode::Op => 'o',
            MemberMode::Voice => 'v',
        }
    }
}

/// A resolved mode change (member arguments already looked up).
#[derive(Debug, Clone)]
pub enum OwnedChange {
    Flag(ModeSign, ChannelFlag),
    Key(ModeSign, String),
    Limit(ModeSign, Option<u32>),
    Ban(ModeSign, String),
    Member(ModeSign, ClientId, MemberMode),
}

#[derive(Debug, Clone)]
enum MbItem {
    Flag(ChannelFlag),
    Key(String),
    Limit(Option<u32>),
    Ban(String),
    Member(ClientId, MemberMode),
}

impl MbItem {
    fn letter(&self) -> char {
        match self {
            MbItem::Flag(f) => f.letter(),
            MbItem::Key(_) => 'k',
            MbItem::Limit(_) => 'l',
            MbItem::Ban(_) => 'b',
            MbItem::Member(_, m) => m.letter(),
        }
    }
}

/// Options governing how a batch of changes is applied.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyOpts {
    /// Bypass state checks that protect against stale changes (OPMODE,
    /// burst, CLEARMODE).
    pub force: bool,
}

/// A batched mode emission for one channel.
pub struct ModeBuf {
    channel: ChannelId,
    /// `nick!user@host` or server name, for local members.
    local_prefix: String,
    /// Numnick, for peers.
    peer_prefix: String,
    /// Emit toward peers as OPMODE rather than MODE.
    as_opmode: bool,
    /// Deliver to local members.
    dest_channel: bool,
    /// Deliver to peers.
    dest_server: bool,
    /// Render key arguments as `*` toward local members.
    hide_key: bool,
    adds: Vec<MbItem>,
    dels: Vec<MbItem>,
}

impl ModeBuf {
    pub fn new(channel: ChannelId, local_prefix: String, peer_prefix: String) -> Self {
        ModeBuf {
            channel,
            local_prefix,
            peer_prefix,
            as_opmode: false,
            dest_channel: true,
            dest_server: true,
            hide_key: false,
            adds: Vec::new(),
            dels: Vec::new(),
        }
    }

    /// Emit toward peers as OPMODE (privileged, forced through).
    pub fn as_opmode(mut self) -> Self {
        self.as_opmode = true;
        self
    }

    /// Suppress the peer emission (burst re-propagates itself).
    pub fn local_only(mut self) -> Self {
        self.dest_server = false;
        self
    }

    /// Mask key arguments toward local members.
    pub fn hide_key(mut self) -> Self {
        self.hide_key = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.dels.is_empty()
    }

    fn push(&mut self, sign: ModeSign, item: MbItem) {
        match sign {
            ModeSign::Plus => self.adds.push(item),
            ModeSign::Minus => self.dels.push(item),
        }
    }

    pub fn flag(&mut self, sign: ModeSign, flag: ChannelFlag) {
        self.push(sign, MbItem::Flag(flag));
    }

    pub fn key(&mut self, sign: ModeSign, key: String) {
        self.push(sign, MbItem::Key(key));
    }

    pub fn limit(&mut self, sign: ModeSign, limit: Option<u32>) {
        self.push(sign, MbItem::Limit(limit));
    }

    pub fn ban(&mut self, sign: ModeSign, mask: String) {
        self.push(sign, MbItem::Ban(mask));
    }

    pub fn member(&mut self, sign: ModeSign, id: ClientId, mode: MemberMode) {
        self.push(sign, MbItem::Member(id, mode));
    }

    /// Pack the batch into `(modestring, args)` chunks respecting the
    /// parameter and byte budgets.
    fn chunks(
        &self,
        ctx: &Context,
        to_peers: bool,
    ) -> Vec<(String, Vec<String>)> {
        // Byte budget per line, leaving room for prefix/verb/channel.
        const ARG_BUDGET: usize = 400;

        let mut out: Vec<(String, Vec<String>)> = Vec::new();
        let mut letters = String::new();
        let mut args: Vec<String> = Vec::new();
        let mut params = 0usize;
        let mut bytes = 0usize;
        let mut sign: Option<ModeSign> = None;

        let mut emit =
            |letters: &mut String, args: &mut Vec<String>, params: &mut usize, bytes: &mut usize, sign: &mut Option<ModeSign>| {
                if !letters.is_empty() {
                    out.push((std::mem::take(letters), std::mem::take(args)));
                }
                *params = 0;
                *bytes = 0;
                *sign = None;
            };

        for (item_sign, item) in self
            .adds
            .iter()
            .map(|i| (ModeSign::Plus, i))
            .chain(self.dels.iter().map(|i| (ModeSign::Minus, i)))
        {
            let arg: Option<String> = match item {
                MbItem::Flag(_) => None,
                MbItem::Key(k) => Some(if self.hide_key && !to_peers {
                    "*".to_string()
                } else {
                    k.clone()
                }),
                MbItem::Limit(l) => l.map(|n| n.to_string()),
                MbItem::Ban(mask) => Some(mask.clone()),
                MbItem::Member(id, _) => match ctx.store.clients.get(*id) {
                    Some(c) => Some(if to_peers {
                        c.numeric.encode()
                    } else {
                        c.nick.clone()
                    }),
                    None => continue,
                },
            };

            let arg_len = arg.as_ref().map(|a| a.len() + 1).unwrap_or(0);
            if (arg.is_some() && params == MAXMODEPARAMS) || bytes + arg_len > ARG_BUDGET {
                emit(&mut letters, &mut args, &mut params, &mut bytes, &mut sign);
            }

            if sign != Some(item_sign) {
                letters.push(match item_sign {
                    ModeSign::Plus => '+',
                    ModeSign::Minus => '-',
                });
                sign = Some(item_sign);
            }
            letters.push(item.letter());
            if let Some(a) = arg {
                bytes += a.len() + 1;
                params += 1;
                args.push(a);
            }
        }
        emit(&mut letters, &mut args, &mut params, &mut bytes, &mut sign);
        out
    }

    /// Emit the batch and consume the buffer. `except` is the link the
    /// triggering line arrived on.
    pub fn flush(self, ctx: &mut Context, except: Option<ConnId>) {
        if self.is_empty() {
            return;
        }
        let Some(chan) = ctx.store.channels.get(self.channel) else {
            return;
        };
        let creation = chan.creation;
        let is_local_chan = chan.is_local();

        if self.dest_channel {
            for (letters, args) in self.chunks(ctx, false) {
                let mut b = MessageBuilder::to_clients(&self.local_prefix, "MODE")
                    .channel(&ctx.store, self.channel)
                    .arg(&letters);
                for a in &args {
                    b = b.arg(a);
                }
                let line = b.render();
                for member in
                    route::local_members(ctx, self.channel, route::LocalFilter::default(), None)
                {
                    send::to_client(ctx, member, Priority::Normal, &line);
                }
            }
        }

        if self.dest_server && !is_local_chan {
            let verb = if self.as_opmode { "OPMODE" } else { "MODE" };
            for (letters, args) in self.chunks(ctx, true) {
                let mut b = MessageBuilder::to_servers(&self.peer_prefix, verb)
                    .channel(&ctx.store, self.channel)
                    .arg(&letters);
                for a in &args {
                    b = b.arg(a);
                }
                let line = b.ts(creation).render();
                for conn in route::server_conns(ctx, except) {
                    send::enqueue(ctx, conn, Priority::Normal, &line);
                }
            }
        }
    }
}

/// Result of trying to add a ban to the channel list.
#[derive(Debug, PartialEq, Eq)]
pub enum BanAdd {
    /// Mask refused: an existing ban already covers it.
    Redundant,
    /// Mask accepted; these existing masks were absorbed and removed.
    Added { removed: Vec<String> },
}

/// Run the ban-list algebra for `+b mask`: collapse the mask, refuse
/// it when covered, and absorb narrower masks it covers.
pub fn add_channel_ban(
    ctx: &mut Context,
    channel: ChannelId,
    mask: &str,
    who: &str,
    now: i64,
) -> BanAdd {
    let mask = collapse(mask);
    let Some(chan) = ctx.store.channels.get_mut(channel) else {
        return BanAdd::Redundant;
    };

    for ban in &chan.bans {
        if mask_contains(&ban.mask, &mask) {
            return BanAdd::Redundant;
        }
    }

    let mut removed = Vec::new();
    chan.bans.retain(|ban| {
        if mask_contains(&mask, &ban.mask) {
            removed.push(ban.mask.clone());
            false
        } else {
            true
        }
    });
    chan.bans.push(ChanBan::new(mask, who.to_string(), now));

    ctx.store.invalidate_ban_cache(channel);
    BanAdd::Added { removed }
}

/// Apply resolved changes to the channel and record them for emission.
/// Permission checks happened at the handler; this is mechanism.
pub fn apply_changes(
    ctx: &mut Context,
    channel: ChannelId,
    changes: &[OwnedChange],
    mbuf: &mut ModeBuf,
    opts: ApplyOpts,
    now: i64,
) {
    for change in changes {
        match change {
            OwnedChange::Flag(sign, flag) => {
                let Some(chan) = ctx.store.channels.get_mut(channel) else {
                    return;
                };
                match sign {
                    ModeSign::Plus if !chan.flags.contains(*flag) => {
                        chan.flags.insert(*flag);
                        mbuf.flag(*sign, *flag);
                    }
                    ModeSign::Minus if chan.flags.contains(*flag) => {
                        chan.flags.remove(*flag);
                        mbuf.flag(*sign, *flag);
                    }
                    _ => {}
                }
            }
            OwnedChange::Key(sign, key) => {
                let Some(chan) = ctx.store.channels.get_mut(channel) else {
                    return;
                };
                match sign {
                    ModeSign::Plus => {
                        if chan.key.as_deref() != Some(key.as_str()) {
                            chan.key = Some(key.clone());
                            mbuf.key(*sign, key.clone());
                        }
                    }
                    ModeSign::Minus => {
                        // The key argument must match to unset it,
                        // unless the change is forced through.
                        let matches = chan.key.as_deref() == Some(key.as_str());
                        if chan.key.is_some() && (matches || opts.force) {
                            let old = chan.key.take().unwrap_or_default();
                            mbuf.key(*sign, old);
                        }
                    }
                }
            }
            OwnedChange::Limit(sign, limit) => {
                let Some(chan) = ctx.store.channels.get_mut(channel) else {
                    return;
                };
                match sign {
                    ModeSign::Plus => {
                        if let Some(n) = limit {
                            if chan.limit != Some(*n) {
                                chan.limit = Some(*n);
                                mbuf.limit(*sign, Some(*n));
                            }
                        }
                    }
                    ModeSign::Minus => {
                        if chan.limit.take().is_some() {
                            mbuf.limit(*sign, None);
                        }
                    }
                }
            }
            OwnedChange::Ban(sign, mask) => match sign {
                ModeSign::Plus => {
                    let who = mbuf.local_prefix.clone();
                    match add_channel_ban(ctx, channel, mask, &who, now) {
                        BanAdd::Redundant => {}
                        BanAdd::Added { removed } => {
                            for r in removed {
                                mbuf.ban(ModeSign::Minus, r);
                            }
                            mbuf.ban(ModeSign::Plus, collapse(mask));
                        }
                    }
                }
                ModeSign::Minus => {
                    let Some(chan) = ctx.store.channels.get_mut(channel) else {
                        return;
                    };
                    let before = chan.bans.len();
                    chan.bans
                        .retain(|b| !tenth_proto::irc_eq(&b.mask, mask));
                    if chan.bans.len() != before {
                        mbuf.ban(ModeSign::Minus, mask.clone());
                        ctx.store.invalidate_ban_cache(channel);
                    }
                }
            },
            OwnedChange::Member(sign, client, mode) => {
                let Some(member_id) = ctx.store.membership(*client, channel) else {
                    continue;
                };
                let Some(member) = ctx.store.members.get_mut(member_id) else {
                    continue;
                };
                let slot = match mode {
                    MemberMode::Op => &mut member.flags.chanop,
                    MemberMode::Voice => &mut member.flags.voice,
                };
                match sign {
                    ModeSign::Plus if !*slot => {
                        *slot = true;
                        if matches!(mode, MemberMode::Op) {
                            member.flags.deopped = false;
                        }
                        mbuf.member(*sign, *client, *mode);
                    }
                    ModeSign::Minus if *slot => {
                        *slot = false;
                        mbuf.member(*sign, *client, *mode);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// CLEARMODE: wipe the modes named by a control string (e.g.
/// `ovpsmikbl`) as one batched, forced removal.
pub fn clear_modes(ctx: &mut Context, channel: ChannelId, control: &str, mbuf: &mut ModeBuf) {
    let mut changes: Vec<OwnedChange> = Vec::new();

    let member_targets = |ctx: &Context, mode: MemberMode| -> Vec<OwnedChange> {
        let Some(chan) = ctx.store.channels.get(channel) else {
            return Vec::new();
        };
        chan.members
            .iter()
            .filter_map(|m| ctx.store.members.get(*m))
            .filter(|m| match mode {
                MemberMode::Op => m.flags.chanop,
                MemberMode::Voice => m.flags.voice,
            })
            .map(|m| OwnedChange::Member(ModeSign::Minus, m.client, mode))
            .collect()
    };

    for c in control.chars() {
        match c {
            'o' => changes.extend(member_targets(ctx, MemberMode::Op)),
            'v' => changes.extend(member_targets(ctx, MemberMode::Voice)),
            'b' => {
                let masks: Vec<String> = ctx
                    .store
                    .channels
                    .get(channel)
                    .map(|ch| ch.bans.iter().map(|b| b.mask.clone()).collect())
                    .unwrap_or_default();
                changes.extend(masks.into_iter().map(|m| OwnedChange::Ban(ModeSign::Minus, m)));
            }
            'k' => {
                if let Some(key) = ctx
                    .store
                    .channels
                    .get(channel)
                    .and_then(|ch| ch.key.clone())
                {
                    changes.push(OwnedChange::Key(ModeSign::Minus, key));
                }
            }
            'l' => changes.push(OwnedChange::Limit(ModeSign::Minus, None)),
            c => {
                if let Some(flag) = ChannelFlag::from_letter(c) {
                    changes.push(OwnedChange::Flag(ModeSign::Minus, flag));
                }
            }
        }
    }

    apply_changes(
        ctx,
        channel,
        &changes,
        mbuf,
        ApplyOpts { force: true },
        0,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_algebra_containment() {
        assert!(mask_contains("*!*@*.example.com", "*!*@evil.example.com"));
        assert!(!mask_contains("*!*@evil.example.com", "*!*@*.example.com"));
    }
}
