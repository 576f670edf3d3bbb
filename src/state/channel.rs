//! Channel entities, memberships and the channel ban list.

use tenth_proto::ChannelFlags;

use crate::state::{ChannelId, ClientId, MemberId};

/// Per-member status bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemberFlags {
    pub chanop: bool,
    pub voice: bool,
    /// Was deopped by a TS wipe; may not be re-opped by its own side.
    pub deopped: bool,
    /// Kicked remotely; invisible to the network side until its own
    /// server acknowledges, so crossing messages do not echo.
    pub zombie: bool,
    /// Added while its server's burst was being applied.
    pub burst_joined: bool,
    /// Reserved for delayed-join channels; never set by this engine.
    pub delayed_join: bool,
    /// `banned` below is current (cache validity bit).
    pub ban_valid: bool,
    /// Cached result of the last ban check.
    pub banned: bool,
}

impl MemberFlags {
    /// The `:o` / `:v` / `:ov` tag used in BURST member lists.
    pub fn burst_tag(&self) -> &'static str {
        match (self.chanop, self.voice) {
            (true, true) => "ov",
            (true, false) => "o",
            (false, true) => "v",
            (false, false) => "",
        }
    }
}

/// One client's presence on one channel. Jointly owned: destruction of
/// either endpoint unlinks the entry from the other side.
#[derive(Debug)]
pub struct Membership {
    pub client: ClientId,
    pub channel: ChannelId,
    pub flags: MemberFlags,
}

/// An entry on a channel's ban list.
#[derive(Debug, Clone)]
pub struct ChanBan {
    pub mask: String,
    /// Who set it; kept for the +b list reply.
    pub who: String,
    pub when: i64,
    /// Arrived in the current burst.
    pub burst: bool,
    /// Marked for removal by a TS wipe.
    pub wipeout: bool,
    /// Made redundant by a wider burst ban.
    pub overlapped: bool,
}

impl ChanBan {
    pub fn new(mask: String, who: String, when: i64) -> Self {
        ChanBan {
            mask,
            who,
            when,
            burst: false,
            wipeout: false,
            overlapped: false,
        }
    }
}

/// A channel. Names beginning with `&` are local-only and never cross
/// a server link.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    /// Creation timestamp; the network-wide tiebreaker. Zero means we
    /// have not learned a timestamp yet.
    pub creation: i64,
    pub flags: ChannelFlags,
    pub key: Option<String>,
    pub limit: Option<u32>,
    /// Admin password (`+A`); protected, requires elevated privilege.
    pub apass: Option<String>,
    /// User password (`+U`).
    pub upass: Option<String>,
    pub topic: String,
    pub topic_who: String,
    pub topic_ts: i64,
    pub members: Vec<MemberId>,
    pub bans: Vec<ChanBan>,
    /// Clients holding an invite past `+i`.
    pub invites: Vec<ClientId>,
}

impl Channel {
    pub fn new(name: String, creation: i64) -> Self {
        Channel {
            name,
            creation,
            flags: ChannelFlags::empty(),
            key: None,
            limit: None,
            apass: None,
            upass: None,
            topic: String::new(),
            topic_who: String::new(),
            topic_ts: 0,
            members: Vec::new(),
            bans: Vec::new(),
            invites: Vec::new(),
        }
    }

    /// Local-only channels are never propagated (`&` prefix).
    pub fn is_local(&self) -> bool {
        self.name.starts_with('&')
    }

    /// Render the current mode string and its parameters.
    ///
    /// `show_secrets` controls whether the key and passwords appear in
    /// parameter positions (peers get them; casual members get `*`).
    pub fn mode_string(&self, show_secrets: bool) -> (String, Vec<String>) {
        let mut letters = String::from("+");
        letters.push_str(&self.flags.letters());
        let mut params = Vec::new();

        if let Some(limit) = self.limit {
            letters.push('l');
            params.push(limit.to_string());
        }
        if let Some(ref key) = self.key {
            letters.push('k');
            params.push(if show_secrets {
                key.clone()
            } else {
                "*".to_string()
            });
        }
        if self.apass.is_some() {
            letters.push('A');
            if let Some(ref apass) = self.apass {
                params.push(if show_secrets {
                    apass.clone()
                } else {
                    "*".to_string()
                });
            }
        }
        if self.upass.is_some() {
            letters.push('U');
            if let Some(ref upass) = self.upass {
                params.push(if show_secrets {
                    upass.clone()
                } else {
                    "*".to_string()
                });
            }
        }

        (letters, params)
    }

    /// True when the mode string carries nothing.
    pub fn modeless(&self) -> bool {
        self.flags.is_empty()
            && self.key.is_none()
            && self.limit.is_none()
            && self.apass.is_none()
            && self.upass.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenth_proto::ChannelFlag;

    #[test]
    fn test_mode_string_render() {
        let mut chan = Channel::new("#x".into(), 1000);
        chan.flags.insert(ChannelFlag::NoPrivmsgs);
        chan.flags.insert(ChannelFlag::TopicLimit);
        chan.key = Some("sesame".into());
        chan.limit = Some(10);

        let (letters, params) = chan.mode_string(true);
        assert_eq!(letters, "+tnlk");
        assert_eq!(params, vec!["10", "sesame"]);

        let (_, masked) = chan.mode_string(false);
        assert_eq!(masked, vec!["10", "*"]);
    }

    #[test]
    fn test_local_channels() {
        assert!(Channel::new("&ops".into(), 0).is_local());
        assert!(!Channel::new("#ops".into(), 0).is_local());
    }

    #[test]
    fn test_burst_tag() {
        let mut f = MemberFlags::default();
        assert_eq!(f.burst_tag(), "");
        f.voice = true;
        assert_eq!(f.burst_tag(), "v");
        f.chanop = true;
        assert_eq!(f.burst_tag(), "ov");
        f.voice = false;
        assert_eq!(f.burst_tag(), "o");
    }
}
