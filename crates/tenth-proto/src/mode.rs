//! Channel mode-string scanning.
//!
//! The scanner turns a signed mode string plus its argument list into a
//! flat list of [`ModeChange`]s; policy (who may set what, burst
//! wipe/merge, op checks) stays with the daemon's mode engine.

/// At most this many parameterized modes fit on one MODE line; excess
/// parameters are dropped to hold the byte budget.
pub const MAXMODEPARAMS: usize = 6;

/// Direction of a mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSign {
    Plus,
    Minus,
}

/// Parameterless channel flag modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFlag {
    Private,
    Secret,
    Moderated,
    TopicLimit,
    InviteOnly,
    NoPrivmsgs,
}

impl ChannelFlag {
    /// All flags, in canonical emission order.
    pub const ALL: [ChannelFlag; 6] = [
        ChannelFlag::Private,
        ChannelFlag::Secret,
        ChannelFlag::Moderated,
        ChannelFlag::TopicLimit,
        ChannelFlag::InviteOnly,
        ChannelFlag::NoPrivmsgs,
    ];

    /// The mode letter on the wire.
    pub fn letter(self) -> char {
        match self {
            ChannelFlag::Private => 'p',
            ChannelFlag::Secret => 's',
            ChannelFlag::Moderated => 'm',
            ChannelFlag::TopicLimit => 't',
            ChannelFlag::InviteOnly => 'i',
            ChannelFlag::NoPrivmsgs => 'n',
        }
    }

    /// Reverse of [`letter`](Self::letter).
    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'p' => Some(ChannelFlag::Private),
            's' => Some(ChannelFlag::Secret),
            'm' => Some(ChannelFlag::Moderated),
            't' => Some(ChannelFlag::TopicLimit),
            'i' => Some(ChannelFlag::InviteOnly),
            'n' => Some(ChannelFlag::NoPrivmsgs),
            _ => None,
        }
    }

    fn bit(self) -> u32 {
        match self {
            ChannelFlag::Private => 1 << 0,
            ChannelFlag::Secret => 1 << 1,
            ChannelFlag::Moderated => 1 << 2,
            ChannelFlag::TopicLimit => 1 << 3,
            ChannelFlag::InviteOnly => 1 << 4,
            ChannelFlag::NoPrivmsgs => 1 << 5,
        }
    }
}

/// A set of parameterless channel flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFlags(u32);

impl ChannelFlags {
    /// The empty set.
    pub fn empty() -> Self {
        ChannelFlags(0)
    }

    pub fn contains(self, flag: ChannelFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn insert(&mut self, flag: ChannelFlag) {
        self.0 |= flag.bit();
    }

    pub fn remove(&mut self, flag: ChannelFlag) {
        self.0 &= !flag.bit();
    }

    /// Set-only union, used by the equal-timestamp burst merge.
    pub fn union(self, other: ChannelFlags) -> ChannelFlags {
        ChannelFlags(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flags present in `self`, in canonical order.
    pub fn iter(self) -> impl Iterator<Item = ChannelFlag> {
        ChannelFlag::ALL.into_iter().filter(move |f| self.contains(*f))
    }

    /// The `psmtin` letters of the set, in canonical order.
    pub fn letters(self) -> String {
        self.iter().map(ChannelFlag::letter).collect()
    }
}

/// One scanned mode change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeChange<'a> {
    Flag(ModeSign, ChannelFlag),
    /// `k`. The key argument is required on both set and unset.
    Key(ModeSign, &'a str),
    /// `l`. The limit argument is required only on set.
    Limit(ModeSign, Option<u32>),
    /// `b`. Mask argument required.
    Ban(ModeSign, &'a str),
    /// `o`. Member argument (nick locally, numnick between peers).
    Op(ModeSign, &'a str),
    /// `v`.
    Voice(ModeSign, &'a str),
    /// `A`, the admin password. Privileged.
    AdminPass(ModeSign, &'a str),
    /// `U`, the user password. Privileged.
    UserPass(ModeSign, &'a str),
    /// A letter the engine does not know. Carried so the caller can
    /// answer with the proper numeric.
    Unknown(ModeSign, char),
}

impl ModeChange<'_> {
    pub fn sign(&self) -> ModeSign {
        match *self {
            ModeChange::Flag(s, _)
            | ModeChange::Key(s, _)
            | ModeChange::Limit(s, _)
            | ModeChange::Ban(s, _)
            | ModeChange::Op(s, _)
            | ModeChange::Voice(s, _)
            | ModeChange::AdminPass(s, _)
            | ModeChange::UserPass(s, _)
            | ModeChange::Unknown(s, _) => s,
        }
    }
}

/// Scan a signed mode string against its argument list.
///
/// Returns the changes and the number of arguments consumed. Changes
/// whose required argument is missing are silently dropped, matching
/// the wire behavior of peers that ran out of line budget.
pub fn parse_mode_string<'a>(
    modes: &'a str,
    args: &[&'a str],
) -> (Vec<ModeChange<'a>>, usize) {
    let mut out = Vec::new();
    let mut sign = ModeSign::Plus;
    let mut arg_idx = 0;

    let mut next_arg = |idx: &mut usize| -> Option<&'a str> {
        let a = args.get(*idx).copied();
        if a.is_some() {
            *idx += 1;
        }
        a
    };

    for c in modes.chars() {
        match c {
            '+' => sign = ModeSign::Plus,
            '-' => sign = ModeSign::Minus,
            'k' => {
                // Key argument travels with both set and unset.
                if let Some(arg) = next_arg(&mut arg_idx) {
                    out.push(ModeChange::Key(sign, arg));
                }
            }
            'l' => match sign {
                ModeSign::Plus => {
                    if let Some(arg) = next_arg(&mut arg_idx) {
                        if let Ok(n) = arg.parse::<u32>() {
                            out.push(ModeChange::Limit(sign, Some(n)));
                        }
                    }
                }
                ModeSign::Minus => out.push(ModeChange::Limit(sign, None)),
            },
            'b' => {
                if let Some(arg) = next_arg(&mut arg_idx) {
                    out.push(ModeChange::Ban(sign, arg));
                }
            }
            'o' => {
                if let Some(arg) = next_arg(&mut arg_idx) {
                    out.push(ModeChange::Op(sign, arg));
                }
            }
            'v' => {
                if let Some(arg) = next_arg(&mut arg_idx) {
                    out.push(ModeChange::Voice(sign, arg));
                }
            }
            'A' => {
                if let Some(arg) = next_arg(&mut arg_idx) {
                    out.push(ModeChange::AdminPass(sign, arg));
                }
            }
            'U' => {
                if let Some(arg) = next_arg(&mut arg_idx) {
                    out.push(ModeChange::UserPass(sign, arg));
                }
            }
            c => match ChannelFlag::from_letter(c) {
                Some(flag) => out.push(ModeChange::Flag(sign, flag)),
                None => out.push(ModeChange::Unknown(sign, c)),
            },
        }
    }

    (out, arg_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_flags() {
        let (changes, used) = parse_mode_string("+ntk", &["sesame"]);
        assert_eq!(used, 1);
        assert_eq!(
            changes,
            vec![
                ModeChange::Flag(ModeSign::Plus, ChannelFlag::NoPrivmsgs),
                ModeChange::Flag(ModeSign::Plus, ChannelFlag::TopicLimit),
                ModeChange::Key(ModeSign::Plus, "sesame"),
            ]
        );
    }

    #[test]
    fn test_parse_sign_toggling() {
        let (changes, _) = parse_mode_string("+n-t+i", &[]);
        assert_eq!(
            changes,
            vec![
                ModeChange::Flag(ModeSign::Plus, ChannelFlag::NoPrivmsgs),
                ModeChange::Flag(ModeSign::Minus, ChannelFlag::TopicLimit),
                ModeChange::Flag(ModeSign::Plus, ChannelFlag::InviteOnly),
            ]
        );
    }

    #[test]
    fn test_parse_member_modes() {
        let (changes, used) = parse_mode_string("+ov-v", &["AAAAB", "AAAAC", "AAAAD"]);
        assert_eq!(used, 3);
        assert_eq!(
            changes,
            vec![
                ModeChange::Op(ModeSign::Plus, "AAAAB"),
                ModeChange::Voice(ModeSign::Plus, "AAAAC"),
                ModeChange::Voice(ModeSign::Minus, "AAAAD"),
            ]
        );
    }

    #[test]
    fn test_parse_limit_semantics() {
        let (changes, used) = parse_mode_string("+l", &["50"]);
        assert_eq!(used, 1);
        assert_eq!(changes, vec![ModeChange::Limit(ModeSign::Plus, Some(50))]);

        // -l takes no argument
        let (changes, used) = parse_mode_string("-l", &["50"]);
        assert_eq!(used, 0);
        assert_eq!(changes, vec![ModeChange::Limit(ModeSign::Minus, None)]);

        // +l with a garbage argument is dropped
        let (changes, used) = parse_mode_string("+l", &["many"]);
        assert_eq!(used, 1);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_parse_missing_args_dropped() {
        let (changes, _) = parse_mode_string("+kob", &["onlykey"]);
        assert_eq!(changes, vec![ModeChange::Key(ModeSign::Plus, "onlykey")]);
    }

    #[test]
    fn test_parse_unknown_letter() {
        let (changes, _) = parse_mode_string("+x", &[]);
        assert_eq!(changes, vec![ModeChange::Unknown(ModeSign::Plus, 'x')]);
    }

    #[test]
    fn test_flags_set_ops() {
        let mut a = ChannelFlags::empty();
        a.insert(ChannelFlag::NoPrivmsgs);
        a.insert(ChannelFlag::TopicLimit);
        let mut b = ChannelFlags::empty();
        b.insert(ChannelFlag::InviteOnly);

        let u = a.union(b);
        assert!(u.contains(ChannelFlag::NoPrivmsgs));
        assert!(u.contains(ChannelFlag::InviteOnly));
        assert_eq!(u.letters(), "tin");

        let mut c = u;
        c.remove(ChannelFlag::InviteOnly);
        assert!(!c.contains(ChannelFlag::InviteOnly));
    }
}
