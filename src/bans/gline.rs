//! G-lines: globally propagated user bans, plus BADCHANs.
//!
//! The overlap rules keep the list minimal without ever weakening it:
//! a narrower mask that expires no later than a wider one it sits
//! inside is refused, and a wider mask absorbs narrower ones that
//! expire no later than it does. Realname masks take no part in
//! containment; they compare by folded equality only.

use std::net::IpAddr;

use ipnet::IpNet;

use tenth_proto::{ipmask_parse, irc_eq, irc_to_lower, mask_contains, match_cidr, match_mask};

use crate::bans::ControlFlags;

/// What a G-line matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlineMask {
    /// `user@host`; the host side may be a CIDR mask.
    UserHost {
        user: String,
        host: String,
        ip: Option<IpNet>,
    },
    /// `$R<pattern>` matched against realnames.
    Realname(String),
    /// `#channel`: joins refused, no user exits.
    BadChan(String),
}

impl GlineMask {
    /// Parse the wire form of a mask.
    pub fn parse(mask: &str) -> GlineMask {
        if mask.starts_with('#') || mask.starts_with('&') {
            return GlineMask::BadChan(mask.to_string());
        }
        if let Some(pattern) = mask.strip_prefix("$R") {
            return GlineMask::Realname(pattern.to_string());
        }
        let (user, host) = match mask.split_once('@') {
            Some((u, h)) => (u.to_string(), h.to_string()),
            None => ("*".to_string(), mask.to_string()),
        };
        let ip = ipmask_parse(&host);
        GlineMask::UserHost { user, host, ip }
    }

    /// Render back to the wire form.
    pub fn render(&self) -> String {
        match self {
            GlineMask::UserHost { user, host, .. } => format!("{}@{}", user, host),
            GlineMask::Realname(pattern) => format!("$R{}", pattern),
            GlineMask::BadChan(name) => name.clone(),
        }
    }

    pub fn is_badchan(&self) -> bool {
        matches!(self, GlineMask::BadChan(_))
    }

    /// Exact identity under case folding.
    pub fn same_as(&self, other: &GlineMask) -> bool {
        match (self, other) {
            (
                GlineMask::UserHost { user: u1, host: h1, .. },
                GlineMask::UserHost { user: u2, host: h2, .. },
            ) => irc_eq(u1, u2) && irc_eq(h1, h2),
            (GlineMask::Realname(a), GlineMask::Realname(b)) => irc_eq(a, b),
            (GlineMask::BadChan(a), GlineMask::BadChan(b)) => irc_eq(a, b),
            _ => false,
        }
    }

    /// True when `self` covers every target `other` covers. Realname
    /// masks deliberately fall back to equality.
    pub fn contains(&self, other: &GlineMask) -> bool {
        match (self, other) {
            (
                GlineMask::UserHost {
                    user: u1,
                    host: h1,
                    ip: ip1,
                },
                GlineMask::UserHost {
                    user: u2,
                    host: h2,
                    ip: ip2,
                },
            ) => {
                if !mask_contains(u1, u2) {
                    return false;
                }
                // Two IP-form hosts compare as networks; the wildcard
                // matcher sees `/24` as literal text and misses.
                match (ip1, ip2) {
                    (Some(wider), Some(narrower)) => {
                        wider.prefix_len() <= narrower.prefix_len()
                            && wider.contains(&narrower.network())
                    }
                    _ => mask_contains(h1, h2),
                }
            }
            (GlineMask::Realname(a), GlineMask::Realname(b)) => irc_eq(a, b),
            _ => false,
        }
    }
}

/// One G-line or BADCHAN entry.
#[derive(Debug, Clone)]
pub struct Gline {
    pub mask: GlineMask,
    pub reason: String,
    /// Absolute expiry, engine clock.
    pub expire: i64,
    /// Monotonic per-ban version; zero means "no version", which burst
    /// skips.
    pub lastmod: i64,
    pub flags: ControlFlags,
}

impl Gline {
    /// In force right now.
    pub fn is_active(&self, now: i64) -> bool {
        self.flags.in_force() && self.expire > now
    }

    /// Does this entry hit the given user?
    pub fn matches_user(&self, username: &str, host: &str, ip: IpAddr, realname: &str) -> bool {
        match &self.mask {
            GlineMask::UserHost {
                user,
                host: mask_host,
                ip: mask_ip,
            } => {
                if !match_mask(user, username) {
                    return false;
                }
                match mask_ip {
                    Some(net) => net.contains(&ip),
                    None => {
                        match_mask(mask_host, host)
                            || match_cidr(mask_host, ip).unwrap_or(false)
                    }
                }
            }
            GlineMask::Realname(pattern) => match_mask(pattern, realname),
            GlineMask::BadChan(_) => false,
        }
    }
}

/// Outcome of [`GlineList::add`].
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted; the index is valid until the next mutation.
    Added(usize),
    /// Swallowed by a wider, longer-lived entry; not an error, just
    /// nothing to do or propagate.
    Overlapped,
}

/// The G-line/BADCHAN table.
#[derive(Default)]
pub struct GlineList {
    entries: Vec<Gline>,
}

impl GlineList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily drop expired entries.
    pub fn expire_sweep(&mut self, now: i64) {
        self.entries.retain(|g| g.expire > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Gline> {
        self.entries.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gline> {
        self.entries.iter()
    }

    /// Install a new entry, applying the overlap rules for user masks.
    pub fn add(
        &mut self,
        mask: GlineMask,
        reason: String,
        expire: i64,
        lastmod: i64,
        flags: ControlFlags,
        now: i64,
    ) -> AddOutcome {
        self.expire_sweep(now);

        if !mask.is_badchan() {
            let mut absorbed = Vec::new();
            for (i, existing) in self.entries.iter().enumerate() {
                if existing.mask.is_badchan() || existing.flags.local != flags.local {
                    continue;
                }
                if existing.mask.contains(&mask) {
                    if expire <= existing.expire {
                        // Narrower and no longer-lived: refused.
                        return AddOutcome::Overlapped;
                    }
                } else if mask.contains(&existing.mask) && existing.expire <= expire {
                    absorbed.push(i);
                }
            }
            for i in absorbed.into_iter().rev() {
                self.entries.remove(i);
            }
        }

        self.entries.push(Gline {
            mask,
            reason,
            expire,
            lastmod,
            flags,
        });
        AddOutcome::Added(self.entries.len() - 1)
    }

    /// Exact-mask lookup (expired entries are freed first).
    pub fn find_exact(&mut self, mask: &GlineMask, now: i64) -> Option<usize> {
        self.expire_sweep(now);
        self.entries.iter().position(|g| g.mask.same_as(mask))
    }

    /// First active entry matching a user, if any.
    pub fn check_user(
        &mut self,
        username: &str,
        host: &str,
        ip: IpAddr,
        realname: &str,
        now: i64,
    ) -> Option<&Gline> {
        self.expire_sweep(now);
        self.entries
            .iter()
            .find(|g| g.is_active(now) && g.matches_user(username, host, ip, realname))
    }

    /// Active BADCHAN covering a channel name, if any.
    pub fn check_channel(&mut self, name: &str, now: i64) -> Option<&Gline> {
        self.expire_sweep(now);
        let folded = irc_to_lower(name);
        self.entries.iter().find(|g| {
            g.is_active(now)
                && matches!(&g.mask, GlineMask::BadChan(chan) if match_mask(chan, &folded))
        })
    }

    /// Apply an activation. `local_only` toggles only the local bit.
    pub fn activate(&mut self, idx: usize, lastmod: i64, local_only: bool) {
        let Some(g) = self.entries.get_mut(idx) else {
            return;
        };
        if local_only {
            g.flags.ldeact = false;
        } else {
            g.flags.active = true;
            if g.lastmod != 0 {
                g.lastmod = crate::bans::advance_lastmod(g.lastmod, lastmod);
            }
        }
    }

    /// Apply a deactivation. Entries without a version (`lastmod == 0`)
    /// are removed outright when deactivated globally, as are local
    /// entries. Returns true when the entry was freed.
    pub fn deactivate(&mut self, idx: usize, lastmod: i64, local_only: bool) -> bool {
        let Some(g) = self.entries.get_mut(idx) else {
            return false;
        };
        if g.flags.local || (g.lastmod == 0 && !local_only) {
            self.entries.remove(idx);
            return true;
        }
        if local_only {
            g.flags.ldeact = true;
        } else {
            g.flags.active = false;
            if g.lastmod != 0 {
                g.lastmod = crate::bans::advance_lastmod(g.lastmod, lastmod);
            }
        }
        false
    }

    /// Entries worth bursting: versioned and not local.
    pub fn burstable(&self, now: i64) -> Vec<&Gline> {
        self.entries
            .iter()
            .filter(|g| g.lastmod != 0 && !g.flags.local && g.expire > now)
            .collect()
    }
}

/// Verdict of the local mask-width check applied to operator G-lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskCheck {
    /// Wild enough to be dangerous: refused outright.
    Rejected,
    /// Wild, but passes the minimums; needs the override privilege.
    Overridable,
    /// No wildcards at all.
    Approved,
}

/// Host masks need at least two non-wild domain components, IP masks
/// at least 16 mask bits. A mask with no wildcards is always fine.
pub fn check_mask(mask: &str) -> MaskCheck {
    let host = match mask.split_once('@') {
        Some((_, h)) => h,
        None => mask,
    };

    let mut wilds = false;
    let mut dots = 0u32;
    let mut ipmask_bits: Option<u32> = None;
    let mut all_digits_or_dots = true;
    // Wildness of the rightmost two components seen so far.
    let mut last_component_wild = false;
    let mut current_wild = false;

    let mut chars = host.chars();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                dots += 1;
                last_component_wild = current_wild;
                current_wild = false;
            }
            '*' | '?' => {
                wilds = true;
                current_wild = true;
                all_digits_or_dots = false;
            }
            '/' => {
                // n.n.n.n/bits or v6/bits notation
                let rest: String = chars.by_ref().collect();
                match rest.parse::<u32>() {
                    Ok(bits) => {
                        if wilds {
                            return MaskCheck::Rejected;
                        }
                        let max = if dots == 0 { 128 } else { 32 };
                        if (dots != 0 && dots != 3) || bits > max {
                            return MaskCheck::Rejected;
                        }
                        if bits < max {
                            wilds = true;
                        }
                        ipmask_bits = Some(bits);
                    }
                    Err(_) => return MaskCheck::Rejected,
                }
                break;
            }
            c if c.is_ascii_digit() => {}
            _ => all_digits_or_dots = false,
        }
    }

    if !wilds {
        return MaskCheck::Approved;
    }

    if let Some(bits) = ipmask_bits {
        if bits >= 16 {
            return MaskCheck::Overridable;
        }
        return MaskCheck::Rejected;
    }

    // A plain-number mask with wilds can cover enormous IP space.
    if all_digits_or_dots {
        return MaskCheck::Rejected;
    }

    // The two rightmost domain components must be free of wildcards.
    if dots >= 2 && !current_wild && !last_component_wild {
        return MaskCheck::Overridable;
    }
    MaskCheck::Rejected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_active() -> ControlFlags {
        ControlFlags {
            active: true,
            local: false,
            ldeact: false,
        }
    }

    fn add(
        list: &mut GlineList,
        mask: &str,
        expire: i64,
        lastmod: i64,
        now: i64,
    ) -> AddOutcome {
        list.add(
            GlineMask::parse(mask),
            "test".into(),
            expire,
            lastmod,
            flags_active(),
            now,
        )
    }

    #[test]
    fn test_narrower_with_earlier_expiry_rejected() {
        let mut list = GlineList::new();
        assert!(matches!(
            add(&mut list, "*@192.0.2.*", 2000, 1, 100),
            AddOutcome::Added(_)
        ));
        // Narrower mask expiring no later than the wider one: refused.
        assert_eq!(
            add(&mut list, "*@192.0.2.42", 1500, 2, 100),
            AddOutcome::Overlapped
        );
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_wider_absorbs_narrower() {
        let mut list = GlineList::new();
        add(&mut list, "*@192.0.2.42", 1500, 1, 100);
        add(&mut list, "*@192.0.2.43", 1400, 2, 100);
        // Wider and longer-lived: both narrower entries go away.
        assert!(matches!(
            add(&mut list, "*@192.0.2.*", 2000, 3, 100),
            AddOutcome::Added(_)
        ));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().mask.render(), "*@192.0.2.*");
    }

    #[test]
    fn test_cidr_narrower_with_earlier_expiry_rejected() {
        let mut list = GlineList::new();
        add(&mut list, "*@192.0.2.0/24", 2000, 1, 100);
        // A bare IP parses as a /32 inside the /24; expiring no later,
        // it is refused.
        assert_eq!(
            add(&mut list, "*@192.0.2.42", 1500, 2, 100),
            AddOutcome::Overlapped
        );
        assert_eq!(list.len(), 1);
        // A narrower subnet that outlives the wider one is kept.
        assert!(matches!(
            add(&mut list, "*@192.0.2.0/28", 9000, 3, 100),
            AddOutcome::Added(_)
        ));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_cidr_wider_absorbs_bare_ips() {
        let mut list = GlineList::new();
        add(&mut list, "*@192.0.2.42", 1400, 1, 100);
        add(&mut list, "*@192.0.2.43", 1500, 2, 100);
        assert!(matches!(
            add(&mut list, "*@192.0.2.0/24", 2000, 3, 100),
            AddOutcome::Added(_)
        ));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().mask.render(), "*@192.0.2.0/24");
    }

    #[test]
    fn test_cidr_containment_is_directional() {
        let wider = GlineMask::parse("*@192.0.2.0/24");
        let narrower = GlineMask::parse("*@192.0.2.42");
        assert!(wider.contains(&narrower));
        assert!(!narrower.contains(&wider));
        // Different networks contain neither way.
        let other = GlineMask::parse("*@198.51.100.0/24");
        assert!(!wider.contains(&other));
        assert!(!other.contains(&wider));
    }

    #[test]
    fn test_narrower_outliving_wider_is_kept() {
        let mut list = GlineList::new();
        add(&mut list, "*@192.0.2.*", 1500, 1, 100);
        assert!(matches!(
            add(&mut list, "*@192.0.2.42", 9000, 2, 100),
            AddOutcome::Added(_)
        ));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_realname_masks_compare_by_equality_only() {
        let mut list = GlineList::new();
        add(&mut list, "$Rbad person", 2000, 1, 100);
        // A "wider" realname pattern does not absorb; containment is
        // not analyzed for realname bans.
        assert!(matches!(
            add(&mut list, "$Rbad*", 3000, 2, 100),
            AddOutcome::Added(_)
        ));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_badchan_skips_overlap() {
        let mut list = GlineList::new();
        add(&mut list, "#bad*", 2000, 1, 100);
        assert!(matches!(
            add(&mut list, "#badness", 1500, 2, 100),
            AddOutcome::Added(_)
        ));
        assert_eq!(list.len(), 2);

        let hit = list.check_channel("#BADNESS", 100).unwrap();
        assert!(hit.mask.is_badchan());
    }

    #[test]
    fn test_check_user_matches_cidr() {
        let mut list = GlineList::new();
        add(&mut list, "*@192.0.2.0/24", 2000, 1, 100);
        let hit = list.check_user("joe", "host.example", "192.0.2.7".parse().unwrap(), "joe", 100);
        assert!(hit.is_some());
        let miss = list.check_user("joe", "host.example", "198.51.100.7".parse().unwrap(), "joe", 100);
        assert!(miss.is_none());
    }

    #[test]
    fn test_deactivate_lastmod_advances() {
        let mut list = GlineList::new();
        add(&mut list, "*@bad.example.com", 2000, 10, 100);
        // An incoming deactivation with an older version still forces
        // the local version up so the change propagates as news.
        list.deactivate(0, 9, false);
        let g = list.get(0).unwrap();
        assert!(!g.flags.active);
        assert_eq!(g.lastmod, 11);
    }

    #[test]
    fn test_local_deactivate_only_flags() {
        let mut list = GlineList::new();
        add(&mut list, "*@bad.example.com", 2000, 10, 100);
        list.deactivate(0, 0, true);
        let g = list.get(0).unwrap();
        assert!(g.flags.active);
        assert!(g.flags.ldeact);
        assert!(!g.is_active(100));

        list.activate(0, 0, true);
        assert!(list.get(0).unwrap().is_active(100));
    }

    #[test]
    fn test_expire_sweep() {
        let mut list = GlineList::new();
        add(&mut list, "*@bad.example.com", 150, 1, 100);
        assert_eq!(list.find_exact(&GlineMask::parse("*@bad.example.com"), 200), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_check_mask_rules() {
        // No wildcards: always allowed.
        assert_eq!(check_mask("user@host.example.com"), MaskCheck::Approved);
        // Two non-wild trailing components.
        assert_eq!(check_mask("*@*.example.com"), MaskCheck::Overridable);
        // Only one non-wild component.
        assert_eq!(check_mask("*@*.com"), MaskCheck::Rejected);
        // IP mask with enough bits.
        assert_eq!(check_mask("*@192.0.2.0/24"), MaskCheck::Overridable);
        // IP mask too wide.
        assert_eq!(check_mask("*@192.0.0.0/8"), MaskCheck::Rejected);
        // Wildcarded CIDR is malformed.
        assert_eq!(check_mask("*@192.0.2.*/24"), MaskCheck::Rejected);
    }
}
