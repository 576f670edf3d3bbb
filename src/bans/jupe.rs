//! Jupes: server-name bans.
//!
//! A juped name may not link; an existing server matching a fresh jupe
//! is SQUIT by the handler layer. Same `lastmod` ordering as G-lines,
//! without the overlap algebra (server-name masks are few and flat).

use tenth_proto::{irc_eq, match_mask};

use crate::bans::ControlFlags;

/// One jupe entry.
#[derive(Debug, Clone)]
pub struct Jupe {
    /// Server-name mask.
    pub mask: String,
    pub reason: String,
    pub expire: i64,
    pub lastmod: i64,
    pub flags: ControlFlags,
}

impl Jupe {
    pub fn is_active(&self, now: i64) -> bool {
        self.flags.in_force() && self.expire > now
    }
}

/// The jupe table.
#[derive(Default)]
pub struct JupeList {
    entries: Vec<Jupe>,
}

impl JupeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire_sweep(&mut self, now: i64) {
        self.entries.retain(|j| j.expire > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Jupe> {
        self.entries.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Jupe> {
        self.entries.iter()
    }

    /// Insert; an existing entry with the same mask is replaced only
    /// through activate/deactivate, so `add` refuses duplicates.
    pub fn add(
        &mut self,
        mask: String,
        reason: String,
        expire: i64,
        lastmod: i64,
        flags: ControlFlags,
        now: i64,
    ) -> Option<usize> {
        self.expire_sweep(now);
        if self.entries.iter().any(|j| irc_eq(&j.mask, &mask)) {
            return None;
        }
        self.entries.push(Jupe {
            mask,
            reason,
            expire,
            lastmod,
            flags,
        });
        Some(self.entries.len() - 1)
    }

    /// Exact-mask lookup, expired entries freed first.
    pub fn find_exact(&mut self, mask: &str, now: i64) -> Option<usize> {
        self.expire_sweep(now);
        self.entries.iter().position(|j| irc_eq(&j.mask, mask))
    }

    /// Active jupe covering a server name, if any.
    pub fn check_server(&mut self, name: &str, now: i64) -> Option<&Jupe> {
        self.expire_sweep(now);
        self.entries
            .iter()
            .find(|j| j.is_active(now) && match_mask(&j.mask, name))
    }

    pub fn activate(&mut self, idx: usize, lastmod: i64, local_only: bool) {
        let Some(j) = self.entries.get_mut(idx) else {
            return;
        };
        if local_only {
            j.flags.ldeact = false;
        } else {
            j.flags.active = true;
            if j.lastmod != 0 {
                j.lastmod = crate::bans::advance_lastmod(j.lastmod, lastmod);
            }
        }
    }

    /// Returns true when the entry was freed (local jupes go away on
    /// deactivation).
    pub fn deactivate(&mut self, idx: usize, lastmod: i64, local_only: bool) -> bool {
        let Some(j) = self.entries.get_mut(idx) else {
            return false;
        };
        if j.flags.local {
            self.entries.remove(idx);
            return true;
        }
        if local_only {
            j.flags.ldeact = true;
        } else {
            j.flags.active = false;
            if j.lastmod != 0 {
                j.lastmod = crate::bans::advance_lastmod(j.lastmod, lastmod);
            }
        }
        false
    }

    /// Entries worth bursting: versioned and not local.
    pub fn burstable(&self, now: i64) -> Vec<&Jupe> {
        self.entries
            .iter()
            .filter(|j| j.lastmod != 0 && !j.flags.local && j.expire > now)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> ControlFlags {
        ControlFlags {
            active: true,
            local: false,
            ldeact: false,
        }
    }

    #[test]
    fn test_check_server_by_mask() {
        let mut list = JupeList::new();
        list.add("*.bad.example".into(), "rogue".into(), 2000, 1, active(), 100);
        assert!(list.check_server("leaf.bad.example", 100).is_some());
        assert!(list.check_server("ok.example", 100).is_none());
        // expired
        assert!(list.check_server("leaf.bad.example", 3000).is_none());
    }

    #[test]
    fn test_duplicate_add_refused() {
        let mut list = JupeList::new();
        assert!(list
            .add("x.example".into(), "a".into(), 2000, 1, active(), 100)
            .is_some());
        assert!(list
            .add("X.example".into(), "b".into(), 2500, 2, active(), 100)
            .is_none());
    }

    #[test]
    fn test_lastmod_ordering_on_toggle() {
        let mut list = JupeList::new();
        list.add("x.example".into(), "a".into(), 2000, 10, active(), 100);
        list.deactivate(0, 4, false);
        // Out-of-date incoming version still advances ours.
        assert_eq!(list.get(0).unwrap().lastmod, 11);
        list.activate(0, 20, false);
        assert_eq!(list.get(0).unwrap().lastmod, 20);
        assert!(list.get(0).unwrap().is_active(100));
    }

    #[test]
    fn test_local_jupe_freed_on_deactivate() {
        let mut list = JupeList::new();
        let flags = ControlFlags {
            active: true,
            local: true,
            ldeact: false,
        };
        list.add("x.example".into(), "a".into(), 2000, 0, flags, 100);
        assert!(list.deactivate(0, 0, false));
        assert!(list.is_empty());
    }
}
