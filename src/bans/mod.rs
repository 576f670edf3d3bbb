//! The ban control planes: G-lines (users), BADCHANs (channels) and
//! jupes (servers).
//!
//! All three share a lifecycle: a mask, a reason, an absolute expiry,
//! a lamport-style `lastmod` version, and active/local/locally-
//! deactivated flags. Local entries never propagate. Conflicting
//! activation state is resolved by `lastmod`: strictly higher wins,
//! equal during burst is a no-op, and an out-of-date peer gets our
//! version resent.

pub mod gline;
pub mod jupe;

pub use gline::{check_mask, AddOutcome, Gline, GlineList, GlineMask, MaskCheck};
pub use jupe::{Jupe, JupeList};

/// Shared flag block for control-plane entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlFlags {
    /// Globally in force (the network-wide bit).
    pub active: bool,
    /// Created locally; never propagated.
    pub local: bool,
    /// Deactivated on this server only.
    pub ldeact: bool,
}

impl ControlFlags {
    /// In force on this server right now (expiry not considered).
    pub fn in_force(&self) -> bool {
        self.active && !self.ldeact
    }
}

/// Bump-or-adopt rule for `lastmod` on activation changes: the version
/// must strictly increase so the change propagates as news.
pub fn advance_lastmod(current: i64, incoming: i64) -> i64 {
    if current >= incoming {
        current + 1
    } else {
        incoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_lastmod_strictly_increases() {
        assert_eq!(advance_lastmod(10, 9), 11);
        assert_eq!(advance_lastmod(10, 10), 11);
        assert_eq!(advance_lastmod(10, 15), 15);
    }

    #[test]
    fn test_in_force() {
        let mut f = ControlFlags {
            active: true,
            ..Default::default()
        };
        assert!(f.in_force());
        f.ldeact = true;
        assert!(!f.in_force());
    }
}
