//! The timer heap.
//!
//! Absolute-expiry min-heap driving the periodic sweepers (connection
//! attempts, ping checks, expired-ban destruction) and one-shot
//! deadlines. Timers are cancellable by handle; cancellation is lazy,
//! cleaned up when the stale heap entry surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// What a timer firing means to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Scan connections for ping probes and timeouts.
    PingSweep,
    /// Try autoconnect link blocks that are down.
    ConnectSweep,
    /// Lazily free expired G-lines and jupes.
    ExpireSweep,
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    kind: TimerKind,
    when: i64,
    period: Option<i64>,
}

/// Min-heap of timers keyed by absolute expiry (engine clock seconds).
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<(i64, u64)>>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, when: i64, kind: TimerKind, period: Option<i64>) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, TimerEntry { kind, when, period });
        self.heap.push(Reverse((when, id)));
        TimerId(id)
    }

    /// One-shot, relative.
    pub fn schedule_in(&mut self, now: i64, delay: i64, kind: TimerKind) -> TimerId {
        self.push(now + delay, kind, None)
    }

    /// One-shot, absolute.
    pub fn schedule_at(&mut self, when: i64, kind: TimerKind) -> TimerId {
        self.push(when, kind, None)
    }

    /// Fires every `period` seconds, first firing one period from now.
    pub fn periodic(&mut self, now: i64, period: i64, kind: TimerKind) -> TimerId {
        self.push(now + period, kind, Some(period))
    }

    /// Delete by handle. Safe on already-fired timers.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id.0);
    }

    /// Earliest live deadline. Lazily discards cancelled residue.
    pub fn next_deadline(&mut self) -> Option<i64> {
        while let Some(Reverse((when, id))) = self.heap.peek().copied() {
            match self.entries.get(&id) {
                // A rescheduled periodic timer leaves its old heap slot
                // behind; drop slots whose time no longer matches.
                Some(entry) if entry.when == when => return Some(when),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Fire everything due at `now`; periodic timers are rescheduled.
    pub fn pop_due(&mut self, now: i64) -> Vec<(TimerId, TimerKind)> {
        let mut fired = Vec::new();
        loop {
            match self.next_deadline() {
                Some(when) if when <= now => {}
                _ => break,
            }
            let Reverse((_, id)) = self.heap.pop().expect("deadline implies entry");
            let entry = self.entries.get_mut(&id).expect("live entry");
            let kind = entry.kind;
            match entry.period {
                Some(period) => {
                    entry.when = now + period;
                    self.heap.push(Reverse((entry.when, id)));
                }
                None => {
                    self.entries.remove(&id);
                }
            }
            fired.push((TimerId(id), kind));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_fires_once() {
        let mut timers = TimerHeap::new();
        timers.schedule_in(100, 5, TimerKind::ExpireSweep);
        assert_eq!(timers.next_deadline(), Some(105));
        assert!(timers.pop_due(104).is_empty());

        let fired = timers.pop_due(105);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, TimerKind::ExpireSweep);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_periodic_reschedules() {
        let mut timers = TimerHeap::new();
        timers.periodic(100, 10, TimerKind::PingSweep);
        assert_eq!(timers.pop_due(110).len(), 1);
        assert_eq!(timers.next_deadline(), Some(120));
        assert_eq!(timers.pop_due(125).len(), 1);
        assert_eq!(timers.next_deadline(), Some(135));
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerHeap::new();
        let a = timers.schedule_at(105, TimerKind::ConnectSweep);
        timers.schedule_at(110, TimerKind::PingSweep);
        timers.cancel(a);
        assert_eq!(timers.next_deadline(), Some(110));
        let fired = timers.pop_due(120);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, TimerKind::PingSweep);
    }

    #[test]
    fn test_ordering_across_kinds() {
        let mut timers = TimerHeap::new();
        timers.schedule_at(300, TimerKind::ExpireSweep);
        timers.schedule_at(100, TimerKind::PingSweep);
        timers.schedule_at(200, TimerKind::ConnectSweep);

        let fired: Vec<TimerKind> = timers.pop_due(300).into_iter().map(|(_, k)| k).collect();
        assert_eq!(
            fired,
            vec![
                TimerKind::PingSweep,
                TimerKind::ConnectSweep,
                TimerKind::ExpireSweep
            ]
        );
    }
}
