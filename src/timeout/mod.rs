//! Per-peer request timeouts.
//!
//! Every peer owns a [`Timeouts`] set with one slot per [`TimeoutKind`]. A slot
//! moves `Disarmed → Armed(deadline) → Disarmed | Fired`; re-arming replaces
//! the deadline and bumps the slot's generation so older queue entries go
//! stale. Disarming and firing take the same lock, so exactly one of them wins
//! for a given arming.
//!
//! Deadlines of all peers of a transport live in one [`TimerQueue`], a
//! min-heap drained by a single timer task per transport.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::Notify;

use crate::peer::PeerId;

/// The independent timers a peer can have armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutKind {
    /// Request line and headers must arrive before this fires.
    Header,
    /// A declared body must arrive before this fires.
    Body,
    /// An idle keep-alive connection is closed when this fires.
    Keepalive,
}

impl TimeoutKind {
    const ALL: [TimeoutKind; 3] = [Self::Header, Self::Body, Self::Keepalive];

    fn index(self) -> usize {
        self as usize
    }

    /// Whether expiry is answered with `408 Request Timeout` (the client is
    /// mid-request) rather than a silent close.
    pub fn sends_response(self) -> bool {
        matches!(self, Self::Header | Self::Body)
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Header => "header",
            Self::Body => "body",
            Self::Keepalive => "keepalive",
        })
    }
}

/// Outcome of [`Timeouts::disarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disarm {
    Cancelled,
    NotArmed,
    /// The timer already fired; its expiry is being handled.
    AlreadyFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Disarmed,
    Armed(Instant),
    Fired,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The timeout slots of one peer.
#[derive(Debug)]
pub struct Timeouts {
    slots: Mutex<[Slot; 3]>,
}

impl Default for Timeouts {
    fn default() -> Self {
        let slot = Slot {
            state: SlotState::Disarmed,
            generation: 0,
        };
        Self {
            slots: Mutex::new([slot; 3]),
        }
    }
}

impl Timeouts {
    /// Arms `kind` to expire at `deadline`, replacing any earlier deadline.
    /// Returns the generation the matching queue entry must carry.
    pub fn arm(&self, kind: TimeoutKind, deadline: Instant) -> u64 {
        let mut slots = lock(&self.slots);
        let slot = &mut slots[kind.index()];
        slot.generation += 1;
        slot.state = SlotState::Armed(deadline);
        slot.generation
    }

    pub fn disarm(&self, kind: TimeoutKind) -> Disarm {
        let mut slots = lock(&self.slots);
        let slot = &mut slots[kind.index()];
        match slot.state {
            SlotState::Armed(_) => {
                slot.state = SlotState::Disarmed;
                Disarm::Cancelled
            }
            SlotState::Fired => Disarm::AlreadyFired,
            SlotState::Disarmed => Disarm::NotArmed,
        }
    }

    pub fn disarm_all(&self) {
        for kind in TimeoutKind::ALL {
            self.disarm(kind);
        }
    }

    /// Transitions `kind` to fired if it is still armed with `generation` and
    /// its deadline has passed. Returns `true` exactly once per arming.
    pub fn try_fire(&self, kind: TimeoutKind, generation: u64, now: Instant) -> bool {
        let mut slots = lock(&self.slots);
        let slot = &mut slots[kind.index()];
        match slot.state {
            SlotState::Armed(deadline) if slot.generation == generation && deadline <= now => {
                slot.state = SlotState::Fired;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimeoutKind) -> bool {
        matches!(lock(&self.slots)[kind.index()].state, SlotState::Armed(_))
    }

    pub fn has_fired(&self, kind: TimeoutKind) -> bool {
        lock(&self.slots)[kind.index()].state == SlotState::Fired
    }

    pub fn deadline(&self, kind: TimeoutKind) -> Option<Instant> {
        match lock(&self.slots)[kind.index()].state {
            SlotState::Armed(deadline) => Some(deadline),
            _ => None,
        }
    }
}

/// One scheduled expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entry {
    pub deadline: Instant,
    pub generation: u64,
    pub peer: PeerId,
    pub kind: TimeoutKind,
}

/// Min-heap of deadlines for every peer of a transport.
///
/// Entries are never removed on disarm; they are discarded when popped if the
/// slot no longer matches.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    wake: Notify,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, entry: Entry) {
        let earliest = {
            let mut heap = lock(&self.heap);
            let earliest = heap.peek().is_none_or(|Reverse(top)| entry.deadline < top.deadline);
            heap.push(Reverse(entry));
            earliest
        };
        if earliest {
            self.wake.notify_one();
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        lock(&self.heap).peek().map(|Reverse(e)| e.deadline)
    }

    /// Removes and returns every entry due at `now`, earliest first.
    pub fn pop_expired(&self, now: Instant) -> Vec<Entry> {
        let mut heap = lock(&self.heap);
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        lock(&self.heap).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.heap).is_empty()
    }

    /// Resolves when a new earliest deadline was scheduled.
    pub async fn rescheduled(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fire_once_per_arming() {
        let t = Timeouts::default();
        let now = Instant::now();
        let generation = t.arm(TimeoutKind::Header, now);
        assert!(t.try_fire(TimeoutKind::Header, generation, now));
        assert!(!t.try_fire(TimeoutKind::Header, generation, now));
        assert_eq!(t.disarm(TimeoutKind::Header), Disarm::AlreadyFired);
    }

    #[test]
    fn disarm_beats_later_fire() {
        let t = Timeouts::default();
        let now = Instant::now();
        let generation = t.arm(TimeoutKind::Body, now);
        assert_eq!(t.disarm(TimeoutKind::Body), Disarm::Cancelled);
        assert!(!t.try_fire(TimeoutKind::Body, generation, now));
        assert_eq!(t.disarm(TimeoutKind::Body), Disarm::NotArmed);
    }

    #[test]
    fn rearm_makes_old_entries_stale() {
        let t = Timeouts::default();
        let now = Instant::now();
        let first = t.arm(TimeoutKind::Keepalive, now);
        let second = t.arm(TimeoutKind::Keepalive, now + Duration::from_secs(60));
        assert!(!t.try_fire(TimeoutKind::Keepalive, first, now));
        assert!(!t.try_fire(TimeoutKind::Keepalive, second, now));
        assert!(t.try_fire(TimeoutKind::Keepalive, second, now + Duration::from_secs(61)));
    }

    #[test]
    fn kinds_are_independent() {
        let t = Timeouts::default();
        let now = Instant::now();
        let header = t.arm(TimeoutKind::Header, now);
        t.arm(TimeoutKind::Body, now);
        assert_eq!(t.disarm(TimeoutKind::Body), Disarm::Cancelled);
        assert!(t.is_armed(TimeoutKind::Header));
        assert!(t.try_fire(TimeoutKind::Header, header, now));
        assert!(t.has_fired(TimeoutKind::Header));
    }

    #[test]
    fn queue_pops_in_deadline_order() {
        let q = TimerQueue::new();
        let base = Instant::now();
        for (offset, peer) in [(30, 1), (10, 2), (20, 3)] {
            q.schedule(Entry {
                deadline: base + Duration::from_millis(offset),
                generation: 1,
                peer,
                kind: TimeoutKind::Header,
            });
        }
        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(10)));
        let due = q.pop_expired(base + Duration::from_millis(25));
        assert_eq!(due.iter().map(|e| e.peer).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn earlier_deadline_wakes_the_timer_task() {
        let q = TimerQueue::new();
        q.schedule(Entry {
            deadline: Instant::now(),
            generation: 1,
            peer: 1,
            kind: TimeoutKind::Header,
        });
        tokio::time::timeout(Duration::from_secs(1), q.rescheduled())
            .await
            .expect("notification should be stored");
    }
}
