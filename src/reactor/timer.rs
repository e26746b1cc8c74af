use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::reactor::core::EventLoop;

pub(crate) type TimerCallback = Box<dyn FnMut(&mut EventLoop)>;

/// Opaque token identifying a scheduled timer, used only for cancellation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

pub(crate) struct TimerState {
    pub(crate) callback: TimerCallback,
    /// Zero means one-shot.
    pub(crate) interval: Duration,
}

/// Expiration-ordered timer collection.
///
/// A binary min-heap orders `(deadline, seq)` slots; the side map from id to
/// callback state is the source of truth for liveness. Cancellation only
/// removes the map entry, leaving a stale heap slot to be pruned when it
/// surfaces. Schedule is O(log n), cancel O(1).
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Slot>,
    live: HashMap<TimerId, TimerState>,
    next_id: u64,
    next_seq: u64,
    firing: Option<TimerId>,
    firing_cancelled: bool,
}

struct Slot {
    deadline: Instant,
    seq: u64,
    id: TimerId,
}

impl Eq for Slot {}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
            next_seq: 0,
            firing: None,
            firing_cancelled: false,
        }
    }

    pub(crate) fn insert(
        &mut self,
        deadline: Instant,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        self.live.insert(id, TimerState { callback, interval });
        self.push_slot(deadline, id);

        id
    }

    /// Cancels a timer. Unknown, already-fired, and already-cancelled ids
    /// are no-ops.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id);

        if self.firing == Some(id) {
            self.firing_cancelled = true;
        }
    }

    /// Ceiling of the time remaining until the earliest live deadline, in
    /// whole milliseconds; `None` when no timers are pending. Rounding up
    /// guarantees the poller never wakes before the deadline.
    pub(crate) fn next_timeout_ms(&mut self, now: Instant) -> Option<u64> {
        self.prune();

        let slot = self.heap.peek()?;
        Some(ceil_millis(slot.deadline.saturating_duration_since(now)))
    }

    /// Pops the earliest live entry whose deadline is at or before `now`,
    /// removing it from the map. Stale slots are skipped.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(TimerId, TimerState)> {
        loop {
            self.prune();

            if self.heap.peek()?.deadline > now {
                return None;
            }

            let slot = self.heap.pop()?;
            if let Some(state) = self.live.remove(&slot.id) {
                return Some((slot.id, state));
            }
        }
    }

    /// Marks `id` as the timer currently running its callback, so that a
    /// cancel issued from within the callback is not lost when the entry
    /// has already been popped.
    pub(crate) fn begin_fire(&mut self, id: TimerId) {
        self.firing = Some(id);
        self.firing_cancelled = false;
    }

    /// Ends the firing window; returns whether the timer survived it.
    pub(crate) fn finish_fire(&mut self) -> bool {
        self.firing = None;
        !self.firing_cancelled
    }

    pub(crate) fn rearm(&mut self, id: TimerId, state: TimerState, deadline: Instant) {
        self.live.insert(id, state);
        self.push_slot(deadline, id);
    }

    fn push_slot(&mut self, deadline: Instant, id: TimerId) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Slot { deadline, seq, id });
    }

    fn prune(&mut self) {
        while let Some(slot) = self.heap.peek() {
            if self.live.contains_key(&slot.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

fn ceil_millis(duration: Duration) -> u64 {
    let ms = duration.as_millis() as u64;

    if Duration::from_millis(ms) < duration {
        ms + 1
    } else {
        ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_: &mut EventLoop| {})
    }

    #[test]
    fn timeout_is_rounded_up() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();

        timers.insert(now + Duration::from_micros(1500), Duration::ZERO, noop());

        assert_eq!(timers.next_timeout_ms(now), Some(2));
    }

    #[test]
    fn timeout_is_exact_on_whole_milliseconds() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();

        timers.insert(now + Duration::from_millis(25), Duration::ZERO, noop());

        assert_eq!(timers.next_timeout_ms(now), Some(25));
    }

    #[test]
    fn timeout_is_none_without_timers_and_zero_when_overdue() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();

        assert_eq!(timers.next_timeout_ms(now), None);

        timers.insert(now, Duration::ZERO, noop());
        assert_eq!(timers.next_timeout_ms(now + Duration::from_millis(5)), Some(0));
    }

    #[test]
    fn equal_deadlines_pop_in_insertion_order() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();
        let deadline = now + Duration::from_millis(1);

        let first = timers.insert(deadline, Duration::ZERO, noop());
        let second = timers.insert(deadline, Duration::ZERO, noop());

        let (id, _) = timers.pop_due(deadline).expect("first entry due");
        assert_eq!(id, first);
        let (id, _) = timers.pop_due(deadline).expect("second entry due");
        assert_eq!(id, second);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();

        let doomed = timers.insert(now, Duration::ZERO, noop());
        let kept = timers.insert(now + Duration::from_millis(1), Duration::ZERO, noop());

        timers.cancel(doomed);

        // The cancelled entry held the earliest deadline; the timeout and
        // the pop must both see past it.
        assert_eq!(timers.next_timeout_ms(now), Some(1));

        let (id, _) = timers
            .pop_due(now + Duration::from_millis(1))
            .expect("surviving entry due");
        assert_eq!(id, kept);
        assert!(timers.pop_due(now + Duration::from_millis(1)).is_none());
    }

    #[test]
    fn cancel_is_a_no_op_for_unknown_and_spent_ids() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();

        let id = timers.insert(now, Duration::ZERO, noop());
        assert!(timers.pop_due(now).is_some());

        timers.cancel(id);
        timers.cancel(id);
    }

    #[test]
    fn cancel_from_within_own_callback_prevents_rearm() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();

        let id = timers.insert(now, Duration::from_millis(10), noop());
        let (popped, state) = timers.pop_due(now).expect("due");
        assert_eq!(popped, id);

        timers.begin_fire(id);
        timers.cancel(id);
        assert!(!timers.finish_fire());

        drop(state);
        assert_eq!(timers.next_timeout_ms(now), None);
    }

    #[test]
    fn rearm_uses_the_supplied_deadline() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();
        let interval = Duration::from_millis(10);

        let id = timers.insert(now, interval, noop());
        let (_, state) = timers.pop_due(now).expect("due");

        timers.begin_fire(id);
        assert!(timers.finish_fire());

        // Fired late: re-arming anchors to the fire time, not the original
        // deadline, so the next expiration drifts with the overload.
        let fired_at = now + Duration::from_millis(30);
        timers.rearm(id, state, fired_at + interval);

        assert_eq!(timers.next_timeout_ms(fired_at), Some(10));
    }
}
