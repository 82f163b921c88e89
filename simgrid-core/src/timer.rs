//! Timer heap, keyed by absolute deadline. Used both for user-visible
//! timeouts (`wait(activity, timeout)`) and internally by the
//! [`crate::engine::Engine`] time-advance loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Opaque handle returned by [`TimerHeap::schedule`], used to cancel a timer
/// before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

/// What a fired timer does. The engine never inspects `action` itself; it
/// just hands fired entries back to the caller in deadline order.
#[derive(Debug, Clone)]
pub enum TimerAction {
    /// Wake one waiter of an activity wait with a timeout outcome.
    WaitTimeout { actor: u64, activity: u64 },
    /// Same as `WaitTimeout`, but for a `wait_any` registered across several
    /// activities at once: fires only if `actor` is still listed as a
    /// waiter on one of them (none of them completed first).
    WaitAnyTimeout { actor: u64, activities: Vec<u64> },
    /// Completes an activity outright (not a timeout): used by `Sleep`,
    /// which has nothing to contend for and so isn't resource-model-backed.
    ActivityDone { activity: u64 },
    /// A generic one-shot callback request, identified by an opaque tag the
    /// caller assigned (e.g. "check this actor's auto-restart").
    Callback(u64),
}

#[derive(Debug)]
struct Entry {
    deadline: f64,
    seq: u64,
    id: TimerId,
    action: TimerAction,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap: reverse by deadline, tie-break by creation order (seq)
        // so that two timers scheduled for the same instant fire in the
        // order they were created.
        other
            .deadline
            .partial_cmp(&self.deadline)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of `(deadline, action)`.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    next_id: u64,
    canceled: std::collections::HashSet<TimerId>,
}

impl TimerHeap {
    /// Builds an empty heap.
    pub fn new() -> TimerHeap {
        TimerHeap::default()
    }

    /// Schedules `action` to fire at absolute time `deadline`.
    pub fn schedule(&mut self, deadline: f64, action: TimerAction) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            id,
            action,
        });
        id
    }

    /// Cancels a previously scheduled timer. A no-op if it already fired.
    pub fn cancel(&mut self, id: TimerId) {
        self.canceled.insert(id);
    }

    /// The deadline of the next not-yet-canceled timer, if any.
    pub fn next_deadline(&self) -> Option<f64> {
        self.heap
            .iter()
            .filter(|e| !self.canceled.contains(&e.id))
            .map(|e| e.deadline)
            .fold(None, |acc, d| Some(acc.map_or(d, |m: f64| m.min(d))))
    }

    /// Pops every timer with `deadline <= now`, in deadline order (ties
    /// broken by creation order). Canceled timers are dropped silently.
    pub fn pop_due(&mut self, now: f64) -> Vec<(TimerId, TimerAction)> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if self.canceled.remove(&entry.id) {
                continue;
            }
            fired.push((entry.id, entry.action));
        }
        fired
    }

    /// True if there is nothing left to fire (mirrors the "timer heap
    /// empty" deadlock-detection condition).
    pub fn is_empty(&self) -> bool {
        self.heap.iter().all(|e| self.canceled.contains(&e.id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut h = TimerHeap::new();
        h.schedule(3.0, TimerAction::Callback(3));
        h.schedule(1.0, TimerAction::Callback(1));
        h.schedule(2.0, TimerAction::Callback(2));

        let fired = h.pop_due(10.0);
        let tags: Vec<u64> = fired
            .into_iter()
            .map(|(_, a)| match a {
                TimerAction::Callback(t) => t,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn ties_break_by_creation_order() {
        let mut h = TimerHeap::new();
        h.schedule(1.0, TimerAction::Callback(1));
        h.schedule(1.0, TimerAction::Callback(2));
        h.schedule(1.0, TimerAction::Callback(3));

        let fired = h.pop_due(1.0);
        let tags: Vec<u64> = fired
            .into_iter()
            .map(|(_, a)| match a {
                TimerAction::Callback(t) => t,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn canceled_timer_does_not_fire() {
        let mut h = TimerHeap::new();
        let id = h.schedule(1.0, TimerAction::Callback(1));
        h.cancel(id);
        assert!(h.pop_due(10.0).is_empty());
    }

    #[test]
    fn pop_due_respects_now() {
        let mut h = TimerHeap::new();
        h.schedule(5.0, TimerAction::Callback(1));
        assert!(h.pop_due(4.0).is_empty());
        assert_eq!(h.pop_due(5.0).len(), 1);
    }
}
