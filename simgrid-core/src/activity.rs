//! Activity layer: the state machine every blocking operation
//! (communication, execution, sleep, mutex/condvar wait) goes through.
//!
//! An [`Activity`] is reference-counted: the activity table holds a strong
//! reference while in flight, and each waiter holds one too. `ActivityRef`
//! is a `Rc<RefCell<..>>`, cloned by every waiter and by the owning
//! resource model. The engine resumes one actor at a time on a single
//! thread, so `Rc<RefCell<_>>` rather than `Arc<Mutex<_>>` is the right
//! tool here.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::actor::ActorId;
use crate::error::SimError;
use crate::host::HostId;
use crate::lmm::VariableId;
use crate::mailbox::MailboxId;
use crate::timer::TimerId;

/// Invoked once, when a Comm reaches a terminal state, with the sender's
/// payload handle (if any). Mirrors SimGrid's `copy_data_fun`: it runs
/// before waiters are woken, so a receiver that inspects its result right
/// after waking already sees the copied value.
pub type CopyCallback = Rc<dyn Fn(Option<Rc<dyn Any>>)>;

/// Opaque handle identifying an [`Activity`] across the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityId(pub u64);

/// What kind of blocking operation this activity represents, with its
/// kind-specific fields.
#[derive(Debug)]
pub enum Kind {
    Comm {
        sender: Option<ActorId>,
        receiver: Option<ActorId>,
        mailbox: Option<MailboxId>,
        payload_size: usize,
        simulated_size: f64,
        rate_cap: f64,
        detached: bool,
        /// latency not yet drained, in seconds; must reach zero before the
        /// bandwidth-limited `remaining` below starts counting down.
        latency_remaining: f64,
        /// Sender-supplied handle to whatever it is "sending"; opaque to
        /// the engine, just carried through to `copy_callback`.
        payload: Option<Rc<dyn Any>>,
        /// Runs once on completion, before waiters wake. A detached Comm
        /// has no sender waiter to hand the result to, so this is its only
        /// way to deliver one.
        copy_callback: Option<CopyCallback>,
    },
    /// Waiting for another actor to terminate (`join`).
    Join {
        target: ActorId,
    },
    Exec {
        hosts: Vec<HostId>,
        flop_amount: f64,
        bound: f64,
        priority: f64,
        affinity: Option<u64>,
    },
    Sleep {
        host: HostId,
        duration: f64,
    },
    MutexWait {
        mutex: crate::sync::MutexId,
    },
    CondVarWait {
        condvar: crate::sync::CondVarId,
    },
    SemWait {
        sem: crate::sync::SemId,
    },
}

/// Lifecycle state of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Inited,
    Starting,
    Running,
    Done,
    Canceled,
    Failed,
    Timeout,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Canceled | State::Failed | State::Timeout)
    }
}

/// One actor's wait on an activity, with its own independent timeout timer:
/// a timeout cancels only that waiter's wait, not the activity itself.
#[derive(Debug)]
pub struct Waiter {
    pub actor: ActorId,
    pub timeout_timer: Option<TimerId>,
}

#[derive(Debug)]
pub struct Activity {
    pub id: ActivityId,
    pub kind: Kind,
    pub state: State,
    /// Remaining work: flops for Exec, bytes for Comm's bandwidth phase,
    /// seconds for Sleep. Ignored for the wait kinds.
    pub remaining: f64,
    pub deadline: Option<f64>,
    pub waiters: VecDeque<Waiter>,
    pub variable: Option<VariableId>,
    /// Set once the activity finishes, so `test` callers who arrive after
    /// completion still learn why.
    pub outcome: Option<Result<(), SimError>>,
    /// Sequence number at creation, for deterministic tie-breaking.
    pub seq: u64,
}

pub type ActivityRef = Rc<RefCell<Activity>>;

impl Activity {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions to a terminal state and records the outcome every
    /// current and future waiter will observe. Does not itself wake
    /// waiters: that's the engine's job, since waking means making actors
    /// runnable, which is a scheduler concern, not an activity one.
    pub fn finish(&mut self, state: State, outcome: Result<(), SimError>) {
        debug_assert!(state.is_terminal(), "finish requires a terminal state");
        self.state = state;
        self.outcome = Some(outcome);
    }
}

/// Registry of all live activities, owned by the [`crate::engine::Engine`].
#[derive(Debug, Default)]
pub struct ActivityTable {
    activities: std::collections::HashMap<ActivityId, ActivityRef>,
    next_id: u64,
    next_seq: u64,
}

impl ActivityTable {
    pub fn new() -> ActivityTable {
        ActivityTable::default()
    }

    pub fn create(&mut self, kind: Kind, remaining: f64, deadline: Option<f64>) -> ActivityRef {
        let id = ActivityId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        let activity = Rc::new(RefCell::new(Activity {
            id,
            kind,
            state: State::Inited,
            remaining,
            deadline,
            waiters: VecDeque::new(),
            variable: None,
            outcome: None,
            seq,
        }));
        self.activities.insert(id, activity.clone());
        activity
    }

    pub fn get(&self, id: ActivityId) -> Option<ActivityRef> {
        self.activities.get(&id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityRef> {
        self.activities.values()
    }

    /// Drops the table's own reference; the activity survives as long as
    /// any waiter or resource model still holds a clone.
    pub fn release(&mut self, id: ActivityId) {
        self.activities.remove(&id);
    }

    pub fn next_sequence(&mut self) -> u64 {
        let s = self.next_seq;
        self.next_seq += 1;
        s
    }
}

/// `test(activity)`: never blocks, just inspects current state.
pub fn test(activity: &ActivityRef) -> bool {
    activity.borrow().is_terminal()
}

/// `test_any(activities)`: first terminal activity's index, if any.
pub fn test_any(activities: &[ActivityRef]) -> Option<usize> {
    activities.iter().position(|a| a.borrow().is_terminal())
}

/// `cancel(activity)`: force-terminates, independent of any LMM/resource
/// bookkeeping, which the caller (resource model) is responsible for
/// unwinding using the activity's `variable` before calling this.
pub fn cancel(activity: &ActivityRef) {
    let mut a = activity.borrow_mut();
    if !a.is_terminal() {
        a.finish(State::Canceled, Err(SimError::Cancel));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_kind() -> Kind {
        Kind::Sleep {
            host: HostId(0),
            duration: 1.0,
        }
    }

    #[test]
    fn new_activity_starts_inited_and_nonterminal() {
        let mut table = ActivityTable::new();
        let a = table.create(dummy_kind(), 1.0, None);
        assert_eq!(a.borrow().state, State::Inited);
        assert!(!test(&a));
    }

    #[test]
    fn finish_marks_terminal_and_records_outcome() {
        let mut table = ActivityTable::new();
        let a = table.create(dummy_kind(), 1.0, None);
        a.borrow_mut().finish(State::Done, Ok(()));
        assert!(test(&a));
        assert_eq!(a.borrow().outcome, Some(Ok(())));
    }

    #[test]
    fn cancel_is_idempotent_on_terminal_activity() {
        let mut table = ActivityTable::new();
        let a = table.create(dummy_kind(), 1.0, None);
        a.borrow_mut().finish(State::Done, Ok(()));
        cancel(&a);
        assert_eq!(a.borrow().state, State::Done); // cancel doesn't clobber an already-done activity
    }

    #[test]
    fn test_any_finds_first_terminal() {
        let mut table = ActivityTable::new();
        let a = table.create(dummy_kind(), 1.0, None);
        let b = table.create(dummy_kind(), 1.0, None);
        b.borrow_mut().finish(State::Done, Ok(()));
        assert_eq!(test_any(&[a, b]), Some(1));
    }
}
