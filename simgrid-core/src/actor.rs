//! Actor runtime: identity, lifecycle, on_exit hooks, and the
//! scheduler-round bookkeeping the engine drives.
//!
//! Generalized from single-purpose worker actors to arbitrary user code
//! running atop a [`crate::context::Context`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::activity::ActivityId;
use crate::context::Context;
use crate::host::HostId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u64);

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Ready,
    Running,
    Blocked,
    Terminated,
    /// Terminated but kept alive because an `ActorPtr` still references it.
    ZombieUntilUnref,
}

/// Why an actor terminated, used to compute on_exit's `failed` flag
/// (`state in {canceled, failed, killed}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    Canceled,
    Failed,
    Killed,
}

impl ExitReason {
    pub fn is_failure(self) -> bool {
        !matches!(self, ExitReason::Normal)
    }
}

type OnExit = Box<dyn FnOnce(bool)>;

pub struct Actor {
    pub id: ActorId,
    pub name: String,
    pub host: HostId,
    pub parent: Option<ActorId>,
    pub state: State,
    pub daemon: bool,
    pub auto_restart: bool,
    pub suspended: bool,
    pub to_be_killed: bool,
    pub waiting_activity: Option<ActivityId>,
    /// The rest of a `wait_any`'s activities, beyond the one held in
    /// `waiting_activity`; empty for an ordinary single-activity wait.
    pub waiting_extra: Vec<ActivityId>,
    /// Set by `terminate`; read back by `join` once this actor is gone.
    pub last_exit: Option<ExitReason>,
    pub context: Context,
    on_exit: Vec<OnExit>,
    /// strong-reference count standing in for `ActorPtr` handles; the
    /// runtime's own table holds one of these implicitly and is not
    /// counted here (see [`ActorTable::release`]).
    refs: usize,
    pub seq: u64,
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("state", &self.state)
            .finish()
    }
}

pub type ActorRef = Rc<RefCell<Actor>>;

impl Actor {
    /// Registers a callback to run on termination, in reverse registration
    /// order. `failed` is passed at call time.
    pub fn on_exit(&mut self, cb: impl FnOnce(bool) + 'static) {
        self.on_exit.push(Box::new(cb));
    }

    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    /// Returns `true` if this was the last reference and the actor's
    /// stack may now be reclaimed.
    pub fn drop_ref(&mut self) -> bool {
        self.refs = self.refs.saturating_sub(1);
        self.refs == 0
    }

    /// Fires every on_exit hook in reverse order, then transitions to
    /// `Terminated` or `ZombieUntilUnref` depending on whether outstanding
    /// `ActorPtr`s remain.
    pub fn terminate(&mut self, reason: ExitReason) {
        let failed = reason.is_failure();
        self.last_exit = Some(reason);
        for cb in self.on_exit.drain(..).rev() {
            cb(failed);
        }
        self.state = if self.refs > 0 {
            State::ZombieUntilUnref
        } else {
            State::Terminated
        };
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, State::Ready) && !self.suspended && !self.to_be_killed
    }
}

/// All actors known to the engine, keyed by id, plus the daemon/non-daemon
/// count used for the "kill daemons when the last non-daemon exits" rule.
#[derive(Debug, Default)]
pub struct ActorTable {
    actors: std::collections::HashMap<ActorId, ActorRef>,
    next_id: u64,
    next_seq: u64,
    non_daemon_count: usize,
}

impl ActorTable {
    pub fn new() -> ActorTable {
        ActorTable::default()
    }

    pub fn insert(
        &mut self,
        name: String,
        host: HostId,
        parent: Option<ActorId>,
        daemon: bool,
        auto_restart: bool,
        context: Context,
    ) -> ActorRef {
        let id = ActorId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        if !daemon {
            self.non_daemon_count += 1;
        }
        let actor = Rc::new(RefCell::new(Actor {
            id,
            name,
            host,
            parent,
            state: State::Created,
            daemon,
            auto_restart,
            suspended: false,
            to_be_killed: false,
            waiting_activity: None,
            waiting_extra: Vec::new(),
            last_exit: None,
            context,
            on_exit: Vec::new(),
            refs: 0,
            seq,
        }));
        self.actors.insert(id, actor.clone());
        actor
    }

    pub fn get(&self, id: ActorId) -> Option<ActorRef> {
        self.actors.get(&id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActorRef> {
        self.actors.values()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Called once an actor has fully terminated; decrements the
    /// non-daemon count and reports whether every non-daemon actor is now
    /// gone (the "kill all daemons" trigger).
    pub fn on_terminated(&mut self, id: ActorId) -> bool {
        if let Some(a) = self.actors.get(&id) {
            if !a.borrow().daemon {
                self.non_daemon_count = self.non_daemon_count.saturating_sub(1);
            }
        }
        self.non_daemon_count == 0
    }

    pub fn remove(&mut self, id: ActorId) {
        self.actors.remove(&id);
    }

    /// Runnable actors ordered by (host id, pid) for deterministic
    /// scheduling.
    pub fn runnable_sorted(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self
            .actors
            .values()
            .filter(|a| a.borrow().is_runnable())
            .map(|a| a.borrow().id)
            .collect();
        ids.sort_by_key(|id| {
            let a = self.actors[id].borrow();
            (a.host.0, a.id.0)
        });
        ids
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn ctx() -> Context {
        Context::create(&Config::default(), |_y| {})
    }

    #[test]
    fn on_exit_runs_in_reverse_order() {
        let mut table = ActorTable::new();
        let a = table.insert("a".into(), HostId(0), None, false, false, ctx());
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let o1 = order.clone();
            let o2 = order.clone();
            let mut a = a.borrow_mut();
            a.on_exit(move |_| o1.borrow_mut().push(1));
            a.on_exit(move |_| o2.borrow_mut().push(2));
        }
        a.borrow_mut().terminate(ExitReason::Normal);
        assert_eq!(*order.borrow(), vec![2, 1]);
    }

    #[test]
    fn terminate_becomes_zombie_while_refs_remain() {
        let mut table = ActorTable::new();
        let a = table.insert("a".into(), HostId(0), None, false, false, ctx());
        a.borrow_mut().add_ref();
        a.borrow_mut().terminate(ExitReason::Normal);
        assert_eq!(a.borrow().state, State::ZombieUntilUnref);
        assert!(a.borrow_mut().drop_ref());
    }

    #[test]
    fn daemon_does_not_count_toward_non_daemon_total() {
        let mut table = ActorTable::new();
        let main = table.insert("main".into(), HostId(0), None, false, false, ctx());
        let daemon = table.insert("d".into(), HostId(0), None, true, false, ctx());
        assert!(!table.on_terminated(daemon.borrow().id));
        assert!(table.on_terminated(main.borrow().id));
    }

    #[test]
    fn runnable_sorted_orders_by_host_then_pid() {
        let mut table = ActorTable::new();
        let a = table.insert("a".into(), HostId(1), None, false, false, ctx());
        let b = table.insert("b".into(), HostId(0), None, false, false, ctx());
        a.borrow_mut().state = State::Ready;
        b.borrow_mut().state = State::Ready;
        let order = table.runnable_sorted();
        assert_eq!(order, vec![b.borrow().id, a.borrow().id]);
    }
}
