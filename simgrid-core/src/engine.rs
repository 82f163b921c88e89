//! Engine: the clock, the timer heap, the scheduler round, and
//! `run_until`'s main loop tying every other component together.
//!
//! `Engine` itself holds no reference to itself; actor code needs one (to
//! call back into `exec`/`send`/`recv`/... from inside its own coroutine),
//! so callers wrap it in `Rc<RefCell<Engine>>` and use the associated
//! functions below ([`Engine::spawn`], [`Engine::run_until`]) rather than
//! methods, taking the shared state as a parameter instead of `self`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::activity::{ActivityId, ActivityTable, CopyCallback, Kind, State as ActState, Waiter};
use crate::actor::{self, ActorId, ActorTable, ExitReason};
use crate::config::Config;
use crate::context::{Context, Resumed, Suspend, Yielder};
use crate::error::{SimError, SimResult};
use crate::sim_assert;
use crate::host::{HostId, LinkId, Platform, ResourceState};
use crate::mailbox::{MailboxTable, MatchResult, Request};
use crate::resource::cpu::CpuModel;
use crate::resource::link::LinkModel;
use crate::resource::Model;
use crate::sync::{CondVar, CondVarId, Mutex, MutexId, SemId, Semaphore};
use crate::timer::{TimerAction, TimerHeap};
use crate::trace::Trace;

/// Process-wide simulation state.
pub struct Engine {
    pub config: Config,
    pub platform: Platform,
    pub actors: ActorTable,
    pub activities: ActivityTable,
    pub mailboxes: MailboxTable,
    pub mutexes: HashMap<MutexId, Mutex>,
    pub condvars: HashMap<CondVarId, CondVar>,
    pub sems: HashMap<SemId, Semaphore>,
    pub cpu: CpuModel,
    pub net: LinkModel,
    pub timers: TimerHeap,
    pub now: f64,
    pub log: slog::Logger,
    host_traces: HashMap<HostId, Trace>,
    link_traces: HashMap<LinkId, Trace>,
    pending_wait_outcome: HashMap<ActorId, Result<(), SimError>>,
    next_mutex: u64,
    next_condvar: u64,
    next_sem: u64,
    pub deadlocked: bool,
    /// Weak back-reference to the `Rc` this `Engine` lives in, set right
    /// after construction. Lets a `&mut self` method (e.g. a host coming
    /// back on) spawn a fresh actor, which needs an `Rc<RefCell<Engine>>`
    /// clone for the new `ActorApi`, without re-borrowing `self`.
    self_handle: Option<Weak<RefCell<Engine>>>,
    /// Everything needed to respawn an auto-restart actor from scratch:
    /// name, host, daemon flag, and its body. Populated by
    /// [`Engine::spawn_restartable`]; drained by [`Engine::reboot_host`]
    /// once the actor has terminated and its host comes back on.
    restart_info: HashMap<ActorId, (String, HostId, bool, ActorBody)>,
}

/// A re-callable actor body, used by [`Engine::spawn_restartable`]. Unlike
/// the plain `FnOnce` [`Engine::spawn`] takes, this can be invoked again
/// to produce a fresh run of the same actor after a host reboot.
pub type ActorBody = Rc<dyn for<'y> Fn(ActorApi<'y>)>;

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("now", &self.now)
            .field("actors", &self.actors.len())
            .field("deadlocked", &self.deadlocked)
            .finish()
    }
}

impl Engine {
    pub fn new(config: Config, platform: Platform, log: slog::Logger) -> Rc<RefCell<Engine>> {
        let precision = config.maxmin_precision;
        let mut cpu = CpuModel::new(precision, log.clone());
        let mut net = LinkModel::new(precision, log.clone());
        for h in platform.hosts() {
            cpu.register_host(h.id, h.cores, h.power_peak, h.power_scale);
        }
        for l in platform.links() {
            net.register_link(l.id, l.capacity, &l.policy);
        }
        let engine = Rc::new(RefCell::new(Engine {
            config,
            platform,
            actors: ActorTable::new(),
            activities: ActivityTable::new(),
            mailboxes: MailboxTable::new(),
            mutexes: HashMap::new(),
            condvars: HashMap::new(),
            sems: HashMap::new(),
            cpu,
            net,
            timers: TimerHeap::new(),
            now: 0.0,
            log,
            host_traces: HashMap::new(),
            link_traces: HashMap::new(),
            pending_wait_outcome: HashMap::new(),
            next_mutex: 0,
            next_condvar: 0,
            next_sem: 0,
            deadlocked: false,
            self_handle: None,
            restart_info: HashMap::new(),
        }));
        engine.borrow_mut().self_handle = Some(Rc::downgrade(&engine));
        engine
    }

    pub fn new_mutex(&mut self) -> MutexId {
        let id = MutexId(self.next_mutex);
        self.next_mutex += 1;
        self.mutexes.insert(id, Mutex::new());
        id
    }

    pub fn new_condvar(&mut self) -> CondVarId {
        let id = CondVarId(self.next_condvar);
        self.next_condvar += 1;
        self.condvars.insert(id, CondVar::new());
        id
    }

    pub fn new_semaphore(&mut self, initial: i64) -> SemId {
        let id = SemId(self.next_sem);
        self.next_sem += 1;
        self.sems.insert(id, Semaphore::new(initial));
        id
    }

    /// Turns a host on or off. Turning one off fails every Exec currently
    /// running on it with [`SimError::HostFailure`], waking their waiters;
    /// turning a host back on does not resurrect them, it only allows new
    /// Execs to be scheduled there again.
    pub fn set_host_state(&mut self, host: HostId, state: ResourceState) {
        let was_off = self.platform.host(host).map(|h| h.state == ResourceState::Off).unwrap_or(false);
        self.platform.set_host_state(host, state);
        if state == ResourceState::Off && !was_off {
            let name = self.platform.host(host).map(|h| h.name.clone()).unwrap_or_default();
            for id in self.cpu.fail_host(host) {
                self.finish_activity(id, ActState::Failed, Err(SimError::HostFailure(name.clone())));
            }
        }
        if state == ResourceState::On && was_off {
            self.reboot_host(host);
        }
    }

    /// Respawns every auto-restart actor registered on `host` (via
    /// [`Engine::spawn_restartable`]) that has since terminated, fresh,
    /// the way init scripts restart after a real reboot. An actor still
    /// running when its host comes back on is left alone: it never
    /// actually died, so there's nothing to restart.
    fn reboot_host(&mut self, host: HostId) {
        let engine_rc = match self.self_handle.as_ref().and_then(Weak::upgrade) {
            Some(e) => e,
            None => return,
        };
        let dead: Vec<ActorId> = self
            .restart_info
            .iter()
            .filter(|(_, (_, h, _, _))| *h == host)
            .filter(|(id, _)| {
                self.actors
                    .get(**id)
                    .map(|a| {
                        let a = a.borrow();
                        a.auto_restart && matches!(a.state, actor::State::Terminated | actor::State::ZombieUntilUnref)
                    })
                    .unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect();
        for old_id in dead {
            if let Some((name, h, daemon, body)) = self.restart_info.remove(&old_id) {
                slog::info!(self.log, "rebooting host restarts actor"; "actor" => name.clone(), "host" => h.0);
                self.respawn_body(&engine_rc, name, h, daemon, body);
            }
        }
    }

    /// Builds a fresh `Context`/`Actor` around an already-erased `body`,
    /// registering it in `restart_info` again so it can be rebooted once
    /// more later. Operates on `&mut self` rather than re-borrowing
    /// `engine_rc`, since callers (like `reboot_host`) may already be
    /// inside a `borrow_mut()` on this very engine.
    fn respawn_body(&mut self, engine_rc: &Rc<RefCell<Engine>>, name: String, host: HostId, daemon: bool, body: ActorBody) -> ActorId {
        let cfg = self.config.clone();
        let engine_for_body = engine_rc.clone();
        let id_cell: Rc<RefCell<Option<ActorId>>> = Rc::new(RefCell::new(None));
        let id_cell_body = id_cell.clone();
        let body_for_ctx = body.clone();
        let ctx = Context::create(&cfg, move |y: &Yielder| {
            let actor = id_cell_body.borrow().expect("actor id set before first resume");
            let api = ActorApi {
                engine: engine_for_body,
                actor,
                yielder: y,
            };
            body_for_ctx(api);
        });
        let actor_ref = self.actors.insert(name.clone(), host, None, daemon, true, ctx);
        let id = actor_ref.borrow().id;
        *id_cell.borrow_mut() = Some(id);
        actor_ref.borrow_mut().state = actor::State::Ready;
        self.restart_info.insert(id, (name, host, daemon, body));
        id
    }

    /// Like [`Engine::spawn`], but `code` is `Fn` rather than `FnOnce`: it
    /// is kept around (type-erased as an [`ActorBody`]) so the actor can be
    /// recreated fresh if the host it runs on reboots after failing it.
    pub fn spawn_restartable<F>(engine: &Rc<RefCell<Engine>>, name: impl Into<String>, host: HostId, daemon: bool, code: F) -> ActorId
    where
        F: for<'y> Fn(ActorApi<'y>) + 'static,
    {
        let body: ActorBody = Rc::new(code);
        engine.borrow_mut().respawn_body(engine, name.into(), host, daemon, body)
    }

    /// Turns a link on or off. Turning one off fails every Comm currently
    /// routed over it with [`SimError::NetworkFailure`].
    pub fn set_link_state(&mut self, link: LinkId, state: ResourceState) {
        let was_off = self.platform.link(link).map(|l| l.state == ResourceState::Off).unwrap_or(false);
        self.platform.set_link_state(link, state);
        if state == ResourceState::Off && !was_off {
            let name = self.platform.link(link).map(|l| l.name.clone()).unwrap_or_default();
            for id in self.net.fail_link(link) {
                self.finish_activity(id, ActState::Failed, Err(SimError::NetworkFailure(name.clone())));
            }
        }
    }

    /// Registers a trace driving `host`'s availability/power scale over
    /// time: a value `<= 0.0` turns the host off, any other value becomes
    /// its power scale (turning it back on first, if it was off).
    pub fn set_host_trace(&mut self, host: HostId, trace: Trace) {
        self.host_traces.insert(host, trace);
    }

    /// Registers a trace driving `link`'s availability/capacity scale over
    /// time, same convention as [`Engine::set_host_trace`].
    pub fn set_link_trace(&mut self, link: LinkId, trace: Trace) {
        self.link_traces.insert(link, trace);
    }

    fn apply_host_trace_value(&mut self, host: HostId, value: f64) {
        if value <= 0.0 {
            self.set_host_state(host, ResourceState::Off);
        } else {
            self.set_host_state(host, ResourceState::On);
            if let Some(h) = self.platform.host(host) {
                let (cores, peak) = (h.cores, h.power_peak);
                self.platform.host_mut(host).unwrap().power_scale = value;
                self.cpu.set_power_scale(host, cores, peak, value);
            }
        }
    }

    fn apply_link_trace_value(&mut self, link: LinkId, value: f64) {
        if value <= 0.0 {
            self.set_link_state(link, ResourceState::Off);
        } else {
            self.set_link_state(link, ResourceState::On);
            if let Some(l) = self.platform.link(link) {
                let base = l.capacity;
                self.net.set_capacity(link, base * value);
            }
        }
    }

    /// Applies every registered trace's value at `now`. Idempotent: safe to
    /// call every round, not just on a change.
    fn apply_traces(&mut self, now: f64) {
        let host_updates: Vec<(HostId, f64)> = self.host_traces.iter().filter_map(|(&h, t)| t.value_at(now).map(|v| (h, v))).collect();
        for (host, value) in host_updates {
            self.apply_host_trace_value(host, value);
        }
        let link_updates: Vec<(LinkId, f64)> = self.link_traces.iter().filter_map(|(&l, t)| t.value_at(now).map(|v| (l, v))).collect();
        for (link, value) in link_updates {
            self.apply_link_trace_value(link, value);
        }
    }

    /// The next timestamp at which a registered trace has a scheduled step,
    /// used to bound `run_until`'s clock advance so it never steps past one.
    fn next_trace_change(&self, now: f64) -> f64 {
        self.host_traces
            .values()
            .chain(self.link_traces.values())
            .filter_map(|t| t.next_change_after(now))
            .map(|t| t - now)
            .fold(f64::INFINITY, f64::min)
    }

    /// Spawns a new actor whose body is `code`. `code` receives an
    /// [`ActorApi`] it uses to block on activities; it runs on its own
    /// context per `config.context_backend` and is not resumed until the
    /// next scheduler round.
    pub fn spawn<F>(engine: &Rc<RefCell<Engine>>, name: impl Into<String>, host: HostId, daemon: bool, auto_restart: bool, code: F) -> ActorId
    where
        F: for<'y> FnOnce(ActorApi<'y>) + 'static,
    {
        let name = name.into();
        let cfg = engine.borrow().config.clone();
        let engine_for_body = engine.clone();
        // id is assigned before the context exists, then patched in: the
        // actor needs to know its own id inside its body, but the table
        // needs the context to insert the actor in the first place.
        let id_cell: Rc<RefCell<Option<ActorId>>> = Rc::new(RefCell::new(None));
        let id_cell_body = id_cell.clone();
        let ctx = Context::create(&cfg, move |y: &Yielder| {
            let actor = id_cell_body.borrow().expect("actor id set before first resume");
            let api = ActorApi {
                engine: engine_for_body,
                actor,
                yielder: y,
            };
            code(api);
        });
        let actor_ref = {
            let mut eng = engine.borrow_mut();
            eng.actors.insert(name, host, None, daemon, auto_restart, ctx)
        };
        let id = actor_ref.borrow().id;
        *id_cell.borrow_mut() = Some(id);
        actor_ref.borrow_mut().state = actor::State::Ready;
        id
    }

    /// Makes `actor` runnable again with `outcome` waiting to be picked up
    /// by its `block_on`/`wait_any`. Also unwinds `actor` out of every
    /// *other* activity it was simultaneously registered on via
    /// `wait_any` (its own entry in the activity that's actually finishing
    /// is typically already drained by the caller): without this, a
    /// `wait_any` across several activities would leave a stale waiter
    /// behind on whichever of them didn't finish first.
    fn wake_actor(&mut self, actor: ActorId, outcome: Result<(), SimError>) {
        if let Some(a) = self.actors.get(actor) {
            let (primary, extra) = {
                let mut a = a.borrow_mut();
                let primary = a.waiting_activity.take();
                let extra = std::mem::take(&mut a.waiting_extra);
                a.state = actor::State::Ready;
                (primary, extra)
            };
            for id in primary.into_iter().chain(extra) {
                if let Some(act) = self.activities.get(id) {
                    let mut act = act.borrow_mut();
                    if let Some(pos) = act.waiters.iter().position(|w| w.actor == actor) {
                        act.waiters.remove(pos);
                    }
                }
            }
        }
        self.pending_wait_outcome.insert(actor, outcome);
    }

    /// Finishes a resource-backed activity: records the outcome, invokes a
    /// Comm's `copy_callback` (if any) before anyone wakes, wakes every
    /// waiter in FIFO order, cancels their timeout timers, and releases the
    /// table's strong reference.
    fn finish_activity(&mut self, id: ActivityId, state: ActState, outcome: Result<(), SimError>) {
        let activity = match self.activities.get(id) {
            Some(a) => a,
            None => return,
        };
        let waiters: Vec<Waiter> = {
            let mut a = activity.borrow_mut();
            if a.is_terminal() {
                return;
            }
            a.finish(state, outcome.clone());
            if let Kind::Comm { payload, copy_callback, .. } = &mut a.kind {
                if let Some(cb) = copy_callback.take() {
                    cb(payload.take());
                }
            }
            a.waiters.drain(..).collect()
        };
        for w in waiters {
            if let Some(t) = w.timeout_timer {
                self.timers.cancel(t);
            }
            self.wake_actor(w.actor, outcome.clone());
        }
        self.activities.release(id);
    }

    /// Completes a synchronization wait (mutex/condvar/semaphore) directly,
    /// with no resource model involved: used by `unlock`/`notify`/`release`.
    fn complete_sync_wait(&mut self, activity: ActivityId, outcome: Result<(), SimError>) {
        let state = if outcome.is_ok() { ActState::Done } else { ActState::Failed };
        self.finish_activity(activity, state, outcome);
    }

    fn finalize_actor(&mut self, id: ActorId) {
        let reason = {
            let a = match self.actors.get(id) {
                Some(a) => a,
                None => return,
            };
            let reason = if a.borrow().to_be_killed { ExitReason::Killed } else { ExitReason::Normal };
            a.borrow_mut().terminate(reason);
            reason
        };
        let joiners: Vec<ActivityId> = self
            .activities
            .iter()
            .filter(|a| matches!(a.borrow().kind, Kind::Join { target } if target == id))
            .map(|a| a.borrow().id)
            .collect();
        for jid in joiners {
            self.finish_activity(jid, ActState::Done, Ok(()));
        }
        let kill_daemons = self.actors.on_terminated(id);
        if kill_daemons {
            let daemons: Vec<ActorId> = self
                .actors
                .iter()
                .filter(|a| a.borrow().daemon && !matches!(a.borrow().state, actor::State::Terminated | actor::State::ZombieUntilUnref))
                .map(|a| a.borrow().id)
                .collect();
            for d in daemons {
                if let Some(a) = self.actors.get(d) {
                    a.borrow_mut().to_be_killed = true;
                    a.borrow_mut().terminate(ExitReason::Killed);
                }
            }
        }
        let _ = reason;
    }

    /// Forcefully terminates `target`. A not-yet-run or yielded (`Ready`)
    /// actor is marked and finalized just before its next scheduling slot
    /// (see `run_until`); a `Blocked` actor is unwound and finalized right
    /// here, since it is never going to be resumed to observe anything.
    /// A `Running` actor (killing itself) is just marked: it finalizes
    /// normally once its current burst of work returns or blocks.
    pub fn kill_actor(&mut self, target: ActorId) {
        let state = match self.actors.get(target) {
            Some(a) => a.borrow().state,
            None => return,
        };
        if matches!(state, actor::State::Terminated | actor::State::ZombieUntilUnref) {
            return;
        }
        if let Some(a) = self.actors.get(target) {
            a.borrow_mut().to_be_killed = true;
        }
        if matches!(state, actor::State::Blocked) {
            let ids: Vec<ActivityId> = self
                .actors
                .get(target)
                .map(|a| {
                    let a = a.borrow();
                    a.waiting_activity.into_iter().chain(a.waiting_extra.iter().copied()).collect()
                })
                .unwrap_or_default();
            for id in ids {
                self.kill_unwind_activity(id, target);
            }
            self.finalize_actor(target);
        }
    }

    /// Either fails `id` outright -- it was resource-backed, so whoever
    /// else was counting on it (a Comm's peer, say) is left with nothing
    /// to wait for once `target` is gone -- or just removes `target`'s own
    /// waiter entry, leaving a sync-primitive or not-yet-matched wait
    /// untouched for everyone else still in its queue.
    fn kill_unwind_activity(&mut self, id: ActivityId, target: ActorId) {
        let resource_backed = self.activities.get(id).map(|a| a.borrow().variable.is_some()).unwrap_or(false);
        if resource_backed {
            self.cpu.stop_exec(id);
            self.net.stop_comm(id);
            self.finish_activity(id, ActState::Failed, Err(SimError::ForcefulKill));
            return;
        }
        if let Some(act) = self.activities.get(id) {
            let timer = {
                let mut a = act.borrow_mut();
                a.waiters.iter().position(|w| w.actor == target).map(|pos| a.waiters.remove(pos).unwrap())
            }
            .and_then(|w| w.timeout_timer);
            if let Some(t) = timer {
                self.timers.cancel(t);
            }
        }
    }

    /// Marks `target` ineligible for scheduling until `resume_actor`.
    /// Since `Actor::is_runnable` already gates on `!suspended`, this needs
    /// no further plumbing in the scheduler loop: a suspended `Ready`
    /// actor just sits there, and a suspended `Blocked` actor still wakes
    /// normally but stays excluded from `runnable_sorted` until resumed.
    pub fn suspend_actor(&mut self, target: ActorId) {
        if let Some(a) = self.actors.get(target) {
            a.borrow_mut().suspended = true;
        }
    }

    pub fn resume_actor(&mut self, target: ActorId) {
        if let Some(a) = self.actors.get(target) {
            a.borrow_mut().suspended = false;
        }
    }

    /// Runs the scheduler round / resource-solve / clock-advance loop
    /// until `t_end`, or until a deadlock is detected.
    pub fn run_until(engine: &Rc<RefCell<Engine>>, t_end: f64) -> SimResult<()> {
        {
            let mut eng = engine.borrow_mut();
            let now = eng.now;
            eng.apply_traces(now);
        }
        loop {
            // A killed actor that was `Ready` (never resumed this round, or
            // just yielded) is excluded from `is_runnable` and so would
            // never again reach `finalize_actor` through the normal
            // resume-and-match-on-Finished path below; finalize it
            // directly instead of letting it sit forever.
            let to_finalize: Vec<ActorId> = engine
                .borrow()
                .actors
                .iter()
                .filter(|a| {
                    let a = a.borrow();
                    a.to_be_killed && matches!(a.state, actor::State::Ready)
                })
                .map(|a| a.borrow().id)
                .collect();
            for id in to_finalize {
                engine.borrow_mut().finalize_actor(id);
            }

            let runnable = engine.borrow().actors.runnable_sorted();
            for id in &runnable {
                let actor_ref = match engine.borrow().actors.get(*id) {
                    Some(a) => a,
                    None => continue,
                };
                if !actor_ref.borrow().is_runnable() {
                    continue; // may have been killed by another actor's round this pass
                }
                actor_ref.borrow_mut().state = actor::State::Running;
                let resumed = actor_ref.borrow_mut().context.resume();
                match resumed {
                    Resumed::Finished => engine.borrow_mut().finalize_actor(*id),
                    Resumed::Suspended(Suspend::Yielded) => actor_ref.borrow_mut().state = actor::State::Ready,
                    Resumed::Suspended(Suspend::Blocked) => {}
                }
            }

            let mut eng = engine.borrow_mut();
            let any_runnable = eng.actors.iter().any(|a| a.borrow().is_runnable());
            let any_blocked = eng.actors.iter().any(|a| matches!(a.borrow().state, actor::State::Blocked));
            if !any_runnable && eng.timers.is_empty() {
                if any_blocked {
                    eng.deadlocked = true;
                    let blocked: Vec<ActorId> = eng
                        .actors
                        .iter()
                        .filter(|a| matches!(a.borrow().state, actor::State::Blocked))
                        .map(|a| a.borrow().id)
                        .collect();
                    let lines: Vec<String> = blocked
                        .iter()
                        .map(|id| {
                            let (name, waiting_on) = match eng.actors.get(*id) {
                                Some(a) => {
                                    let a = a.borrow();
                                    (a.name.clone(), a.waiting_activity)
                                }
                                None => ("<gone>".to_string(), None),
                            };
                            let what = waiting_on
                                .and_then(|aid| eng.activities.get(aid))
                                .map(|act| describe_wait(&act.borrow().kind, &eng.platform, &eng.mailboxes))
                                .unwrap_or_else(|| "nothing known (activity already gone)".to_string());
                            format!("'{}' (#{}) waiting on {}", name, id.0, what)
                        })
                        .collect();
                    slog::crit!(
                        eng.log,
                        "deadlock: no runnable actor, no pending timer, {} actor(s) still blocked: {}",
                        blocked.len(),
                        lines.join("; ")
                    );
                    return Err(SimError::Cancel);
                }
                return Ok(());
            }

            let dt_resource = eng.cpu.share_resources(eng.now).min(eng.net.share_resources(eng.now));
            let dt_timer = eng.timers.next_deadline().map(|d| d - eng.now).unwrap_or(f64::INFINITY);
            let dt_trace = eng.next_trace_change(eng.now);
            let dt = dt_resource.min(dt_timer).min(dt_trace).min(t_end - eng.now);

            if !dt.is_finite() || dt < 0.0 {
                return Ok(());
            }

            eng.now += dt;
            let now = eng.now;
            eng.apply_traces(now);

            let cpu_out = eng.cpu.update_actions_state(now, dt, &eng.activities);
            let net_out = eng.net.update_actions_state(now, dt, &eng.activities);
            for id in cpu_out.done.into_iter().chain(net_out.done) {
                eng.cpu.stop_exec(id);
                eng.net.stop_comm(id);
                eng.finish_activity(id, ActState::Done, Ok(()));
            }
            for id in cpu_out.failed.into_iter().chain(net_out.failed) {
                eng.cpu.stop_exec(id);
                eng.net.stop_comm(id);
                eng.finish_activity(id, ActState::Failed, Err(SimError::HostFailure(String::new())));
            }

            let due = eng.timers.pop_due(now);
            for (_tid, action) in due {
                match action {
                    TimerAction::WaitTimeout { actor, activity } => {
                        let (removed, condvar) = if let Some(a) = eng.activities.get(ActivityId(activity)) {
                            let mut a = a.borrow_mut();
                            let removed = if let Some(pos) = a.waiters.iter().position(|w| w.actor.0 == actor) {
                                a.waiters.remove(pos);
                                true
                            } else {
                                false
                            };
                            let condvar = match &a.kind {
                                Kind::CondVarWait { condvar } => Some(*condvar),
                                _ => None,
                            };
                            (removed, condvar)
                        } else {
                            (false, None)
                        };
                        if removed {
                            // a condvar's own wait queue is separate bookkeeping from the
                            // activity's waiters list and must be unwound too, or a later
                            // notify_one could hand a wakeup to an actor that already timed out.
                            if let Some(cv) = condvar {
                                if let Some(state) = eng.condvars.get_mut(&cv) {
                                    state.waiters.retain(|&a| a != ActorId(actor));
                                }
                            }
                            eng.wake_actor(ActorId(actor), Err(SimError::Timeout));
                        }
                    }
                    TimerAction::WaitAnyTimeout { actor, activities } => {
                        let still_pending = activities.iter().any(|&aid| {
                            eng.activities
                                .get(ActivityId(aid))
                                .map(|a| a.borrow().waiters.iter().any(|w| w.actor.0 == actor))
                                .unwrap_or(false)
                        });
                        if still_pending {
                            // `wake_actor` itself drains this actor's waiter entry from
                            // both `waiting_activity` and every `waiting_extra` sibling.
                            eng.wake_actor(ActorId(actor), Err(SimError::Timeout));
                        }
                    }
                    TimerAction::ActivityDone { activity } => {
                        eng.finish_activity(ActivityId(activity), ActState::Done, Ok(()));
                    }
                    TimerAction::Callback(_) => {}
                }
            }

            if eng.now >= t_end {
                return Ok(());
            }
        }
    }
}

/// Renders a blocked actor's activity for the deadlock log: what kind of
/// wait it is, and the resource/mailbox/actor it names, so a crit-level
/// log line alone is enough to diagnose which actors are stuck on what.
fn describe_wait(kind: &Kind, platform: &Platform, mailboxes: &MailboxTable) -> String {
    match kind {
        Kind::Comm { mailbox, sender, receiver, .. } => {
            let mb = mailbox
                .and_then(|m| mailboxes.name_of(m))
                .map(|n| format!("mailbox '{}'", n))
                .unwrap_or_else(|| "an unmatched mailbox".to_string());
            format!("a comm on {} (sender {:?}, receiver {:?})", mb, sender, receiver)
        }
        Kind::Join { target } => format!("actor #{} to terminate", target.0),
        Kind::Exec { hosts, .. } => {
            let names: Vec<String> = hosts
                .iter()
                .map(|h| platform.host(*h).map(|h| h.name.clone()).unwrap_or_else(|| format!("host#{}", h.0)))
                .collect();
            format!("an exec on [{}]", names.join(", "))
        }
        Kind::Sleep { host, .. } => {
            let name = platform.host(*host).map(|h| h.name.clone()).unwrap_or_else(|| format!("host#{}", host.0));
            format!("a sleep on '{}'", name)
        }
        Kind::MutexWait { mutex } => format!("mutex #{}", mutex.0),
        Kind::CondVarWait { condvar } => format!("condvar #{}", condvar.0),
        Kind::SemWait { sem } => format!("semaphore #{}", sem.0),
    }
}

/// Handle given to actor code for the duration of one spawn's body,
/// bundling the engine reference, this actor's own id, and the suspend
/// primitive: a blocking call registers a new activity and returns control
/// via `suspend`.
pub struct ActorApi<'y> {
    engine: Rc<RefCell<Engine>>,
    actor: ActorId,
    yielder: &'y Yielder<'y>,
}

impl<'y> std::fmt::Debug for ActorApi<'y> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorApi").field("actor", &self.actor).finish()
    }
}

impl<'y> ActorApi<'y> {
    pub fn actor_id(&self) -> ActorId {
        self.actor
    }

    /// Registers `activity` as this actor's wait, suspends, and returns
    /// the outcome the engine recorded when it woke this actor back up.
    fn block_on(&self, activity: ActivityId, timeout: Option<f64>) -> SimResult<()> {
        {
            let mut eng = self.engine.borrow_mut();
            let timer = timeout.map(|t| {
                let deadline = eng.now + t;
                eng.timers.schedule(deadline, TimerAction::WaitTimeout { actor: self.actor.0, activity: activity.0 })
            });
            let a = eng.actors.get(self.actor).expect("actor missing from table");
            a.borrow_mut().waiting_activity = Some(activity);
            a.borrow_mut().state = actor::State::Blocked;
            let act = eng.activities.get(activity).expect("activity missing from table");
            act.borrow_mut().waiters.push_back(Waiter { actor: self.actor, timeout_timer: timer });
        }
        self.yielder.suspend(Suspend::Blocked);
        let mut eng = self.engine.borrow_mut();
        eng.pending_wait_outcome.remove(&self.actor).unwrap_or(Ok(()))
    }

    /// Gives up the CPU for the rest of this scheduling round without
    /// blocking on anything; resumed at the top of the next round.
    pub fn yield_now(&self) {
        self.yielder.suspend(Suspend::Yielded);
    }

    pub fn exec(&self, flop_amount: f64) -> SimResult<()> {
        self.exec_with(flop_amount, f64::INFINITY, 1.0, None, None)
    }

    pub fn exec_with(&self, flop_amount: f64, bound: f64, priority: f64, affinity: Option<u64>, timeout: Option<f64>) -> SimResult<()> {
        if flop_amount < 0.0 {
            return Err(SimError::InvalidArgument("flop_amount must be >= 0".into()));
        }
        let activity = {
            let mut eng = self.engine.borrow_mut();
            let host = eng.actors.get(self.actor).unwrap().borrow().host;
            let act = eng.activities.create(
                Kind::Exec {
                    hosts: vec![host],
                    flop_amount,
                    bound,
                    priority,
                    affinity,
                },
                flop_amount,
                None,
            );
            let id = act.borrow().id;
            let var = eng.cpu.start_exec(id, host, flop_amount, bound, priority, affinity);
            act.borrow_mut().variable = Some(var);
            act.borrow_mut().state = ActState::Running;
            id
        };
        self.block_on(activity, timeout)
    }

    /// A sleep contends for nothing, so unlike `exec`/`send`/`recv` it isn't
    /// backed by a resource model: it's just a timer that completes the
    /// activity directly once it fires.
    pub fn sleep(&self, duration: f64) -> SimResult<()> {
        let activity = {
            let mut eng = self.engine.borrow_mut();
            let host = eng.actors.get(self.actor).unwrap().borrow().host;
            let act = eng.activities.create(Kind::Sleep { host, duration }, duration, None);
            let id = act.borrow().id;
            act.borrow_mut().state = ActState::Running;
            let deadline = eng.now + duration;
            eng.timers.schedule(deadline, TimerAction::ActivityDone { activity: id.0 });
            id
        };
        self.block_on(activity, None)
    }

    /// `send`: blocks until a matching `recv` completes the transfer.
    ///
    /// Whichever side of a rendezvous matches second is the one that knows
    /// the route to use, so it's also the one responsible for wiring up the
    /// real resource-backed Comm; the side that enqueued first already
    /// created a bare placeholder activity and is just waiting on it. This
    /// keeps a receiver generic: it never needs to know the path a sender
    /// took to reach it.
    pub fn send(&self, mailbox: &str, route_links: Vec<LinkId>, latency: f64, payload_size: usize, simulated_bytes: f64) -> SimResult<()> {
        let activity = self.create_comm_placeholder(Some(self.actor), None, payload_size);
        let matched = {
            let mut eng = self.engine.borrow_mut();
            let mb_id = eng.mailboxes.get_or_create(mailbox);
            let req = Request {
                actor: self.actor,
                payload_size,
                matcher: crate::mailbox::any_matcher(),
                activity,
                result_size: Rc::new(Cell::new(payload_size)),
            };
            let mb = eng.mailboxes.get_mut(mb_id).unwrap();
            mb.offer_send(req)
        };
        match matched {
            MatchResult::Matched(_send_req, recv_req) => {
                recv_req.result_size.set(payload_size);
                self.attach_comm(recv_req.activity, route_links, latency, payload_size, simulated_bytes, false, None, None);
                self.engine.borrow_mut().activities.release(activity);
                self.block_on(recv_req.activity, None)
            }
            MatchResult::DeliveredToReadyBuffer => {
                self.engine.borrow_mut().activities.release(activity);
                Ok(())
            }
            MatchResult::Enqueued => {
                self.attach_comm(activity, route_links, latency, payload_size, simulated_bytes, false, None, None);
                self.block_on(activity, None)
            }
        }
    }

    /// `send_detached`: fires a Comm without blocking the caller. `payload`
    /// is an opaque handle to whatever is "sent", carried through to
    /// `on_complete`, which runs once when the Comm reaches a terminal
    /// state (there is no sender-side waiter left to hand the result to
    /// directly, so this is the only way to observe it).
    pub fn send_detached(
        &self,
        mailbox: &str,
        route_links: Vec<LinkId>,
        latency: f64,
        payload_size: usize,
        simulated_bytes: f64,
        payload: Option<Rc<dyn Any>>,
        on_complete: Option<CopyCallback>,
    ) {
        let activity = self.create_comm_placeholder(Some(self.actor), None, payload_size);
        let matched = {
            let mut eng = self.engine.borrow_mut();
            let mb_id = eng.mailboxes.get_or_create(mailbox);
            let req = Request {
                actor: self.actor,
                payload_size,
                matcher: crate::mailbox::any_matcher(),
                activity,
                result_size: Rc::new(Cell::new(payload_size)),
            };
            let mb = eng.mailboxes.get_mut(mb_id).unwrap();
            mb.offer_send(req)
        };
        match matched {
            MatchResult::Matched(_send_req, recv_req) => {
                recv_req.result_size.set(payload_size);
                self.attach_comm(recv_req.activity, route_links, latency, payload_size, simulated_bytes, true, payload, on_complete);
                self.engine.borrow_mut().activities.release(activity);
            }
            MatchResult::DeliveredToReadyBuffer => {
                // delivered synchronously into the ready buffer: there's no
                // activity left to run `on_complete` from later, so invoke
                // it right here with the payload it would have carried.
                self.engine.borrow_mut().activities.release(activity);
                if let Some(cb) = on_complete {
                    cb(payload);
                }
            }
            MatchResult::Enqueued => {
                self.attach_comm(activity, route_links, latency, payload_size, simulated_bytes, true, payload, on_complete);
            }
        }
    }

    /// `recv` never needs a route: whichever `send` matches it supplies the
    /// route and wires up the real resource-backed Comm, so a receiver stays
    /// generic over who it ends up talking to.
    pub fn recv(&self, mailbox: &str, timeout: Option<f64>) -> SimResult<usize> {
        let ready = {
            let mut eng = self.engine.borrow_mut();
            let mb_id = eng.mailboxes.get_or_create(mailbox);
            eng.mailboxes.get_mut(mb_id).unwrap().take_ready()
        };
        if let Some(r) = ready {
            return Ok(r.payload_size);
        }

        let activity = self.create_comm_placeholder(None, Some(self.actor), 0);
        let result_size = Rc::new(Cell::new(0));
        let matched = {
            let mut eng = self.engine.borrow_mut();
            let mb_id = eng.mailboxes.get_or_create(mailbox);
            let req = Request {
                actor: self.actor,
                payload_size: 0,
                matcher: crate::mailbox::any_matcher(),
                activity,
                result_size: result_size.clone(),
            };
            eng.mailboxes.get_mut(mb_id).unwrap().offer_recv(req)
        };
        match matched {
            MatchResult::Matched(_recv_req, send_req) => {
                // the sender already wired up real resource backing on its
                // own activity when it enqueued; we're just another waiter.
                let size = send_req.payload_size;
                self.engine.borrow_mut().activities.release(activity);
                self.block_on(send_req.activity, timeout)?;
                Ok(size)
            }
            MatchResult::DeliveredToReadyBuffer => unreachable!("recv path never delivers to ready buffer"),
            MatchResult::Enqueued => {
                self.block_on(activity, timeout)?;
                Ok(result_size.get())
            }
        }
    }

    /// `iprobe`: is there a pending sender on `mailbox`? Never suspends.
    pub fn iprobe(&self, mailbox: &str) -> Option<ActorId> {
        let mut eng = self.engine.borrow_mut();
        let mb_id = eng.mailboxes.get_or_create(mailbox);
        eng.mailboxes.get_mut(mb_id).unwrap().iprobe(|_| true)
    }

    /// Installs this actor as `mailbox`'s permanent receiver: a later
    /// `send` that finds no matching `recv` already queued delivers
    /// straight into a ready buffer instead of blocking, and this actor's
    /// own `recv` drains that buffer first.
    pub fn set_receiver(&self, mailbox: &str) {
        let mut eng = self.engine.borrow_mut();
        let mb_id = eng.mailboxes.get_or_create(mailbox);
        eng.mailboxes.get_mut(mb_id).unwrap().permanent_receiver = Some(self.actor);
    }

    /// Creates a bare [`Kind::Comm`] activity with no resource backing yet:
    /// used by whichever side of a rendezvous offers first, before it's
    /// known whether there's already a counterpart to match against.
    fn create_comm_placeholder(&self, sender: Option<ActorId>, receiver: Option<ActorId>, payload_size: usize) -> ActivityId {
        let mut eng = self.engine.borrow_mut();
        let act = eng.activities.create(
            Kind::Comm {
                sender,
                receiver,
                mailbox: None,
                payload_size,
                simulated_size: 0.0,
                rate_cap: f64::INFINITY,
                detached: false,
                latency_remaining: 0.0,
                payload: None,
                copy_callback: None,
            },
            0.0,
            None,
        );
        act.borrow().id
    }

    /// Wires real resource backing onto a previously bare placeholder
    /// activity, once the route and byte count are known. `detached`,
    /// `payload`, and `copy_callback` are only ever non-default for
    /// `send_detached`; an ordinary `send`/`recv` passes `false, None, None`.
    fn attach_comm(
        &self,
        activity: ActivityId,
        links: Vec<LinkId>,
        latency: f64,
        payload_size: usize,
        simulated_bytes: f64,
        detached: bool,
        payload: Option<Rc<dyn Any>>,
        copy_callback: Option<CopyCallback>,
    ) {
        let mut eng = self.engine.borrow_mut();
        let var = eng.net.start_comm(activity, links, latency, simulated_bytes, f64::INFINITY);
        if let Some(a) = eng.activities.get(activity) {
            let mut a = a.borrow_mut();
            if let Kind::Comm {
                payload_size: ps,
                simulated_size,
                latency_remaining,
                detached: d,
                payload: p,
                copy_callback: cb,
                ..
            } = &mut a.kind
            {
                *ps = payload_size;
                *simulated_size = simulated_bytes;
                *latency_remaining = latency;
                *d = detached;
                *p = payload;
                *cb = copy_callback;
            }
            a.remaining = simulated_bytes;
            a.variable = Some(var);
            a.state = ActState::Running;
        }
    }

    pub fn lock(&self, mutex: MutexId) -> SimResult<()> {
        let got_it = {
            let mut eng = self.engine.borrow_mut();
            eng.mutexes.get_mut(&mutex).expect("unknown mutex").try_lock(self.actor)
        };
        if got_it {
            return Ok(());
        }
        let activity = {
            let mut eng = self.engine.borrow_mut();
            eng.mutexes.get_mut(&mutex).unwrap().enqueue(self.actor);
            eng.activities.create(Kind::MutexWait { mutex }, 0.0, None).borrow().id
        };
        self.block_on(activity, None)
    }

    pub fn unlock(&self, mutex: MutexId) -> SimResult<()> {
        let next = {
            let mut eng = self.engine.borrow_mut();
            eng.mutexes.get_mut(&mutex).expect("unknown mutex").unlock(self.actor)
        };
        if let Some(next_actor) = next {
            self.grant_waiting_activity(next_actor, Ok(()));
        }
        Ok(())
    }

    /// Atomically unlocks `mutex` and waits on `condvar`; re-locks `mutex`
    /// before returning, whether woken by a notify or by `timeout` firing
    /// first (mirroring `pthread_cond_timedwait`'s re-lock-on-timeout rule).
    pub fn condvar_wait(&self, condvar: CondVarId, mutex: MutexId, timeout: Option<f64>) -> SimResult<()> {
        self.unlock(mutex)?;
        let activity = {
            let mut eng = self.engine.borrow_mut();
            eng.condvars.get_mut(&condvar).expect("unknown condvar").enqueue(mutex, self.actor);
            eng.activities.create(Kind::CondVarWait { condvar }, 0.0, None).borrow().id
        };
        let outcome = self.block_on(activity, timeout);
        self.lock(mutex)?;
        outcome
    }

    pub fn notify_one(&self, condvar: CondVarId) {
        let next = {
            let mut eng = self.engine.borrow_mut();
            eng.condvars.get_mut(&condvar).expect("unknown condvar").notify_one()
        };
        if let Some(a) = next {
            self.grant_waiting_activity(a, Ok(()));
        }
    }

    pub fn notify_all(&self, condvar: CondVarId) {
        let all = {
            let mut eng = self.engine.borrow_mut();
            eng.condvars.get_mut(&condvar).expect("unknown condvar").notify_all()
        };
        for a in all {
            self.grant_waiting_activity(a, Ok(()));
        }
    }

    pub fn sem_acquire(&self, sem: SemId) -> SimResult<()> {
        let got_it = {
            let mut eng = self.engine.borrow_mut();
            eng.sems.get_mut(&sem).expect("unknown semaphore").try_acquire(self.actor)
        };
        if got_it {
            return Ok(());
        }
        let activity = {
            let mut eng = self.engine.borrow_mut();
            eng.activities.create(Kind::SemWait { sem }, 0.0, None).borrow().id
        };
        self.block_on(activity, None)
    }

    pub fn sem_release(&self, sem: SemId) {
        let next = {
            let mut eng = self.engine.borrow_mut();
            eng.sems.get_mut(&sem).expect("unknown semaphore").release()
        };
        if let Some(a) = next {
            self.grant_waiting_activity(a, Ok(()));
        }
    }

    /// Completes whichever sync-wait activity `actor` is currently blocked
    /// on (used by unlock/notify/release, which hand ownership or a token
    /// directly to the next waiter rather than going through a resource
    /// model's `update_actions_state`).
    fn grant_waiting_activity(&self, actor: ActorId, outcome: Result<(), SimError>) {
        let mut eng = self.engine.borrow_mut();
        let activity_id = eng.actors.get(actor).and_then(|a| a.borrow().waiting_activity);
        if let Some(id) = activity_id {
            eng.complete_sync_wait(id, outcome);
        }
    }

    /// Blocks on the `target` actor's termination. A no-op wait if `target`
    /// is already gone: `finalize_actor` only wakes joiners registered
    /// before it terminates, so arriving after the fact must be handled
    /// here instead, or a `join` on an already-dead actor would hang.
    pub fn join(&self, target: ActorId) -> SimResult<()> {
        let already_gone = {
            let eng = self.engine.borrow();
            eng.actors
                .get(target)
                .map(|a| matches!(a.borrow().state, actor::State::Terminated | actor::State::ZombieUntilUnref))
                .unwrap_or(true)
        };
        if already_gone {
            return Ok(());
        }
        let activity = {
            let mut eng = self.engine.borrow_mut();
            eng.activities.create(Kind::Join { target }, 0.0, None).borrow().id
        };
        self.block_on(activity, None)
    }

    /// Forcefully terminates `target`. See [`Engine::kill_actor`] for what
    /// happens to whatever it was waiting on.
    pub fn kill(&self, target: ActorId) {
        self.engine.borrow_mut().kill_actor(target);
    }

    /// Excludes `target` from scheduling until [`ActorApi::resume`].
    pub fn suspend(&self, target: ActorId) {
        self.engine.borrow_mut().suspend_actor(target);
    }

    pub fn resume(&self, target: ActorId) {
        self.engine.borrow_mut().resume_actor(target);
    }

    /// `test(activity)`: never blocks, just reports whether it's already
    /// terminal.
    pub fn test(&self, activity: ActivityId) -> bool {
        self.engine.borrow().activities.get(activity).map(|a| crate::activity::test(&a)).unwrap_or(true)
    }

    /// `test_any(activities)`: index of the first already-terminal activity,
    /// if any, without blocking.
    pub fn test_any(&self, activities: &[ActivityId]) -> Option<usize> {
        let eng = self.engine.borrow();
        activities.iter().position(|&id| eng.activities.get(id).map(|a| a.borrow().is_terminal()).unwrap_or(true))
    }

    /// Blocks until the first of `activities` completes, returning its
    /// index and outcome. Registers this actor as a waiter on every one of
    /// them; `wake_actor` cleans up the rest once one of them wakes it.
    pub fn wait_any(&self, activities: &[ActivityId], timeout: Option<f64>) -> SimResult<usize> {
        let log = self.engine.borrow().log.clone();
        sim_assert!(log, !activities.is_empty(), "wait_any called with no activities");
        if let Some(idx) = self.test_any(activities) {
            return Ok(idx);
        }
        {
            let mut eng = self.engine.borrow_mut();
            let timer = timeout.map(|t| {
                let deadline = eng.now + t;
                eng.timers.schedule(
                    deadline,
                    TimerAction::WaitAnyTimeout {
                        actor: self.actor.0,
                        activities: activities.iter().map(|a| a.0).collect(),
                    },
                )
            });
            let a = eng.actors.get(self.actor).expect("actor missing from table");
            {
                let mut a = a.borrow_mut();
                a.waiting_activity = Some(activities[0]);
                a.waiting_extra = activities[1..].to_vec();
                a.state = actor::State::Blocked;
            }
            for &id in activities {
                let act = eng.activities.get(id).expect("activity missing from table");
                act.borrow_mut().waiters.push_back(Waiter {
                    actor: self.actor,
                    timeout_timer: timer,
                });
            }
        }
        self.yielder.suspend(Suspend::Blocked);
        let outcome = {
            let mut eng = self.engine.borrow_mut();
            eng.pending_wait_outcome.remove(&self.actor).unwrap_or(Ok(()))
        };
        outcome?;
        let eng = self.engine.borrow();
        Ok(test_any_or_first(activities, &eng))
    }
}

/// After a `wait_any` wakes with `Ok`, finds which activity actually
/// completed; falls back to the first if none reads terminal yet (the
/// woken activity's own waiter-drain happens before `wake_actor`, so by
/// the time this runs its state is already terminal).
fn test_any_or_first(activities: &[ActivityId], eng: &Engine) -> usize {
    activities
        .iter()
        .position(|&id| eng.activities.get(id).map(|a| a.borrow().is_terminal()).unwrap_or(false))
        .unwrap_or(0)
}

impl Drop for Engine {
    fn drop(&mut self) {
        slog::debug!(self.log, "engine shutdown at t={}", self.now);
    }
}
