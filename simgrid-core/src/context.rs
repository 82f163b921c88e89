//! Context factory: gives every actor its own stack and a
//! cooperative switch primitive, so actor code can block mid-function
//! (`activity.wait`) without the engine needing to be written in
//! continuation-passing style.
//!
//! Two backends, selected by [`crate::config::ContextBackend`]:
//!
//! - `Stackful` (default): one [`corosensei`] stackful coroutine per actor.
//!   `resume`/`suspend` are a real register-and-stack swap, no heap
//!   allocation per switch.
//! - `Thread`: one kernel thread per actor, serialized behind a handoff
//!   channel. Heavier, but doesn't require a platform with stack-switching
//!   support; kept as a fallback the way the engine's own `contexts/factory`
//!   config names a `thread` option.
//!
//! This replaces a polling `advance`-style trait: instead of actor code
//! returning control every time it would block, it runs on its own stack
//! and calls [`Yielder::suspend`] directly from arbitrarily deep inside
//! `activity::wait`.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult};

/// Why a context gave up the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    /// Blocked on an activity; don't resume until something wakes it.
    Blocked,
    /// Finished its current burst of work and is yielding the core
    /// voluntarily (used by the parallel scheduling round to time-slice
    /// actors that never block).
    Yielded,
}

/// Outcome of a [`Context::resume`] call.
#[derive(Debug)]
pub enum Resumed {
    /// The actor suspended again; it is still alive.
    Suspended(Suspend),
    /// The actor's body returned; the context is spent and must not be
    /// resumed again.
    Finished,
}

enum Backend {
    Stackful(Coroutine<(), Suspend, ()>),
    /// `Some` while the thread is alive and parked waiting for a resume;
    /// taken and joined once the body returns.
    Thread(ThreadContext),
}

/// See the safety comment at its only construction site in `Context::create`.
struct SendBody<F>(F);
unsafe impl<F> Send for SendBody<F> {}

struct ThreadContext {
    to_actor: crossbeam_channel::Sender<()>,
    from_actor: crossbeam_channel::Receiver<Resumed>,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// A single actor's execution context. Created once per actor and resumed
/// every time the engine decides it's that actor's turn to run.
pub struct Context {
    backend: Backend,
    finished: bool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("finished", &self.finished).finish()
    }
}

/// The handle passed into an actor's body, used to give up the CPU.
/// For the thread backend this blocks on a channel; for the stackful
/// backend it's a real coroutine yield. Actor code doesn't need to know
/// which: it just calls [`Yielder::suspend`].
pub enum Yielder<'a> {
    Stackful(&'a corosensei::Yielder<(), Suspend>),
    Thread {
        to_sched: &'a crossbeam_channel::Sender<Resumed>,
        from_sched: &'a crossbeam_channel::Receiver<()>,
    },
}

impl<'a> std::fmt::Debug for Yielder<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Yielder::Stackful(_) => f.write_str("Yielder::Stackful"),
            Yielder::Thread { .. } => f.write_str("Yielder::Thread"),
        }
    }
}

impl<'a> Yielder<'a> {
    /// Gives up the CPU until the engine resumes this context again.
    pub fn suspend(&self, why: Suspend) {
        match self {
            Yielder::Stackful(y) => {
                y.suspend(why);
            }
            Yielder::Thread { to_sched, from_sched } => {
                to_sched.send(Resumed::Suspended(why)).expect("scheduler thread gone");
                from_sched.recv().expect("scheduler thread gone");
            }
        }
    }
}

impl Context {
    /// Builds a context around `body`, which runs on its own stack/thread
    /// once [`Context::resume`] is first called. `body` receives a
    /// [`Yielder`] it must use instead of ever returning early.
    pub fn create<F>(cfg: &crate::config::Config, body: F) -> Context
    where
        F: FnOnce(&Yielder) + 'static,
    {
        match cfg.context_backend {
            crate::config::ContextBackend::Stackful => {
                // corosensei's DefaultStack maps a guard page of its own;
                // cfg.guard_size isn't independently selectable here, only
                // the stack size is.
                let stack = DefaultStack::new(cfg.stack_size).expect("failed to allocate actor stack");
                let coro = Coroutine::with_stack(stack, move |yielder, ()| {
                    body(&Yielder::Stackful(yielder));
                });
                Context {
                    backend: Backend::Stackful(coro),
                    finished: false,
                }
            }
            crate::config::ContextBackend::Thread => {
                let (to_actor_tx, to_actor_rx) = crossbeam_channel::bounded::<()>(0);
                let (from_actor_tx, from_actor_rx) = crossbeam_channel::bounded::<Resumed>(0);
                // `body` typically closes over `Rc`/`RefCell` engine state, which
                // isn't `Send`: that's fine here because the handoff channels
                // enforce strict alternation with the resuming thread (it blocks
                // in `resume` the entire time this thread touches shared
                // state), so there's never a real data race, just a type system
                // that can't see the rendezvous.
                let body = SendBody(body);
                let handle = std::thread::Builder::new()
                    .stack_size(cfg.stack_size)
                    .spawn(move || {
                        let body = body;
                        // wait for the first resume before running any actor code,
                        // so construction order matches the stackful backend (lazy start).
                        if to_actor_rx.recv().is_err() {
                            return;
                        }
                        let yielder = Yielder::Thread {
                            to_sched: &from_actor_tx,
                            from_sched: &to_actor_rx,
                        };
                        (body.0)(&yielder);
                        let _ = from_actor_tx.send(Resumed::Finished);
                    })
                    .expect("failed to spawn actor thread");
                Context {
                    backend: Backend::Thread(ThreadContext {
                        to_actor: to_actor_tx,
                        from_actor: from_actor_rx,
                        handle: Some(handle),
                    }),
                    finished: false,
                }
            }
        }
    }

    /// Runs (or resumes) the context until it next suspends or returns.
    /// Calling this after `Resumed::Finished` has been observed panics.
    pub fn resume(&mut self) -> Resumed {
        assert!(!self.finished, "resumed a finished context");
        match &mut self.backend {
            Backend::Stackful(coro) => match coro.resume(()) {
                CoroutineResult::Yield(why) => Resumed::Suspended(why),
                CoroutineResult::Return(()) => {
                    self.finished = true;
                    Resumed::Finished
                }
            },
            Backend::Thread(t) => {
                t.to_actor.send(()).expect("actor thread gone");
                let r = t.from_actor.recv().expect("actor thread gone");
                if matches!(r, Resumed::Finished) {
                    self.finished = true;
                }
                r
            }
        }
    }

    /// Whether the actor body has returned.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Backend::Thread(t) = &mut self.backend {
            if let Some(handle) = t.handle.take() {
                if !self.finished {
                    // dropping the sender unblocks the actor thread's recv with an error,
                    // which it uses as its cue to exit without running the rest of its body.
                    drop(std::mem::replace(&mut t.to_actor, crossbeam_channel::bounded(0).0));
                }
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn stackful_runs_to_completion() {
        let cfg = Config::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let mut ctx = Context::create(&cfg, move |_y| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        match ctx.resume() {
            Resumed::Finished => {}
            Resumed::Suspended(_) => panic!("should have run to completion"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(ctx.is_finished());
    }

    #[test]
    fn stackful_suspends_and_resumes() {
        let cfg = Config::default();
        let mut ctx = Context::create(&cfg, |y| {
            y.suspend(Suspend::Blocked);
            y.suspend(Suspend::Yielded);
        });
        assert!(matches!(ctx.resume(), Resumed::Suspended(Suspend::Blocked)));
        assert!(matches!(ctx.resume(), Resumed::Suspended(Suspend::Yielded)));
        assert!(matches!(ctx.resume(), Resumed::Finished));
    }

    #[test]
    fn thread_backend_suspends_and_resumes() {
        let mut cfg = Config::default();
        cfg.context_backend = crate::config::ContextBackend::Thread;
        let mut ctx = Context::create(&cfg, |y| {
            y.suspend(Suspend::Blocked);
        });
        assert!(matches!(ctx.resume(), Resumed::Suspended(Suspend::Blocked)));
        assert!(matches!(ctx.resume(), Resumed::Finished));
    }
}
