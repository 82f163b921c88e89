//! A lone `recv(mbox, timeout=0.5)` with no sender ever arriving wakes at
//! t = 0.5 with `SimError::Timeout`.

use std::cell::RefCell;
use std::rc::Rc;

use simgrid_core::engine::{ActorApi, Engine};
use simgrid_core::host::Platform;
use simgrid_core::{Config, SimError};

#[test]
fn recv_with_no_sender_times_out_at_deadline() {
    let mut platform = Platform::new();
    let a = platform.add_host("a", 1e9, 1);
    platform.seal();

    let engine = Engine::new(Config::default(), platform, simgrid_core::logger::discard());
    let outcome: Rc<RefCell<Option<(f64, Result<usize, SimError>)>>> = Rc::new(RefCell::new(None));

    let outcome_for_actor = outcome.clone();
    let engine_for_actor = engine.clone();
    Engine::spawn(&engine, "receiver", a, false, false, move |api: ActorApi| {
        let result = api.recv("mbox-a", Some(0.5));
        *outcome_for_actor.borrow_mut() = Some((engine_for_actor.borrow().now, result));
    });

    Engine::run_until(&engine, 10.0).expect("no deadlock");

    let (t, result) = outcome.borrow_mut().take().expect("receiver should have woken");
    assert!((t - 0.5).abs() < 1e-9, "woke at {}, expected 0.5", t);
    assert_eq!(result, Err(SimError::Timeout));
}
