//! Turning a host or link off fails every activity currently using it and
//! wakes its waiters with the matching `SimError` variant.

use std::cell::RefCell;
use std::rc::Rc;

use simgrid_core::engine::{ActorApi, Engine};
use simgrid_core::host::{Platform, ResourceState, SharingPolicy};
use simgrid_core::{Config, SimError};

#[test]
fn host_failure_fails_running_exec() {
    let mut platform = Platform::new();
    let a = platform.add_host("a", 1e9, 1);
    platform.seal();

    let engine = Engine::new(Config::default(), platform, simgrid_core::logger::discard());
    let outcome: Rc<RefCell<Option<Result<(), SimError>>>> = Rc::new(RefCell::new(None));

    let outcome_for_actor = outcome.clone();
    Engine::spawn(&engine, "worker", a, false, false, move |api: ActorApi| {
        let result = api.exec(1e9);
        *outcome_for_actor.borrow_mut() = Some(result);
    });

    // let the exec actually start before failing its host
    let engine_for_failure = engine.clone();
    Engine::spawn(&engine, "killer", a, false, false, move |api: ActorApi| {
        let _ = api.sleep(0.1);
        engine_for_failure.borrow_mut().set_host_state(a, ResourceState::Off);
    });

    Engine::run_until(&engine, 10.0).expect("no deadlock");

    let outcome = outcome.borrow_mut().take().expect("worker should have woken");
    assert_eq!(outcome, Err(SimError::HostFailure("a".into())));
}

#[test]
fn link_failure_fails_running_comm() {
    let mut platform = Platform::new();
    let a = platform.add_host("a", 1e9, 1);
    let b = platform.add_host("b", 1e9, 1);
    let link = platform.add_link("a-b", 1e6, 0.001, SharingPolicy::Shared);
    platform.add_route(a, b, vec![link]);
    platform.seal();

    let engine = Engine::new(Config::default(), platform, simgrid_core::logger::discard());
    let send_outcome: Rc<RefCell<Option<Result<(), SimError>>>> = Rc::new(RefCell::new(None));
    let recv_outcome: Rc<RefCell<Option<Result<usize, SimError>>>> = Rc::new(RefCell::new(None));

    let recv_outcome_for_actor = recv_outcome.clone();
    Engine::spawn(&engine, "receiver", b, false, false, move |api: ActorApi| {
        let result = api.recv("mbox-b", None);
        *recv_outcome_for_actor.borrow_mut() = Some(result);
    });

    let send_outcome_for_actor = send_outcome.clone();
    Engine::spawn(&engine, "sender", a, false, false, move |api: ActorApi| {
        let result = api.send("mbox-b", vec![link], 0.001, 1_000_000, 1_000_000.0);
        *send_outcome_for_actor.borrow_mut() = Some(result);
    });

    let engine_for_failure = engine.clone();
    Engine::spawn(&engine, "killer", a, false, false, move |api: ActorApi| {
        let _ = api.sleep(0.1);
        engine_for_failure.borrow_mut().set_link_state(link, ResourceState::Off);
    });

    Engine::run_until(&engine, 10.0).expect("no deadlock");

    let send_outcome = send_outcome.borrow_mut().take().expect("sender should have woken");
    assert_eq!(send_outcome, Err(SimError::NetworkFailure("a-b".into())));
    let recv_outcome = recv_outcome.borrow_mut().take().expect("receiver should have woken");
    assert_eq!(recv_outcome, Err(SimError::NetworkFailure("a-b".into())));
}

#[test]
fn host_trace_turns_resource_off_and_back_on() {
    let mut platform = Platform::new();
    let a = platform.add_host("a", 1e9, 1);
    platform.seal();

    let engine = Engine::new(Config::default(), platform, simgrid_core::logger::discard());
    {
        let mut eng = engine.borrow_mut();
        let trace = simgrid_core::trace::Trace::parse("0.0 1.0\n0.5 0.0\n2.0 1.0\n").unwrap();
        eng.set_host_trace(a, trace);
    }

    let outcome: Rc<RefCell<Option<Result<(), SimError>>>> = Rc::new(RefCell::new(None));
    let outcome_for_actor = outcome.clone();
    Engine::spawn(&engine, "worker", a, false, false, move |api: ActorApi| {
        let result = api.exec(1e9);
        *outcome_for_actor.borrow_mut() = Some(result);
    });

    Engine::run_until(&engine, 10.0).expect("no deadlock");

    let outcome = outcome.borrow_mut().take().expect("worker should have woken");
    assert_eq!(outcome, Err(SimError::HostFailure("a".into())));
}
