//! Host A runs two 1e9-flop execs concurrently; the Cas01 CPU model splits
//! its one constraint evenly between them, so each sees half its declared
//! rate: both finish at t = 2 s, and each has done exactly half its flops
//! (remaining 5e8) at t = 1 s. Verified here by splitting each exec into two
//! 5e8-flop halves and checking the wall-clock time between them.

use std::cell::RefCell;
use std::rc::Rc;

use simgrid_core::engine::{ActorApi, Engine};
use simgrid_core::host::Platform;
use simgrid_core::Config;

#[test]
fn two_execs_on_one_host_finish_at_double_the_solo_time() {
    let mut platform = Platform::new();
    let a = platform.add_host("a", 1e9, 1);
    platform.seal();

    let engine = Engine::new(Config::default(), platform, simgrid_core::logger::discard());
    let halfway: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
    let finish: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));

    for i in 0..2 {
        let halfway = halfway.clone();
        let finish = finish.clone();
        let engine_for_exec = engine.clone();
        Engine::spawn(&engine, format!("exec-{}", i), a, false, false, move |api: ActorApi| {
            if api.exec(5e8).is_ok() {
                halfway.borrow_mut().push(engine_for_exec.borrow().now);
            }
            if api.exec(5e8).is_ok() {
                finish.borrow_mut().push(engine_for_exec.borrow().now);
            }
        });
    }

    Engine::run_until(&engine, 10.0).expect("no deadlock");

    let halfway = halfway.borrow();
    let finish = finish.borrow();
    assert_eq!(halfway.len(), 2);
    assert_eq!(finish.len(), 2);
    for &t in halfway.iter() {
        assert!((t - 1.0).abs() < 1e-6, "halfway at {}, expected 1.0", t);
    }
    for &t in finish.iter() {
        assert!((t - 2.0).abs() < 1e-6, "finished at {}, expected 2.0", t);
    }
}
