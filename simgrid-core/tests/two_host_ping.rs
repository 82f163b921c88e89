//! Two hosts, one shared 10 Mbit/s, 10 us link. A sends 1 MB to B.
//! Expected completion: t = 10e-6 + 1e6 * 8 / 10e6 = 0.80001 s.

use std::cell::RefCell;
use std::rc::Rc;

use simgrid_core::engine::{ActorApi, Engine};
use simgrid_core::host::{Platform, SharingPolicy};
use simgrid_core::Config;

#[test]
fn ping_completes_at_expected_time() {
    let mut platform = Platform::new();
    let a = platform.add_host("a", 1e9, 1);
    let b = platform.add_host("b", 1e9, 1);
    let link = platform.add_link("a-b", 10e6 / 8.0, 10e-6, SharingPolicy::Shared);
    platform.add_route(a, b, vec![link]);
    platform.add_route(b, a, vec![link]);
    platform.seal();

    let engine = Engine::new(Config::default(), platform, simgrid_core::logger::discard());
    let done_at: Rc<RefCell<Option<f64>>> = Rc::new(RefCell::new(None));

    Engine::spawn(&engine, "receiver", b, false, false, |api: ActorApi| {
        let _ = api.recv("mbox-b", None);
    });

    let done_at_send = done_at.clone();
    let engine_for_send = engine.clone();
    Engine::spawn(&engine, "sender", a, false, false, move |api: ActorApi| {
        if api.send("mbox-b", vec![link], 10e-6, 1_000_000, 1_000_000.0).is_ok() {
            *done_at_send.borrow_mut() = Some(engine_for_send.borrow().now);
        }
    });

    Engine::run_until(&engine, 10.0).expect("no deadlock");

    let t = done_at.borrow().expect("send should have completed");
    assert!((t - 0.80001).abs() < 1e-9, "completed at {}, expected 0.80001", t);
}
