//! Same platform as two_host_ping, but A sends 1 MB to B twice at once over
//! the same shared link. Each Comm gets 5 Mbit/s; both complete at 1.60001 s.

use std::cell::RefCell;
use std::rc::Rc;

use simgrid_core::engine::{ActorApi, Engine};
use simgrid_core::host::{Platform, SharingPolicy};
use simgrid_core::Config;

#[test]
fn two_simultaneous_sends_split_the_link_evenly() {
    let mut platform = Platform::new();
    let a = platform.add_host("a", 1e9, 1);
    let b = platform.add_host("b", 1e9, 1);
    let link = platform.add_link("a-b", 10e6 / 8.0, 10e-6, SharingPolicy::Shared);
    platform.add_route(a, b, vec![link]);
    platform.seal();

    let engine = Engine::new(Config::default(), platform, simgrid_core::logger::discard());
    let completions: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));

    for i in 0..2 {
        let mailbox = format!("mbox-b-{}", i);
        Engine::spawn(&engine, format!("receiver-{}", i), b, false, false, {
            let mailbox = mailbox.clone();
            move |api: ActorApi| {
                let _ = api.recv(&mailbox, None);
            }
        });

        let completions = completions.clone();
        let engine_for_send = engine.clone();
        Engine::spawn(&engine, format!("sender-{}", i), a, false, false, move |api: ActorApi| {
            if api.send(&mailbox, vec![link], 10e-6, 1_000_000, 1_000_000.0).is_ok() {
                completions.borrow_mut().push(engine_for_send.borrow().now);
            }
        });
    }

    Engine::run_until(&engine, 10.0).expect("no deadlock");

    let completions = completions.borrow();
    assert_eq!(completions.len(), 2);
    for &t in completions.iter() {
        assert!((t - 1.60001).abs() < 1e-9, "completed at {}, expected 1.60001", t);
    }
}
