#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

//! A discrete-event simulator of distributed systems: actors running on
//! simulated hosts, communicating over simulated networks whose bandwidth
//! and CPU time are shared by a max-min fair solver rather than measured on
//! real hardware.
//!
//! The pieces, in the order a simulation assembles them:
//!
//! - [`host`]: the platform -- hosts, links, routes.
//! - [`lmm`]: the max-min fair solver shared hosts and links contend through.
//! - [`resource`]: the CPU and Link models built on top of [`lmm`].
//! - [`context`]: one stack (or thread) per actor, so actor code can block
//! mid-function.
//! - [`actor`]: actor identity and lifecycle.
//! - [`activity`]: the state machine every blocking operation goes through.
//! - [`mailbox`], [`sync`]: rendezvous communication and mutex/condvar/semaphore.
//! - [`timer`]: the deadline heap driving timeouts and sleeps.
//! - [`engine`]: ties all of the above into `run_until`.
//!
//! [`config::Config`] and [`error::SimError`] are used throughout; [`logger`]
//! wires up `slog` the way every other module expects a `slog::Logger` to
//! have already been built.

pub mod activity;
pub mod actor;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod host;
pub mod lmm;
pub mod logger;
pub mod mailbox;
pub mod resource;
pub mod sync;
pub mod timer;
pub mod trace;

pub use config::Config;
pub use engine::Engine;
pub use error::{SimError, SimResult};
pub use host::Platform;
