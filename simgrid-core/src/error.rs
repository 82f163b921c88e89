//! Error kinds surfaced through activity waits.
//!
//! Every variant here is recovered locally by the *other* side of whatever
//! the failing actor was waiting on: they come back as the `Err` side of a
//! wait's `Result`. A killed actor is never resumed again to observe
//! `ForcefulKill` itself (see [`crate::engine::Engine::kill_actor`]); the
//! variant exists for whoever was still waiting on an activity it held.

use thiserror::Error;

/// Recoverable and fatal error kinds an activity wait can produce.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    /// A waiter's timer fired before the activity terminated.
    #[error("activity timed out")]
    Timeout,

    /// The host executing the waiter went down.
    #[error("host '{0}' failed")]
    HostFailure(String),

    /// A link used by the Comm went down.
    #[error("link '{0}' failed")]
    NetworkFailure(String),

    /// Caller or peer cancelled the activity.
    #[error("activity was cancelled")]
    Cancel,

    /// Contract violation at request time (e.g. negative size).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An activity's owner was killed while the activity was still in
    /// flight (e.g. a `recv` whose matching `send` is held by an actor
    /// `kill` just tore down).
    #[error("actor was forcefully killed")]
    ForcefulKill,
}

/// Result alias used throughout the activity-wait API.
pub type SimResult<T> = Result<T, SimError>;

/// Logs a `crit`-level message through `$log` and panics, for invariants
/// that must never be violated by a correct caller. Always fatal, unlike
/// every other [`SimError`] variant, so it takes a logger rather than
/// returning one.
#[macro_export]
macro_rules! sim_assert {
    ($log:expr, $cond:expr, $($arg:tt)+) => {
        if !$cond {
            let msg = format!($($arg)+);
            slog::crit!($log, "internal invariant violated: {}", msg);
            panic!("internal invariant violated: {}", msg);
        }
    };
}
