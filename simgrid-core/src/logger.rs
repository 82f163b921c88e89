//! A *very* simple [`slog::Drain`], lifted from the engine's own logger.
//!
//! `Trace`-level records are timestamped against an [`Instant`] captured at
//! construction (nanos-since-start, message); every other level is written
//! as a bare message line. This is deliberately not a general-purpose
//! drain: it exists so that the LMM solver and the activity layer can emit
//! a cheap, grep-able trace of every `solve` and state transition without
//! pulling in `slog-json`/`slog-async`.

use slog::OwnedKVList;
use slog::Record;

use std::cell::RefCell;
use std::io;
use std::time::Instant;

/// Writes log records to `W`, prefixing `Trace` records with an elapsed-time column.
#[derive(Debug)]
pub struct MsgLogger<W: io::Write> {
    io: RefCell<W>,
    start: Instant,
}

impl<W> MsgLogger<W>
where
    W: io::Write,
{
    /// Builds a drain writing to `io`; the clock for `Trace` timestamps starts now.
    pub fn new(io: W) -> MsgLogger<W> {
        MsgLogger {
            io: RefCell::new(io),
            start: Instant::now(),
        }
    }
}

impl<W> slog::Drain for MsgLogger<W>
where
    W: io::Write,
{
    type Ok = ();
    type Err = io::Error;

    fn log(&self, rinfo: &Record, _logger_values: &OwnedKVList) -> io::Result<()> {
        let mut io = self.io.borrow_mut();
        if rinfo.level == slog::Level::Trace {
            writeln!(io, "{},{}", self.start.elapsed().as_nanos(), rinfo.msg())?;
        } else {
            writeln!(io, "{}", rinfo.msg())?;
        }

        Ok(())
    }
}

/// Builds a root logger that discards everything, for embedders who don't
/// want the simulator's internal trace.
pub fn discard() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// Builds a root logger writing through [`MsgLogger`] to stderr.
pub fn stderr() -> slog::Logger {
    slog::Logger::root(MsgLogger::new(std::io::stderr()).fuse(), slog::o!())
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::info;

    #[test]
    fn writes_bare_message_for_non_trace_levels() {
        let buf: Vec<u8> = Vec::new();
        let drain = MsgLogger::new(buf);
        let log = slog::Logger::root(drain.fuse(), slog::o!());
        info!(log, "hello");
    }
}
