//! Piecewise-linear trace file reader, for the availability/power-scale
//! events `cpu_cas01.c`'s `tmgr_history_add_trace` feeds into
//! `cpu_update_resource_state` -- the distilled feature list dropped the file
//! format but not the underlying feature (hosts/links can still be given
//! `set_trace`), so it's supplemented here from `original_source/`.
//!
//! Format: one `time value` pair per line, blank lines and `#`-comments
//! ignored, times strictly increasing. Between two points the value is
//! held constant from the earlier point's timestamp (SimGrid's own trace
//! format is a step function, not a true linear interpolation, despite
//! the "piecewise-linear" name it's long carried).

use crate::error::{SimError, SimResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: f64,
    pub value: f64,
}

/// A parsed trace: an ordered list of (time, value) steps.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    points: Vec<Point>,
}

impl Trace {
    pub fn parse(text: &str) -> SimResult<Trace> {
        let mut points = Vec::new();
        let mut last_time = f64::NEG_INFINITY;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let time: f64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| SimError::InvalidArgument(format!("trace line {}: missing time", lineno + 1)))?;
            let value: f64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| SimError::InvalidArgument(format!("trace line {}: missing value", lineno + 1)))?;
            if time <= last_time {
                return Err(SimError::InvalidArgument(format!(
                    "trace line {}: time {} does not strictly increase after {}",
                    lineno + 1,
                    time,
                    last_time
                )));
            }
            last_time = time;
            points.push(Point { time, value });
        }
        Ok(Trace { points })
    }

    /// The value in effect at `now`: the last point whose time is `<= now`,
    /// or the trace's first value if `now` precedes every point.
    pub fn value_at(&self, now: f64) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        match self.points.binary_search_by(|p| p.time.partial_cmp(&now).unwrap()) {
            Ok(i) => Some(self.points[i].value),
            Err(0) => Some(self.points[0].value),
            Err(i) => Some(self.points[i - 1].value),
        }
    }

    /// The next timestamp strictly after `now`, if any -- used to schedule
    /// the next trace-driven `update_resource_state` callback.
    pub fn next_change_after(&self, now: f64) -> Option<f64> {
        self.points.iter().map(|p| p.time).find(|&t| t > now)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_and_steps() {
        let trace = Trace::parse("0.0 1.0\n5.0 0.5\n# comment\n10.0 0.0\n").unwrap();
        assert_eq!(trace.value_at(0.0), Some(1.0));
        assert_eq!(trace.value_at(4.9), Some(1.0));
        assert_eq!(trace.value_at(5.0), Some(0.5));
        assert_eq!(trace.value_at(100.0), Some(0.0));
    }

    #[test]
    fn rejects_non_increasing_times() {
        assert!(Trace::parse("1.0 1.0\n0.5 1.0\n").is_err());
    }

    #[test]
    fn next_change_after_skips_past_points() {
        let trace = Trace::parse("0.0 1.0\n5.0 0.5\n10.0 0.0\n").unwrap();
        assert_eq!(trace.next_change_after(3.0), Some(5.0));
        assert_eq!(trace.next_change_after(10.0), None);
    }
}
