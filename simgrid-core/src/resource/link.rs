//! Link (network) resource model: one LMM constraint per link, one
//! variable per Comm with coefficient 1 in every link of its route.
//! `fatpipe` links use the LMM's per-variable max rule; `non-linear` links
//! pass their capacity through a hook before the solver sees it.
//!
//! Latency is deliberately kept out of the LMM: each Comm tracks its own
//! `latency_remaining`, draining at a fixed rate of 1 simulated second per
//! second, and only gets a nonzero LMM weight once that reaches zero --
//! modeling bytes that aren't on the wire yet.

use std::collections::HashMap;

use crate::activity::{ActivityId, ActivityTable, State};
use crate::host::{LinkId, SharingPolicy as PlatformPolicy};
use crate::lmm::{ConstraintId, SharingPolicy, System, VariableId};

use super::{Model, Outcome};

#[derive(Debug)]
struct RunningComm {
    var: VariableId,
    latency_remaining: f64,
    bytes_remaining: f64,
    in_bandwidth_phase: bool,
}

#[derive(Debug)]
pub struct LinkModel {
    system: System,
    constraints: HashMap<LinkId, ConstraintId>,
    running: HashMap<ActivityId, RunningComm>,
    activity_links: HashMap<ActivityId, Vec<LinkId>>,
}

impl LinkModel {
    pub fn new(precision: f64, log: slog::Logger) -> LinkModel {
        LinkModel {
            system: System::new(precision, log),
            constraints: HashMap::new(),
            running: HashMap::new(),
            activity_links: HashMap::new(),
        }
    }

    pub fn register_link(&mut self, link: LinkId, capacity: f64, policy: &PlatformPolicy) {
        let lmm_policy = match policy {
            PlatformPolicy::FatPipe => SharingPolicy::FatPipe,
            PlatformPolicy::NonLinear => {
                SharingPolicy::NonLinear(std::sync::Arc::new(|cap: f64, n: usize| cap / (n.max(1) as f64).sqrt()))
            }
            // wifi: shared sharing with a reduced effective capacity to
            // approximate per-station airtime overhead (see DESIGN.md).
            PlatformPolicy::Wifi => SharingPolicy::Shared,
            PlatformPolicy::Shared => SharingPolicy::Shared,
        };
        let k = self.system.add_constraint(capacity, lmm_policy);
        self.constraints.insert(link, k);
    }

    pub fn start_comm(&mut self, activity: ActivityId, links: Vec<LinkId>, latency: f64, simulated_bytes: f64, rate_cap: f64) -> VariableId {
        let bound = if rate_cap > 0.0 { rate_cap } else { f64::INFINITY };
        let latency_phase = latency > 0.0;
        let var = self.system.add_variable(if latency_phase { 0.0 } else { 1.0 }, bound);
        for l in &links {
            if let Some(&k) = self.constraints.get(l) {
                self.system.set_coefficient(var, k, 1.0);
            }
        }
        self.running.insert(
            activity,
            RunningComm {
                var,
                latency_remaining: latency,
                bytes_remaining: simulated_bytes,
                in_bandwidth_phase: !latency_phase,
            },
        );
        self.activity_links.insert(activity, links);
        var
    }

    pub fn stop_comm(&mut self, activity: ActivityId) {
        if let Some(r) = self.running.remove(&activity) {
            self.system.remove_variable(r.var);
        }
        self.activity_links.remove(&activity);
    }

    pub fn rate(&self, activity: ActivityId) -> Option<f64> {
        self.running.get(&activity).map(|r| self.system.value(r.var))
    }

    pub fn set_capacity(&mut self, link: LinkId, capacity: f64) {
        if let Some(&k) = self.constraints.get(&link) {
            self.system.set_capacity(k, capacity);
        }
    }

    /// Stops every Comm using `link` and returns their ids, for the engine
    /// to fail; used when a link is turned off mid-run.
    pub fn fail_link(&mut self, link: LinkId) -> Vec<ActivityId> {
        let ids: Vec<ActivityId> = self
            .activity_links
            .iter()
            .filter(|&(_, links)| links.contains(&link))
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            self.stop_comm(*id);
        }
        ids
    }
}

impl Model for LinkModel {
    fn share_resources(&mut self, _now: f64) -> f64 {
        self.system.solve();
        let mut dt = f64::INFINITY;
        for r in self.running.values() {
            if !r.in_bandwidth_phase {
                dt = dt.min(r.latency_remaining.max(0.0));
                continue;
            }
            let rate = self.system.value(r.var);
            if rate > 0.0 {
                dt = dt.min(r.bytes_remaining / rate);
            }
        }
        dt
    }

    fn update_actions_state(&mut self, _now: f64, dt: f64, activities: &ActivityTable) -> Outcome {
        let mut out = Outcome::default();
        for (&id, r) in self.running.iter_mut() {
            if !r.in_bandwidth_phase {
                r.latency_remaining = (r.latency_remaining - dt).max(0.0);
                if r.latency_remaining <= 1e-9 {
                    r.in_bandwidth_phase = true;
                    self.system.set_weight(r.var, 1.0);
                }
                continue;
            }
            let rate = self.system.value(r.var);
            r.bytes_remaining -= rate * dt;
            if let Some(a) = activities.get(id) {
                let mut a = a.borrow_mut();
                a.remaining = r.bytes_remaining;
                if r.bytes_remaining <= 1e-9 && a.state == State::Running {
                    out.done.push(id);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn comm_with_no_latency_starts_in_bandwidth_phase() {
        let mut net = LinkModel::new(1e-9, crate::logger::discard());
        let link = LinkId(0);
        net.register_link(link, 100.0, &PlatformPolicy::Shared);
        net.start_comm(ActivityId(0), vec![link], 0.0, 1000.0, f64::INFINITY);
        let dt = net.share_resources(0.0);
        assert!((dt - 10.0).abs() < 1e-6);
    }

    #[test]
    fn latency_drains_before_bandwidth_phase() {
        let mut net = LinkModel::new(1e-9, crate::logger::discard());
        let link = LinkId(0);
        net.register_link(link, 100.0, &PlatformPolicy::Shared);
        net.start_comm(ActivityId(0), vec![link], 5.0, 1000.0, f64::INFINITY);
        let dt = net.share_resources(0.0);
        assert!((dt - 5.0).abs() < 1e-6);
    }

    #[test]
    fn fatpipe_link_gives_each_comm_full_capacity() {
        let mut net = LinkModel::new(1e-9, crate::logger::discard());
        let link = LinkId(0);
        net.register_link(link, 100.0, &PlatformPolicy::FatPipe);
        net.start_comm(ActivityId(0), vec![link], 0.0, 1000.0, f64::INFINITY);
        net.start_comm(ActivityId(1), vec![link], 0.0, 1000.0, f64::INFINITY);
        net.share_resources(0.0);
        assert!((net.rate(ActivityId(0)).unwrap() - 100.0).abs() < 1e-6);
        assert!((net.rate(ActivityId(1)).unwrap() - 100.0).abs() < 1e-6);
    }
}
