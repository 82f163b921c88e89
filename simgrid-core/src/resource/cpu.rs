//! CPU resource model, Cas01 style: one LMM constraint per host with
//! capacity `cores * peak * scale`, one LMM variable per Exec activity
//! with coefficient 1 in its host's constraint. Per-core affinity adds an
//! optional second constraint per (host, core) pair.

use std::collections::HashMap;

use crate::activity::{ActivityId, ActivityTable, State};
use crate::host::HostId;
use crate::lmm::{ConstraintId, SharingPolicy, System, VariableId};

use super::{Model, Outcome};

#[derive(Debug)]
struct Running {
    var: VariableId,
    remaining: f64,
}

#[derive(Debug)]
pub struct CpuModel {
    system: System,
    host_constraints: HashMap<HostId, ConstraintId>,
    core_constraints: HashMap<(HostId, u32), ConstraintId>,
    running: HashMap<ActivityId, Running>,
    activity_host: HashMap<ActivityId, HostId>,
}

impl CpuModel {
    pub fn new(precision: f64, log: slog::Logger) -> CpuModel {
        CpuModel {
            system: System::new(precision, log),
            host_constraints: HashMap::new(),
            core_constraints: HashMap::new(),
            running: HashMap::new(),
            activity_host: HashMap::new(),
        }
    }

    /// Registers a host's CPU constraint. `cores` additional per-core
    /// constraints are created lazily the first time an Exec sets
    /// affinity for that core.
    pub fn register_host(&mut self, host: HostId, cores: u32, peak: f64, scale: f64) {
        let capacity = cores as f64 * peak * scale;
        let k = self.system.add_constraint(capacity, SharingPolicy::Shared);
        self.host_constraints.insert(host, k);
    }

    pub fn set_power_scale(&mut self, host: HostId, cores: u32, peak: f64, scale: f64) {
        if let Some(&k) = self.host_constraints.get(&host) {
            self.system.set_capacity(k, cores as f64 * peak * scale);
        }
    }

    /// Starts an Exec: creates its LMM variable, linked to the host
    /// constraint and, if `affinity` names specific cores, to each of
    /// those per-core constraints too.
    pub fn start_exec(
        &mut self,
        activity: ActivityId,
        host: HostId,
        flop_amount: f64,
        bound: f64,
        priority: f64,
        affinity: Option<u64>,
    ) -> VariableId {
        let bound = if bound > 0.0 { bound } else { f64::INFINITY };
        let var = self.system.add_variable(priority.max(f64::MIN_POSITIVE), bound);
        let host_k = *self.host_constraints.get(&host).expect("exec on unregistered host");
        self.system.set_coefficient(var, host_k, 1.0);

        if let Some(mask) = affinity {
            for core in 0..64u32 {
                if mask & (1 << core) != 0 {
                    let k = *self
                        .core_constraints
                        .entry((host, core))
                        .or_insert_with(|| self.system.add_constraint(f64::INFINITY, SharingPolicy::Shared));
                    self.system.set_coefficient(var, k, 1.0);
                }
            }
        }

        self.running.insert(activity, Running { var, remaining: flop_amount });
        self.activity_host.insert(activity, host);
        var
    }

    pub fn stop_exec(&mut self, activity: ActivityId) {
        if let Some(r) = self.running.remove(&activity) {
            self.system.remove_variable(r.var);
        }
        self.activity_host.remove(&activity);
    }

    pub fn rate(&self, activity: ActivityId) -> Option<f64> {
        self.running.get(&activity).map(|r| self.system.value(r.var))
    }

    /// Stops every Exec running on `host` and returns their ids, for the
    /// engine to fail; used when a host is turned off mid-run.
    pub fn fail_host(&mut self, host: HostId) -> Vec<ActivityId> {
        let ids: Vec<ActivityId> = self.activity_host.iter().filter(|&(_, &h)| h == host).map(|(&id, _)| id).collect();
        for id in &ids {
            self.stop_exec(*id);
        }
        ids
    }
}

impl Model for CpuModel {
    fn share_resources(&mut self, _now: f64) -> f64 {
        self.system.solve();
        let mut dt = f64::INFINITY;
        for r in self.running.values() {
            let rate = self.system.value(r.var);
            if rate > 0.0 {
                dt = dt.min(r.remaining / rate);
            }
        }
        dt
    }

    fn update_actions_state(&mut self, _now: f64, dt: f64, activities: &ActivityTable) -> Outcome {
        let mut out = Outcome::default();
        for (&id, r) in self.running.iter_mut() {
            let rate = self.system.value(r.var);
            r.remaining -= rate * dt;
            if let Some(a) = activities.get(id) {
                let mut a = a.borrow_mut();
                a.remaining = r.remaining;
                if r.remaining <= 1e-9 && a.state == State::Running {
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
    fn single_exec_gets_full_host_capacity() {
        let mut cpu = CpuModel::new(1e-9, crate::logger::discard());
        let host = HostId(0);
        cpu.register_host(host, 1, 1.0, 1.0);
        let act = ActivityId(0);
        cpu.start_exec(act, host, 10.0, f64::INFINITY, 1.0, None);
        let dt = cpu.share_resources(0.0);
        assert!((dt - 10.0).abs() < 1e-6);
    }

    #[test]
    fn two_execs_on_same_host_split_evenly() {
        let mut cpu = CpuModel::new(1e-9, crate::logger::discard());
        let host = HostId(0);
        cpu.register_host(host, 1, 2.0, 1.0);
        cpu.start_exec(ActivityId(0), host, 10.0, f64::INFINITY, 1.0, None);
        cpu.start_exec(ActivityId(1), host, 10.0, f64::INFINITY, 1.0, None);
        cpu.share_resources(0.0);
        assert!((cpu.rate(ActivityId(0)).unwrap() - 1.0).abs() < 1e-6);
        assert!((cpu.rate(ActivityId(1)).unwrap() - 1.0).abs() < 1e-6);
    }
}
