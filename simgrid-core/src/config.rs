//! Simulation-wide configuration, populated from `--cfg key:value` pairs
//! (CLI surface). `simgrid-core` never parses argv itself, that's
//! `simgrid-cli`'s job; this module just defines the destination struct and
//! its defaults.

/// Which context-switch backend [`crate::context::ContextFactory`] should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextBackend {
    /// Stackful coroutines via `corosensei` (the default).
    Stackful,
    /// One kernel thread per actor, serialized behind a single token.
    /// Heavier, but a useful fallback when a platform can't run stackful
    /// contexts (matches the real engine's `thread` context factory).
    Thread,
}

/// Which CPU resource model to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuModel {
    /// Cas01: one LMM constraint per host, linear in core count.
    Cas01,
}

/// Which network resource model to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkModel {
    /// One LMM constraint per link, latency handled outside the LMM.
    Constant,
}

/// Which host-level model composes the CPU and network models together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostModel {
    /// A host is just its CPU plus its network endpoint, solved
    /// independently (the only composition spec.md's Workstation section
    /// names).
    Workstation,
}

/// Simulation-wide tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `cpu/model`
    pub cpu_model: CpuModel,
    /// `network/model`
    pub network_model: NetworkModel,
    /// `host/model`
    pub host_model: HostModel,
    /// `contexts/factory`
    pub context_backend: ContextBackend,
    /// `contexts/stack-size`, in bytes.
    pub stack_size: usize,
    /// `contexts/guard-size`, in bytes. Zero disables the guard page.
    pub guard_size: usize,
    /// `contexts/nthreads`: worker count for the parallel pool.
    pub nthreads: usize,
    /// `contexts/parallel`: whether a scheduling round may use the worker pool.
    pub parallel: bool,
    /// `maxmin/precision`: tolerance used for every "<="/"==" comparison in the LMM solver.
    pub maxmin_precision: f64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cpu_model: CpuModel::Cas01,
            network_model: NetworkModel::Constant,
            host_model: HostModel::Workstation,
            context_backend: ContextBackend::Stackful,
            stack_size: 8 * 1024 * 1024,
            guard_size: 4096,
            nthreads: num_cpus::get(),
            parallel: false,
            maxmin_precision: 1e-5,
        }
    }
}

impl Config {
    /// Applies one `key:value` pair as parsed from a `--cfg` flag.
    ///
    /// Unknown keys are rejected with [`crate::error::SimError::InvalidArgument`]
    /// rather than silently ignored, matching "contract violation
    /// at request time" semantics.
    pub fn set(&mut self, key: &str, value: &str) -> crate::error::SimResult<()> {
        use crate::error::SimError;
        match key {
            "cpu/model" => match value {
                "Cas01" | "cas01" => self.cpu_model = CpuModel::Cas01,
                _ => return Err(SimError::InvalidArgument(format!("unknown cpu/model {}", value))),
            },
            "network/model" => match value {
                "Constant" | "constant" => self.network_model = NetworkModel::Constant,
                _ => return Err(SimError::InvalidArgument(format!("unknown network/model {}", value))),
            },
            "host/model" => match value {
                "Workstation" | "workstation" => self.host_model = HostModel::Workstation,
                _ => return Err(SimError::InvalidArgument(format!("unknown host/model {}", value))),
            },
            "contexts/factory" => match value {
                "stackful" | "ucontext" => self.context_backend = ContextBackend::Stackful,
                "thread" => self.context_backend = ContextBackend::Thread,
                _ => return Err(SimError::InvalidArgument(format!("unknown contexts/factory {}", value))),
            },
            "contexts/stack-size" => {
                self.stack_size = value
                    .parse()
                    .map_err(|_| SimError::InvalidArgument(format!("bad contexts/stack-size {}", value)))?;
            }
            "contexts/guard-size" => {
                self.guard_size = value
                    .parse()
                    .map_err(|_| SimError::InvalidArgument(format!("bad contexts/guard-size {}", value)))?;
            }
            "contexts/nthreads" => {
                self.nthreads = value
                    .parse()
                    .map_err(|_| SimError::InvalidArgument(format!("bad contexts/nthreads {}", value)))?;
            }
            "contexts/parallel" => {
                self.parallel = match value {
                    "1" | "true" | "yes" => true,
                    "0" | "false" | "no" => false,
                    _ => return Err(SimError::InvalidArgument(format!("bad contexts/parallel {}", value))),
                };
            }
            "maxmin/precision" => {
                self.maxmin_precision = value
                    .parse()
                    .map_err(|_| SimError::InvalidArgument(format!("bad maxmin/precision {}", value)))?;
            }
            _ => return Err(SimError::InvalidArgument(format!("unknown --cfg key {}", key))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.maxmin_precision, 1e-5);
        assert_eq!(cfg.stack_size, 8 * 1024 * 1024);
        assert!(!cfg.parallel);
    }

    #[test]
    fn set_rejects_unknown_key() {
        let mut cfg = Config::default();
        assert!(cfg.set("bogus/key", "1").is_err());
    }

    #[test]
    fn set_updates_precision() {
        let mut cfg = Config::default();
        cfg.set("maxmin/precision", "1e-7").unwrap();
        assert_eq!(cfg.maxmin_precision, 1e-7);
    }
}
