//! Platform data types: Host, Link, Route, and the builder used
//! to assemble them before `Engine::run` is called.

use std::collections::HashMap;

/// Opaque handle to a [`Host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub u64);

/// Opaque handle to a [`Link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

/// Whether a resource is available for new activities. A resource toggled
/// `Off` mid-simulation fails every activity currently using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    On,
    Off,
}

/// How a [`Link`]'s variables share its capacity, mirrors [`crate::lmm::SharingPolicy`]
/// one level up (this is the platform-facing vocabulary; `Platform::seal` lowers
/// it into the LMM's `SharingPolicy`).
#[derive(Debug, Clone)]
pub enum SharingPolicy {
    Shared,
    FatPipe,
    /// wifi shares `Shared` semantics plus a fixed per-station overhead; modeled
    /// here as shared sharing with a reduced effective capacity, see DESIGN.md.
    Wifi,
    NonLinear,
}

/// A simulated host: one CPU resource, a network endpoint, zero or more disks.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub power_peak: f64,
    pub power_scale: f64,
    pub cores: u32,
    pub state: ResourceState,
}

/// A simulated network link.
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub name: String,
    pub capacity: f64,
    pub latency: f64,
    pub policy: SharingPolicy,
    pub state: ResourceState,
}

/// An ordered path of links between two hosts, as returned by routing.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub links: Vec<LinkId>,
    pub latency: f64,
}

/// Builds the platform (hosts, links, routes) before the engine starts.
/// Matches the `add_host` / `add_link` / `add_route` / `set_trace` /
/// `seal` external interface; once sealed the topology is immutable for
/// the rest of the run (resources can still be turned on/off, but no new
/// host/link/route may be added).
#[derive(Debug, Default)]
pub struct Platform {
    hosts: HashMap<HostId, Host>,
    links: HashMap<LinkId, Link>,
    routes: HashMap<(HostId, HostId), Route>,
    by_name: HashMap<String, HostId>,
    next_host: u64,
    next_link: u64,
    sealed: bool,
}

impl Platform {
    pub fn new() -> Platform {
        Platform::default()
    }

    /// Adds a host. Panics if `seal` was already called or the name is
    /// already in use, both contract violations from a correct platform
    /// builder caller (these would be `invalid_argument` errors, but
    /// since this runs strictly before the simulation exists there's no
    /// activity wait to carry the error through, so we fail fast).
    pub fn add_host(&mut self, name: impl Into<String>, power_peak: f64, cores: u32) -> HostId {
        assert!(!self.sealed, "cannot add a host after seal");
        let name = name.into();
        assert!(!self.by_name.contains_key(&name), "duplicate host name '{}'", name);
        let id = HostId(self.next_host);
        self.next_host += 1;
        self.by_name.insert(name.clone(), id);
        self.hosts.insert(
            id,
            Host {
                id,
                name,
                power_peak,
                power_scale: 1.0,
                cores,
                state: ResourceState::On,
            },
        );
        id
    }

    pub fn add_link(&mut self, name: impl Into<String>, capacity: f64, latency: f64, policy: SharingPolicy) -> LinkId {
        assert!(!self.sealed, "cannot add a link after seal");
        let id = LinkId(self.next_link);
        self.next_link += 1;
        self.links.insert(
            id,
            Link {
                id,
                name: name.into(),
                capacity,
                latency,
                policy,
                state: ResourceState::On,
            },
        );
        id
    }

    /// Registers the route between `src` and `dst`. Routes are directional;
    /// call twice for a symmetric topology.
    pub fn add_route(&mut self, src: HostId, dst: HostId, links: Vec<LinkId>) {
        assert!(!self.sealed, "cannot add a route after seal");
        let latency = links.iter().filter_map(|l| self.links.get(l)).map(|l| l.latency).sum();
        self.routes.insert((src, dst), Route { links, latency });
    }

    /// Applies a one-shot capacity/state change outside of a trace file,
    /// used by tests and by [`crate::trace::Trace`] replay.
    pub fn set_trace(&mut self, host_or_link_power_scale: HashMap<HostId, f64>) {
        for (id, scale) in host_or_link_power_scale {
            if let Some(h) = self.hosts.get_mut(&id) {
                h.power_scale = scale;
            }
        }
    }

    /// Freezes the topology. Host/link on/off toggles remain legal afterwards.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Flips a host's availability. Does not by itself touch any activity
    /// already running on it; see `Engine::set_host_state`.
    pub fn set_host_state(&mut self, id: HostId, state: ResourceState) {
        if let Some(h) = self.hosts.get_mut(&id) {
            h.state = state;
        }
    }

    /// Flips a link's availability. Does not by itself touch any activity
    /// already using it; see `Engine::set_link_state`.
    pub fn set_link_state(&mut self, id: LinkId, state: ResourceState) {
        if let Some(l) = self.links.get_mut(&id) {
            l.state = state;
        }
    }

    pub fn host(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(&id)
    }

    pub fn host_mut(&mut self, id: HostId) -> Option<&mut Host> {
        self.hosts.get_mut(&id)
    }

    pub fn host_by_name(&self, name: &str) -> Option<HostId> {
        self.by_name.get(name).copied()
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    pub fn route(&self, src: HostId, dst: HostId) -> Option<&Route> {
        self.routes.get(&(src, dst))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_host_and_link_and_route() {
        let mut p = Platform::new();
        let a = p.add_host("a", 1e9, 1);
        let b = p.add_host("b", 1e9, 1);
        let l = p.add_link("a-b", 1e6, 0.001, SharingPolicy::Shared);
        p.add_route(a, b, vec![l]);
        p.seal();

        assert_eq!(p.host_by_name("a"), Some(a));
        let route = p.route(a, b).unwrap();
        assert_eq!(route.links, vec![l]);
        assert!((route.latency - 0.001).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "duplicate host name")]
    fn duplicate_host_name_panics() {
        let mut p = Platform::new();
        p.add_host("a", 1e9, 1);
        p.add_host("a", 1e9, 1);
    }
}
