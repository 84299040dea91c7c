/// Backend set: the registry of every backend and topology group, plus selection
///
/// Selection and `modify` take the registry's read lock only; state and type live in
/// per-backend atomics, so health updates never stall selectors. `add` and `remove` take
/// the write lock since they change the array and, for `remove`, index assignment.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::{Backend, ProcessContext};
use super::challenge::AuthChallenge;
use super::group::TopologyGroup;
use super::{BackendAlgo, BackendId, BackendState, BackendType};
use crate::config::Config;
use crate::error::{PasarelaError, PasarelaResult};
use crate::utils::parse_backend_address;

/// Read-only view of one backend for operator-facing layers
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub index: usize,
    pub id: BackendId,
    pub address: String,
    pub group: Option<String>,
    pub state: BackendState,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub uuid: String,
    pub connected_clients: usize,
    pub slave_delay_msec: u64,
    pub idle_conns: usize,
    pub used_conns: usize,
}

/// Read-only view of one topology group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub master: Option<String>,
    pub slaves: Vec<String>,
}

#[derive(Default)]
struct Registry {
    backends: Vec<Arc<Backend>>,
    slots: FnvHashMap<BackendId, usize>,
    groups: Vec<TopologyGroup>,
}

impl Registry {
    fn resolve(&self, id: BackendId) -> Option<Arc<Backend>> {
        self.slots.get(&id).map(|&slot| Arc::clone(&self.backends[slot]))
    }

    fn group(&self, name: &str) -> Option<&TopologyGroup> {
        self.groups.iter().find(|group| group.name() == name)
    }

    fn group_mut(&mut self, name: &str) -> &mut TopologyGroup {
        match self.groups.iter().position(|group| group.name() == name) {
            Some(pos) => &mut self.groups[pos],
            None => {
                self.groups.push(TopologyGroup::new(name));
                let last = self.groups.len() - 1;
                &mut self.groups[last]
            }
        }
    }

    fn attach_to_group(&mut self, backend: &Backend) {
        let Some(name) = backend.server_group() else {
            return;
        };
        let id = backend.id();
        let address = backend.address().to_string();
        let group = self.group_mut(name);
        match backend.backend_type() {
            BackendType::ReadWrite => {
                if let Some(previous) = group.set_master(id) {
                    warn!(
                        "Group {} primary replaced by {} (was backend {})",
                        group.name(),
                        address,
                        previous
                    );
                }
            }
            BackendType::ReadOnly => {
                if !group.add_slave(id) {
                    warn!(
                        "Group {} already has {} replicas, {} is not attached",
                        group.name(),
                        group.nslaves(),
                        address
                    );
                }
            }
            BackendType::Unknown => {}
        }
    }

    fn detach_from_groups(&mut self, id: BackendId) {
        for group in &mut self.groups {
            group.detach(id);
        }
    }

    fn rebuild_slots(&mut self) {
        self.slots = self
            .backends
            .iter()
            .enumerate()
            .map(|(slot, backend)| (backend.id(), slot))
            .collect();
    }

    /// Backends that currently have `role` and are up, in index order
    fn serving(&self, role: BackendType) -> impl Iterator<Item = (usize, &Arc<Backend>)> + '_ {
        self.backends
            .iter()
            .enumerate()
            .filter(move |(_, backend)| backend.serves(role))
    }

    fn select(
        &self,
        role: BackendType,
        algo: BackendAlgo,
        read_count: &AtomicUsize,
    ) -> Option<(usize, &Arc<Backend>)> {
        let nth = match algo {
            BackendAlgo::First => 0,
            BackendAlgo::RoundRobin => {
                let candidates = self.serving(role).count();
                if candidates == 0 {
                    return None;
                }
                read_count.fetch_add(1, Ordering::Relaxed) % candidates
            }
            BackendAlgo::Random => {
                let candidates = self.serving(role).count();
                if candidates == 0 {
                    return None;
                }
                rand::thread_rng().gen_range(0..candidates)
            }
        };

        // A health update may take a backend down between the two passes
        self.serving(role)
            .nth(nth)
            .or_else(|| self.serving(role).next())
    }

    fn address_of(&self, id: Option<BackendId>) -> Option<String> {
        id.and_then(|id| self.resolve(id))
            .map(|backend| backend.address().to_string())
    }

    fn snapshot_group(&self, group: &TopologyGroup) -> GroupSnapshot {
        GroupSnapshot {
            name: group.name().to_string(),
            master: self.address_of(group.master()),
            slaves: group
                .slaves()
                .iter()
                .filter_map(|&id| self.address_of(Some(id)))
                .collect(),
        }
    }
}

/// Registry of all backends and topology groups
pub struct BackendSet {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    read_count: AtomicUsize,
    auth_key: RwLock<Option<Bytes>>,
    /// Seconds since the epoch of the last health sweep, 0 when none ran
    backend_last_check: AtomicU64,
}

impl BackendSet {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            read_count: AtomicUsize::new(0),
            auth_key: RwLock::new(None),
            backend_last_check: AtomicU64::new(0),
        }
    }

    /// Build a set from the configured server list
    pub fn from_config(config: &Config, ctx: &ProcessContext) -> PasarelaResult<Self> {
        let set = Self::new();
        if let Some(key) = &ctx.auth_key {
            set.set_auth_key(key.clone());
        }

        for server in &config.backends.servers {
            set.add(
                &server.address,
                server.backend_type,
                server.state.unwrap_or_default(),
                Some(ctx),
            )?;
        }

        info!(
            "Loaded {} backends in {} groups",
            set.count(),
            set.group_names().len()
        );
        Ok(set)
    }

    /// Register a backend and return its index.
    ///
    /// `address` is `host:port`, optionally followed by `@group`. Host names are kept
    /// as-is for the caller's resolver.
    pub fn add(
        &self,
        address: &str,
        backend_type: BackendType,
        state: BackendState,
        extra: Option<&ProcessContext>,
    ) -> PasarelaResult<usize> {
        let parsed = parse_backend_address(address)?;

        let mut registry = self.registry.write();
        if registry
            .backends
            .iter()
            .any(|backend| backend.address() == parsed.address)
        {
            return Err(PasarelaError::AlreadyExists {
                address: parsed.address,
            });
        }

        let id = BackendId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let backend = Backend::new(id, parsed);
        backend.update(backend_type, state, None)?;
        if let Some(ctx) = extra {
            backend.init_extra(ctx);
        }

        registry.attach_to_group(&backend);

        let index = registry.backends.len();
        info!(
            "Added backend {} ({}, {}) at index {}",
            backend.address(),
            backend_type,
            state,
            index
        );
        registry.backends.push(Arc::new(backend));
        registry.slots.insert(id, index);
        Ok(index)
    }

    /// Remove the backend at `index`; later backends shift down by one.
    ///
    /// The removed backend is marked deleted so holders of its `Arc` see it retired.
    pub fn remove(&self, index: usize) -> PasarelaResult<Arc<Backend>> {
        let mut registry = self.registry.write();
        if index >= registry.backends.len() {
            return Err(PasarelaError::not_found(format!("backend index {}", index)));
        }

        let backend = registry.backends.remove(index);
        registry.rebuild_slots();
        registry.detach_from_groups(backend.id());
        drop(registry);

        backend.set_state(BackendState::Deleted);
        info!("Removed backend {} from index {}", backend.address(), index);
        Ok(backend)
    }

    /// Update type and state of the backend at `index`.
    ///
    /// With `old_state_hint` the state change is a compare-and-swap: when the current state
    /// differs the call fails with `Conflict` and nothing is changed. Returns the previous
    /// state.
    pub fn modify(
        &self,
        index: usize,
        new_type: BackendType,
        new_state: BackendState,
        old_state_hint: Option<BackendState>,
    ) -> PasarelaResult<BackendState> {
        let backend = self.get(index)?;
        self.apply_modify(&backend, new_type, new_state, old_state_hint)
    }

    /// `modify` addressed by stable id
    pub fn modify_by_id(
        &self,
        id: BackendId,
        new_type: BackendType,
        new_state: BackendState,
        old_state_hint: Option<BackendState>,
    ) -> PasarelaResult<BackendState> {
        let backend = self.get_by_id(id)?;
        self.apply_modify(&backend, new_type, new_state, old_state_hint)
    }

    fn apply_modify(
        &self,
        backend: &Backend,
        new_type: BackendType,
        new_state: BackendState,
        old_state_hint: Option<BackendState>,
    ) -> PasarelaResult<BackendState> {
        let (old_type, previous) = backend.update(new_type, new_state, old_state_hint)?;

        if old_type != new_type && backend.server_group().is_some() {
            let mut registry = self.registry.write();
            if registry.slots.contains_key(&backend.id()) {
                registry.detach_from_groups(backend.id());
                registry.attach_to_group(backend);
            }
        }

        if previous != new_state || old_type != new_type {
            info!(
                "Backend {} changed {}/{} -> {}/{}",
                backend.address(),
                old_type,
                previous,
                new_type,
                new_state
            );
        }
        Ok(previous)
    }

    /// Move backend `id` from `expected` to `new_state` without touching its type.
    ///
    /// Fails with `Conflict` when the state is no longer `expected`.
    pub fn transition_by_id(
        &self,
        id: BackendId,
        expected: BackendState,
        new_state: BackendState,
    ) -> PasarelaResult<BackendState> {
        let backend = self.get_by_id(id)?;
        backend
            .compare_and_set_state(expected, new_state)
            .map_err(|actual| PasarelaError::Conflict { expected, actual })?;

        if expected != new_state {
            info!("Backend {} changed {} -> {}", backend.address(), expected, new_state);
        }
        Ok(expected)
    }

    /// Index of the backend whose configured address matches
    pub fn find_address(&self, address: &str) -> PasarelaResult<usize> {
        let wanted = parse_backend_address(address)
            .map(|parsed| parsed.address)
            .unwrap_or_else(|_| address.trim().to_string());

        self.registry
            .read()
            .backends
            .iter()
            .position(|backend| backend.address() == wanted)
            .ok_or_else(|| PasarelaError::not_found(format!("backend address {}", address)))
    }

    pub fn get(&self, index: usize) -> PasarelaResult<Arc<Backend>> {
        self.registry
            .read()
            .backends
            .get(index)
            .cloned()
            .ok_or_else(|| PasarelaError::not_found(format!("backend index {}", index)))
    }

    pub fn get_by_id(&self, id: BackendId) -> PasarelaResult<Arc<Backend>> {
        self.registry
            .read()
            .resolve(id)
            .ok_or_else(|| PasarelaError::not_found(format!("backend {}", id)))
    }

    /// Current index of a backend, which changes when an earlier one is removed
    pub fn index_of(&self, id: BackendId) -> PasarelaResult<usize> {
        self.registry
            .read()
            .slots
            .get(&id)
            .copied()
            .ok_or_else(|| PasarelaError::not_found(format!("backend {}", id)))
    }

    pub fn count(&self) -> usize {
        self.registry.read().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Snapshot of the backend array, for sweeps that must not hold the lock
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.registry.read().backends.clone()
    }

    pub fn idle_conns(&self) -> usize {
        self.registry
            .read()
            .backends
            .iter()
            .map(|backend| backend.idle_conns())
            .sum()
    }

    pub fn used_conns(&self) -> usize {
        self.registry
            .read()
            .backends
            .iter()
            .map(|backend| backend.used_conns())
            .sum()
    }

    /// Run `init_extra` on every backend; already initialized backends are untouched
    pub fn init_backends(&self, ctx: &ProcessContext) {
        for backend in self.registry.read().backends.iter() {
            backend.init_extra(ctx);
        }
    }

    /// Index of the first read-write backend that is up
    pub fn get_rw_ndx(&self) -> PasarelaResult<usize> {
        self.registry
            .read()
            .select(BackendType::ReadWrite, BackendAlgo::First, &self.read_count)
            .map(|(index, _)| index)
            .ok_or(PasarelaError::Exhausted {
                role: BackendType::ReadWrite,
            })
    }

    /// Index of a read-only backend that is up, chosen by `algo`
    pub fn get_ro_ndx(&self, algo: BackendAlgo) -> PasarelaResult<usize> {
        let index = self
            .registry
            .read()
            .select(BackendType::ReadOnly, algo, &self.read_count)
            .map(|(index, _)| index)
            .ok_or(PasarelaError::Exhausted {
                role: BackendType::ReadOnly,
            })?;
        debug!("Selected read-only backend {} via {:?}", index, algo);
        Ok(index)
    }

    /// Like `get_rw_ndx`, returning the backend itself
    pub fn get_rw(&self) -> PasarelaResult<Arc<Backend>> {
        self.registry
            .read()
            .select(BackendType::ReadWrite, BackendAlgo::First, &self.read_count)
            .map(|(_, backend)| Arc::clone(backend))
            .ok_or(PasarelaError::Exhausted {
                role: BackendType::ReadWrite,
            })
    }

    /// Like `get_ro_ndx`, returning the backend itself.
    ///
    /// Index and backend are read under one lock so a concurrent `remove` cannot
    /// hand back a neighbour.
    pub fn get_ro(&self, algo: BackendAlgo) -> PasarelaResult<Arc<Backend>> {
        self.registry
            .read()
            .select(BackendType::ReadOnly, algo, &self.read_count)
            .map(|(_, backend)| Arc::clone(backend))
            .ok_or(PasarelaError::Exhausted {
                role: BackendType::ReadOnly,
            })
    }

    /// Current value of the shared read-only round-robin counter
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Round-robin pick among the replicas of group `name`
    pub fn group_pick_slave_backend(&self, name: &str) -> PasarelaResult<Arc<Backend>> {
        let registry = self.registry.read();
        let group = registry
            .group(name)
            .ok_or_else(|| PasarelaError::not_found(format!("group {}", name)))?;

        group
            .pick_slave(|id| registry.resolve(id))
            .ok_or_else(|| {
                PasarelaError::unavailable(format!("no replica of group {} is up", name))
            })
    }

    /// The primary of group `name`, if it is up
    pub fn group_master(&self, name: &str) -> PasarelaResult<Arc<Backend>> {
        let registry = self.registry.read();
        let group = registry
            .group(name)
            .ok_or_else(|| PasarelaError::not_found(format!("group {}", name)))?;

        group
            .master()
            .and_then(|id| registry.resolve(id))
            .filter(|backend| backend.serves(BackendType::ReadWrite))
            .ok_or_else(|| {
                PasarelaError::unavailable(format!("primary of group {} is not up", name))
            })
    }

    pub fn get_group(&self, name: &str) -> PasarelaResult<GroupSnapshot> {
        let registry = self.registry.read();
        registry
            .group(name)
            .map(|group| registry.snapshot_group(group))
            .ok_or_else(|| PasarelaError::not_found(format!("group {}", name)))
    }

    pub fn group_names(&self) -> Vec<String> {
        self.registry
            .read()
            .groups
            .iter()
            .map(|group| group.name().to_string())
            .collect()
    }

    /// Comma-separated replica addresses of group `name`
    pub fn group_slave_names(&self, name: &str) -> PasarelaResult<String> {
        Ok(self.get_group(name)?.slaves.join(","))
    }

    pub fn group_snapshots(&self) -> Vec<GroupSnapshot> {
        let registry = self.registry.read();
        registry
            .groups
            .iter()
            .map(|group| registry.snapshot_group(group))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.registry
            .read()
            .backends
            .iter()
            .enumerate()
            .map(|(index, backend)| {
                let (backend_type, state) = backend.role_state();
                BackendSnapshot {
                    index,
                    id: backend.id(),
                    address: backend.address().to_string(),
                    group: backend.server_group().map(str::to_string),
                    state,
                    backend_type,
                    uuid: backend.uuid(),
                    connected_clients: backend.connected_clients(),
                    slave_delay_msec: backend.slave_delay_msec(),
                    idle_conns: backend.idle_conns(),
                    used_conns: backend.used_conns(),
                }
            })
            .collect()
    }

    pub fn save_challenge(
        &self,
        index: usize,
        challenge: Bytes,
        is_fast: bool,
    ) -> PasarelaResult<()> {
        self.get(index)?.save_challenge(challenge, is_fast);
        Ok(())
    }

    pub fn get_challenge(&self, index: usize) -> PasarelaResult<Option<AuthChallenge>> {
        Ok(self.get(index)?.get_challenge())
    }

    pub fn set_auth_key(&self, key: Bytes) {
        *self.auth_key.write() = Some(key);
    }

    pub fn auth_key(&self) -> Option<Bytes> {
        self.auth_key.read().clone()
    }

    pub fn backend_last_check(&self) -> Option<SystemTime> {
        match self.backend_last_check.load(Ordering::Acquire) {
            0 => None,
            secs => Some(UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }

    pub(crate) fn touch_last_check(&self, at: SystemTime) {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.backend_last_check.store(secs.max(1), Ordering::Release);
    }
}

impl Default for BackendSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::BackendConfig;
    use crate::core::pool::BoundedPoolProvider;

    fn pool_context() -> ProcessContext {
        ProcessContext::new(BackendConfig {
            max_conn_pool: 4,
            ..BackendConfig::default()
        })
        .with_pool_provider(Arc::new(BoundedPoolProvider))
    }

    fn set_with(entries: &[(&str, BackendType, BackendState)]) -> BackendSet {
        let set = BackendSet::new();
        for (address, backend_type, state) in entries {
            set.add(address, *backend_type, *state, None).unwrap();
        }
        set
    }

    #[test]
    fn test_add_then_get() {
        let set = BackendSet::new();
        let index = set
            .add("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Unknown, None)
            .unwrap();
        let backend = set.get(index).unwrap();
        assert_eq!(index, 0);
        assert_eq!(backend.address(), "10.0.0.1:3306");
        assert_eq!(backend.state(), BackendState::Unknown);
        assert_eq!(backend.backend_type(), BackendType::ReadWrite);
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_add_rejects_malformed_and_duplicate() {
        let set = BackendSet::new();
        assert!(matches!(
            set.add("10.0.0.1", BackendType::ReadOnly, BackendState::Unknown, None),
            Err(PasarelaError::Malformed { .. })
        ));
        set.add("10.0.0.1:3306", BackendType::ReadOnly, BackendState::Unknown, None)
            .unwrap();
        assert!(matches!(
            set.add("10.0.0.1:3306@g1", BackendType::ReadOnly, BackendState::Unknown, None),
            Err(PasarelaError::AlreadyExists { .. })
        ));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_add_with_context_initializes_pool() {
        let set = BackendSet::new();
        let index = set
            .add("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Up, Some(&pool_context()))
            .unwrap();
        let backend = set.get(index).unwrap();
        assert!(backend.has_pool());

        let conn = backend.acquire().unwrap();
        assert_eq!(set.used_conns(), 1);
        assert_eq!(set.idle_conns(), 0);
        backend.release(conn);
        assert_eq!(set.used_conns(), 0);
        assert_eq!(set.idle_conns(), 1);
    }

    #[test]
    fn test_conns_without_pool_are_zero() {
        let set = set_with(&[("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Up)]);
        assert_eq!(set.idle_conns(), 0);
        assert_eq!(set.used_conns(), 0);

        set.init_backends(&pool_context());
        assert!(set.get(0).unwrap().has_pool());
    }

    #[test]
    fn test_remove_compacts() {
        let set = set_with(&[
            ("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Up),
            ("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Up),
            ("10.0.0.3:3306", BackendType::ReadOnly, BackendState::Up),
        ]);
        let third_id = set.get(2).unwrap().id();

        let removed = set.remove(1).unwrap();
        assert_eq!(removed.address(), "10.0.0.2:3306");
        assert_eq!(removed.state(), BackendState::Deleted);
        assert_eq!(set.get(1).unwrap().address(), "10.0.0.3:3306");
        assert_eq!(set.index_of(third_id).unwrap(), 1);
        assert!(matches!(
            set.get_by_id(removed.id()),
            Err(PasarelaError::NotFound { .. })
        ));

        // Removing the last element leaves nothing at that index
        set.remove(1).unwrap();
        assert!(matches!(set.get(1), Err(PasarelaError::NotFound { .. })));
        assert!(matches!(set.remove(5), Err(PasarelaError::NotFound { .. })));
    }

    #[test]
    fn test_modify_conflict_leaves_state() {
        let set = set_with(&[("10.0.0.1:3306", BackendType::ReadOnly, BackendState::Unknown)]);

        let result = set.modify(
            0,
            BackendType::ReadOnly,
            BackendState::Down,
            Some(BackendState::Up),
        );
        match result {
            Err(PasarelaError::Conflict { expected, actual }) => {
                assert_eq!(expected, BackendState::Up);
                assert_eq!(actual, BackendState::Unknown);
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
        assert_eq!(set.get(0).unwrap().state(), BackendState::Unknown);

        let previous = set
            .modify(0, BackendType::ReadOnly, BackendState::Up, Some(BackendState::Unknown))
            .unwrap();
        assert_eq!(previous, BackendState::Unknown);
        assert_eq!(set.get(0).unwrap().state(), BackendState::Up);
    }

    #[test]
    fn test_modify_without_hint_and_missing_index() {
        let set = set_with(&[("10.0.0.1:3306", BackendType::ReadOnly, BackendState::Up)]);
        set.modify(0, BackendType::ReadWrite, BackendState::Maintaining, None)
            .unwrap();
        let backend = set.get(0).unwrap();
        assert_eq!(backend.state(), BackendState::Maintaining);
        assert_eq!(backend.backend_type(), BackendType::ReadWrite);

        assert!(matches!(
            set.modify(3, BackendType::ReadOnly, BackendState::Up, None),
            Err(PasarelaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_find_address() {
        let set = set_with(&[
            ("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Up),
            ("db-replica.internal:3306@g1", BackendType::ReadOnly, BackendState::Up),
        ]);
        assert_eq!(set.find_address("10.0.0.1:3306").unwrap(), 0);
        assert_eq!(set.find_address("db-replica.internal:3306").unwrap(), 1);
        assert!(matches!(
            set.find_address("10.0.0.9:3306"),
            Err(PasarelaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rw_selection_and_scenario() {
        let set = set_with(&[
            ("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Unknown),
            ("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Unknown),
        ]);
        assert!(matches!(set.get_rw_ndx(), Err(PasarelaError::Exhausted { .. })));

        set.modify(1, BackendType::ReadOnly, BackendState::Up, None).unwrap();
        assert_eq!(set.get_ro_ndx(BackendAlgo::RoundRobin).unwrap(), 1);

        set.modify(0, BackendType::ReadWrite, BackendState::Up, None).unwrap();
        assert_eq!(set.get_rw_ndx().unwrap(), 0);
        assert_eq!(set.get_rw().unwrap().address(), "10.0.0.1:3306");

        set.modify(1, BackendType::ReadOnly, BackendState::Down, None).unwrap();
        assert!(matches!(
            set.get_ro_ndx(BackendAlgo::RoundRobin),
            Err(PasarelaError::Exhausted {
                role: BackendType::ReadOnly
            })
        ));
    }

    #[test]
    fn test_rw_never_returns_ineligible() {
        let set = set_with(&[
            ("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Down),
            ("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Up),
            ("10.0.0.3:3306", BackendType::ReadWrite, BackendState::Maintaining),
            ("10.0.0.4:3306", BackendType::ReadWrite, BackendState::Up),
            ("10.0.0.5:3306", BackendType::ReadWrite, BackendState::Up),
        ]);
        assert_eq!(set.get_rw_ndx().unwrap(), 3);
    }

    #[test]
    fn test_ro_round_robin_visits_each_once() {
        let set = set_with(&[
            ("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Up),
            ("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Up),
            ("10.0.0.3:3306", BackendType::ReadOnly, BackendState::Down),
            ("10.0.0.4:3306", BackendType::ReadOnly, BackendState::Up),
            ("10.0.0.5:3306", BackendType::ReadOnly, BackendState::Up),
        ]);
        let candidates = [1usize, 3, 4];

        // Advance the counter to an arbitrary position first
        set.get_ro_ndx(BackendAlgo::RoundRobin).unwrap();
        let start = set.read_count();

        let picks: Vec<usize> = (0..3)
            .map(|_| set.get_ro_ndx(BackendAlgo::RoundRobin).unwrap())
            .collect();
        let expected: Vec<usize> = (0..3)
            .map(|i| candidates[(start + i) % candidates.len()])
            .collect();
        assert_eq!(picks, expected);
        assert_eq!(set.read_count(), start + 3);

        let mut sorted = picks.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, candidates.to_vec());
    }

    #[test]
    fn test_ro_first_and_random() {
        let set = set_with(&[
            ("10.0.0.1:3306", BackendType::ReadOnly, BackendState::Down),
            ("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Up),
            ("10.0.0.3:3306", BackendType::ReadOnly, BackendState::Up),
        ]);
        for _ in 0..5 {
            assert_eq!(set.get_ro_ndx(BackendAlgo::First).unwrap(), 1);
        }
        for _ in 0..50 {
            let pick = set.get_ro_ndx(BackendAlgo::Random).unwrap();
            assert!(pick == 1 || pick == 2);
        }
        assert_eq!(set.read_count(), 0);
        assert_eq!(set.get_ro(BackendAlgo::First).unwrap().address(), "10.0.0.2:3306");
    }

    #[test]
    fn test_read_count_wraps() {
        let set = set_with(&[
            ("10.0.0.1:3306", BackendType::ReadOnly, BackendState::Up),
            ("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Up),
        ]);
        set.read_count.store(usize::MAX, Ordering::Relaxed);
        let first = set.get_ro_ndx(BackendAlgo::RoundRobin).unwrap();
        let second = set.get_ro_ndx(BackendAlgo::RoundRobin).unwrap();
        assert_eq!(first, usize::MAX % 2);
        assert_eq!(second, 0);
        assert_eq!(set.read_count(), 1);
    }

    #[test]
    fn test_group_scenario() {
        let set = set_with(&[
            ("10.0.1.1:3306@g1", BackendType::ReadWrite, BackendState::Up),
            ("10.0.1.2:3306@g1", BackendType::ReadOnly, BackendState::Up),
            ("10.0.1.3:3306@g1", BackendType::ReadOnly, BackendState::Up),
        ]);

        let picks: Vec<String> = (0..3)
            .map(|_| set.group_pick_slave_backend("g1").unwrap().address().to_string())
            .collect();
        assert_eq!(picks, vec!["10.0.1.2:3306", "10.0.1.3:3306", "10.0.1.2:3306"]);

        assert_eq!(set.group_master("g1").unwrap().address(), "10.0.1.1:3306");
        assert_eq!(
            set.group_slave_names("g1").unwrap(),
            "10.0.1.2:3306,10.0.1.3:3306"
        );
        assert!(matches!(
            set.group_pick_slave_backend("missing"),
            Err(PasarelaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_group_skips_down_replica_immediately() {
        let set = set_with(&[
            ("10.0.1.1:3306@g1", BackendType::ReadWrite, BackendState::Up),
            ("10.0.1.2:3306@g1", BackendType::ReadOnly, BackendState::Up),
            ("10.0.1.3:3306@g1", BackendType::ReadOnly, BackendState::Up),
        ]);
        set.modify(1, BackendType::ReadOnly, BackendState::Down, Some(BackendState::Up))
            .unwrap();
        for _ in 0..4 {
            assert_eq!(
                set.group_pick_slave_backend("g1").unwrap().address(),
                "10.0.1.3:3306"
            );
        }

        set.modify(2, BackendType::ReadOnly, BackendState::Down, None).unwrap();
        assert!(matches!(
            set.group_pick_slave_backend("g1"),
            Err(PasarelaError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_group_after_remove() {
        let set = set_with(&[
            ("10.0.1.1:3306@g1", BackendType::ReadWrite, BackendState::Up),
            ("10.0.1.2:3306@g1", BackendType::ReadOnly, BackendState::Up),
        ]);
        set.remove(1).unwrap();
        assert!(matches!(
            set.group_pick_slave_backend("g1"),
            Err(PasarelaError::Unavailable { .. })
        ));

        set.remove(0).unwrap();
        assert!(matches!(
            set.group_master("g1"),
            Err(PasarelaError::Unavailable { .. })
        ));
        let group = set.get_group("g1").unwrap();
        assert_eq!(group.master, None);
        assert!(group.slaves.is_empty());
    }

    #[test]
    fn test_group_replica_limit() {
        let set = BackendSet::new();
        for i in 0..6 {
            set.add(
                &format!("10.0.2.{}:3306@big", i + 1),
                BackendType::ReadOnly,
                BackendState::Up,
                None,
            )
            .unwrap();
        }
        assert_eq!(set.count(), 6);
        assert_eq!(set.get_group("big").unwrap().slaves.len(), 4);
    }

    #[test]
    fn test_modify_type_moves_group_membership() {
        let set = set_with(&[
            ("10.0.1.1:3306@g1", BackendType::ReadWrite, BackendState::Up),
            ("10.0.1.2:3306@g1", BackendType::ReadOnly, BackendState::Up),
        ]);
        set.modify(1, BackendType::ReadWrite, BackendState::Up, None).unwrap();
        let group = set.get_group("g1").unwrap();
        assert_eq!(group.master.as_deref(), Some("10.0.1.2:3306"));
        assert!(group.slaves.is_empty());
    }

    #[test]
    fn test_challenge_by_index() {
        let set = set_with(&[("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Up)]);
        assert_eq!(set.get_challenge(0).unwrap(), None);

        set.save_challenge(0, Bytes::from_static(b"first-nonce"), true).unwrap();
        let challenge = set.get_challenge(0).unwrap().unwrap();
        assert_eq!(challenge.bytes.as_ref(), b"first-nonce");
        assert!(challenge.is_fast);

        set.save_challenge(0, Bytes::from_static(b"second-nonce"), false).unwrap();
        let challenge = set.get_challenge(0).unwrap().unwrap();
        assert_eq!(challenge.bytes.as_ref(), b"second-nonce");
        assert!(!challenge.is_fast);

        assert!(matches!(set.get_challenge(4), Err(PasarelaError::NotFound { .. })));
    }

    #[test]
    fn test_auth_key_and_snapshot() {
        let set = set_with(&[
            ("10.0.1.1:3306@g1", BackendType::ReadWrite, BackendState::Up),
            ("10.0.1.2:3306@g1", BackendType::ReadOnly, BackendState::Down),
        ]);
        assert!(set.auth_key().is_none());
        set.set_auth_key(Bytes::from_static(b"-----BEGIN PUBLIC KEY-----"));
        assert!(set.auth_key().is_some());

        set.get(1).unwrap().set_slave_delay_msec(250);
        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].address, "10.0.1.2:3306");
        assert_eq!(snapshot[1].state, BackendState::Down);
        assert_eq!(snapshot[1].backend_type, BackendType::ReadOnly);
        assert_eq!(snapshot[1].slave_delay_msec, 250);
        assert_eq!(snapshot[1].group.as_deref(), Some("g1"));

        let groups = set.group_snapshots();
        assert_eq!(
            groups,
            vec![GroupSnapshot {
                name: "g1".to_string(),
                master: Some("10.0.1.1:3306".to_string()),
                slaves: vec!["10.0.1.2:3306".to_string()],
            }]
        );
    }

    #[test]
    fn test_concurrent_selection_during_modify() {
        let set = Arc::new(set_with(&[
            ("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Up),
            ("10.0.0.2:3306", BackendType::ReadOnly, BackendState::Up),
            ("10.0.0.3:3306", BackendType::ReadOnly, BackendState::Up),
        ]));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let set = Arc::clone(&set);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(index) = set.get_rw_ndx() {
                            assert_eq!(index, 0);
                        }
                        if let Ok(index) = set.get_ro_ndx(BackendAlgo::RoundRobin) {
                            assert!(index == 1 || index == 2);
                        }
                    }
                });
            }

            let set = Arc::clone(&set);
            scope.spawn(move || {
                for i in 0..1000 {
                    let state = if i % 2 == 0 {
                        BackendState::Down
                    } else {
                        BackendState::Up
                    };
                    let _ = set.modify(1, BackendType::ReadOnly, state, None);
                    let _ = set.modify(0, BackendType::ReadWrite, state, None);
                }
            });
        });

        assert_eq!(set.get(1).unwrap().state(), BackendState::Up);
    }

    #[test]
    fn test_demotion_never_exposes_writable_primary() {
        let set = set_with(&[("10.0.0.1:3306", BackendType::ReadWrite, BackendState::Down)]);
        let done = std::sync::atomic::AtomicBool::new(false);
        let mut writable = 0;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..50_000 {
                    set.modify(0, BackendType::ReadOnly, BackendState::Up, None).unwrap();
                    set.modify(0, BackendType::ReadWrite, BackendState::Down, None).unwrap();
                }
                done.store(true, Ordering::Release);
            });

            while !done.load(Ordering::Acquire) {
                if set.get_rw_ndx().is_ok() || set.get_rw().is_ok() {
                    writable += 1;
                }
            }
        });

        assert_eq!(writable, 0);
        assert_eq!(
            set.get(0).unwrap().role_state(),
            (BackendType::ReadWrite, BackendState::Down)
        );
    }
}
