/// Replication topology groups: one primary plus up to four replicas
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::backend::Backend;
use super::{BackendId, BackendType};

/// Maximum number of replicas tracked per group
pub const MAX_GROUP_SLAVES: usize = 4;

/// A named primary-plus-replicas cluster.
///
/// Members are held by `BackendId` and resolved through the owning set on every access;
/// an id that no longer resolves counts as an unavailable member.
#[derive(Debug)]
pub struct TopologyGroup {
    name: String,
    master: Option<BackendId>,
    slaves: Vec<BackendId>,
    slave_visit_cnt: AtomicUsize,
}

impl TopologyGroup {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            master: None,
            slaves: Vec::with_capacity(MAX_GROUP_SLAVES),
            slave_visit_cnt: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> Option<BackendId> {
        self.master
    }

    pub fn slaves(&self) -> &[BackendId] {
        &self.slaves
    }

    pub fn nslaves(&self) -> usize {
        self.slaves.len()
    }

    pub fn slave_visit_count(&self) -> usize {
        self.slave_visit_cnt.load(Ordering::Relaxed)
    }

    pub(crate) fn set_master(&mut self, id: BackendId) -> Option<BackendId> {
        self.master.replace(id)
    }

    /// Returns false when the group already holds `MAX_GROUP_SLAVES` replicas
    pub(crate) fn add_slave(&mut self, id: BackendId) -> bool {
        if self.slaves.len() >= MAX_GROUP_SLAVES {
            return false;
        }
        self.slaves.push(id);
        true
    }

    /// Forget a member, e.g. after it was removed from the set
    pub(crate) fn detach(&mut self, id: BackendId) {
        if self.master == Some(id) {
            self.master = None;
        }
        self.slaves.retain(|slave| *slave != id);
    }

    /// Round-robin over the replicas, skipping any that are not up or no longer resolve.
    ///
    /// The visit counter advances once per call; wraparound only shifts the starting
    /// replica since it is always taken modulo the replica count.
    pub fn pick_slave<F>(&self, resolve: F) -> Option<Arc<Backend>>
    where
        F: Fn(BackendId) -> Option<Arc<Backend>>,
    {
        let n = self.slaves.len();
        if n == 0 {
            return None;
        }

        let start = self.slave_visit_cnt.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|offset| self.slaves[start.wrapping_add(offset) % n])
            .filter_map(&resolve)
            .find(|backend| backend.serves(BackendType::ReadOnly))
    }
}
