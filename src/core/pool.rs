/// Connection pool adapter
///
/// The physical pool (sockets, handshakes, keepalive) lives outside this crate. A backend
/// only needs to count its connections and ask for one or hand one back, which is what
/// the `ConnectionPool` trait captures. `BoundedPool` is a slot-counting implementation
/// used when no real pool is plugged in.
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::backend::BackendConfig;

/// Opaque handle to a pooled connection
pub struct PooledConnection {
    id: u64,
    payload: Box<dyn Any + Send>,
}

impl PooledConnection {
    pub fn new<T: Any + Send>(id: u64, payload: T) -> Self {
        Self {
            id,
            payload: Box::new(payload),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn into_payload<T: Any>(self) -> Option<Box<T>> {
        self.payload.downcast::<T>().ok()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

/// Per-backend pool interface
pub trait ConnectionPool: Send + Sync {
    /// Take a connection; `None` means the pool is busy
    fn acquire(&self) -> Option<PooledConnection>;

    /// Return a connection previously handed out by `acquire`
    fn release(&self, conn: PooledConnection);

    fn idle_count(&self) -> usize;

    fn used_count(&self) -> usize;
}

/// Creates one pool per backend when the backend is initialized
pub trait PoolProvider: Send + Sync {
    fn create_pool(&self, address: &str, config: &BackendConfig) -> Arc<dyn ConnectionPool>;
}

#[derive(Debug, Default)]
struct BoundedPoolSlots {
    idle: Vec<u64>,
    used: usize,
}

/// Pool that tracks connection slots up to `max_conn_pool`
#[derive(Debug)]
pub struct BoundedPool {
    max: usize,
    next_id: AtomicU64,
    slots: Mutex<BoundedPoolSlots>,
}

impl BoundedPool {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(BoundedPoolSlots::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }
}

impl ConnectionPool for BoundedPool {
    fn acquire(&self) -> Option<PooledConnection> {
        let mut slots = self.slots.lock();
        let id = match slots.idle.pop() {
            Some(id) => id,
            None if slots.used < self.max => self.next_id.fetch_add(1, Ordering::Relaxed),
            None => return None,
        };
        slots.used += 1;
        Some(PooledConnection::new(id, ()))
    }

    fn release(&self, conn: PooledConnection) {
        let mut slots = self.slots.lock();
        slots.used = slots.used.saturating_sub(1);
        slots.idle.push(conn.id());
    }

    fn idle_count(&self) -> usize {
        self.slots.lock().idle.len()
    }

    fn used_count(&self) -> usize {
        self.slots.lock().used
    }
}

/// Provider handing every backend a `BoundedPool` sized by its config
#[derive(Debug, Default, Clone, Copy)]
pub struct BoundedPoolProvider;

impl PoolProvider for BoundedPoolProvider {
    fn create_pool(&self, address: &str, config: &BackendConfig) -> Arc<dyn ConnectionPool> {
        tracing::debug!(
            "Creating pool for {} (max {}, mid {})",
            address,
            config.max_conn_pool,
            config.mid_conn_pool
        );
        Arc::new(BoundedPool::new(config.max_conn_pool))
    }
}
