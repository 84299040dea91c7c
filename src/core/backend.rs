/// Backend record: state for one upstream database server
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::challenge::{AuthChallenge, ChallengeCache};
use super::pool::{ConnectionPool, PoolProvider, PooledConnection};
use super::{BackendId, BackendState, BackendType};
use crate::error::{PasarelaError, PasarelaResult};
use crate::utils::{generate_id, ParsedAddress};

/// Per-backend settings taken from the process context at `init_extra` time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub default_username: String,
    pub default_db: String,
    /// MySQL collation id of the default charset
    pub charset: u8,
    pub max_conn_pool: usize,
    pub mid_conn_pool: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_username: String::new(),
            default_db: String::new(),
            charset: 33, // utf8_general_ci
            max_conn_pool: 100,
            mid_conn_pool: 50,
        }
    }
}

/// Shared settings supplied by the process that owns the backend set
#[derive(Clone, Default)]
pub struct ProcessContext {
    pub backend_config: BackendConfig,
    pub pool_provider: Option<Arc<dyn PoolProvider>>,
    /// Opaque key material used to encrypt challenges (e.g. an RSA public key in PEM)
    pub auth_key: Option<Bytes>,
}

impl ProcessContext {
    pub fn new(backend_config: BackendConfig) -> Self {
        Self {
            backend_config,
            pool_provider: None,
            auth_key: None,
        }
    }

    pub fn with_pool_provider(mut self, provider: Arc<dyn PoolProvider>) -> Self {
        self.pool_provider = Some(provider);
        self
    }

    pub fn with_auth_key(mut self, key: Bytes) -> Self {
        self.auth_key = Some(key);
        self
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("backend_config", &self.backend_config)
            .field("pool_provider", &self.pool_provider.is_some())
            .field("auth_key", &self.auth_key.as_ref().map(Bytes::len))
            .finish()
    }
}

/// One upstream server.
///
/// Type and state share one atomic word so a reader always sees a pair some writer
/// actually stored, and selection never waits on a health update. The pool and config
/// are set once by `init_extra`.
pub struct Backend {
    id: BackendId,
    addr: Option<SocketAddr>,
    address: String,
    server_group: Option<String>,
    /// Type in the high byte, state in the low byte
    role_state: AtomicU16,
    /// Microseconds since the epoch of the last state change
    state_since: AtomicU64,
    pool: OnceLock<Arc<dyn ConnectionPool>>,
    connected_clients: AtomicUsize,
    uuid: RwLock<String>,
    config: OnceLock<BackendConfig>,
    challenge: ChallengeCache,
    /// Seconds since the epoch, 0 when never checked
    last_check_time: AtomicU64,
    slave_delay_msec: AtomicU64,
}

fn pack(backend_type: BackendType, state: BackendState) -> u16 {
    ((backend_type as u16) << 8) | state as u16
}

fn unpack(word: u16) -> (BackendType, BackendState) {
    (
        BackendType::from_u8((word >> 8) as u8),
        BackendState::from_u8(word as u8),
    )
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

impl Backend {
    pub(crate) fn new(id: BackendId, parsed: ParsedAddress) -> Self {
        Self {
            id,
            addr: parsed.socket_addr,
            address: parsed.address,
            server_group: parsed.group,
            role_state: AtomicU16::new(pack(BackendType::Unknown, BackendState::Unknown)),
            state_since: AtomicU64::new(now_micros()),
            pool: OnceLock::new(),
            connected_clients: AtomicUsize::new(0),
            uuid: RwLock::new(generate_id("backend")),
            config: OnceLock::new(),
            challenge: ChallengeCache::new(),
            last_check_time: AtomicU64::new(0),
            slave_delay_msec: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    /// Resolved socket address, `None` when the backend was added by host name
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Address as configured, host name or literal IP with port
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn server_group(&self) -> Option<&str> {
        self.server_group.as_deref()
    }

    /// Type and state read together in one load
    pub fn role_state(&self) -> (BackendType, BackendState) {
        unpack(self.role_state.load(Ordering::Acquire))
    }

    pub fn state(&self) -> BackendState {
        self.role_state().1
    }

    pub fn backend_type(&self) -> BackendType {
        self.role_state().0
    }

    pub fn is_up(&self) -> bool {
        self.state() == BackendState::Up
    }

    /// Whether the backend currently has `role` and is up
    pub fn serves(&self, role: BackendType) -> bool {
        self.role_state() == (role, BackendState::Up)
    }

    pub fn state_since(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.state_since.load(Ordering::Acquire))
    }

    /// Store type and state as one pair, returning the previous pair.
    ///
    /// With `expected` set the update only happens while the state equals it; otherwise
    /// it fails with `Conflict` and nothing changes.
    pub(crate) fn update(
        &self,
        new_type: BackendType,
        new_state: BackendState,
        expected: Option<BackendState>,
    ) -> PasarelaResult<(BackendType, BackendState)> {
        let desired = pack(new_type, new_state);
        let mut current = self.role_state.load(Ordering::Acquire);

        loop {
            let (old_type, old_state) = unpack(current);
            if let Some(expected) = expected {
                if expected != old_state {
                    return Err(PasarelaError::Conflict {
                        expected,
                        actual: old_state,
                    });
                }
            }

            match self.role_state.compare_exchange_weak(
                current,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if old_state != new_state {
                        self.state_since.store(now_micros(), Ordering::Release);
                    }
                    return Ok((old_type, old_state));
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Unconditionally move to `new` keeping the type, returning the previous state
    pub(crate) fn set_state(&self, new: BackendState) -> BackendState {
        let word = self
            .role_state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(unpack(word).0, new))
            })
            .unwrap_or_else(|word| word);
        let previous = unpack(word).1;
        if previous != new {
            self.state_since.store(now_micros(), Ordering::Release);
        }
        previous
    }

    /// Move from `expected` to `new` keeping the type; on mismatch returns the actual state
    pub(crate) fn compare_and_set_state(
        &self,
        expected: BackendState,
        new: BackendState,
    ) -> Result<BackendState, BackendState> {
        let result = self
            .role_state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (backend_type, state) = unpack(word);
                (state == expected).then(|| pack(backend_type, new))
            });

        match result {
            Ok(_) => {
                if expected != new {
                    self.state_since.store(now_micros(), Ordering::Release);
                }
                Ok(expected)
            }
            Err(word) => Err(unpack(word).1),
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::Acquire)
    }

    pub fn uuid(&self) -> String {
        self.uuid.read().clone()
    }

    /// Replace the generated identifier, e.g. with the server's own `server_uuid`
    pub fn set_uuid<S: Into<String>>(&self, uuid: S) {
        *self.uuid.write() = uuid.into();
    }

    pub fn config(&self) -> Option<&BackendConfig> {
        self.config.get()
    }

    pub fn has_pool(&self) -> bool {
        self.pool.get().is_some()
    }

    /// Allocate the pool and per-backend config. Calling it again is a no-op.
    pub fn init_extra(&self, ctx: &ProcessContext) {
        let config = self.config.get_or_init(|| ctx.backend_config.clone());

        if let Some(provider) = &ctx.pool_provider {
            self.pool.get_or_init(|| provider.create_pool(&self.address, config));
        }
    }

    /// Idle plus used connections; zero before `init_extra`
    pub fn conns_count(&self) -> usize {
        self.idle_conns() + self.used_conns()
    }

    pub fn idle_conns(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.idle_count())
    }

    pub fn used_conns(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.used_count())
    }

    pub fn acquire(&self) -> PasarelaResult<PooledConnection> {
        let pool = self.pool.get().ok_or_else(|| {
            PasarelaError::unavailable(format!("backend {} has no connection pool", self.address))
        })?;

        let conn = pool.acquire().ok_or_else(|| PasarelaError::Busy {
            address: self.address.clone(),
        })?;
        self.connected_clients.fetch_add(1, Ordering::AcqRel);
        Ok(conn)
    }

    pub fn release(&self, conn: PooledConnection) {
        // Saturating: a stray release must not wrap the counter
        let _ = self
            .connected_clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match self.pool.get() {
            Some(pool) => pool.release(conn),
            None => tracing::warn!(
                "Dropping connection {} for backend {} without a pool",
                conn.id(),
                self.address
            ),
        }
    }

    pub fn save_challenge(&self, challenge: Bytes, is_fast: bool) {
        self.challenge.save(challenge, is_fast);
    }

    pub fn get_challenge(&self) -> Option<AuthChallenge> {
        self.challenge.get()
    }

    pub fn last_check_time(&self) -> Option<SystemTime> {
        match self.last_check_time.load(Ordering::Acquire) {
            0 => None,
            secs => Some(UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }

    pub(crate) fn touch_check_time(&self, at: SystemTime) {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.last_check_time.store(secs.max(1), Ordering::Release);
    }

    /// Replication lag; only meaningful for read-only backends
    pub fn slave_delay_msec(&self) -> u64 {
        self.slave_delay_msec.load(Ordering::Acquire)
    }

    pub fn set_slave_delay_msec(&self, delay: u64) {
        self.slave_delay_msec.store(delay, Ordering::Release);
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("group", &self.server_group)
            .field("role_state", &self.role_state())
            .field("connected_clients", &self.connected_clients())
            .finish()
    }
}
