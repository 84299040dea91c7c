/// Core abstractions: backend records, the registry and its selection algorithms
pub mod backend;
pub mod challenge;
pub mod group;
pub mod pool;
pub mod set;

pub use backend::{Backend, BackendConfig, ProcessContext};
pub use challenge::{AuthChallenge, ChallengeCache};
pub use group::{TopologyGroup, MAX_GROUP_SLAVES};
pub use pool::{BoundedPool, BoundedPoolProvider, ConnectionPool, PoolProvider, PooledConnection};
pub use set::{BackendSet, BackendSnapshot, GroupSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health state of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BackendState {
    #[default]
    Unknown = 0,
    Up = 1,
    Down = 2,
    /// Held by an operator; the health checker never moves a backend out of it
    Maintaining = 3,
    Deleted = 4,
}

impl BackendState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BackendState::Up,
            2 => BackendState::Down,
            3 => BackendState::Maintaining,
            4 => BackendState::Deleted,
            _ => BackendState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Unknown => "unknown",
            BackendState::Up => "up",
            BackendState::Down => "down",
            BackendState::Maintaining => "maintaining",
            BackendState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Role of a backend in its replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum BackendType {
    #[default]
    #[serde(rename = "unknown")]
    Unknown = 0,
    /// Primary, accepts writes
    #[serde(rename = "rw")]
    ReadWrite = 1,
    /// Replica
    #[serde(rename = "ro")]
    ReadOnly = 2,
}

impl BackendType {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BackendType::ReadWrite,
            2 => BackendType::ReadOnly,
            _ => BackendType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Unknown => "unknown",
            BackendType::ReadWrite => "rw",
            BackendType::ReadOnly => "ro",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Read-only selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendAlgo {
    #[default]
    RoundRobin,
    Random,
    /// Lowest eligible index, for pinned configurations
    First,
}

/// Stable backend identifier.
///
/// Ids are handed out from a per-set counter and never reused, so a group or a caller
/// holding one can detect that its backend was removed instead of silently resolving to
/// whatever now occupies the old array slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BackendId(pub(crate) u64);

impl BackendId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_u8_conversion() {
        for state in [
            BackendState::Unknown,
            BackendState::Up,
            BackendState::Down,
            BackendState::Maintaining,
            BackendState::Deleted,
        ] {
            assert_eq!(BackendState::from_u8(state as u8), state);
        }
        assert_eq!(BackendState::from_u8(200), BackendState::Unknown);
    }

    #[test]
    fn test_type_display() {
        assert_eq!(BackendType::ReadWrite.to_string(), "rw");
        assert_eq!(BackendType::ReadOnly.to_string(), "ro");
        assert_eq!(BackendType::from_u8(9), BackendType::Unknown);
    }

    #[test]
    fn test_algo_default_is_round_robin() {
        assert_eq!(BackendAlgo::default(), BackendAlgo::RoundRobin);
    }
}
