/// Per-backend cache of the last authentication handshake challenge
use bytes::Bytes;
use parking_lot::Mutex;

use crate::utils::short_digest;

/// A captured handshake challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub bytes: Bytes,
    /// Whether this challenge may be reused for an accelerated handshake
    pub is_fast: bool,
}

/// Holds at most one challenge; each save overwrites the previous one.
#[derive(Debug, Default)]
pub struct ChallengeCache {
    current: Mutex<Option<AuthChallenge>>,
}

impl ChallengeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, challenge: Bytes, is_fast: bool) {
        tracing::debug!(
            "Caching auth challenge {} ({} bytes, fast={})",
            short_digest(&challenge),
            challenge.len(),
            is_fast
        );
        *self.current.lock() = Some(AuthChallenge {
            bytes: challenge,
            is_fast,
        });
    }

    pub fn get(&self) -> Option<AuthChallenge> {
        self.current.lock().clone()
    }

}
