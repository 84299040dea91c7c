/// TCP connect probe for MySQL-protocol backends

use std::io;

use super::{HealthProbe, HealthStatus};
use crate::error::PasarelaResult;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Connects to the backend and waits for the server's first packet.
///
/// A MySQL server speaks first (the handshake greeting), so a connection that is accepted
/// and then produces at least one byte is treated as alive. Host names are resolved by
/// tokio. The overall deadline is enforced by the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe {
    /// Only check that the port accepts connections
    connect_only: bool,
}

impl TcpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_only() -> Self {
        Self { connect_only: true }
    }

    /// Connect and, unless `connect_only`, read the first bytes of the greeting
    async fn greet(&self, address: &str) -> PasarelaResult<()> {
        let mut stream = TcpStream::connect(address).await?;
        if self.connect_only {
            return Ok(());
        }

        let mut buffer = [0u8; 64];
        match stream.read(&mut buffer).await? {
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before greeting",
            )
            .into()),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, address: &str) -> HealthStatus {
        tracing::trace!("Probing backend {}", address);

        match self.greet(address).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }
}
