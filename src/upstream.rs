//! Upstream connection factory
//!
//! Dials the configured backend, runs the upstream authentication
//! exchange, and hands the pool a framed transport that is ready for
//! article commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::constants::protocol;
use crate::pool::ConnectionFactory;
use crate::stream::ConnectionStream;
use crate::transport::LineTransport;

/// A pool-owned, pre-authenticated upstream connection
pub type UpstreamConn = LineTransport<ConnectionStream>;

/// Factory producing authenticated connections to one backend
#[derive(Debug, Clone)]
pub struct UpstreamFactory {
    backend: BackendConfig,
}

impl UpstreamFactory {
    pub fn new(backend: BackendConfig) -> Self {
        Self { backend }
    }

    async fn connect(&self) -> Result<ConnectionStream> {
        let target = format!("{}:{}", self.backend.addr, self.backend.port);
        let tcp = TcpStream::connect(&target)
            .await
            .with_context(|| format!("failed to connect to backend '{}' at {}", self.backend.name, target))?;
        tcp.set_nodelay(true)?;

        if !self.backend.tls_enabled {
            return Ok(ConnectionStream::plain(tcp));
        }

        let connector = crate::tls::client_connector(self.backend.tls_verify_cert)?;
        let server_name = rustls::pki_types::ServerName::try_from(self.backend.addr.clone())
            .with_context(|| format!("invalid backend hostname '{}'", self.backend.addr))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with backend '{}' failed", self.backend.name))?;
        Ok(ConnectionStream::tls_client(tls))
    }
}

#[async_trait]
impl ConnectionFactory for UpstreamFactory {
    type Conn = UpstreamConn;

    async fn create(&self) -> Result<UpstreamConn> {
        let stream = self.connect().await?;
        let mut transport = LineTransport::new(stream);

        let greeting = transport
            .read_code_line(protocol::UPSTREAM_READY)
            .await
            .with_context(|| format!("bad greeting from backend '{}'", self.backend.name))?;
        debug!("backend '{}' greeting: {}", self.backend.name, greeting);

        transport
            .write_line(&format!("AUTHINFO USER {}", self.backend.user))
            .await?;
        transport
            .read_code_line(protocol::UPSTREAM_PASSWORD_REQUIRED)
            .await
            .with_context(|| {
                format!("backend '{}' rejected AUTHINFO USER", self.backend.name)
            })?;

        transport
            .write_line(&format!("AUTHINFO PASS {}", self.backend.pass))
            .await?;
        transport
            .read_code_line(protocol::UPSTREAM_AUTH_ACCEPTED)
            .await
            .with_context(|| {
                format!("authentication to backend '{}' failed", self.backend.name)
            })?;

        info!("connected to backend '{}'", self.backend.name);
        Ok(transport)
    }
}
