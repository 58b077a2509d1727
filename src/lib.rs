//! # NNTP Gate
//!
//! An authenticating, quota-enforcing NNTP proxy. Clients authenticate
//! with `AUTHINFO USER`/`PASS` against a durable user store, allowed
//! article commands are forwarded through a bounded pool of
//! pre-authenticated upstream connections, and every transferred byte is
//! accounted against the user's renewable allowance.
//!
//! ## Architecture
//!
//! - **transport**: CRLF line framing and dot-stuffed body streaming
//! - **session**: per-connection protocol state machine and admission
//! - **pool**: bounded multiplexing of upstream connections
//! - **store**: durable per-user counters and the session log (SQLite)
//! - **cache**: short-TTL lockout facts gating repeated auth failures
//! - **upstream**: backend dialing and the upstream auth exchange
//! - **config**: TOML configuration
//! - **tls**: frontend acceptor and upstream connector
//!
//! The proxy is deliberately stateless toward upstream servers: only
//! commands that carry their full context on one line are forwarded, so
//! any pooled connection can serve any client's next command.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

mod auth;
mod cache;
mod config;
mod constants;
pub mod daemon;
mod pool;
mod session;
mod store;
mod stream;
pub mod tls;
mod transport;
mod types;
mod upstream;

pub use auth::{hash_password, verify_password};
pub use cache::{DynCache, FactCache, Lockout, MemoryCache};
pub use config::{
    create_default_config, load_config, BackendConfig, Config, FrontendConfig, PasswordScheme,
    StoreConfig,
};
pub use pool::{ConnectionFactory, PoolStatus, UpstreamPool};
pub use session::Session;
pub use store::{NewUser, QuotaStore, SessionRow, User};
pub use stream::ConnectionStream;
pub use transport::{LineTransport, TransportError};
pub use types::ClientId;
pub use upstream::{UpstreamConn, UpstreamFactory};

/// The proxy: shared state handed to every frontend session
#[derive(Clone)]
pub struct Proxy {
    config: Arc<Config>,
    pool: Arc<UpstreamPool<UpstreamFactory>>,
    store: QuotaStore,
    lockout: Lockout,
}

impl Proxy {
    /// Initialize the proxy from a validated configuration
    ///
    /// Opens the quota store, clears stale occupancy counters (no
    /// frontend session survives a restart), and sets up the upstream
    /// pool against the first configured backend.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if config.backends.len() > 1 {
            warn!(
                "only the first backend ('{}') is used; {} further entries ignored",
                config.backends[0].name,
                config.backends.len() - 1
            );
        }

        let store = QuotaStore::new(&config.store.database_url).await?;
        store.reset_all_conn_used().await?;

        let factory = UpstreamFactory::new(config.backends[0].clone());
        let pool = Arc::new(UpstreamPool::new(
            factory,
            constants::pool::INITIAL_CONNECTIONS,
            constants::pool::MAX_CONNECTIONS,
        )?);

        let lockout = Lockout::new(Arc::new(MemoryCache::new()));

        Ok(Self {
            config: Arc::new(config),
            pool,
            store,
            lockout,
        })
    }

    /// Establish the configured number of upstream connections eagerly
    pub async fn prewarm_connections(&self) {
        self.pool.prewarm().await;
        let status = self.pool.status().await;
        info!(
            "upstream pool ready ({}/{} connections idle)",
            status.idle, status.max_cap
        );
    }

    /// Handle to the quota store, for provisioning and reporting
    pub fn store(&self) -> &QuotaStore {
        &self.store
    }

    /// The loaded configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one frontend session to completion
    pub async fn handle_client(&self, stream: ConnectionStream, addr: SocketAddr) -> Result<()> {
        Session::new(
            stream,
            addr,
            self.pool.clone(),
            self.store.clone(),
            self.lockout.clone(),
            self.config.clone(),
        )
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = create_default_config();
        config.store.database_url = "sqlite::memory:".to_string();
        config
    }

    #[tokio::test]
    async fn test_proxy_creation() {
        let proxy = Proxy::new(test_config()).await.expect("proxy should build");
        assert_eq!(proxy.config().backends.len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_rejects_empty_backends() {
        let mut config = test_config();
        config.backends.clear();
        let result = Proxy::new(config).await;
        match result {
            Err(e) => assert!(e.to_string().contains("no backends configured")),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn test_startup_clears_stale_counters() {
        // Two proxies sharing one database file: counters bumped by the
        // first must be gone after the second starts
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/gate.db", dir.path().display());

        let mut config = test_config();
        config.store.database_url = url.clone();

        let first = Proxy::new(config.clone()).await.unwrap();
        let user_id = first
            .store()
            .create_user(&NewUser {
                username: "alice",
                password: "secret",
                max_conn: 2,
                allowance: 0,
                period: 1,
            })
            .await
            .unwrap();
        first.store().adjust_conn_used(user_id, 1).await.unwrap();
        drop(first);

        let second = Proxy::new(config).await.unwrap();
        let user = second.store().get_user_by_id(user_id).await.unwrap();
        assert_eq!(user.conn_used, 0);
    }
}
