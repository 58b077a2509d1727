//! Bounded pool of pre-authenticated upstream connections
//!
//! Many frontend sessions share a small set of upstream connections. The
//! pool hands out idle connections, creates new ones on demand up to a
//! hard cap, and blocks acquirers once the cap is reached until another
//! session returns a connection.
//!
//! A connection that breaks mid-request must not be returned; callers
//! report it through [`UpstreamPool::discard`], which frees its capacity
//! slot so a replacement can be created.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::constants::pool::ACQUIRE_GRACE;

/// Produces ready-to-use upstream connections
///
/// Implementations complete the whole upstream handshake (greeting and
/// authentication) before returning, so pool consumers never see a
/// half-initialized connection.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Conn: Send;

    async fn create(&self) -> Result<Self::Conn>;
}

/// Point-in-time pool counters, used for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections waiting in the queue
    pub idle: usize,
    /// Connections alive in total, idle plus in-flight
    pub created: usize,
    /// Hard capacity limit
    pub max_cap: usize,
}

struct PoolState<C> {
    idle: VecDeque<C>,
    created: usize,
}

/// Bounded multi-producer/multi-consumer connection pool
pub struct UpstreamPool<F: ConnectionFactory> {
    factory: F,
    initial_cap: usize,
    max_cap: usize,
    state: Mutex<PoolState<F::Conn>>,
    returned: Notify,
}

impl<F: ConnectionFactory> UpstreamPool<F> {
    /// Create an empty pool
    ///
    /// `initial_cap` connections are established later by [`prewarm`];
    /// until then the pool fills lazily on demand.
    ///
    /// [`prewarm`]: UpstreamPool::prewarm
    pub fn new(factory: F, initial_cap: usize, max_cap: usize) -> Result<Self> {
        if max_cap == 0 || initial_cap > max_cap {
            anyhow::bail!(
                "invalid pool capacity settings: initial {} / max {}",
                initial_cap,
                max_cap
            );
        }
        Ok(Self {
            factory,
            initial_cap,
            max_cap,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(max_cap),
                created: 0,
            }),
            returned: Notify::new(),
        })
    }

    /// Fill the pool up to its configured initial capacity
    ///
    /// Creation failures are logged and skipped; the pool still fills
    /// lazily afterwards.
    pub async fn prewarm(&self) {
        for i in 0..self.initial_cap {
            if !self.try_reserve_slot().await {
                break;
            }
            match self.factory.create().await {
                Ok(conn) => {
                    debug!("prewarmed upstream connection {}/{}", i + 1, self.initial_cap);
                    self.push_idle(conn).await;
                }
                Err(e) => {
                    warn!("failed to prewarm upstream connection: {}", e);
                    self.release_failed_acquire().await;
                }
            }
        }
    }

    /// Get a ready upstream connection
    ///
    /// Takes an idle connection when one is available, otherwise waits
    /// briefly for a return, otherwise creates a new connection if the
    /// cap allows, otherwise blocks until another session releases one.
    /// A factory failure frees its capacity slot before the error is
    /// propagated.
    pub async fn acquire(&self) -> Result<F::Conn> {
        if let Some(conn) = self.take_idle().await {
            return Ok(conn);
        }
        // A return may be imminent; a short wait is cheaper than a new
        // upstream handshake.
        let _ = tokio::time::timeout(ACQUIRE_GRACE, self.returned.notified()).await;
        loop {
            if let Some(conn) = self.take_idle().await {
                return Ok(conn);
            }
            if self.try_reserve_slot().await {
                return match self.factory.create().await {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        self.release_failed_acquire().await;
                        Err(e)
                    }
                };
            }
            self.returned.notified().await;
        }
    }

    /// Return a healthy connection to the pool
    ///
    /// If the queue is somehow full the connection is dropped and its
    /// capacity slot freed.
    pub async fn release(&self, conn: F::Conn) {
        let mut state = self.state.lock().await;
        if state.idle.len() < self.max_cap {
            state.idle.push_back(conn);
        } else {
            state.created = state.created.saturating_sub(1);
        }
        drop(state);
        self.returned.notify_one();
    }

    /// Drop a broken connection and free its capacity slot
    pub async fn discard(&self, conn: F::Conn) {
        drop(conn);
        self.release_slot().await;
    }

    /// Free the capacity slot of an acquire whose factory call failed
    ///
    /// [`acquire`] calls this internally; it is public for callers that
    /// drive the factory themselves.
    ///
    /// [`acquire`]: UpstreamPool::acquire
    pub async fn release_failed_acquire(&self) {
        self.release_slot().await;
    }

    /// Current pool counters
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            idle: state.idle.len(),
            created: state.created,
            max_cap: self.max_cap,
        }
    }

    async fn take_idle(&self) -> Option<F::Conn> {
        self.state.lock().await.idle.pop_front()
    }

    async fn push_idle(&self, conn: F::Conn) {
        self.state.lock().await.idle.push_back(conn);
        self.returned.notify_one();
    }

    async fn try_reserve_slot(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.created < self.max_cap {
            state.created += 1;
            true
        } else {
            false
        }
    }

    async fn release_slot(&self) {
        let mut state = self.state.lock().await;
        state.created = state.created.saturating_sub(1);
        drop(state);
        self.returned.notify_one();
    }
}
