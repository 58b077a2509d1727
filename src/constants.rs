//! Constants used throughout the proxy
//!
//! This module centralizes magic numbers and protocol strings
//! to improve maintainability and reduce duplication.

use std::time::Duration;

/// NNTP protocol constants
pub mod protocol {
    /// Greeting sent to every frontend connection
    pub const GREETING: &str = "200 Welcome to NNTP Proxy!";

    /// Reply to `AUTHINFO USER`, requesting the password
    pub const PASSWORD_REQUIRED: &str = "381 Continue";

    /// Reply on successful admission
    pub const AUTH_ACCEPTED: &str = "281 Welcome";

    /// Status code announcing a multi-line article body
    pub const ARTICLE_FOLLOWS: u16 = 220;

    /// Expected upstream greeting code
    pub const UPSTREAM_READY: u16 = 200;

    /// Expected upstream reply to `AUTHINFO USER`
    pub const UPSTREAM_PASSWORD_REQUIRED: u16 = 381;

    /// Expected upstream reply to `AUTHINFO PASS`
    pub const UPSTREAM_AUTH_ACCEPTED: u16 = 281;

    /// Whether a status code announces a dot-terminated multi-line
    /// block
    ///
    /// The block must be consumed before the connection can carry the
    /// next command.
    pub const fn is_multiline_reply(code: u16) -> bool {
        matches!(
            code,
            100 | 101 | 215 | 220 | 221 | 222 | 224 | 225 | 230 | 231
        )
    }
}

/// Upstream connection pool constants
pub mod pool {
    use super::Duration;

    /// Hard cap on upstream connections, idle plus in-flight
    pub const MAX_CONNECTIONS: usize = 50;

    /// Connections created eagerly at startup
    pub const INITIAL_CONNECTIONS: usize = 0;

    /// How long an acquirer waits for a returned connection before
    /// paying for a fresh one
    pub const ACQUIRE_GRACE: Duration = Duration::from_millis(1);
}

/// Quota and lockout constants
pub mod quota {
    use super::Duration;

    /// Forwarded commands between accounting flushes
    pub const FLUSH_INTERVAL: u32 = 10;

    /// Auth failures tolerated before the lockout fact is cached
    pub const AUTH_FAILURE_LIMIT: u32 = 100;

    /// Lifetime of every lockout cache fact
    pub const LOCKOUT_TTL: Duration = Duration::from_secs(60);
}

/// Command forwarding constants
pub mod forward {
    /// Upstream attempts per forwarded command before giving up
    pub const MAX_ATTEMPTS: u32 = 3;
}
