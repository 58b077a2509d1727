//! Frontend session state machine
//!
//! One `Session` runs per accepted frontend connection and owns the
//! whole protocol dialog: greeting, the `AUTHINFO` handshake with its
//! admission decision, command gating against the allow-list, forwarding
//! through the upstream pool, and teardown with the final accounting
//! flush.
//!
//! Accounting is batched: transferred bytes accumulate in memory and are
//! flushed to the quota store every [`FLUSH_INTERVAL`] forwarded
//! commands and once more at close. Each flush re-reads the user record
//! so external allowance adjustments take effect without a reconnect.
//!
//! [`FLUSH_INTERVAL`]: crate::constants::quota::FLUSH_INTERVAL

use anyhow::Result;
use chrono::Utc;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::auth::verify_password;
use crate::cache::Lockout;
use crate::config::Config;
use crate::constants::{forward, protocol, quota};
use crate::pool::UpstreamPool;
use crate::store::{QuotaStore, User};
use crate::stream::ConnectionStream;
use crate::transport::{LineTransport, TransportError};
use crate::types::ClientId;
use crate::upstream::UpstreamFactory;

/// Split a command line at the first space
fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((head, rest)) => (head, rest),
        None => (line, ""),
    }
}

/// Client-facing status line for an article body
///
/// The upstream's article index is replaced by the fixed placeholder
/// `1`; existing clients depend on this shape.
fn placeholder_status(upstream_text: &str) -> String {
    let remainder = upstream_text.split_once(' ').map_or("", |(_, rest)| rest);
    format!("220 1 {}", remainder)
}

/// An active frontend session
pub struct Session {
    client_id: ClientId,
    client_addr: SocketAddr,
    transport: LineTransport<ConnectionStream>,
    pool: Arc<UpstreamPool<UpstreamFactory>>,
    store: QuotaStore,
    lockout: Lockout,
    config: Arc<Config>,
    /// Snapshot of the authenticated user, refreshed on every flush
    user: Option<User>,
    session_id: Option<i64>,
    /// True once `conn_used` was incremented, so close decrements
    /// exactly once
    conn_counted: bool,
    unflushed_bytes: i64,
    requests_since_flush: u32,
}

impl Session {
    pub fn new(
        stream: ConnectionStream,
        client_addr: SocketAddr,
        pool: Arc<UpstreamPool<UpstreamFactory>>,
        store: QuotaStore,
        lockout: Lockout,
        config: Arc<Config>,
    ) -> Self {
        Self {
            client_id: ClientId::new(),
            client_addr,
            transport: LineTransport::new(stream),
            pool,
            store,
            lockout,
            config,
            user: None,
            session_id: None,
            conn_counted: false,
            unflushed_bytes: 0,
            requests_since_flush: 0,
        }
    }

    /// Drive the session until the client disconnects or a terminal
    /// reply closes it
    pub async fn run(mut self) -> Result<()> {
        debug!(client = %self.client_id, addr = %self.client_addr, "session started");

        if let Err(e) = self.transport.write_line(protocol::GREETING).await {
            debug!(client = %self.client_id, "failed to send greeting: {}", e);
            return Ok(());
        }

        loop {
            let line = match self.transport.read_line().await {
                Ok(line) => line,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    debug!(client = %self.client_id, "client read failed: {}", e);
                    break;
                }
            };
            match self.dispatch(&line).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    debug!(client = %self.client_id, "session error: {}", e);
                    break;
                }
            }
        }

        self.close().await;
        Ok(())
    }

    async fn dispatch(&mut self, line: &str) -> Result<ControlFlow<()>> {
        let (head, args) = split_command(line);

        if self.user.is_none() {
            if head.eq_ignore_ascii_case("authinfo") {
                return self.handle_auth(args).await;
            }
            self.transport
                .write_line(&format!("502 {} not allowed", head))
                .await?;
            return Ok(ControlFlow::Continue(()));
        }

        if self.config.frontend.is_command_allowed(head) {
            self.forward(line).await
        } else {
            warn!(client = %self.client_id, "command {} not allowed", head);
            self.transport
                .write_line(&format!("502 {} not allowed", head))
                .await?;
            Ok(ControlFlow::Continue(()))
        }
    }

    /// Run the `AUTHINFO USER`/`PASS` exchange and the admission decision
    async fn handle_auth(&mut self, args: &str) -> Result<ControlFlow<()>> {
        let (subcommand, username) = split_command(args);
        if !subcommand.eq_ignore_ascii_case("user") || username.is_empty() {
            self.transport.write_line("502 Unknown Syntax!").await?;
            return Ok(ControlFlow::Break(()));
        }
        let username = username.to_string();

        self.transport
            .write_line(protocol::PASSWORD_REQUIRED)
            .await?;

        let reply = self.transport.read_line().await?;
        let mut words = reply.splitn(3, ' ');
        let w0 = words.next().unwrap_or("");
        let w1 = words.next().unwrap_or("");
        let password = words.next().unwrap_or("");
        if !w0.eq_ignore_ascii_case("authinfo") || !w1.eq_ignore_ascii_case("pass") {
            self.transport.write_line("502 Unknown Syntax!").await?;
            return Ok(ControlFlow::Break(()));
        }

        self.admit(&username, password).await
    }

    async fn admit(&mut self, username: &str, password: &str) -> Result<ControlFlow<()>> {
        if self.lockout.is_blocked(username).await {
            self.transport.write_line("502 Auth Failed").await?;
            return Ok(ControlFlow::Break(()));
        }
        if self.lockout.allowance_exhausted(username).await {
            self.transport.write_line("502 Allowance Used").await?;
            return Ok(ControlFlow::Break(()));
        }

        let scheme = self.config.store.password_scheme;
        let mut user = match self.store.get_user_by_name(username).await {
            Ok(Some(user)) if verify_password(scheme, password, &user.password) => user,
            Ok(_) => {
                // Wrong password and unknown user are indistinguishable
                // to the client, and both feed the failure counter
                self.lockout.record_auth_failure(username).await;
                self.transport.write_line("502 AUTH FAILED!").await?;
                return Ok(ControlFlow::Break(()));
            }
            Err(e) => {
                // A store outage is not a credential failure; refuse
                // without touching the counter
                error!(client = %self.client_id, "user lookup failed: {}", e);
                self.transport.write_line("502 AUTH FAILED!").await?;
                return Ok(ControlFlow::Break(()));
            }
        };

        if user.conn_used + 1 > user.max_conn {
            info!(
                client = %self.client_id,
                user = %username,
                "connection limit reached ({}/{})",
                user.conn_used,
                user.max_conn
            );
            self.transport
                .write_line("502 Too many connections")
                .await?;
            return Ok(ControlFlow::Break(()));
        }

        if user.allowance > 0 && user.allowance_used >= user.allowance {
            if Utc::now() > user.end_date {
                match self.store.reset_allowance(user.id).await {
                    Ok(()) => match self.store.get_user_by_id(user.id).await {
                        Ok(fresh) => user = fresh,
                        Err(e) => {
                            warn!(client = %self.client_id, "user refresh failed: {}", e);
                            user.allowance_used = 0;
                        }
                    },
                    Err(e) => {
                        error!(client = %self.client_id, "allowance reset failed: {}", e);
                        self.transport.write_line("502 Allowance Used").await?;
                        return Ok(ControlFlow::Break(()));
                    }
                }
            } else {
                self.lockout.mark_allowance_exhausted(username).await;
                self.transport.write_line("502 Allowance Used").await?;
                return Ok(ControlFlow::Break(()));
            }
        }

        let session_id = match self.store.insert_session(user.id).await {
            Ok(id) => id,
            Err(e) => {
                error!(client = %self.client_id, "session insert failed: {}", e);
                self.transport.write_line("502 Try again later").await?;
                return Ok(ControlFlow::Break(()));
            }
        };

        match self.store.adjust_conn_used(user.id, 1).await {
            Ok(()) => {
                self.conn_counted = true;
                user.conn_used += 1;
            }
            Err(e) => {
                // Admit anyway; close must not decrement what was never
                // counted
                warn!(client = %self.client_id, "conn_used increment failed: {}", e);
            }
        }

        info!(client = %self.client_id, user = %username, "session admitted");
        self.session_id = Some(session_id);
        self.user = Some(user);
        self.transport.write_line(protocol::AUTH_ACCEPTED).await?;
        Ok(ControlFlow::Continue(()))
    }

    /// Forward one allowed command upstream and stream the reply back
    async fn forward(&mut self, line: &str) -> Result<ControlFlow<()>> {
        self.requests_since_flush += 1;
        if self.requests_since_flush >= quota::FLUSH_INTERVAL {
            self.flush_accounting().await;
        }

        let (user_id, allowance, allowance_used, end_date) = match &self.user {
            Some(user) => (user.id, user.allowance, user.allowance_used, user.end_date),
            None => return Ok(ControlFlow::Continue(())),
        };

        if allowance > 0 && allowance_used > allowance {
            if Utc::now() > end_date {
                match self.store.reset_allowance(user_id).await {
                    Ok(()) => {
                        if let Some(user) = self.user.as_mut() {
                            user.allowance_used = 0;
                        }
                    }
                    Err(e) => {
                        error!(client = %self.client_id, "allowance reset failed: {}", e);
                        self.transport.write_line("502 Allowance Used").await?;
                        return Ok(ControlFlow::Break(()));
                    }
                }
            } else {
                self.transport.write_line("502 Allowance Used").await?;
                return Ok(ControlFlow::Break(()));
            }
        }

        for attempt in 1..=forward::MAX_ATTEMPTS {
            let mut conn = match self.pool.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        client = %self.client_id,
                        "upstream acquire failed (attempt {}): {}",
                        attempt, e
                    );
                    continue;
                }
            };

            if let Err(e) = conn.write_line(line).await {
                debug!(
                    client = %self.client_id,
                    "upstream write failed (attempt {}): {}",
                    attempt, e
                );
                self.pool.discard(conn).await;
                continue;
            }

            match conn.read_code_line(protocol::ARTICLE_FOLLOWS).await {
                Ok(text) => {
                    if let Err(e) = self.transport.write_line(&placeholder_status(&text)).await {
                        // The body is still pending upstream; the
                        // connection cannot be reused
                        self.pool.discard(conn).await;
                        return Err(e.into());
                    }
                    match conn.copy_dot_body(&mut self.transport).await {
                        Ok(copied) => {
                            self.unflushed_bytes += copied as i64;
                            self.pool.release(conn).await;
                            return Ok(ControlFlow::Continue(()));
                        }
                        Err(e) => {
                            // Interrupted mid-body: unrecoverable in
                            // both directions
                            self.pool.discard(conn).await;
                            return Err(e.into());
                        }
                    }
                }
                Err(TransportError::UnexpectedCode { code, text, .. }) => {
                    // Some other verdict from the upstream; relay it.
                    // A multi-line reply (HEAD's 221, BODY's 222, the
                    // listing codes) must be drained too, or the next
                    // acquirer would read leftover body lines as its
                    // status line.
                    let reply = if text.is_empty() {
                        code.to_string()
                    } else {
                        format!("{} {}", code, text)
                    };
                    if let Err(e) = self.transport.write_line(&reply).await {
                        if protocol::is_multiline_reply(code) {
                            self.pool.discard(conn).await;
                        } else {
                            self.pool.release(conn).await;
                        }
                        return Err(e.into());
                    }
                    if protocol::is_multiline_reply(code) {
                        match conn.copy_dot_body(&mut self.transport).await {
                            Ok(copied) => self.unflushed_bytes += copied as i64,
                            Err(e) => {
                                self.pool.discard(conn).await;
                                return Err(e.into());
                            }
                        }
                    }
                    self.pool.release(conn).await;
                    return Ok(ControlFlow::Continue(()));
                }
                Err(e) => {
                    debug!(
                        client = %self.client_id,
                        "upstream status read failed (attempt {}): {}",
                        attempt, e
                    );
                    self.pool.discard(conn).await;
                    continue;
                }
            }
        }

        warn!(
            client = %self.client_id,
            "giving up on upstream after {} attempts",
            forward::MAX_ATTEMPTS
        );
        self.transport.write_line("502 Backend unavailable").await?;
        Ok(ControlFlow::Continue(()))
    }

    /// Push accumulated bytes into the store and refresh the user
    /// snapshot
    async fn flush_accounting(&mut self) {
        self.requests_since_flush = 0;
        let (user_id, session_id) = match (&self.user, self.session_id) {
            (Some(user), Some(session_id)) => (user.id, session_id),
            _ => return,
        };

        let bytes = self.unflushed_bytes;
        if bytes > 0 {
            match self.store.add_session_bytes(session_id, bytes).await {
                Ok(()) => {
                    self.unflushed_bytes = 0;
                    if let Err(e) = self.store.add_user_allowance_used(user_id, bytes).await {
                        warn!(client = %self.client_id, "allowance flush failed: {}", e);
                    }
                }
                Err(e) => {
                    // Keep the accumulator; the next flush retries
                    warn!(client = %self.client_id, "session byte flush failed: {}", e);
                }
            }
        }

        match self.store.get_user_by_id(user_id).await {
            Ok(user) => self.user = Some(user),
            Err(e) => warn!(client = %self.client_id, "user refresh failed: {}", e),
        }
    }

    /// Final flush and occupancy release; runs exactly once
    async fn close(&mut self) {
        if self.user.is_none() {
            debug!(client = %self.client_id, "session closed before authentication");
            return;
        }

        self.flush_accounting().await;

        if let Some(user) = self.user.take() {
            if self.conn_counted {
                if let Err(e) = self.store.adjust_conn_used(user.id, -1).await {
                    warn!(client = %self.client_id, "conn_used decrement failed: {}", e);
                }
            }
            info!(client = %self.client_id, user = %user.username, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("ARTICLE <1@test>"), ("ARTICLE", "<1@test>"));
        assert_eq!(split_command("QUIT"), ("QUIT", ""));
        assert_eq!(split_command(""), ("", ""));
        assert_eq!(
            split_command("AUTHINFO USER alice"),
            ("AUTHINFO", "USER alice")
        );
    }

    #[test]
    fn test_placeholder_status_replaces_index() {
        assert_eq!(
            placeholder_status("42 <1@test> article retrieved"),
            "220 1 <1@test> article retrieved"
        );
    }

    #[test]
    fn test_placeholder_status_without_remainder() {
        // Upstream sent a bare article number
        assert_eq!(placeholder_status("42"), "220 1 ");
        assert_eq!(placeholder_status(""), "220 1 ");
    }
}
