//! Service-manager integration
//!
//! When running under systemd the proxy announces readiness after the
//! listener is bound and keeps the watchdog fed at a third of the
//! announced interval. Outside systemd both calls are no-ops.

use sd_notify::NotifyState;
use tracing::{debug, info};

/// Announce readiness to the service manager
pub fn notify_ready() {
    if let Err(e) = sd_notify::notify(false, &[NotifyState::Ready]) {
        debug!("service manager not notified: {}", e);
    }
}

/// Start the watchdog feeder if the service manager requested one
pub fn spawn_watchdog() {
    let mut usec = 0;
    if !sd_notify::watchdog_enabled(false, &mut usec) || usec == 0 {
        return;
    }
    let interval = std::time::Duration::from_micros(usec / 3);
    info!("systemd watchdog enabled, pinging every {:?}", interval);
    tokio::spawn(async move {
        loop {
            if let Err(e) = sd_notify::notify(false, &[NotifyState::Watchdog]) {
                debug!("watchdog ping failed: {}", e);
            }
            tokio::time::sleep(interval).await;
        }
    });
}
