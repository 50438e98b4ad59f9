//! Discovery and connection arbitration.
//!
//! The radio can service one connection at a time, so the arbiter holds a
//! single-slot lock: at most one connection attempt or live handshake exists,
//! and every other discovery while the lock is held only refreshes the
//! registry.  Scanning stops for the duration of a connection and resumes
//! when the lock is released.

use std::sync::Arc;

use presence_core::{now_ms, DeviceRegistry, DeviceState};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::infrastructure::radio::RadioHandle;
use crate::infrastructure::relay::LoginTarget;

pub struct ConnectionArbiter {
    /// Single-flight connection lock.  Taken on the decision to connect,
    /// released on disconnect or connect failure.
    locked: bool,
    /// Tracks whether a scan is in flight so start/stop are not repeated.
    scanning: bool,
    powered_on: bool,
    registry: Arc<Mutex<DeviceRegistry>>,
    login_target: LoginTarget,
    radio: RadioHandle,
}

impl ConnectionArbiter {
    pub fn new(
        registry: Arc<Mutex<DeviceRegistry>>,
        login_target: LoginTarget,
        radio: RadioHandle,
    ) -> Self {
        Self {
            locked: false,
            scanning: false,
            powered_on: false,
            registry,
            login_target,
            radio,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Adapter power transitions gate scanning entirely.
    pub async fn on_power_change(&mut self, powered_on: bool) {
        self.powered_on = powered_on;
        if powered_on {
            info!("radio powered on, starting scan");
            self.start_scan().await;
        } else {
            warn!("radio powered off, scanning suspended");
            self.stop_scan().await;
        }
    }

    /// One advertisement observed.  Decides between connecting for a
    /// handshake and merely refreshing the registry.
    pub async fn on_discover(&mut self, id: &str, rssi: i16) {
        // Sightings while the connection slot is busy are dropped outright:
        // refreshing here would mark a queued device trusted-present without
        // the re-verification it is waiting for.
        if self.locked {
            debug!("discovered {id} while busy, ignoring");
            return;
        }

        if self.should_connect(id).await {
            debug!("discovered {id} (rssi {rssi}), connecting");
            self.locked = true;
            self.stop_scan().await;
            self.radio.connect(id).await;
        } else {
            self.mark_seen(id).await;
        }
    }

    /// The attempt never produced a connection; release and resume.
    pub async fn on_connect_failed(&mut self, id: &str, reason: &str) {
        warn!("connection to {id} failed: {reason}");
        self.release().await;
    }

    /// The live connection ended, cleanly or not; release and resume.
    pub async fn on_disconnect(&mut self) {
        debug!("connection closed, releasing lock");
        self.release().await;
    }

    /// A wearable deserves a connection when it is unknown, queued for
    /// re-verification, or the front-end's login target.
    async fn should_connect(&self, id: &str) -> bool {
        if self.login_target.is(id).await {
            return true;
        }
        let registry = self.registry.lock().await;
        !registry.contains(id) || registry.needs_checking(id)
    }

    async fn mark_seen(&self, id: &str) {
        let mut registry = self.registry.lock().await;
        registry.upsert(id, DeviceState::Active, now_ms());
    }

    async fn release(&mut self) {
        self.locked = false;
        if self.powered_on {
            self.start_scan().await;
        }
    }

    async fn start_scan(&mut self) {
        if self.scanning {
            return;
        }
        self.scanning = true;
        self.radio.start_scan().await;
    }

    async fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        self.radio.stop_scan().await;
    }
}
