//! DeviceRegistry: the authoritative map of known wearables and their
//! liveness state, plus the re-verification queue.
//!
//! Devices progress through this lifecycle:
//!
//! ```text
//! (first seen / handshake ok)      inactivity >= stale     inactivity >= evict
//!            │                           │                        │
//!            ▼                           ▼                        ▼
//!         active  ────────────────►   stale  ─────────────►   removed
//!                                 (queued for recheck)
//! ```
//!
//! The arbiter and the handshake state machine request mutations through this
//! type; they never hold private copies of a record.  [`DeviceRegistry::sweep`]
//! is the only place records age out.
//!
//! # Recheck queue invariant
//!
//! An identifier is queued if and only if its record's age is within
//! `[stale_after, evict_after)` and it has not been re-verified since entering
//! that window.  At most one queue entry exists per identifier; entries leave
//! the queue on successful handshake ([`DeviceRegistry::clear_checking`]) or
//! on eviction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Stable identifier for a wearable, extracted from its advertisement data.
pub type DeviceId = String;

/// Liveness classification of a known device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Seen recently enough to be trusted as present.
    Active,
    /// Not seen recently; queued for re-verification, not yet evicted.
    Stale,
}

/// Registry entry for a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub state: DeviceState,
    /// Milliseconds since the Unix epoch of the last successful interaction.
    pub last_seen_ms: u64,
}

/// One device in a [`RegistrySnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPresence {
    pub id: DeviceId,
    pub state: DeviceState,
}

/// Immutable view of the registry handed to the presence relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub clients: Vec<ClientPresence>,
}

/// In-memory registry of all known devices.
///
/// The daemon stores this behind a `Mutex` so the arbiter, the handshake
/// state machine, the sweep task, and the relay can share it; the logical
/// single-threaded dispatch loop means contention is negligible.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
    /// Ordered queue of `(id, record-at-queue-time)` pairs pending recheck.
    recheck: Vec<(DeviceId, DeviceRecord)>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or overwrites a record, stamping `last_seen_ms = now_ms`.
    /// Idempotent.
    pub fn upsert(&mut self, id: &str, state: DeviceState, now_ms: u64) {
        self.devices.insert(
            id.to_string(),
            DeviceRecord {
                state,
                last_seen_ms: now_ms,
            },
        );
    }

    /// Returns the record for `id`, if known.
    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    /// Returns `true` when `id` has a record.
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Returns `true` when `id` is queued for re-verification.
    pub fn needs_checking(&self, id: &str) -> bool {
        self.recheck.iter().any(|(queued, _)| queued == id)
    }

    /// Removes `id` from the recheck queue after a successful handshake.
    pub fn clear_checking(&mut self, id: &str) {
        self.recheck.retain(|(queued, _)| queued != id);
    }

    /// Number of entries currently queued for re-verification.
    pub fn recheck_len(&self) -> usize {
        self.recheck.len()
    }

    /// Ages out inactive devices.  Runs on a fixed wall-clock cadence.
    ///
    /// For every record: if `now_ms - last_seen_ms >= evict_after_ms`, the
    /// record and any queue entry are removed; else if the age has reached
    /// `stale_after_ms`, the record is marked [`DeviceState::Stale`] and
    /// queued for recheck unless already queued.  Re-running the sweep without
    /// an intervening re-verification never queues a device twice.
    pub fn sweep(&mut self, now_ms: u64, stale_after_ms: u64, evict_after_ms: u64) {
        let evicted: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, record)| now_ms.saturating_sub(record.last_seen_ms) >= evict_after_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for id in evicted {
            debug!("evicting {id}: unseen past the eviction threshold");
            self.devices.remove(&id);
            self.clear_checking(&id);
        }

        let mut newly_stale: Vec<(DeviceId, DeviceRecord)> = Vec::new();
        for (id, record) in &mut self.devices {
            let age = now_ms.saturating_sub(record.last_seen_ms);
            if age >= stale_after_ms {
                record.state = DeviceState::Stale;
                if !self.recheck.iter().any(|(queued, _)| queued == id) {
                    newly_stale.push((id.clone(), record.clone()));
                }
            }
        }
        for entry in newly_stale {
            debug!("queueing {} for recheck", entry.0);
            self.recheck.push(entry);
        }
    }

    /// Returns an immutable view for the relay, sorted by identifier so
    /// successive pushes of the same population are byte-identical.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut clients: Vec<ClientPresence> = self
            .devices
            .iter()
            .map(|(id, record)| ClientPresence {
                id: id.clone(),
                state: record.state,
            })
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        RegistrySnapshot { clients }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
