// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Three-level connection index: user → platform → set of live connections.
//!
//! All three maps move together under one writer lock. Readers take
//! snapshots (uuids paired with their send capability) so fan-out never
//! holds the registry lock during network I/O. The lock is never held
//! across a suspension point.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One live server-side connection, immutable at creation.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub uuid: Uuid,
    pub user_id: String,
    pub platform: String,
    pub api_key: String,
    pub remote_addr: Option<SocketAddr>,
    pub established_at: Instant,
}

/// A routable view of one connection, taken under the lock and used after
/// releasing it.
#[derive(Debug, Clone)]
pub struct ConnSnapshot<S> {
    pub uuid: Uuid,
    pub user_id: String,
    pub platform: String,
    pub sender: S,
}

/// Registry gauge counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub users: usize,
    pub connections: usize,
}

/// The three coordinated maps. Mutation is only reachable through
/// [`Registry`], which serializes writers; the struct itself is sync so the
/// invariants can be exercised directly in tests.
pub(crate) struct Maps<S> {
    by_user_platform: HashMap<String, HashMap<String, HashSet<Uuid>>>,
    by_uuid: HashMap<Uuid, ConnectionRecord>,
    senders: HashMap<Uuid, S>,
}

impl<S> Default for Maps<S> {
    fn default() -> Self {
        Self { by_user_platform: HashMap::new(), by_uuid: HashMap::new(), senders: HashMap::new() }
    }
}

impl<S: Clone> Maps<S> {
    pub(crate) fn insert(&mut self, record: ConnectionRecord, sender: S) {
        let uuid = record.uuid;
        self.by_user_platform
            .entry(record.user_id.clone())
            .or_default()
            .entry(record.platform.clone())
            .or_default()
            .insert(uuid);
        self.by_uuid.insert(uuid, record);
        self.senders.insert(uuid, sender);
    }

    /// Remove one connection from all three maps, pruning empty platform
    /// sets and user entries.
    pub(crate) fn remove(&mut self, uuid: Uuid) -> Option<ConnectionRecord> {
        let record = self.by_uuid.remove(&uuid)?;
        self.senders.remove(&uuid);

        if let Some(platforms) = self.by_user_platform.get_mut(&record.user_id) {
            if let Some(set) = platforms.get_mut(&record.platform) {
                set.remove(&uuid);
                if set.is_empty() {
                    platforms.remove(&record.platform);
                }
            }
            if platforms.is_empty() {
                self.by_user_platform.remove(&record.user_id);
            }
        }

        Some(record)
    }

    pub(crate) fn lookup(&self, user_id: &str, platform: &str) -> Vec<(Uuid, S)> {
        let Some(set) = self.by_user_platform.get(user_id).and_then(|p| p.get(platform)) else {
            return Vec::new();
        };
        set.iter()
            .filter_map(|uuid| self.senders.get(uuid).map(|s| (*uuid, s.clone())))
            .collect()
    }

    pub(crate) fn snapshot_all(&self) -> Vec<ConnSnapshot<S>> {
        self.by_uuid
            .values()
            .filter_map(|record| {
                self.senders.get(&record.uuid).map(|sender| ConnSnapshot {
                    uuid: record.uuid,
                    user_id: record.user_id.clone(),
                    platform: record.platform.clone(),
                    sender: sender.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        RegistryStats { users: self.by_user_platform.len(), connections: self.by_uuid.len() }
    }

    /// Check the cross-map invariants. Test support.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        // Every indexed uuid resolves to a record with matching coordinates,
        // and a send capability exists for it.
        for (user, platforms) in &self.by_user_platform {
            if platforms.is_empty() {
                return Err(format!("empty platform map for user {user}"));
            }
            for (platform, set) in platforms {
                if set.is_empty() {
                    return Err(format!("empty uuid set for ({user}, {platform})"));
                }
                for uuid in set {
                    let Some(record) = self.by_uuid.get(uuid) else {
                        return Err(format!("{uuid} indexed but has no record"));
                    };
                    if record.user_id != *user || record.platform != *platform {
                        return Err(format!("{uuid} indexed under wrong coordinates"));
                    }
                    if !self.senders.contains_key(uuid) {
                        return Err(format!("{uuid} has a record but no sender"));
                    }
                }
            }
        }
        // Every record is indexed, and every sender has a record.
        for (uuid, record) in &self.by_uuid {
            let indexed = self
                .by_user_platform
                .get(&record.user_id)
                .and_then(|p| p.get(&record.platform))
                .is_some_and(|set| set.contains(uuid));
            if !indexed {
                return Err(format!("{uuid} has a record but is not indexed"));
            }
        }
        if self.senders.len() != self.by_uuid.len() {
            return Err("sender map and record map diverge".to_owned());
        }
        Ok(())
    }
}

/// Concurrent registry: single writer lock, snapshot reads.
pub struct Registry<S> {
    maps: RwLock<Maps<S>>,
}

impl<S: Clone> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> Registry<S> {
    pub fn new() -> Self {
        Self { maps: RwLock::new(Maps::default()) }
    }

    /// Insert into all three maps under a single critical section.
    pub async fn register(&self, record: ConnectionRecord, sender: S) {
        self.maps.write().await.insert(record, sender);
    }

    /// Remove from all three maps. Idempotent: returns the record only on
    /// the call that actually removed it.
    pub async fn unregister(&self, uuid: Uuid) -> Option<ConnectionRecord> {
        self.maps.write().await.remove(uuid)
    }

    /// Immutable snapshot of the connections matching `(user_id, platform)`,
    /// so a subsequent fan-out does not race concurrent unregisters.
    pub async fn lookup(&self, user_id: &str, platform: &str) -> Vec<(Uuid, S)> {
        self.maps.read().await.lookup(user_id, platform)
    }

    /// Snapshot of every live connection, for broadcast.
    pub async fn snapshot_all(&self) -> Vec<ConnSnapshot<S>> {
        self.maps.read().await.snapshot_all()
    }

    pub async fn stats(&self) -> RegistryStats {
        self.maps.read().await.stats()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
