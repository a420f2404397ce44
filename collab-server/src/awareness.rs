//! Awareness (presence) tracking for one document.
//!
//! Ephemeral per-client state: cursors, selections, user metadata. Merged
//! with the y-protocols rules so that every replica agrees on who is present:
//!
//! - a higher clock always wins
//! - an equal clock only wins when it removes a known state (`null`)
//! - clocks are remembered after removal, so a stale re-add is ignored
//!
//! Nothing here is persisted and nothing here reaches the persistence
//! scheduler.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use yrs::block::ClientID;
use yrs::sync::awareness::{AwarenessUpdate, AwarenessUpdateEntry};

/// JSON payload marking a removed client.
const NULL_STATE: &str = "null";

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u32,
    last_updated: Instant,
}

/// Which clients a merged delta touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientID>,
    pub updated: Vec<ClientID>,
    pub removed: Vec<ClientID>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence state of every client attached to a document.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    states: HashMap<ClientID, String>,
    meta: HashMap<ClientID, ClientMeta>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a presence delta.
    pub fn apply_update(&mut self, update: AwarenessUpdate) -> AwarenessChange {
        let now = Instant::now();
        let mut change = AwarenessChange::default();

        for (client_id, entry) in update.clients {
            let json: &str = &entry.json;
            let is_null = json == NULL_STATE;
            let known = self.states.contains_key(&client_id);
            let current_clock = self.meta.get(&client_id).map_or(0, |m| m.clock);

            let newer = current_clock < entry.clock;
            let removes_known = current_clock == entry.clock && is_null && known;
            if !newer && !removes_known {
                continue;
            }

            if is_null {
                self.states.remove(&client_id);
            } else {
                self.states.insert(client_id, json.to_string());
            }
            self.meta.insert(
                client_id,
                ClientMeta {
                    clock: entry.clock,
                    last_updated: now,
                },
            );

            match (known, is_null) {
                (false, false) => change.added.push(client_id),
                (true, false) => change.updated.push(client_id),
                (true, true) => change.removed.push(client_id),
                (false, true) => {}
            }
        }

        change
    }

    /// Encode the current state of the given clients.
    ///
    /// Clients with no recorded clock are skipped; removed clients are
    /// encoded as `null`.
    pub fn encode_current_state(&self, client_ids: &[ClientID]) -> Option<AwarenessUpdate> {
        let mut clients = HashMap::new();
        for client_id in client_ids {
            let Some(meta) = self.meta.get(client_id) else {
                continue;
            };
            let json = self
                .states
                .get(client_id)
                .cloned()
                .unwrap_or_else(|| NULL_STATE.to_string());
            clients.insert(
                *client_id,
                AwarenessUpdateEntry {
                    clock: meta.clock,
                    json: json.into(),
                },
            );
        }
        if clients.is_empty() {
            None
        } else {
            Some(AwarenessUpdate { clients })
        }
    }

    /// Encode every present client (snapshot for a newly joined connection).
    pub fn encode_all(&self) -> Option<AwarenessUpdate> {
        let ids: Vec<ClientID> = self.states.keys().copied().collect();
        self.encode_current_state(&ids)
    }

    /// Remove the given clients, bumping their clocks.
    ///
    /// Returns the removal delta to broadcast, or None if none were present.
    pub fn remove_states(&mut self, client_ids: &[ClientID]) -> Option<AwarenessUpdate> {
        let now = Instant::now();
        let mut removed = Vec::new();
        for client_id in client_ids {
            if self.states.remove(client_id).is_none() {
                continue;
            }
            let meta = self.meta.entry(*client_id).or_insert(ClientMeta {
                clock: 0,
                last_updated: now,
            });
            meta.clock += 1;
            meta.last_updated = now;
            removed.push(*client_id);
        }
        self.encode_current_state(&removed)
    }

    /// Drop clients that have not refreshed their state within `timeout`.
    pub fn prune_outdated(&mut self, timeout: Duration) -> (Vec<ClientID>, Option<AwarenessUpdate>) {
        let outdated: Vec<ClientID> = self
            .states
            .keys()
            .filter(|id| {
                self.meta
                    .get(*id)
                    .is_some_and(|m| m.last_updated.elapsed() >= timeout)
            })
            .copied()
            .collect();
        let update = self.remove_states(&outdated);
        (outdated, update)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
