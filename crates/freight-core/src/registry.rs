//! Process-wide directory of named stores plus a broadcast feed of store
//! events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::store::{Store, StoreShared};
use crate::types::{Cargo, SubscriptionId};
use crate::Result;

/// Something that happened to a registered store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PubEvent {
    NewStore {
        store_name: String,
        deeds: Vec<String>,
        cargo: Cargo,
    },
    StoreRemoved {
        store_name: String,
    },
    AddSub {
        store_name: String,
        sub_id: SubscriptionId,
    },
    CargoShipped {
        store_name: String,
        cargo: Cargo,
    },
}

struct RegistryInner {
    stores: Mutex<HashMap<String, Weak<StoreShared>>>,
    events: broadcast::Sender<PubEvent>,
}

/// Shared registry. Clones point at the same directory.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("stores", &self.names()).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                stores: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    fn stores(&self) -> MutexGuard<'_, HashMap<String, Weak<StoreShared>>> {
        self.inner.stores.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive every event published after this call.
    pub fn watch(&self) -> broadcast::Receiver<PubEvent> {
        self.inner.events.subscribe()
    }

    /// Fire-and-forget: nobody watching is not an error.
    pub fn publish(&self, event: PubEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Subscribe `callback` to the store registered as `store_name`.
    pub fn assign<F>(&self, store_name: &str, id: SubscriptionId, callback: F) -> Result<Store>
    where
        F: Fn(&Cargo) + Send + Sync + 'static,
    {
        let store = self
            .store(store_name)
            .ok_or_else(|| StoreError::StoreNotFound(store_name.to_string()))?;
        store.subscribe(id, callback);
        self.publish(PubEvent::AddSub {
            store_name: store_name.to_string(),
            sub_id: id,
        });
        Ok(store)
    }

    /// A handle to a live store, if one is registered under `name`.
    pub fn store(&self, name: &str) -> Option<Store> {
        self.stores()
            .get(name)
            .and_then(Weak::upgrade)
            .map(Store::from_shared)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store(name).is_some()
    }

    /// Names of the live stores, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stores()
            .iter()
            .filter(|(_, store)| store.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Forget every store without disconnecting them.
    pub fn clear(&self) {
        self.stores().clear();
    }

    pub(crate) fn insert(&self, name: &str, store: Weak<StoreShared>) {
        self.stores().insert(name.to_string(), store);
    }

    /// Remove `name` only while it still points at `store`; a newer store
    /// that took over the name stays registered.
    pub(crate) fn remove(&self, name: &str, store: &Store) {
        let mut stores = self.stores();
        if stores.get(name).is_some_and(|entry| store.shares(entry)) {
            stores.remove(name);
        }
    }
}
