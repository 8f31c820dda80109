//! Context values handed to deed hooks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{self, FutureExt};

use crate::deed::DeedFuture;
use crate::store::StoreShared;
use crate::types::{Args, Cargo};

/// Callable view of a store's deed table.
///
/// Holds the store weakly: calls on a dropped or disconnected store log a
/// warning and resolve to `Ok(None)`.
#[derive(Clone)]
pub struct Deeds {
    store: Weak<StoreShared>,
    name: String,
}

impl fmt::Debug for Deeds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deeds").field("store", &self.name).finish()
    }
}

impl Deeds {
    pub(crate) fn new(store: Weak<StoreShared>, name: String) -> Self {
        Self { store, name }
    }

    /// Name of the store this table belongs to.
    pub fn store_name(&self) -> &str {
        &self.name
    }

    /// Invoke deed `deed` with `args`.
    pub fn call(&self, deed: &str, args: Args) -> DeedFuture {
        let resolved = match self.store.upgrade() {
            Some(store) => store.deed(deed),
            None => Ok(None),
        };
        match resolved {
            Ok(Some(callable)) => callable(args),
            Ok(None) => {
                tracing::warn!(store = %self.name, deed = %deed, "deed called on disconnected store");
                future::ready(Ok(None)).boxed()
            }
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    /// Registered deed names, sorted. Empty once the store is gone.
    pub fn names(&self) -> Vec<String> {
        self.store
            .upgrade()
            .map(|store| store.deed_names())
            .unwrap_or_default()
    }

    pub fn contains(&self, deed: &str) -> bool {
        self.store
            .upgrade()
            .is_some_and(|store| store.has_deed(deed))
    }
}

/// Passed to every action and `then_does` hook.
#[derive(Debug, Clone)]
pub struct ActionExtras {
    pub props: Cargo,
    /// Cargo including mutations not yet delivered.
    pub cargo: Cargo,
    pub deeds: Deeds,
    skip: Arc<AtomicBool>,
}

impl ActionExtras {
    pub(crate) fn new(props: Cargo, cargo: Cargo, deeds: Deeds) -> Self {
        Self {
            props,
            cargo,
            deeds,
            skip: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Finish this invocation without queuing its value for shipment.
    pub fn skip_shipment(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    pub(crate) fn skip_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.skip)
    }
}

/// Passed to the request hooks that shape the outgoing call.
#[derive(Debug, Clone, Default)]
pub struct FetchExtras {
    pub props: Cargo,
    pub cargo: Cargo,
}

/// Passed to `afterwards` and `catch_error` hooks.
#[derive(Debug, Clone)]
pub struct RequestExtras {
    pub props: Cargo,
    pub cargo: Cargo,
    pub deeds: Deeds,
}
