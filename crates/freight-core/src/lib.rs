//! `freight-core`: a reactive cargo store driven by named deeds.
//!
//! Callers register deeds against a [`Store`]. Invoking a deed produces a
//! partial mutation that is merged into the store's cargo and delivered to
//! subscribers once per batch window.
//!
//! # Architecture
//!
//! ```text
//! Deed (Action | Request | Flow | Stub)
//!     │  registered once
//!     ▼
//! Store::register      ← builds a callable per deed, one Process each
//!     │
//!     ▼
//! Deeds::call          ← Process start → action / HTTP fetch / flow stages
//!     │
//!     ▼
//! Batch::enqueue       ← merge into volatile cargo, arm the window timer
//!     │
//!     ▼
//! ship                 ← stable := volatile, subscribers, Process cleanup
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use freight_core::{ActionDeed, Registry, Store, StoreConfig, SubscriptionId};
//! use serde_json::json;
//!
//! let registry = Registry::new();
//! let add = ActionDeed::sync("add", |extras, _args| {
//!     let count = extras.cargo.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
//!     Ok(Some(json!({ "count": count + 1 })))
//! });
//! let store = Store::new(&registry, StoreConfig {
//!     name: Some("counter".into()),
//!     deeds: vec![add.into()],
//!     ..Default::default()
//! })?;
//! store.subscribe(SubscriptionId::new(), |cargo| println!("{cargo:?}"));
//! store.call("add", vec![]).await?;
//! ```

pub mod action;
pub mod batch;
pub mod deed;
pub mod error;
pub mod extras;
pub mod flow;
pub mod merge;
pub mod process;
pub mod registry;
pub mod request;
pub mod settings;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use action::{action_fn, ActionDeed, ActionFn};
pub use batch::DEFAULT_BATCH_WINDOW;
pub use deed::{deed_fn, Deed, DeedFn, DeedFuture, DeedKind, DeedView, StubDeed};
pub use error::{ResponseError, StoreError};
pub use extras::{ActionExtras, Deeds, FetchExtras, RequestExtras};
pub use flow::{FlowDeed, FlowStage, TransformFn};
pub use process::{ListenerToken, Process, ProcessEvent, ProcessInfo, ProcessState, Timestamp};
pub use registry::{PubEvent, Registry};
pub use request::{
    Fetch, FetchRequest, FetchResponse, RequestDeed, RequestDefaults, RequestPath, ReqwestFetch,
};
pub use settings::StoreSettings;
pub use store::{Store, StoreConfig, StoreName, EXTERNAL_UPDATE};
pub use types::{ArgSource, Args, Cargo, MergeMode, ProcessId, SubscriptionId, Trigger};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
