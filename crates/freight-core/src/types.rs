use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The store's data payload. Always a JSON object.
pub type Cargo = serde_json::Map<String, Value>;

/// Arguments passed to a deed invocation.
pub type Args = Vec<Value>;

// ─── ProcessId ────────────────────────────────────────────────────────────

/// Opaque identity of one [`Process`](crate::Process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

// ─── SubscriptionId ───────────────────────────────────────────────────────

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Opaque token identifying one subscriber of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ─── Flow enums ───────────────────────────────────────────────────────────

/// The event every deed in a flow stage must reach before the flow advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The deed produced its value (process `end`).
    #[default]
    Done,
    /// The deed's value was shipped to subscribers (process `cleanup`).
    Shipment,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Done => "done",
            Trigger::Shipment => "shipment",
        }
    }
}

/// Which argument list a flow stage is invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSource {
    /// The arguments the flow itself was called with.
    Original,
    /// The previous stage's transformed output.
    #[default]
    LastCalled,
}

// ─── MergeMode ────────────────────────────────────────────────────────────

/// How a mutation is folded into cargo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Top-level keys of the mutation overwrite cargo keys.
    #[default]
    Shallow,
    /// Nested objects are merged recursively.
    Deep,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMode::Shallow => "shallow",
            MergeMode::Deep => "deep",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_are_unique() {
        let a = SubscriptionId::new();
        let b = SubscriptionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn enums_use_snake_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&Trigger::Shipment).unwrap(), r#""shipment""#);
        assert_eq!(
            serde_json::from_str::<ArgSource>(r#""last_called""#).unwrap(),
            ArgSource::LastCalled
        );
        assert_eq!(serde_json::from_str::<MergeMode>(r#""deep""#).unwrap(), MergeMode::Deep);
    }
}
