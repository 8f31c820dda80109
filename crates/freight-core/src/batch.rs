//! Batching engine: the store's cargo snapshots and the pending shipment.
//!
//! Every accepted mutation is merged into `volatile` right away so in-flight
//! deeds read the latest speculative cargo. Delivery is deferred until the
//! batch window closes (or happens immediately when the window is zero), and
//! then `stable` catches up with `volatile` in one step.

use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::merge::{merge_into, merged};
use crate::types::{Cargo, MergeMode, ProcessId};

/// Default batch window.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(4);

/// What the caller of [`Batch::enqueue`] has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Batchless mode: ship right away.
    FlushNow,
    /// First mutation of a window: arm the flush timer.
    StartTimer,
    /// A timer is already running; nothing to do.
    Wait,
}

/// A closed batch, ready for delivery.
#[derive(Debug)]
pub struct Shipment {
    pub cargo: Cargo,
    pub pids: Vec<ProcessId>,
    pub(crate) timer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct Batch {
    stable: Option<Cargo>,
    volatile: Cargo,
    delta: Cargo,
    pending: Vec<ProcessId>,
    window: Duration,
    mode: MergeMode,
    timer: Option<(u64, JoinHandle<()>)>,
    generation: u64,
}

impl Batch {
    pub fn new(cargo: Cargo, window: Duration, mode: MergeMode) -> Self {
        Self {
            stable: Some(cargo.clone()),
            volatile: cargo,
            delta: Cargo::new(),
            pending: Vec::new(),
            window,
            mode,
            timer: None,
            generation: 0,
        }
    }

    pub fn is_batchless(&self) -> bool {
        self.window.is_zero()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Last delivered cargo; `None` once the store is disconnected.
    pub fn stable(&self) -> Option<&Cargo> {
        self.stable.as_ref()
    }

    /// Cargo including every mutation accepted in the current window.
    pub fn volatile(&self) -> &Cargo {
        &self.volatile
    }

    /// Merged-but-undelivered mutations of the current window.
    pub fn delta(&self) -> &Cargo {
        &self.delta
    }

    pub fn pending(&self) -> &[ProcessId] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.delta.is_empty()
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Accept a mutation produced by process `pid`.
    pub fn enqueue(&mut self, mutation: Option<&Value>, pid: ProcessId) -> Dispatch {
        if let Some(mutation) = mutation {
            merge_into(&mut self.delta, mutation, self.mode);
        }
        self.volatile = merged(&self.volatile, &Value::Object(self.delta.clone()), self.mode);
        self.pending.push(pid);

        if self.is_batchless() {
            Dispatch::FlushNow
        } else if self.timer.is_some() {
            Dispatch::Wait
        } else {
            Dispatch::StartTimer
        }
    }

    /// Generation number for the next timer; see [`Batch::arm`].
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn arm(&mut self, generation: u64, handle: JoinHandle<()>) {
        self.timer = Some((generation, handle));
    }

    /// Whether the timer identified by `generation` is still the live one.
    pub fn is_current_timer(&self, generation: u64) -> bool {
        matches!(self.timer, Some((g, _)) if g == generation)
    }

    /// Close the window: stable catches up with volatile and the batch resets.
    pub fn take_shipment(&mut self) -> Shipment {
        let cargo = self.volatile.clone();
        self.stable = Some(cargo.clone());
        self.delta = Cargo::new();
        Shipment {
            cargo,
            pids: std::mem::take(&mut self.pending),
            timer: self.timer.take().map(|(_, handle)| handle),
        }
    }

    /// Drop every snapshot. Returns the running timer so the caller can abort it.
    pub fn clear(&mut self) -> Option<JoinHandle<()>> {
        self.stable = None;
        self.volatile = Cargo::new();
        self.delta = Cargo::new();
        self.pending.clear();
        self.timer.take().map(|(_, handle)| handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cargo(v: Value) -> Cargo {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn zero_window_is_batchless() {
        let mut batch = Batch::new(Cargo::new(), Duration::ZERO, MergeMode::Shallow);
        assert!(batch.is_batchless());
        assert_eq!(
            batch.enqueue(Some(&json!({"a": 1})), ProcessId::new()),
            Dispatch::FlushNow
        );
    }

    #[tokio::test]
    async fn first_enqueue_starts_timer_then_waits() {
        let mut batch = Batch::new(Cargo::new(), DEFAULT_BATCH_WINDOW, MergeMode::Shallow);
        assert_eq!(batch.enqueue(Some(&json!({"a": 1})), ProcessId::new()), Dispatch::StartTimer);
        let generation = batch.next_generation();
        let handle = tokio::spawn(async {});
        batch.arm(generation, handle);
        assert_eq!(batch.enqueue(Some(&json!({"b": 2})), ProcessId::new()), Dispatch::Wait);
        assert!(batch.is_current_timer(generation));
        assert!(!batch.is_current_timer(generation + 1));
    }

    #[test]
    fn volatile_tracks_every_enqueue_before_delivery() {
        let mut batch = Batch::new(cargo(json!({"count": 0})), DEFAULT_BATCH_WINDOW, MergeMode::Shallow);
        batch.enqueue(Some(&json!({"count": 1})), ProcessId::new());
        assert_eq!(batch.volatile().get("count"), Some(&json!(1)));
        batch.enqueue(Some(&json!({"count": 2, "x": true})), ProcessId::new());
        assert_eq!(Value::Object(batch.volatile().clone()), json!({"count": 2, "x": true}));
        assert_eq!(batch.stable(), Some(&cargo(json!({"count": 0}))));
    }

    #[test]
    fn volatile_equals_stable_merged_with_delta() {
        let mut batch = Batch::new(cargo(json!({"a": {"x": 1}, "k": 0})), DEFAULT_BATCH_WINDOW, MergeMode::Deep);
        batch.enqueue(Some(&json!({"a": {"y": 2}})), ProcessId::new());
        batch.enqueue(None, ProcessId::new());
        batch.enqueue(Some(&json!({"k": 5})), ProcessId::new());
        let expected = merged(
            batch.stable().unwrap(),
            &Value::Object(batch.delta().clone()),
            MergeMode::Deep,
        );
        assert_eq!(batch.volatile(), &expected);
    }

    #[test]
    fn shipment_resets_the_window() {
        let mut batch = Batch::new(Cargo::new(), DEFAULT_BATCH_WINDOW, MergeMode::Shallow);
        let a = ProcessId::new();
        let b = ProcessId::new();
        batch.enqueue(Some(&json!({"a": 1})), a);
        batch.enqueue(None, b);
        assert!(batch.has_pending());

        let shipment = batch.take_shipment();
        assert_eq!(Value::Object(shipment.cargo.clone()), json!({"a": 1}));
        assert_eq!(shipment.pids, vec![a, b]);
        assert_eq!(batch.stable(), Some(&shipment.cargo));
        assert!(batch.delta().is_empty());
        assert!(!batch.has_pending());
        assert!(!batch.timer_armed());
    }

    #[test]
    fn clear_nulls_cargo() {
        let mut batch = Batch::new(cargo(json!({"a": 1})), DEFAULT_BATCH_WINDOW, MergeMode::Shallow);
        batch.enqueue(Some(&json!({"b": 1})), ProcessId::new());
        assert!(batch.clear().is_none());
        assert!(batch.stable().is_none());
        assert!(!batch.has_pending());
    }
}
