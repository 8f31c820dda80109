//! Per-invocation lifecycle tracker.
//!
//! A [`Process`] is a tiny event emitter with a state machine attached:
//!
//! ```text
//! ready ──start──▶ running ──end──▶ pendingShipment ──cleanup──▶ ready
//!   └────────────────────┴──────────────┴──kill──▶ killed
//! ```
//!
//! The machine is permissive: every event is accepted in every state and
//! simply moves the process to the event's target state. `kill` is terminal
//! in the sense that it drops every listener, leaving the process inert.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ProcessId;

// ─── Events and states ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEvent {
    Start,
    End,
    Cleanup,
    Kill,
}

impl ProcessEvent {
    pub const ALL: [ProcessEvent; 4] = [
        ProcessEvent::Start,
        ProcessEvent::End,
        ProcessEvent::Cleanup,
        ProcessEvent::Kill,
    ];

    /// The state a process lands in after this event.
    pub fn target_state(&self) -> ProcessState {
        match self {
            ProcessEvent::Start => ProcessState::Running,
            ProcessEvent::End => ProcessState::PendingShipment,
            ProcessEvent::Cleanup => ProcessState::Ready,
            ProcessEvent::Kill => ProcessState::Killed,
        }
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessEvent::Start => write!(f, "start"),
            ProcessEvent::End => write!(f, "end"),
            ProcessEvent::Cleanup => write!(f, "cleanup"),
            ProcessEvent::Kill => write!(f, "kill"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    Ready,
    Running,
    PendingShipment,
    Killed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Ready => write!(f, "ready"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::PendingShipment => write!(f, "pendingShipment"),
            ProcessState::Killed => write!(f, "killed"),
        }
    }
}

// ─── Timestamp ────────────────────────────────────────────────────────────

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// When an event was emitted.
///
/// Normally a monotonic offset from the first timestamp taken in this
/// process. If the monotonic reading is unusable the wall clock is used
/// instead, so consumers must handle both representations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Timestamp {
    Monotonic(Duration),
    WallClock(DateTime<Utc>),
}

impl Timestamp {
    pub fn now() -> Self {
        let epoch = *CLOCK_EPOCH.get_or_init(Instant::now);
        match Instant::now().checked_duration_since(epoch) {
            Some(elapsed) => Timestamp::Monotonic(elapsed),
            None => Timestamp::WallClock(Utc::now()),
        }
    }
}

// ─── Listener plumbing ────────────────────────────────────────────────────

/// Metadata envelope handed to every listener ahead of the payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub deed_name: String,
    pub state: ProcessState,
    pub run_count: u64,
    pub id: ProcessId,
    pub event: ProcessEvent,
    pub timestamp: Timestamp,
}

/// Handle returned by [`Process::attach`], used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(u64);

pub type Listener = Arc<dyn Fn(&ProcessInfo, &[Value]) + Send + Sync>;

struct ProcessInner {
    state: ProcessState,
    run_count: u64,
    children: BTreeSet<ProcessId>,
    listeners: HashMap<ProcessEvent, BTreeMap<ListenerToken, Listener>>,
    next_token: u64,
}

// ─── Process ──────────────────────────────────────────────────────────────

pub struct Process {
    id: ProcessId,
    deed_name: String,
    parent: Option<ProcessId>,
    inner: Mutex<ProcessInner>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("deed_name", &self.deed_name)
            .field("parent", &self.parent)
            .field("state", &inner.state)
            .field("run_count", &inner.run_count)
            .finish()
    }
}

impl Process {
    pub fn new(deed_name: impl Into<String>) -> Self {
        Self::build(deed_name.into(), None)
    }

    /// A process nested under `parent`, e.g. a flow stage member.
    pub fn child_of(deed_name: impl Into<String>, parent: ProcessId) -> Self {
        Self::build(deed_name.into(), Some(parent))
    }

    fn build(deed_name: String, parent: Option<ProcessId>) -> Self {
        let listeners = ProcessEvent::ALL
            .iter()
            .map(|event| (*event, BTreeMap::new()))
            .collect();
        Self {
            id: ProcessId::new(),
            deed_name,
            parent,
            inner: Mutex::new(ProcessInner {
                state: ProcessState::Ready,
                run_count: 0,
                children: BTreeSet::new(),
                listeners,
                next_token: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn deed_name(&self) -> &str {
        &self.deed_name
    }

    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    pub fn children(&self) -> Vec<ProcessId> {
        self.lock().children.iter().copied().collect()
    }

    pub fn add_child(&self, child: ProcessId) {
        self.lock().children.insert(child);
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    pub fn run_count(&self) -> u64 {
        self.lock().run_count
    }

    pub fn listener_count(&self, event: ProcessEvent) -> usize {
        self.lock().listeners.get(&event).map_or(0, BTreeMap::len)
    }

    /// Register `callback` for `event`.
    pub fn attach<F>(&self, event: ProcessEvent, callback: F) -> ListenerToken
    where
        F: Fn(&ProcessInfo, &[Value]) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let token = ListenerToken(inner.next_token);
        inner.next_token += 1;
        inner
            .listeners
            .entry(event)
            .or_default()
            .insert(token, Arc::new(callback));
        token
    }

    /// Remove a listener. Unknown tokens are ignored.
    pub fn detach(&self, event: ProcessEvent, token: ListenerToken) {
        if let Some(group) = self.lock().listeners.get_mut(&event) {
            group.remove(&token);
        }
    }

    /// Record `event` and notify its listeners.
    ///
    /// An array payload is spread into one listener argument per element;
    /// anything else is passed as a single argument.
    pub fn emit(&self, event: ProcessEvent, payload: Value) {
        let args = match payload {
            Value::Array(items) => items,
            other => vec![other],
        };

        let (info, listeners) = {
            let mut inner = self.lock();
            if event == ProcessEvent::Start {
                inner.run_count += 1;
            }
            inner.state = event.target_state();

            let info = ProcessInfo {
                deed_name: self.deed_name.clone(),
                state: inner.state,
                run_count: inner.run_count,
                id: self.id,
                event,
                timestamp: Timestamp::now(),
            };
            let listeners: Vec<Listener> = inner
                .listeners
                .get(&event)
                .map(|group| group.values().cloned().collect())
                .unwrap_or_default();

            if event == ProcessEvent::Kill {
                for group in inner.listeners.values_mut() {
                    group.clear();
                }
            }
            (info, listeners)
        };

        for listener in listeners {
            listener(&info, &args);
        }
    }

    pub fn kill(&self) {
        self.emit(ProcessEvent::Kill, Value::Null);
    }
}
