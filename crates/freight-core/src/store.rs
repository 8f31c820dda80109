//! Store coordination: deed registration, the deed table, cargo shipment and
//! teardown.
//!
//! A [`Store`] is a cheap handle around `Arc<StoreShared>`. Registered deed
//! callables and batch timers only hold `Weak` references, so dropping every
//! handle (or calling [`Store::disconnect`]) turns further calls into no-ops.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::action::init_action;
use crate::batch::{Batch, Dispatch, DEFAULT_BATCH_WINDOW};
use crate::deed::{deed_fn, Deed, DeedFn, DeedView};
use crate::error::StoreError;
use crate::extras::{ActionExtras, Deeds, FetchExtras, RequestExtras};
use crate::flow::init_flow;
use crate::process::{Process, ProcessEvent};
use crate::registry::{PubEvent, Registry};
use crate::request::{init_request, Fetch, RequestDefaults, ReqwestFetch};
use crate::types::{Args, Cargo, MergeMode, ProcessId, SubscriptionId};
use crate::Result;

/// Name of the process that tracks [`Store::update_cargo`] calls.
pub const EXTERNAL_UPDATE: &str = "external update";

pub type Subscriber = Arc<dyn Fn(&Cargo) + Send + Sync>;

// ─── StoreName ────────────────────────────────────────────────────────────

/// How a store gets its registry name.
#[derive(Clone)]
pub enum StoreName {
    Literal(String),
    /// Computed from a freshly generated id.
    Generated(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl StoreName {
    pub fn generated<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        StoreName::Generated(Arc::new(f))
    }

    fn resolve(name: Option<&StoreName>) -> Result<String> {
        let resolved = match name {
            Some(StoreName::Literal(name)) => name.clone(),
            Some(StoreName::Generated(f)) => f(&short_id()),
            None => short_id(),
        };
        if resolved.is_empty() {
            return Err(StoreError::InvalidStoreName);
        }
        Ok(resolved)
    }
}

impl fmt::Debug for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreName::Literal(name) => f.debug_tuple("Literal").field(name).finish(),
            StoreName::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

impl From<&str> for StoreName {
    fn from(name: &str) -> Self {
        StoreName::Literal(name.to_string())
    }
}

impl From<String> for StoreName {
    fn from(name: String) -> Self {
        StoreName::Literal(name)
    }
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

// ─── StoreConfig ──────────────────────────────────────────────────────────

/// Everything needed to build a [`Store`].
///
/// ```rust,ignore
/// let config = StoreConfig {
///     name: Some("todos".into()),
///     deeds: vec![load_todos.into()],
///     ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct StoreConfig {
    /// Registry name. A short random id is used when omitted.
    pub name: Option<StoreName>,
    /// Initial cargo.
    pub cargo: Cargo,
    pub deeds: Vec<Deed>,
    /// How long mutations are collected before delivery. Zero delivers
    /// synchronously inside the invoking call.
    pub batch_window: Duration,
    pub merge_mode: MergeMode,
    /// HTTP transport for request deeds. Defaults to [`ReqwestFetch`].
    pub fetch: Option<Arc<dyn Fetch>>,
    /// Trace deed starts, queued mutations and shipments at debug level.
    pub debug: bool,
    /// Caller-supplied values exposed to every hook.
    pub props: Cargo,
    pub request_defaults: RequestDefaults,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: None,
            cargo: Cargo::new(),
            deeds: Vec::new(),
            batch_window: DEFAULT_BATCH_WINDOW,
            merge_mode: MergeMode::default(),
            fetch: None,
            debug: false,
            props: Cargo::new(),
            request_defaults: RequestDefaults::default(),
        }
    }
}

// ─── Shared state ─────────────────────────────────────────────────────────

pub(crate) struct StoreShared {
    name: String,
    debug: bool,
    registry: Registry,
    fetch: Arc<dyn Fetch>,
    request_defaults: RequestDefaults,
    external: ProcessId,
    state: Mutex<StoreState>,
}

struct StoreState {
    batch: Batch,
    deeds: BTreeMap<String, DeedFn>,
    processes: HashMap<ProcessId, Arc<Process>>,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    props: Cargo,
    disconnected: bool,
}

impl StoreShared {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn fetcher(&self) -> Arc<dyn Fetch> {
        Arc::clone(&self.fetch)
    }

    pub(crate) fn request_defaults(&self) -> &RequestDefaults {
        &self.request_defaults
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }

    pub(crate) fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.lock().processes.get(&pid).cloned()
    }

    /// Look up a deed callable. `Ok(None)` means the store is disconnected.
    pub(crate) fn deed(&self, name: &str) -> Result<Option<DeedFn>> {
        let state = self.lock();
        if state.disconnected {
            return Ok(None);
        }
        match state.deeds.get(name) {
            Some(deed) => Ok(Some(Arc::clone(deed))),
            None => Err(StoreError::UnknownDeed {
                store: self.name.clone(),
                deed: name.to_string(),
            }),
        }
    }

    pub(crate) fn deed_names(&self) -> Vec<String> {
        self.lock().deeds.keys().cloned().collect()
    }

    pub(crate) fn has_deed(&self, name: &str) -> bool {
        self.lock().deeds.contains_key(name)
    }

    // ─── Extras ───────────────────────────────────────────────────────────

    fn props_and_cargo(&self) -> (Cargo, Cargo) {
        let state = self.lock();
        (state.props.clone(), state.batch.volatile().clone())
    }

    pub(crate) fn deeds_handle(self: &Arc<Self>) -> Deeds {
        Deeds::new(Arc::downgrade(self), self.name.clone())
    }

    pub(crate) fn action_extras(self: &Arc<Self>) -> ActionExtras {
        let (props, cargo) = self.props_and_cargo();
        ActionExtras::new(props, cargo, self.deeds_handle())
    }

    pub(crate) fn fetch_extras(&self) -> FetchExtras {
        let (props, cargo) = self.props_and_cargo();
        FetchExtras { props, cargo }
    }

    pub(crate) fn request_extras(self: &Arc<Self>) -> RequestExtras {
        let (props, cargo) = self.props_and_cargo();
        RequestExtras {
            props,
            cargo,
            deeds: self.deeds_handle(),
        }
    }

    // ─── Registration ─────────────────────────────────────────────────────

    /// Create a process, optionally nested under `parent`, and track it.
    pub(crate) fn spawn_process(&self, name: &str, parent: Option<ProcessId>) -> ProcessId {
        let px = match parent {
            Some(parent) => Process::child_of(name, parent),
            None => Process::new(name),
        };
        let pid = px.id();
        let mut state = self.lock();
        if let Some(parent) = parent.and_then(|p| state.processes.get(&p)) {
            parent.add_child(pid);
        }
        state.processes.insert(pid, Arc::new(px));
        pid
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        if self.has_deed(name) {
            return Err(StoreError::DuplicateDeed(name.to_string()));
        }
        Ok(())
    }

    /// Turn a descriptor into a callable and insert it into the deed table.
    ///
    /// `pid` is the process provisioned by an enclosing flow; top-level
    /// registrations get a fresh one.
    pub(crate) fn register(self: &Arc<Self>, view: DeedView, pid: Option<ProcessId>) -> Result<()> {
        let name = view.name().to_string();
        let callable = match view.deed() {
            Deed::Action(deed) => {
                self.ensure_unique(&name)?;
                let pid = pid.unwrap_or_else(|| self.spawn_process(&name, None));
                init_action(self, &name, Arc::clone(deed.action()), pid)
            }
            Deed::Request(deed) => {
                self.ensure_unique(&name)?;
                let pid = pid.unwrap_or_else(|| self.spawn_process(&name, None));
                init_request(self, &name, Arc::clone(deed), pid)
            }
            Deed::Flow(deed) => {
                let pid = pid.unwrap_or_else(|| self.spawn_process(&name, None));
                init_flow(self, &name, Arc::clone(deed), pid)?
            }
            Deed::Stub(deed) => match pid {
                None => Arc::clone(deed.stub()),
                Some(pid) => tracked_stub(self, Arc::clone(deed.stub()), pid),
            },
        };
        if self.debug {
            tracing::debug!(store = %self.name, deed = %name, kind = %view.kind(), "registered deed");
        }
        self.lock().deeds.insert(name, callable);
        Ok(())
    }

    // ─── Cargo transit ────────────────────────────────────────────────────

    /// Accept a mutation produced by process `pid`.
    ///
    /// Mutations arriving after disconnect are dropped.
    pub(crate) fn enqueue(self: &Arc<Self>, mutation: Option<&Value>, pid: ProcessId) {
        let ship_now = {
            let mut state = self.lock();
            if state.disconnected {
                return;
            }
            match state.batch.enqueue(mutation, pid) {
                Dispatch::FlushNow => true,
                Dispatch::Wait => false,
                Dispatch::StartTimer => match Handle::try_current() {
                    Ok(handle) => {
                        let generation = state.batch.next_generation();
                        let window = state.batch.window();
                        let store = Arc::downgrade(self);
                        let task = handle.spawn(async move {
                            tokio::time::sleep(window).await;
                            if let Some(store) = store.upgrade() {
                                store.ship(Some(generation));
                            }
                        });
                        state.batch.arm(generation, task);
                        false
                    }
                    // No runtime to drive a timer: deliver right away.
                    Err(_) => true,
                },
            }
        };
        if ship_now {
            self.ship(None);
        }
    }

    /// Deliver the pending batch.
    ///
    /// `generation` identifies the timer that fired; a stale timer is a
    /// no-op. Manual flushes pass `None` and abort the running timer.
    fn ship(&self, generation: Option<u64>) {
        let (shipment, subscribers) = {
            let mut state = self.lock();
            if state.disconnected {
                return;
            }
            match generation {
                Some(g) if !state.batch.is_current_timer(g) => return,
                None if !state.batch.has_pending() => return,
                _ => {}
            }
            let shipment = state.batch.take_shipment();
            let subscribers: Vec<Subscriber> = state.subscribers.values().cloned().collect();
            (shipment, subscribers)
        };
        if let (None, Some(timer)) = (generation, &shipment.timer) {
            timer.abort();
        }

        if self.debug {
            let cargo = Value::Object(shipment.cargo.clone());
            tracing::debug!(store = %self.name, cargo = %cargo, "new cargo");
        }

        for subscriber in &subscribers {
            subscriber(&shipment.cargo);
        }

        self.registry.publish(PubEvent::CargoShipped {
            store_name: self.name.clone(),
            cargo: shipment.cargo.clone(),
        });

        let payload = Value::Object(shipment.cargo);
        for pid in shipment.pids {
            self.end_process(pid, payload.clone());
        }
    }

    /// Emit `cleanup` on a process, if it is still tracked.
    pub(crate) fn end_process(&self, pid: ProcessId, payload: Value) {
        if let Some(px) = self.process(pid) {
            px.emit(ProcessEvent::Cleanup, payload);
        }
    }
}

/// A stub provisioned with a flow stage process reports its own lifecycle
/// so the stage trigger can fire.
fn tracked_stub(store: &Arc<StoreShared>, stub: DeedFn, pid: ProcessId) -> DeedFn {
    let store = Arc::downgrade(store);
    deed_fn(move |args: Args| {
        let stub = Arc::clone(&stub);
        let px = store.upgrade().and_then(|s| s.process(pid));
        async move {
            if let Some(px) = &px {
                px.emit(ProcessEvent::Start, Value::Array(args.clone()));
            }
            let out = stub(args).await?;
            if let Some(px) = &px {
                let payload = Value::Array(vec![out.clone().unwrap_or(Value::Null)]);
                px.emit(ProcessEvent::End, payload.clone());
                px.emit(ProcessEvent::Cleanup, payload);
            }
            Ok(out)
        }
    })
}

// ─── Store ────────────────────────────────────────────────────────────────

/// Handle to a live store. Clones share the same state.
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.shared.name)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl Store {
    /// Build a store, register its deeds and publish it in `registry`.
    ///
    /// A store already registered under the same name is replaced.
    pub fn new(registry: &Registry, config: StoreConfig) -> Result<Store> {
        let name = StoreName::resolve(config.name.as_ref())?;
        let external = Process::new(EXTERNAL_UPDATE);
        let external_pid = external.id();

        let mut processes = HashMap::new();
        processes.insert(external_pid, Arc::new(external));

        let fetch = config
            .fetch
            .unwrap_or_else(|| Arc::new(ReqwestFetch::new()) as Arc<dyn Fetch>);

        let shared = Arc::new(StoreShared {
            name: name.clone(),
            debug: config.debug,
            registry: registry.clone(),
            fetch,
            request_defaults: config.request_defaults,
            external: external_pid,
            state: Mutex::new(StoreState {
                batch: Batch::new(config.cargo, config.batch_window, config.merge_mode),
                deeds: BTreeMap::new(),
                processes,
                subscribers: BTreeMap::new(),
                props: config.props,
                disconnected: false,
            }),
        });

        for deed in &config.deeds {
            shared.register(deed.view(), None)?;
        }

        registry.insert(&name, Arc::downgrade(&shared));
        let store = Store { shared };
        registry.publish(PubEvent::NewStore {
            store_name: name,
            deeds: store.shared.deed_names(),
            cargo: store.cargo().unwrap_or_default(),
        });
        Ok(store)
    }

    pub(crate) fn from_shared(shared: Arc<StoreShared>) -> Self {
        Store { shared }
    }

    pub(crate) fn shares(&self, other: &std::sync::Weak<StoreShared>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.shared), other.as_ptr())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn batch_window(&self) -> Duration {
        self.shared.lock().batch.window()
    }

    pub fn merge_mode(&self) -> MergeMode {
        self.shared.lock().batch.mode()
    }

    /// Register one more deed after construction.
    pub fn register_deed(&self, deed: impl Into<Deed>) -> Result<()> {
        let deed = deed.into();
        self.shared.register(deed.view(), None)
    }

    /// The callable deed table.
    pub fn deeds(&self) -> Deeds {
        self.shared.deeds_handle()
    }

    /// Shorthand for `self.deeds().call(name, args)`.
    pub async fn call(&self, name: &str, args: Args) -> Result<Option<Value>> {
        self.deeds().call(name, args).await
    }

    /// The last delivered cargo. `None` once disconnected.
    pub fn cargo(&self) -> Option<Cargo> {
        self.shared.lock().batch.stable().cloned()
    }

    /// Cargo including mutations that have not been delivered yet.
    pub fn volatile_cargo(&self) -> Cargo {
        self.shared.lock().batch.volatile().clone()
    }

    pub fn processes(&self) -> Vec<Arc<Process>> {
        let mut processes: Vec<Arc<Process>> =
            self.shared.lock().processes.values().cloned().collect();
        processes.sort_by(|a, b| a.deed_name().cmp(b.deed_name()));
        processes
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.shared.process(pid)
    }

    /// Every tracked process registered under `deed_name`.
    pub fn processes_named(&self, deed_name: &str) -> Vec<Arc<Process>> {
        self.processes()
            .into_iter()
            .filter(|px| px.deed_name() == deed_name)
            .collect()
    }

    /// The process that tracks [`Store::update_cargo`].
    pub fn external_process(&self) -> ProcessId {
        self.shared.external
    }

    pub fn subscribe<F>(&self, id: SubscriptionId, callback: F)
    where
        F: Fn(&Cargo) + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        if state.disconnected {
            return;
        }
        state.subscribers.insert(id, Arc::new(callback));
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.lock().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Queue a mutation from outside any deed.
    pub fn update_cargo(&self, mutation: Value) {
        let Some(px) = self.shared.process(self.shared.external) else {
            tracing::warn!(store = %self.shared.name, "cargo update on disconnected store was dropped");
            return;
        };
        px.emit(ProcessEvent::Start, mutation.clone());
        if self.shared.debug {
            tracing::debug!(store = %self.shared.name, cargo = %mutation, "external queued cargo");
        }
        self.shared.enqueue(Some(&mutation), px.id());
    }

    /// Shallow-merge `props` into the values handed to hooks.
    pub fn update_props(&self, props: Cargo) {
        let mut state = self.shared.lock();
        for (key, value) in props {
            state.props.insert(key, value);
        }
    }

    pub fn props(&self) -> Cargo {
        self.shared.lock().props.clone()
    }

    /// Whether mutations are waiting for the batch window to close.
    pub fn has_pending(&self) -> bool {
        self.shared.lock().batch.has_pending()
    }

    /// Ship the pending batch now instead of waiting for the window.
    pub fn flush(&self) {
        self.shared.ship(None);
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.is_disconnected()
    }

    /// Tear the store down.
    ///
    /// Removes it from the registry, drops every subscriber, kills every
    /// process and nulls the cargo. Deeds still in flight complete but their
    /// mutations are dropped; later calls resolve to `Ok(None)` with a warning.
    pub fn disconnect(&self) {
        let (processes, timer) = {
            let mut state = self.shared.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.subscribers.clear();
            state.deeds.clear();
            let processes: Vec<Arc<Process>> =
                state.processes.drain().map(|(_, px)| px).collect();
            (processes, state.batch.clear())
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        self.shared.registry.remove(&self.shared.name, self);
        for px in processes {
            px.kill();
        }
        if self.shared.debug {
            tracing::debug!(store = %self.shared.name, "store disconnected");
        }
        self.shared.registry.publish(PubEvent::StoreRemoved {
            store_name: self.shared.name.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionDeed;
    use crate::deed::StubDeed;
    use crate::process::ProcessState;
    use crate::test_support::LogCapture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cargo(v: Value) -> Cargo {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn counter_store(registry: &Registry, window: Duration) -> Store {
        let add = ActionDeed::sync("add", |extras, args| {
            let count = extras.cargo.get("count").and_then(Value::as_i64).unwrap_or(0);
            let by = args.first().and_then(Value::as_i64).unwrap_or(1);
            Ok(Some(json!({ "count": count + by })))
        });
        Store::new(
            registry,
            StoreConfig {
                name: Some("counter".into()),
                cargo: cargo(json!({"count": 0})),
                deeds: vec![add.into()],
                batch_window: window,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn delivery_log(store: &Store) -> Arc<Mutex<Vec<Cargo>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        store.subscribe(SubscriptionId::new(), move |cargo| {
            sink.lock().unwrap().push(cargo.clone());
        });
        log
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_in_one_window_ship_once() {
        let registry = Registry::new();
        let store = counter_store(&registry, DEFAULT_BATCH_WINDOW);
        let log = delivery_log(&store);

        store.call("add", vec![json!(1)]).await.unwrap();
        store.call("add", vec![json!(1)]).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(store.cargo(), Some(cargo(json!({"count": 0}))));
        assert_eq!(store.volatile_cargo(), cargo(json!({"count": 2})));

        tokio::time::sleep(DEFAULT_BATCH_WINDOW * 2).await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], cargo(json!({"count": 2})));
        assert_eq!(store.cargo(), Some(cargo(json!({"count": 2}))));
    }

    #[tokio::test(start_paused = true)]
    async fn last_write_in_a_window_wins() {
        let registry = Registry::new();
        let set = ActionDeed::sync("set", |_, args| {
            Ok(Some(json!({ "count": args.first().cloned().unwrap_or(Value::Null) })))
        });
        let store = Store::new(
            &registry,
            StoreConfig {
                cargo: cargo(json!({"count": 0})),
                deeds: vec![set.into()],
                ..Default::default()
            },
        )
        .unwrap();
        let log = delivery_log(&store);

        store.call("set", vec![json!(1)]).await.unwrap();
        store.call("set", vec![json!(2)]).await.unwrap();
        tokio::time::sleep(DEFAULT_BATCH_WINDOW * 2).await;

        assert_eq!(*log.lock().unwrap(), vec![cargo(json!({"count": 2}))]);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_ship_separately() {
        let registry = Registry::new();
        let store = counter_store(&registry, DEFAULT_BATCH_WINDOW);
        let log = delivery_log(&store);

        store.call("add", vec![json!(1)]).await.unwrap();
        tokio::time::sleep(DEFAULT_BATCH_WINDOW * 2).await;
        store.call("add", vec![json!(5)]).await.unwrap();
        tokio::time::sleep(DEFAULT_BATCH_WINDOW * 2).await;

        let counts: Vec<Value> = log.lock().unwrap().iter().map(|c| c["count"].clone()).collect();
        assert_eq!(counts, vec![json!(1), json!(6)]);
    }

    #[tokio::test]
    async fn zero_window_delivers_inside_the_call() {
        let registry = Registry::new();
        let store = counter_store(&registry, Duration::ZERO);
        let log = delivery_log(&store);

        store.call("add", vec![json!(3)]).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(store.cargo(), Some(cargo(json!({"count": 3}))));
        assert!(!store.has_pending());
    }

    #[tokio::test]
    async fn debug_flag_gates_lifecycle_traces() {
        for debug in [true, false] {
            let registry = Registry::new();
            let set = ActionDeed::sync("set", |_, args| Ok(Some(json!({ "n": args.first() }))));
            let store = Store::new(
                &registry,
                StoreConfig {
                    name: Some("traced".into()),
                    deeds: vec![set.into()],
                    batch_window: Duration::ZERO,
                    debug,
                    ..Default::default()
                },
            )
            .unwrap();

            let logs = LogCapture::default();
            let _guard = logs.install(tracing::Level::DEBUG);
            store.call("set", vec![json!(7)]).await.unwrap();
            let output = logs.contents();

            for message in ["deed started", "queued cargo", "new cargo"] {
                assert_eq!(output.contains(message), debug, "debug={debug}: {output}");
            }
            if debug {
                assert!(output.contains(r#"cargo={"n":7}"#), "{output}");
            }
        }
    }

    #[test]
    fn outside_a_runtime_updates_ship_immediately() {
        let registry = Registry::new();
        let store = counter_store(&registry, DEFAULT_BATCH_WINDOW);
        let log = delivery_log(&store);
        store.update_cargo(json!({"count": 9}));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(store.cargo(), Some(cargo(json!({"count": 9}))));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_flush_ships_and_cancels_the_timer() {
        let registry = Registry::new();
        let store = counter_store(&registry, Duration::from_secs(10));
        let log = delivery_log(&store);

        store.call("add", vec![json!(2)]).await.unwrap();
        store.flush();
        assert_eq!(log.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().unwrap().len(), 1);

        store.flush();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deep_mode_unions_nested_cargo() {
        let registry = Registry::new();
        let store = Store::new(
            &registry,
            StoreConfig {
                cargo: cargo(json!({"a": {"x": 1}})),
                batch_window: Duration::ZERO,
                merge_mode: MergeMode::Deep,
                ..Default::default()
            },
        )
        .unwrap();
        store.update_cargo(json!({"a": {"y": 2}}));
        assert_eq!(store.cargo(), Some(cargo(json!({"a": {"x": 1, "y": 2}}))));
    }

    #[test]
    fn duplicate_action_names_are_rejected() {
        let registry = Registry::new();
        let a = ActionDeed::sync("same", |_, _| Ok(None));
        let b = ActionDeed::sync("same", |_, _| Ok(None));
        let err = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![a.into(), b.into()],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDeed(ref name) if name == "same"));
    }

    #[test]
    fn deed_names_are_scoped_to_their_store() {
        let registry = Registry::new();
        let action = ActionDeed::sync("same", |_, _| Ok(None));
        let stub = StubDeed::new("same", |_| async { Ok(None) });
        let first = Store::new(
            &registry,
            StoreConfig {
                name: Some("first".into()),
                deeds: vec![action.into()],
                ..Default::default()
            },
        )
        .unwrap();
        let second = Store::new(
            &registry,
            StoreConfig {
                name: Some("second".into()),
                deeds: vec![stub.into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(first.deeds().contains("same"));
        assert!(second.deeds().contains("same"));
        assert_eq!(registry.names(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn deeds_can_be_registered_after_construction() {
        let registry = Registry::new();
        let store = counter_store(&registry, Duration::ZERO);
        let reset: crate::Deed = ActionDeed::sync("reset", |_, _| Ok(Some(json!({"count": 0})))).into();

        store.register_deed(reset.clone()).unwrap();
        store.call("add", vec![json!(4)]).await.unwrap();
        store.call("reset", vec![]).await.unwrap();
        assert_eq!(store.cargo(), Some(cargo(json!({"count": 0}))));

        let err = store.register_deed(reset).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDeed(ref name) if name == "reset"));
    }

    #[tokio::test]
    async fn stub_names_overwrite() {
        let registry = Registry::new();
        let first = StubDeed::new("stub", |_| async { Ok(Some(json!(1))) });
        let second = StubDeed::new("stub", |_| async { Ok(Some(json!(2))) });
        let store = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![first.into(), second.into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(store.call("stub", vec![]).await.unwrap(), Some(json!(2)));
    }

    #[test]
    fn empty_name_is_rejected() {
        let registry = Registry::new();
        let err = Store::new(
            &registry,
            StoreConfig {
                name: Some("".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidStoreName));

        let err = Store::new(
            &registry,
            StoreConfig {
                name: Some(StoreName::generated(|_| String::new())),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidStoreName));
    }

    #[test]
    fn generated_names_receive_an_id() {
        let registry = Registry::new();
        let store = Store::new(
            &registry,
            StoreConfig {
                name: Some(StoreName::generated(|id| format!("todos-{id}"))),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(store.name().starts_with("todos-"));
        assert!(store.name().len() > "todos-".len());
        assert!(registry.contains(store.name()));
    }

    #[tokio::test]
    async fn unknown_deed_is_an_error() {
        let registry = Registry::new();
        let store = counter_store(&registry, Duration::ZERO);
        let err = store.call("missing", vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownDeed { ref deed, .. } if deed == "missing"));
    }

    #[tokio::test]
    async fn action_lifecycle_runs_through_cleanup() {
        let registry = Registry::new();
        let store = counter_store(&registry, Duration::ZERO);
        store.call("add", vec![json!(1)]).await.unwrap();
        let px = store.processes_named("add").pop().unwrap();
        assert_eq!(px.state(), ProcessState::Ready);
        assert_eq!(px.run_count(), 1);
    }

    #[tokio::test]
    async fn skipped_shipment_cleans_up_without_delivery() {
        let registry = Registry::new();
        let quiet = ActionDeed::sync("quiet", |extras, _| {
            extras.skip_shipment();
            Ok(Some(json!({"hidden": true})))
        });
        let store = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![quiet.into()],
                batch_window: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
        let log = delivery_log(&store);

        let out = store.call("quiet", vec![]).await.unwrap();
        assert_eq!(out, Some(json!({"hidden": true})));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(store.cargo(), Some(Cargo::new()));
        let px = store.processes_named("quiet").pop().unwrap();
        assert_eq!(px.state(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn failing_action_is_wrapped() {
        let registry = Registry::new();
        let bad = ActionDeed::sync("bad", |_, _| Err(anyhow::anyhow!("nope")));
        let store = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![bad.into()],
                ..Default::default()
            },
        )
        .unwrap();
        let err = store.call("bad", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("deed bad threw an error"));
    }

    #[tokio::test]
    async fn update_props_is_shallow_and_visible_to_hooks() {
        let registry = Registry::new();
        let whoami = ActionDeed::sync("whoami", |extras, _| {
            Ok(Some(json!({ "user": extras.props.get("user").cloned() })))
        });
        let store = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![whoami.into()],
                batch_window: Duration::ZERO,
                props: cargo(json!({"user": "ann", "theme": "dark"})),
                ..Default::default()
            },
        )
        .unwrap();
        store.update_props(cargo(json!({"user": "bo"})));
        assert_eq!(store.props(), cargo(json!({"user": "bo", "theme": "dark"})));
        store.call("whoami", vec![]).await.unwrap();
        assert_eq!(store.cargo().unwrap()["user"], json!("bo"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_with_a_deed_in_flight() {
        let registry = Registry::new();
        let slow = ActionDeed::new("slow", |_, _| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some(json!({"late": true})))
        });
        let store = Store::new(
            &registry,
            StoreConfig {
                name: Some("doomed".into()),
                deeds: vec![slow.into()],
                ..Default::default()
            },
        )
        .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        store.subscribe(SubscriptionId::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let in_flight = tokio::spawn({
            let store = store.clone();
            async move { store.call("slow", vec![]).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let px = store.processes_named("slow").pop().unwrap();

        store.disconnect();
        assert_eq!(px.state(), ProcessState::Killed);
        assert!(store.cargo().is_none());
        assert!(!registry.contains("doomed"));
        assert!(store.processes().is_empty());

        let late = in_flight.await.unwrap().unwrap();
        assert_eq!(late, Some(json!({"late": true})));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.cargo().is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let logs = LogCapture::default();
        let _guard = logs.install(tracing::Level::WARN);
        assert_eq!(store.call("slow", vec![]).await.unwrap(), None);
        assert_eq!(store.call("anything", vec![]).await.unwrap(), None);
        let output = logs.contents();
        assert!(output.contains("deed called on disconnected store"), "{output}");
        assert!(output.contains("store=doomed"), "{output}");
        assert!(output.contains("deed=slow"), "{output}");
        assert!(output.contains("deed=anything"), "{output}");
    }

    #[test]
    fn external_updates_use_their_own_process() {
        let registry = Registry::new();
        let store = counter_store(&registry, Duration::ZERO);
        store.update_cargo(json!({"count": 4}));
        let px = store.process(store.external_process()).unwrap();
        assert_eq!(px.deed_name(), EXTERNAL_UPDATE);
        assert_eq!(px.run_count(), 1);
        assert_eq!(px.state(), ProcessState::Ready);
    }

    #[test]
    fn unsubscribed_callbacks_stop_receiving() {
        let registry = Registry::new();
        let store = counter_store(&registry, Duration::ZERO);
        let id = SubscriptionId::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        store.subscribe(id, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.update_cargo(json!({"count": 1}));
        store.unsubscribe(id);
        store.update_cargo(json!({"count": 2}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 0);
    }
}
