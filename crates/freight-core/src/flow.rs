//! Flow deeds: ordered stages of deeds, each stage starting once every deed
//! in the previous one reached its trigger event.
//!
//! At registration every stage member is registered again under the name
//! `{flow}-{deed}-stage-{i}` with its own process nested under the flow's.
//! Invoking the flow walks a [`StageSequence`]: attach a one-shot trigger
//! listener to each member process, call all members concurrently, wait for
//! every call and every trigger, transform the collected trigger values into
//! the next stage's arguments.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::deed::{deed_fn, Deed, DeedFn};
use crate::error::StoreError;
use crate::process::{ListenerToken, Process, ProcessEvent};
use crate::store::StoreShared;
use crate::types::{ArgSource, Args, ProcessId, Trigger};
use crate::Result;

/// Maps a stage's trigger values to the next stage's arguments. A non-array
/// result becomes a single argument.
pub type TransformFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

fn identity() -> TransformFn {
    Arc::new(|values: Vec<Value>| -> anyhow::Result<Value> { Ok(Value::Array(values)) })
}

#[derive(Clone)]
pub struct FlowStage {
    deeds: Vec<Deed>,
    trigger: Trigger,
    arg_source: ArgSource,
    transform: TransformFn,
}

impl fmt::Debug for FlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStage")
            .field("deeds", &self.deeds)
            .field("trigger", &self.trigger)
            .field("arg_source", &self.arg_source)
            .finish()
    }
}

impl FlowStage {
    pub fn new(deeds: Vec<Deed>) -> Self {
        Self {
            deeds,
            trigger: Trigger::default(),
            arg_source: ArgSource::default(),
            transform: identity(),
        }
    }

    pub fn deeds(&self) -> &[Deed] {
        &self.deeds
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn arg_source(&self) -> ArgSource {
        self.arg_source
    }
}

/// ```rust,ignore
/// let flow = FlowDeed::new("refresh")
///     .starts_with(login)
///     .advances_on(Trigger::Shipment)
///     .then_calls_all([load_profile, load_settings])
///     .with_original_args();
/// ```
#[derive(Debug, Clone)]
pub struct FlowDeed {
    name: String,
    stages: Vec<FlowStage>,
}

impl FlowDeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Append a stage with a single deed.
    pub fn starts_with(self, deed: impl Into<Deed>) -> Self {
        self.then_calls(deed)
    }

    /// Append a stage whose deeds run concurrently.
    pub fn starts_with_all<I>(self, deeds: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Deed>,
    {
        self.then_calls_all(deeds)
    }

    pub fn then_calls(mut self, deed: impl Into<Deed>) -> Self {
        self.stages.push(FlowStage::new(vec![deed.into()]));
        self
    }

    pub fn then_calls_all<I>(mut self, deeds: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Deed>,
    {
        self.stages
            .push(FlowStage::new(deeds.into_iter().map(Into::into).collect()));
        self
    }

    /// Event the most recently added stage waits for.
    pub fn advances_on(mut self, trigger: Trigger) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.trigger = trigger;
        }
        self
    }

    /// Call the most recently added stage with the flow's own arguments.
    pub fn with_original_args(mut self) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.arg_source = ArgSource::Original;
        }
        self
    }

    /// Transform the most recently added stage's output.
    pub fn maps_to<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        if let Some(stage) = self.stages.last_mut() {
            stage.transform = Arc::new(f);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[FlowStage] {
        &self.stages
    }
}

// ─── Stage plan ───────────────────────────────────────────────────────────

struct StageMember {
    name: String,
    pid: ProcessId,
}

struct StagePlan {
    members: Vec<StageMember>,
    trigger: Trigger,
    arg_source: ArgSource,
    transform: TransformFn,
}

impl StagePlan {
    fn event(&self) -> ProcessEvent {
        match self.trigger {
            Trigger::Done => ProcessEvent::End,
            Trigger::Shipment => ProcessEvent::Cleanup,
        }
    }
}

/// Position of one flow invocation within its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageSequence {
    Pending { next: usize, total: usize },
    Finished,
}

impl StageSequence {
    fn new(total: usize) -> Self {
        if total == 0 {
            StageSequence::Finished
        } else {
            StageSequence::Pending { next: 0, total }
        }
    }

    fn current(&self) -> Option<usize> {
        match self {
            StageSequence::Pending { next, .. } => Some(*next),
            StageSequence::Finished => None,
        }
    }

    fn complete_current(&mut self) {
        if let StageSequence::Pending { next, total } = *self {
            *self = if next + 1 >= total {
                StageSequence::Finished
            } else {
                StageSequence::Pending {
                    next: next + 1,
                    total,
                }
            };
        }
    }
}

// ─── Registration ─────────────────────────────────────────────────────────

pub(crate) fn init_flow(
    store: &Arc<StoreShared>,
    name: &str,
    deed: Arc<FlowDeed>,
    pid: ProcessId,
) -> Result<DeedFn> {
    if let Some(stage) = deed.stages.iter().position(|s| s.deeds.is_empty()) {
        return Err(StoreError::InvalidFlowStage {
            flow: name.to_string(),
            stage,
        });
    }

    let mut plans = Vec::with_capacity(deed.stages.len());
    for (i, stage) in deed.stages.iter().enumerate() {
        let mut members = Vec::with_capacity(stage.deeds.len());
        for member in &stage.deeds {
            let child = format!("{name}-{}-stage-{i}", member.name());
            let child_pid = store.spawn_process(&child, Some(pid));
            store.register(member.renamed(child.clone()), Some(child_pid))?;
            members.push(StageMember {
                name: child,
                pid: child_pid,
            });
        }
        plans.push(StagePlan {
            members,
            trigger: stage.trigger,
            arg_source: stage.arg_source,
            transform: Arc::clone(&stage.transform),
        });
    }

    let plans = Arc::new(plans);
    let store = Arc::downgrade(store);
    let name = name.to_string();
    Ok(deed_fn(move |args: Args| {
        let store = store.upgrade();
        let plans = Arc::clone(&plans);
        let name = name.clone();
        async move {
            match store {
                Some(store) => run_flow(&store, &name, &plans, pid, args).await,
                None => Ok(None),
            }
        }
    }))
}

// ─── Execution ────────────────────────────────────────────────────────────

async fn run_flow(
    store: &Arc<StoreShared>,
    name: &str,
    plans: &[StagePlan],
    pid: ProcessId,
    init_args: Args,
) -> Result<Option<Value>> {
    if let Some(px) = store.process(pid) {
        px.emit(ProcessEvent::Start, Value::Array(init_args.clone()));
    }
    if store.debug() {
        tracing::debug!(store = %store.name(), deed = %name, stages = plans.len(), "flow started");
    }

    let mut sequence = StageSequence::new(plans.len());
    let mut args = init_args.clone();
    let mut last_output = Vec::new();

    while let Some(i) = sequence.current() {
        let plan = &plans[i];
        let input = match plan.arg_source {
            ArgSource::LastCalled if i > 0 => args.clone(),
            _ => init_args.clone(),
        };
        let Some(output) = run_stage(store, plan, input).await? else {
            if store.debug() {
                tracing::debug!(store = %store.name(), deed = %name, stage = i, "flow halted");
            }
            return Ok(None);
        };
        let mapped = (plan.transform)(output.clone()).map_err(|source| StoreError::Deed {
            deed: name.to_string(),
            source,
        })?;
        args = match mapped {
            Value::Array(items) => items,
            other => vec![other],
        };
        last_output = output;
        sequence.complete_current();
    }

    if let Some(px) = store.process(pid) {
        px.emit(ProcessEvent::End, Value::Array(last_output));
        px.emit(ProcessEvent::Cleanup, Value::Array(args.clone()));
    }
    Ok(Some(Value::Array(args)))
}

struct ArmedTrigger {
    px: Arc<Process>,
    token: ListenerToken,
    fired: oneshot::Receiver<Value>,
}

/// Run one stage. `Ok(None)` means the store went away mid-stage.
async fn run_stage(store: &Arc<StoreShared>, plan: &StagePlan, args: Args) -> Result<Option<Vec<Value>>> {
    let event = plan.event();

    let mut targets = Vec::with_capacity(plan.members.len());
    for member in &plan.members {
        let (Some(px), Some(callable)) = (store.process(member.pid), store.deed(&member.name)?) else {
            return Ok(None);
        };
        targets.push((px, callable));
    }

    let mut armed = Vec::with_capacity(targets.len());
    let mut calls = Vec::with_capacity(targets.len());
    for (px, callable) in targets {
        let (tx, fired) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let token = px.attach(event, move |_, values| {
            let sender = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(sender) = sender {
                let _ = sender.send(values.first().cloned().unwrap_or(Value::Null));
            }
        });
        armed.push(ArmedTrigger { px, token, fired });
        calls.push(callable(args.clone()));
    }

    if let Err(e) = try_join_all(calls).await {
        for trigger in &armed {
            trigger.px.detach(event, trigger.token);
        }
        return Err(e);
    }
    if store.is_disconnected() {
        return Ok(None);
    }

    let mut output = Vec::with_capacity(armed.len());
    for trigger in armed {
        let value = trigger.fired.await;
        trigger.px.detach(event, trigger.token);
        match value {
            Ok(value) => output.push(value),
            // Listener dropped without firing: the process was killed.
            Err(_) => return Ok(None),
        }
    }
    Ok(Some(output))
}
