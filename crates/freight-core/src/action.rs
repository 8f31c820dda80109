//! Action deeds: a function of the current extras and arguments whose
//! return value becomes a cargo mutation.

use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::deed::{deed_fn, DeedFn};
use crate::error::StoreError;
use crate::extras::ActionExtras;
use crate::process::ProcessEvent;
use crate::store::StoreShared;
use crate::types::{Args, ProcessId};
use crate::Result;

pub type ActionFuture = BoxFuture<'static, anyhow::Result<Option<Value>>>;
pub type ActionFn = Arc<dyn Fn(ActionExtras, Args) -> ActionFuture + Send + Sync>;

/// Wrap an async closure as an [`ActionFn`].
pub fn action_fn<F, Fut>(f: F) -> ActionFn
where
    F: Fn(ActionExtras, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    Arc::new(move |extras: ActionExtras, args: Args| f(extras, args).boxed())
}

pub struct ActionDeed {
    name: String,
    action: ActionFn,
}

impl fmt::Debug for ActionDeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDeed").field("name", &self.name).finish()
    }
}

impl ActionDeed {
    /// An action backed by an async closure.
    ///
    /// ```rust,ignore
    /// let load = ActionDeed::new("load", |extras, _args| async move {
    ///     Ok(Some(json!({ "loaded": true })))
    /// });
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionExtras, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: action_fn(f),
        }
    }

    /// An action backed by a plain function.
    pub fn sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionExtras, Args) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        Self::new(name, move |extras, args| {
            let out = f(extras, args);
            async move { out }
        })
    }

    pub fn from_fn(name: impl Into<String>, action: ActionFn) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &ActionFn {
        &self.action
    }
}

/// Build the callable for an action registered as `name` on process `pid`.
pub(crate) fn init_action(store: &Arc<StoreShared>, name: &str, action: ActionFn, pid: ProcessId) -> DeedFn {
    let store = Arc::downgrade(store);
    let name = name.to_string();
    deed_fn(move |args: Args| {
        let store = store.upgrade();
        let name = name.clone();
        let action = Arc::clone(&action);
        async move {
            match store {
                Some(store) => run_action(&store, &name, &action, pid, args).await,
                None => Ok(None),
            }
        }
    })
}

/// Run `action` on process `pid` and queue its value.
///
/// Shared by action deeds and the `then_does` step of request deeds.
pub(crate) async fn run_action(
    store: &Arc<StoreShared>,
    name: &str,
    action: &ActionFn,
    pid: ProcessId,
    args: Args,
) -> Result<Option<Value>> {
    let extras = store.action_extras();
    let skip = extras.skip_flag();
    let px = store.process(pid);

    if let Some(px) = &px {
        px.emit(ProcessEvent::Start, Value::Array(args.clone()));
        if store.debug() {
            tracing::debug!(store = %store.name(), deed = %name, "deed started");
        }
    }

    let value = action(extras, args)
        .await
        .map_err(|source| StoreError::Deed {
            deed: name.to_string(),
            source,
        })?;

    if let Some(px) = &px {
        px.emit(ProcessEvent::End, value.clone().unwrap_or(Value::Null));
    }

    if skip.load(Ordering::SeqCst) {
        store.end_process(pid, value.clone().unwrap_or(Value::Null));
    } else {
        if store.debug() {
            let cargo = value.clone().unwrap_or(Value::Null);
            tracing::debug!(store = %store.name(), deed = %name, cargo = %cargo, "queued cargo");
        }
        store.enqueue(value.as_ref(), pid);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use crate::registry::Registry;
    use crate::store::{Store, StoreConfig};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn async_actions_see_volatile_cargo_and_args() {
        let registry = Registry::new();
        let echo = ActionDeed::new("echo", |extras, args| async move {
            let seen = extras.cargo.get("seed").cloned().unwrap_or(Value::Null);
            Ok(Some(json!({ "seen": seen, "args": args })))
        });
        let store = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![echo.into()],
                ..Default::default()
            },
        )
        .unwrap();
        store.update_cargo(json!({"seed": 7}));

        let out = store.call("echo", vec![json!("a"), json!(2)]).await.unwrap();
        assert_eq!(out, Some(json!({"seen": 7, "args": ["a", 2]})));
    }

    #[tokio::test]
    async fn void_actions_still_complete_their_process() {
        let registry = Registry::new();
        let noop = ActionDeed::sync("noop", |_, _| Ok(None));
        let store = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![noop.into()],
                batch_window: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let px = store.processes_named("noop").pop().unwrap();
        for event in [ProcessEvent::Start, ProcessEvent::End, ProcessEvent::Cleanup] {
            let sink = Arc::clone(&events);
            px.attach(event, move |info, _| sink.lock().unwrap().push(info.event));
        }

        assert_eq!(store.call("noop", vec![]).await.unwrap(), None);
        assert_eq!(
            *events.lock().unwrap(),
            vec![ProcessEvent::Start, ProcessEvent::End, ProcessEvent::Cleanup]
        );
        assert_eq!(px.state(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn actions_can_call_other_deeds() {
        let registry = Registry::new();
        let inner = ActionDeed::sync("inner", |_, _| Ok(Some(json!({"inner": true}))));
        let outer = ActionDeed::new("outer", |extras, _| async move {
            let out = extras.deeds.call("inner", vec![]).await?;
            Ok(Some(json!({ "outer": out.is_some() })))
        });
        let store = Store::new(
            &registry,
            StoreConfig {
                deeds: vec![inner.into(), outer.into()],
                batch_window: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
        store.call("outer", vec![]).await.unwrap();
        assert_eq!(
            Value::Object(store.cargo().unwrap()),
            json!({"inner": true, "outer": true})
        );
    }
}
