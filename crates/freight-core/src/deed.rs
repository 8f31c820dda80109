//! Deed descriptors.
//!
//! A [`Deed`] is immutable data describing one unit of work. The store reads
//! it once at registration time and turns it into a callable [`DeedFn`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::action::ActionDeed;
use crate::flow::FlowDeed;
use crate::request::RequestDeed;
use crate::types::Args;
use crate::Result;

/// Future returned by every registered deed.
pub type DeedFuture = BoxFuture<'static, Result<Option<Value>>>;

/// A registered, callable deed.
pub type DeedFn = Arc<dyn Fn(Args) -> DeedFuture + Send + Sync>;

/// Wrap an async closure as a [`DeedFn`].
pub fn deed_fn<F, Fut>(f: F) -> DeedFn
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    Arc::new(move |args: Args| f(args).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeedKind {
    Action,
    Request,
    Flow,
    Stub,
}

impl fmt::Display for DeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeedKind::Action => write!(f, "action"),
            DeedKind::Request => write!(f, "request"),
            DeedKind::Flow => write!(f, "flow"),
            DeedKind::Stub => write!(f, "stub"),
        }
    }
}

/// A deed descriptor of any kind.
#[derive(Clone)]
pub enum Deed {
    Action(Arc<ActionDeed>),
    Request(Arc<RequestDeed>),
    Flow(Arc<FlowDeed>),
    Stub(Arc<StubDeed>),
}

impl fmt::Debug for Deed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deed")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

impl Deed {
    pub fn name(&self) -> &str {
        match self {
            Deed::Action(d) => d.name(),
            Deed::Request(d) => d.name(),
            Deed::Flow(d) => d.name(),
            Deed::Stub(d) => d.name(),
        }
    }

    pub fn kind(&self) -> DeedKind {
        match self {
            Deed::Action(_) => DeedKind::Action,
            Deed::Request(_) => DeedKind::Request,
            Deed::Flow(_) => DeedKind::Flow,
            Deed::Stub(_) => DeedKind::Stub,
        }
    }

    /// View of this deed under its own name.
    pub fn view(&self) -> DeedView {
        DeedView {
            name: self.name().to_string(),
            deed: self.clone(),
        }
    }

    /// View of this deed reporting `name` instead of its own.
    pub fn renamed(&self, name: impl Into<String>) -> DeedView {
        DeedView {
            name: name.into(),
            deed: self.clone(),
        }
    }
}

impl From<ActionDeed> for Deed {
    fn from(d: ActionDeed) -> Self {
        Deed::Action(Arc::new(d))
    }
}

impl From<RequestDeed> for Deed {
    fn from(d: RequestDeed) -> Self {
        Deed::Request(Arc::new(d))
    }
}

impl From<FlowDeed> for Deed {
    fn from(d: FlowDeed) -> Self {
        Deed::Flow(Arc::new(d))
    }
}

impl From<StubDeed> for Deed {
    fn from(d: StubDeed) -> Self {
        Deed::Stub(Arc::new(d))
    }
}

/// A descriptor plus the name it registers under.
///
/// Flow stages register their members as renamed views so the same
/// descriptor can appear in several stages and alongside its standalone
/// registration without name collisions.
#[derive(Debug, Clone)]
pub struct DeedView {
    name: String,
    deed: Deed,
}

impl DeedView {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deed(&self) -> &Deed {
        &self.deed
    }

    pub fn kind(&self) -> DeedKind {
        self.deed.kind()
    }

    /// The name of the underlying descriptor.
    pub fn original_name(&self) -> &str {
        self.deed.name()
    }
}

// ─── StubDeed ─────────────────────────────────────────────────────────────

/// A deed whose callable is supplied verbatim, bypassing process tracking.
pub struct StubDeed {
    name: String,
    stub: DeedFn,
}

impl StubDeed {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            stub: deed_fn(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stub(&self) -> &DeedFn {
        &self.stub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renamed_view_leaves_descriptor_untouched() {
        let deed: Deed = ActionDeed::sync("load", |_, _| Ok(None)).into();
        let view = deed.renamed("flow-load-stage-0");
        assert_eq!(view.name(), "flow-load-stage-0");
        assert_eq!(view.original_name(), "load");
        assert_eq!(deed.name(), "load");
        assert_eq!(deed.view().name(), "load");
        assert_eq!(view.kind(), DeedKind::Action);
    }

    #[tokio::test]
    async fn stub_calls_through() {
        let stub = StubDeed::new("stub", |args| async move { Ok(args.into_iter().next()) });
        let out = (stub.stub())(vec![json!(7)]).await.unwrap();
        assert_eq!(out, Some(json!(7)));
    }
}
