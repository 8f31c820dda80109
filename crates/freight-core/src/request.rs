//! Request deeds: an HTTP call whose parsed response optionally feeds an
//! action.
//!
//! Per invocation the pipeline resolves the path, applies the persistent
//! query parameters, builds a [`FetchRequest`] from the store's
//! [`RequestDefaults`] and the deed's hooks, sends it through the store's
//! [`Fetch`] implementation, parses the response and hands the result to
//! `afterwards` and then to `then_does` (or the default terminal step).

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use crate::action::{action_fn, run_action, ActionFn};
use crate::deed::{deed_fn, DeedFn};
use crate::error::{ResponseError, StoreError};
use crate::extras::{ActionExtras, FetchExtras, RequestExtras};
use crate::process::ProcessEvent;
use crate::store::StoreShared;
use crate::types::{Args, Cargo, ProcessId};
use crate::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

pub type FetchHook<T> = Arc<dyn Fn(&FetchExtras, &[Value]) -> T + Send + Sync>;
pub type AfterFn = Arc<dyn Fn(RequestExtras, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type CatchFn = Arc<dyn Fn(RequestExtras, StoreError) -> anyhow::Result<Option<Value>> + Send + Sync>;

// ─── Transport ────────────────────────────────────────────────────────────

/// A fully resolved outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    /// `None` when no headers remain after stripping.
    pub headers: Option<BTreeMap<String, String>>,
    /// Always `None` for GET and HEAD.
    pub body: Option<String>,
    /// Transport-specific settings from the store defaults and config hook.
    pub settings: Cargo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP transport used by request deeds.
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse>>;
}

/// [`Fetch`] backed by a shared `reqwest` client.
///
/// Honours a numeric `timeout_ms` setting.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fetch for ReqwestFetch {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse>> {
        let client = self.client.clone();
        async move {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|e| StoreError::Network(format!("invalid method {}: {e}", request.method)))?;
            let mut builder = client.request(method, request.url.as_str());
            for (name, value) in request.headers.iter().flatten() {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            if let Some(ms) = request.settings.get("timeout_ms").and_then(Value::as_u64) {
                builder = builder.timeout(Duration::from_millis(ms));
            }

            let res = builder
                .send()
                .await
                .map_err(|e| StoreError::Network(e.to_string()))?;
            let status = res.status();
            let url = res.url().to_string();
            let content_type = res
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = res
                .text()
                .await
                .map_err(|e| StoreError::Network(e.to_string()))?;
            Ok(FetchResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                url,
                content_type,
                body,
            })
        }
        .boxed()
    }
}

/// Store-wide request settings.
#[derive(Debug, Clone, Default)]
pub struct RequestDefaults {
    /// Prefixed to every URL that does not start with `http`.
    pub base_url: String,
    pub headers: BTreeMap<String, String>,
    pub settings: Cargo,
}

// ─── RequestDeed ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum RequestPath {
    Literal(String),
    Computed(FetchHook<String>),
}

impl Default for RequestPath {
    fn default() -> Self {
        RequestPath::Literal(String::new())
    }
}

impl From<&str> for RequestPath {
    fn from(path: &str) -> Self {
        RequestPath::Literal(path.to_string())
    }
}

impl From<String> for RequestPath {
    fn from(path: String) -> Self {
        RequestPath::Literal(path)
    }
}

#[derive(Clone)]
pub struct RequestDeed {
    name: String,
    path: RequestPath,
    verb: String,
    query_params: Option<FetchHook<Cargo>>,
    body: Option<FetchHook<Value>>,
    json: Option<FetchHook<Value>>,
    headers: BTreeMap<String, Option<String>>,
    config: Option<FetchHook<Cargo>>,
    after: Option<AfterFn>,
    then_does: Option<ActionFn>,
    catch_error: Option<CatchFn>,
}

impl fmt::Debug for RequestDeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = match &self.path {
            RequestPath::Literal(path) => path.as_str(),
            RequestPath::Computed(_) => "<computed>",
        };
        f.debug_struct("RequestDeed")
            .field("name", &self.name)
            .field("verb", &self.verb)
            .field("path", &path)
            .field("headers", &self.headers)
            .finish()
    }
}

impl RequestDeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: RequestPath::default(),
            verb: "GET".to_string(),
            query_params: None,
            body: None,
            json: None,
            headers: BTreeMap::new(),
            config: None,
            after: None,
            then_does: None,
            catch_error: None,
        }
    }

    pub fn hits(mut self, path: impl Into<RequestPath>) -> Self {
        self.path = path.into();
        self
    }

    /// Compute the path per invocation.
    pub fn hits_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchExtras, &[Value]) -> String + Send + Sync + 'static,
    {
        self.path = RequestPath::Computed(Arc::new(f));
        self
    }

    pub fn with_verb(mut self, verb: impl AsRef<str>) -> Self {
        self.verb = verb.as_ref().to_ascii_uppercase();
        self
    }

    /// Keys are set on the deed's query string; `null` removes a key.
    /// The query string persists across invocations.
    pub fn with_query_params<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchExtras, &[Value]) -> Cargo + Send + Sync + 'static,
    {
        self.query_params = Some(Arc::new(f));
        self
    }

    /// Raw body. Strings are sent verbatim, anything else as JSON text.
    pub fn with_body<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchExtras, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(f));
        self
    }

    /// JSON body. Takes precedence over [`RequestDeed::with_body`].
    pub fn with_json<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchExtras, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.json = Some(Arc::new(f));
        self
    }

    /// Static headers, merged over computed ones. `None` removes a header.
    pub fn with_headers<I, K>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<String>)>,
        K: Into<String>,
    {
        self.headers = headers.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    /// Partial settings merged per invocation. `method`, `headers` and
    /// `body` override the request fields; other keys go to
    /// [`FetchRequest::settings`].
    pub fn with_config<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchExtras, &[Value]) -> Cargo + Send + Sync + 'static,
    {
        self.config = Some(Arc::new(f));
        self
    }

    pub fn afterwards<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RequestExtras, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.after = Some(Arc::new(move |extras: RequestExtras, value: Value| {
            f(extras, value).boxed()
        }));
        self
    }

    pub fn then_does<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActionExtras, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.then_does = Some(action_fn(f));
        self
    }

    pub fn catch_error<F>(mut self, f: F) -> Self
    where
        F: Fn(RequestExtras, StoreError) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.catch_error = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &RequestPath {
        &self.path
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn headers(&self) -> &BTreeMap<String, Option<String>> {
        &self.headers
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────

/// Query string owned by one registered request deed.
#[derive(Debug, Default)]
struct QueryString {
    pairs: Mutex<Vec<(String, String)>>,
}

impl QueryString {
    fn apply(&self, params: &Cargo) -> String {
        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in params {
            pairs.retain(|(k, _)| k != key);
            if !value.is_null() {
                pairs.push((key.clone(), param_text(value)));
            }
        }
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish()
    }

    fn encoded(&self) -> String {
        self.apply(&Cargo::new())
    }
}

/// Text form of a query value. Arrays are joined with commas, nested ones
/// flattened, and `null` elements left empty.
fn param_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(param_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

pub(crate) fn init_request(
    store: &Arc<StoreShared>,
    name: &str,
    deed: Arc<RequestDeed>,
    pid: ProcessId,
) -> DeedFn {
    let store = Arc::downgrade(store);
    let name = name.to_string();
    let query = Arc::new(QueryString::default());
    deed_fn(move |args: Args| {
        let store = store.upgrade();
        let name = name.clone();
        let deed = Arc::clone(&deed);
        let query = Arc::clone(&query);
        async move {
            let Some(store) = store else {
                return Ok(None);
            };
            match execute(&store, &name, &deed, &query, pid, args).await {
                Ok(value) => Ok(value),
                Err(err) => match &deed.catch_error {
                    Some(handler) => {
                        if store.debug() {
                            tracing::debug!(store = %store.name(), deed = %name, error = %err, "request error handled");
                        }
                        let out = handler(store.request_extras(), err).map_err(|source| {
                            StoreError::Deed {
                                deed: name.clone(),
                                source,
                            }
                        })?;
                        finish(&store, pid, out.clone().unwrap_or(Value::Null));
                        Ok(out)
                    }
                    None => Err(err),
                },
            }
        }
    })
}

async fn execute(
    store: &Arc<StoreShared>,
    name: &str,
    deed: &RequestDeed,
    query: &QueryString,
    pid: ProcessId,
    args: Args,
) -> Result<Option<Value>> {
    if store.debug() {
        tracing::debug!(store = %store.name(), deed = %name, "request started");
    }
    if let Some(px) = store.process(pid) {
        px.emit(ProcessEvent::Start, Value::Array(args.clone()));
    }

    let request = build_request(store, deed, query, &args);
    if store.debug() {
        tracing::debug!(store = %store.name(), deed = %name, method = %request.method, url = %request.url, "fetch");
    }
    let response = store.fetcher().fetch(request).await?;
    let data = parse_response(response)?;

    let data = match &deed.after {
        Some(after) => after(store.request_extras(), data)
            .await
            .map_err(|source| StoreError::Deed {
                deed: name.to_string(),
                source,
            })?,
        None => data,
    };

    match &deed.then_does {
        Some(action) => {
            let args = match data {
                Value::Array(items) => items,
                other => vec![other],
            };
            run_action(store, name, action, pid, args).await
        }
        None => {
            finish(store, pid, data.clone());
            Ok(Some(data))
        }
    }
}

/// Default terminal step: the process ends and cleans up with `value`.
fn finish(store: &StoreShared, pid: ProcessId, value: Value) {
    if let Some(px) = store.process(pid) {
        let payload = Value::Array(vec![value]);
        px.emit(ProcessEvent::End, payload.clone());
        px.emit(ProcessEvent::Cleanup, payload);
    }
}

fn build_request(store: &StoreShared, deed: &RequestDeed, query: &QueryString, args: &[Value]) -> FetchRequest {
    let defaults = store.request_defaults();
    let extras = store.fetch_extras();

    let search = match &deed.query_params {
        Some(hook) => query.apply(&hook(&extras, args)),
        None => query.encoded(),
    };

    let mut method = deed.verb.clone();
    let mut headers: BTreeMap<String, Option<String>> = defaults
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect();
    let mut body: Option<String> = None;
    let mut settings = defaults.settings.clone();

    if let Some(hook) = &deed.config {
        for (key, value) in hook(&extras, args) {
            match key.as_str() {
                "method" => {
                    if let Some(m) = value.as_str() {
                        method = m.to_ascii_uppercase();
                    }
                }
                "headers" => headers = header_map(&value),
                "body" => body = body_text(value),
                _ => {
                    settings.insert(key, value);
                }
            }
        }
    }

    if let Some(hook) = &deed.body {
        body = body_text(hook(&extras, args));
    }

    if let Some(hook) = &deed.json {
        body = Some(hook(&extras, args).to_string());
        headers.insert("content-type".to_string(), Some(JSON_CONTENT_TYPE.to_string()));
    }

    for (key, value) in &deed.headers {
        headers.insert(key.clone(), value.clone());
    }

    let path = match &deed.path {
        RequestPath::Literal(path) => path.clone(),
        RequestPath::Computed(hook) => hook(&extras, args),
    };
    let mut url = if search.is_empty() {
        path
    } else {
        format!("{path}?{search}")
    };
    if !url.starts_with("http") {
        url = format!("{}{url}", defaults.base_url);
    }

    if method == "GET" || method == "HEAD" {
        body = None;
    }
    let headers: BTreeMap<String, String> = headers
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();

    FetchRequest {
        url,
        method,
        headers: (!headers.is_empty()).then_some(headers),
        body,
        settings,
    }
}

fn header_map(value: &Value) -> BTreeMap<String, Option<String>> {
    let Value::Object(map) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
            (k.clone(), v)
        })
        .collect()
}

fn body_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.contains("application/json") || ct.contains("application/javascript"))
}

/// Turn a raw response into a value, or the error for a non-2xx status.
pub fn parse_response(res: FetchResponse) -> Result<Value> {
    if !res.ok() {
        return Err(StoreError::Response(ResponseError {
            status: res.status,
            status_text: res.status_text,
            url: res.url,
        }));
    }
    if !is_json_content_type(res.content_type.as_deref()) {
        return Ok(json!({
            "message": format!(
                "The API response from {} returned a body type of something other than JSON.",
                res.url
            )
        }));
    }
    serde_json::from_str(&res.body).map_err(|source| StoreError::Decode {
        url: res.url,
        source,
    })
}
