//! YAML manifest describing a store and its deeds.
//!
//! ```yaml
//! store:
//!   name: todos
//!   batch_window_ms: 0
//!   base_url: https://api.example.com
//! cargo:
//!   count: 0
//! deeds:
//!   - kind: action
//!     name: set_count
//!     ships: { count: "{0}" }
//!   - kind: request
//!     name: load
//!     path: /todos
//!     query: { page: "{0}" }
//!     ship_as: todos
//!   - kind: flow
//!     name: boot
//!     stages:
//!       - deeds: [load]
//!         advance_on: shipment
//!       - deeds: [set_count]
//!         args: original
//! ```
//!
//! String values may contain `{N}` placeholders. A string that is exactly
//! `{N}` becomes argument `N` with its JSON type intact; placeholders inside
//! longer strings are replaced with the argument's text.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context};
use freight_core::{
    ActionDeed, ArgSource, Cargo, Deed, FlowDeed, Registry, RequestDeed, Store, StoreSettings,
    Trigger,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub cargo: Cargo,
    #[serde(default)]
    pub deeds: Vec<DeedSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeedSpec {
    Action(ActionSpec),
    Request(RequestSpec),
    Flow(FlowSpec),
}

impl DeedSpec {
    pub fn name(&self) -> &str {
        match self {
            DeedSpec::Action(a) => &a.name,
            DeedSpec::Request(r) => &r.name,
            DeedSpec::Flow(f) => &f.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeedSpec::Action(_) => "action",
            DeedSpec::Request(_) => "request",
            DeedSpec::Flow(_) => "flow",
        }
    }

    /// One-line summary for listings.
    pub fn detail(&self) -> String {
        match self {
            DeedSpec::Action(a) if a.ships.is_null() => "ships nothing".to_string(),
            DeedSpec::Action(a) => format!("ships {}", a.ships),
            DeedSpec::Request(r) => format!("{} {}", r.verb.to_ascii_uppercase(), r.path),
            DeedSpec::Flow(f) => {
                let stages: Vec<String> = f.stages.iter().map(|s| s.deeds.join("+")).collect();
                stages.join(" -> ")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    /// Mutation template. `null` ships nothing.
    #[serde(default)]
    pub ships: Value,
}

fn default_verb() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub name: String,
    pub path: String,
    #[serde(default = "default_verb")]
    pub verb: String,
    #[serde(default, skip_serializing_if = "Cargo::is_empty")]
    pub query: Cargo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Cargo key the parsed response is shipped under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub name: String,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub deeds: Vec<String>,
    #[serde(default)]
    pub advance_on: Trigger,
    #[serde(default)]
    pub args: ArgSource,
    /// Forward only the trigger value at this index to the next stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick: Option<usize>,
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse manifest {}", path.display()))
    }

    /// Turn every manifest entry into a deed descriptor, in declaration order.
    ///
    /// Flow stages may reference any action or request, and any flow
    /// declared before them.
    pub fn deeds(&self) -> anyhow::Result<Vec<Deed>> {
        let mut known: HashMap<&str, Deed> = HashMap::new();
        for spec in &self.deeds {
            match spec {
                DeedSpec::Action(a) => {
                    known.insert(&a.name, action_deed(a).into());
                }
                DeedSpec::Request(r) => {
                    known.insert(&r.name, request_deed(r).into());
                }
                DeedSpec::Flow(_) => {}
            }
        }

        let mut deeds = Vec::with_capacity(self.deeds.len());
        for spec in &self.deeds {
            let deed = match spec {
                DeedSpec::Flow(f) => {
                    let deed: Deed = flow_deed(f, &known)?.into();
                    known.insert(&f.name, deed.clone());
                    deed
                }
                other => match known.get(other.name()) {
                    Some(deed) => deed.clone(),
                    None => bail!("deed {} is missing from the manifest", other.name()),
                },
            };
            deeds.push(deed);
        }
        Ok(deeds)
    }

    /// Build a store from this manifest.
    pub fn build(&self, registry: &Registry) -> anyhow::Result<Store> {
        let deeds = self.deeds()?;
        let mut config = self.store.clone().into_config();
        config.cargo = self.cargo.clone();
        config.deeds = deeds;
        Store::new(registry, config).context("failed to build store")
    }
}

fn action_deed(spec: &ActionSpec) -> ActionDeed {
    let ships = spec.ships.clone();
    ActionDeed::sync(spec.name.clone(), move |_, args| {
        if ships.is_null() {
            return Ok(None);
        }
        Ok(Some(render(&ships, &args)))
    })
}

fn request_deed(spec: &RequestSpec) -> RequestDeed {
    let path = spec.path.clone();
    let mut deed = RequestDeed::new(spec.name.clone())
        .hits_with(move |_, args| render_str(&path, args))
        .with_verb(&spec.verb)
        .with_headers(spec.headers.clone());

    if !spec.query.is_empty() {
        let query = spec.query.clone();
        deed = deed.with_query_params(move |_, args| {
            query
                .iter()
                .map(|(k, v)| (k.clone(), render(v, args)))
                .collect()
        });
    }
    if let Some(body) = spec.body.clone() {
        deed = deed.with_body(move |_, args| Value::String(render_str(&body, args)));
    }
    if let Some(json) = spec.json.clone() {
        deed = deed.with_json(move |_, args| render(&json, args));
    }
    if let Some(key) = spec.ship_as.clone() {
        deed = deed.then_does(move |_, args| {
            let mut mutation = Cargo::new();
            let data = match args.len() {
                1 => args.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(args),
            };
            mutation.insert(key.clone(), data);
            async move { Ok(Some(Value::Object(mutation))) }
        });
    }
    deed
}

fn flow_deed(spec: &FlowSpec, known: &HashMap<&str, Deed>) -> anyhow::Result<FlowDeed> {
    let mut flow = FlowDeed::new(spec.name.clone());
    for (i, stage) in spec.stages.iter().enumerate() {
        let mut members = Vec::with_capacity(stage.deeds.len());
        for name in &stage.deeds {
            match known.get(name.as_str()) {
                Some(deed) => members.push(deed.clone()),
                None => bail!(
                    "flow {} stage {i} references unknown deed {name}",
                    spec.name
                ),
            }
        }
        flow = flow.then_calls_all(members).advances_on(stage.advance_on);
        if stage.args == ArgSource::Original {
            flow = flow.with_original_args();
        }
        if let Some(index) = stage.pick {
            flow = flow.maps_to(move |values| Ok(values.get(index).cloned().unwrap_or(Value::Null)));
        }
    }
    Ok(flow)
}

// ─── Templates ────────────────────────────────────────────────────────────

/// Index of an exact `{N}` placeholder.
fn placeholder(s: &str) -> Option<usize> {
    s.strip_prefix('{')?.strip_suffix('}')?.parse().ok()
}

fn arg_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn render_str(template: &str, args: &[Value]) -> String {
    let mut out = template.to_string();
    for (i, arg) in args.iter().enumerate() {
        out = out.replace(&format!("{{{i}}}"), &arg_text(arg));
    }
    out
}

pub fn render(template: &Value, args: &[Value]) -> Value {
    match template {
        Value::String(s) => match placeholder(s) {
            Some(i) => args.get(i).cloned().unwrap_or(Value::Null),
            None => Value::String(render_str(s, args)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, args)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, args)))
                .collect(),
        ),
        other => other.clone(),
    }
}
