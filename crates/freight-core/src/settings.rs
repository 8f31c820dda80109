use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::RequestDefaults;
use crate::store::StoreConfig;
use crate::types::MergeMode;
use crate::Result;

fn default_batch_window_ms() -> u64 {
    4
}

/// Store options as written in a YAML file.
///
/// ```yaml
/// name: todos
/// batch_window_ms: 10
/// merge_mode: deep
/// base_url: https://api.example.com
/// headers:
///   accept: application/json
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default)]
    pub merge_mode: MergeMode,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            name: None,
            batch_window_ms: default_batch_window_ms(),
            merge_mode: MergeMode::default(),
            debug: false,
            base_url: String::new(),
            headers: BTreeMap::new(),
        }
    }
}

impl StoreSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// A [`StoreConfig`] carrying these settings; cargo and deeds are left
    /// empty for the caller to fill in.
    pub fn into_config(self) -> StoreConfig {
        StoreConfig {
            name: self.name.as_deref().map(Into::into),
            batch_window: self.batch_window(),
            merge_mode: self.merge_mode,
            debug: self.debug,
            request_defaults: RequestDefaults {
                base_url: self.base_url,
                headers: self.headers,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
