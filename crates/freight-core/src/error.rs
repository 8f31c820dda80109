use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store name must be a non-empty string")]
    InvalidStoreName,

    #[error("a deed has already been registered with name {0}")]
    DuplicateDeed(String),

    #[error("no deed named {deed} is registered on store {store}")]
    UnknownDeed { store: String, deed: String },

    #[error("you're attempting to subscribe to {0}, but that store hasn't been created yet")]
    StoreNotFound(String),

    #[error("flow deed {flow} was passed an invalid deed at stage {stage}")]
    InvalidFlowStage { flow: String, stage: usize },

    #[error("deed {deed} threw an error but didn't handle it: {source:#}")]
    Deed {
        deed: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("request failed: {0}")]
    Response(ResponseError),

    #[error("failed to decode JSON response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] serde_yaml::Error),
}

impl StoreError {
    /// The non-success response behind this error, if there is one.
    pub fn response(&self) -> Option<&ResponseError> {
        match self {
            StoreError::Response(r) => Some(r),
            _ => None,
        }
    }
}

/// A non-success HTTP response, as reported to `catch_error` hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseError {
    pub status: u16,
    pub status_text: String,
    pub url: String,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same shape the error carried on the wire: a small JSON object.
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{} {} ({})", self.status, self.status_text, self.url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_error_displays_as_json() {
        let err = StoreError::Response(ResponseError {
            status: 404,
            status_text: "Not Found".into(),
            url: "https://example.test/x".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains(r#""status":404"#));
        assert!(msg.contains(r#""statusText":"Not Found""#));
        assert_eq!(err.response().map(|r| r.status), Some(404));
    }

    #[test]
    fn deed_error_names_the_deed() {
        let err = StoreError::Deed {
            deed: "load".into(),
            source: anyhow::anyhow!("boom"),
        };
        let msg = err.to_string();
        assert!(msg.contains("deed load"));
        assert!(msg.contains("boom"));
    }
}
