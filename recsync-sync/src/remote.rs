//! The remote API contract consumed by the sync loop.
//!
//! Clients own their auth and credential-refresh behaviour; the loop only
//! ever sees the standardized [`ApiResponse`].

use std::collections::BTreeMap;

use recsync_core::config::HttpMethod;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path template relative to the client's base URL, e.g. `/widgets/{id}`.
    pub endpoint: String,
    #[serde(default)]
    pub path_params: BTreeMap<String, String>,
    #[serde(default)]
    pub query: Vec<(String, Value)>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            path_params: BTreeMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: Value) -> Self {
        self.query.push((name.into(), value));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Status code `0` means the request was never sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status_code: u16,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok(status_code: u16, data: Option<Value>) -> Self {
        Self {
            status_code,
            data,
            error: None,
        }
    }

    pub fn failed(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            status_code,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    /// Error text, or `HTTP <code>` when the server gave none.
    pub fn detail(&self) -> String {
        match self.error.as_deref() {
            Some(e) if !e.is_empty() => e.to_owned(),
            _ => format!("HTTP {}", self.status_code),
        }
    }
}

pub trait RemoteApiClient: Send + Sync {
    /// Called once before any unit; an error aborts the whole run.
    fn authenticate(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    fn request(&self, request: &ApiRequest) -> ApiResponse;
}
