//! Blocking HTTP implementation of [`RemoteApiClient`] on `ureq`.
//!
//! Transport failures never surface as errors: they become `503` (or `504`
//! on timeout) responses so the loop classifies them as transient.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Mutex;
use std::time::Duration;

use recsync_core::config::LoginConfig;
use serde_json::Value;

use crate::error::RemoteError;
use crate::remote::{ApiRequest, ApiResponse, RemoteApiClient};

/// Longest body excerpt used as an error message.
const ERROR_EXCERPT: usize = 200;

/// Supplies the bearer token. `refresh = true` is passed after a `401`.
pub trait CredentialSource: Send + Sync {
    fn token(&self, refresh: bool) -> Result<Option<String>, RemoteError>;
}

/// A fixed token from config or environment, or no auth at all.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl CredentialSource for StaticToken {
    fn token(&self, _refresh: bool) -> Result<Option<String>, RemoteError> {
        Ok(self.0.clone())
    }
}

/// Logs in on first use and again on every refresh, caching the token
/// in between.
pub struct LoginToken {
    agent: ureq::Agent,
    url: String,
    credentials: Value,
    token_field: String,
    cached: Mutex<Option<String>>,
}

impl LoginToken {
    pub fn new(base_url: &str, login: &LoginConfig, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: join_url(base_url, &login.path),
            credentials: Value::Object(login.credentials.clone()),
            token_field: login.token_field.clone(),
            cached: Mutex::new(None),
        }
    }

    fn login(&self) -> Result<String, RemoteError> {
        tracing::info!("logging in at {}", self.url);
        let response = match self.agent.post(&self.url).send_json(&self.credentials) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                let detail = parse_body(status, &body).detail();
                return Err(RemoteError::Credentials(format!(
                    "login rejected with HTTP {status}: {detail}"
                )));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(RemoteError::Credentials(format!("login failed: {transport}")));
            }
        };
        let body: Value = response
            .into_json()
            .map_err(|e| RemoteError::Credentials(format!("login response is not JSON: {e}")))?;
        body.get(&self.token_field)
            .and_then(Value::as_str)
            .filter(|token| !token.trim().is_empty())
            .map(str::to_owned)
            .ok_or_else(|| {
                RemoteError::Credentials(format!(
                    "login response has no '{}' field",
                    self.token_field
                ))
            })
    }
}

impl CredentialSource for LoginToken {
    fn token(&self, refresh: bool) -> Result<Option<String>, RemoteError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| RemoteError::Credentials("token cache poisoned".to_owned()))?;
        if refresh || cached.is_none() {
            *cached = Some(self.login()?);
        }
        Ok(cached.clone())
    }
}

pub struct HttpApiClient<C> {
    agent: ureq::Agent,
    base_url: String,
    credentials: C,
}

impl<C: CredentialSource> HttpApiClient<C> {
    pub fn new(base_url: impl Into<String>, timeout: Duration, credentials: C) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.into(),
            credentials,
        }
    }

    fn send(&self, request: &ApiRequest, token: Option<&str>) -> ApiResponse {
        let url = match build_url(&self.base_url, &request.endpoint, &request.path_params) {
            Ok(url) => url,
            Err(e) => return ApiResponse::failed(0, e.to_string()),
        };
        tracing::debug!("{} {url}", request.method);

        let mut call = self
            .agent
            .request(request.method.as_str(), &url)
            .set("Accept", "application/json");
        if let Some(token) = token {
            call = call.set("Authorization", &format!("Bearer {token}"));
        }
        for (name, value) in &request.query {
            if let Some(value) = query_value(value) {
                call = call.query(name, &value);
            }
        }

        let result = match &request.body {
            Some(body) => call.send_json(body),
            None => call.call(),
        };
        match result {
            Ok(response) => {
                let status = response.status();
                read_response(status, response)
            }
            Err(ureq::Error::Status(status, response)) => read_response(status, response),
            Err(ureq::Error::Transport(transport)) => {
                let status = if is_timeout(&transport) { 504 } else { 503 };
                tracing::warn!("{} {url}: transport error: {transport}", request.method);
                ApiResponse::failed(status, transport.to_string())
            }
        }
    }
}

impl<C: CredentialSource> RemoteApiClient for HttpApiClient<C> {
    fn authenticate(&self) -> Result<(), RemoteError> {
        self.credentials.token(false).map(|_| ())
    }

    fn request(&self, request: &ApiRequest) -> ApiResponse {
        let token = match self.credentials.token(false) {
            Ok(token) => token,
            Err(e) => return ApiResponse::failed(0, e.to_string()),
        };
        let response = self.send(request, token.as_deref());
        if response.status_code != 401 {
            return response;
        }

        tracing::info!("{} {}: 401, refreshing credentials", request.method, request.endpoint);
        match self.credentials.token(true) {
            Ok(token) => self.send(request, token.as_deref()),
            Err(e) => ApiResponse::failed(0, e.to_string()),
        }
    }
}

fn read_response(status: u16, response: ureq::Response) -> ApiResponse {
    let body = match response.into_string() {
        Ok(body) => body,
        Err(e) => return ApiResponse::failed(503, format!("failed to read response body: {e}")),
    };
    parse_body(status, &body)
}

/// Success bodies become `data`; error bodies are mined for a message.
pub(crate) fn parse_body(status: u16, body: &str) -> ApiResponse {
    let json = if body.trim().is_empty() {
        None
    } else {
        serde_json::from_str::<Value>(body).ok()
    };
    if (200..300).contains(&status) {
        return ApiResponse::ok(status, json);
    }
    let message = json
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("error")))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| body.chars().take(ERROR_EXCERPT).collect());
    ApiResponse {
        status_code: status,
        data: json,
        error: Some(message),
    }
}

fn is_timeout(transport: &ureq::Transport) -> bool {
    std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .map_or(false, |io| matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock))
}

/// `null` drops the parameter; booleans are lower-case.
fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Join base URL and endpoint, substituting `{name}` path parameters.
pub(crate) fn build_url(
    base_url: &str,
    template: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, RemoteError> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        let name = &rest[open + 1..close];
        let value = params.get(name).ok_or_else(|| RemoteError::MissingPathParam {
            template: template.to_owned(),
            param: name.to_owned(),
        })?;
        path.push_str(&rest[..open]);
        path.push_str(&urlencoding::encode(value));
        rest = &rest[close + 1..];
    }
    path.push_str(rest);

    Ok(join_url(base_url, &path))
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
