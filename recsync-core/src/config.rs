//! YAML configuration: database location, remote API, and job definitions.
//!
//! # Storage layout
//!
//! ```text
//! ~/.recsync/
//!   config.yaml   (default location; `--config` overrides)
//! ```
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Loading always applies environment overrides and validates; a config that
//! comes back `Ok` is safe to run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::types::{JobId, Schedule};

pub const ENV_DATABASE: &str = "RECSYNC_DATABASE";
pub const ENV_API_BASE_URL: &str = "RECSYNC_API_BASE_URL";
pub const ENV_API_TOKEN: &str = "RECSYNC_API_TOKEN";
pub const ENV_API_PASSWORD: &str = "RECSYNC_API_PASSWORD";
pub const ENV_RECORD_LIMIT: &str = "RECSYNC_RECORD_LIMIT";

pub const DEFAULT_BATCH_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database holding the source tables and the application tables.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Hard cap on work units per run, for constrained test runs.
    #[serde(default)]
    pub record_limit: Option<usize>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Fixed bearer token. Ignored when `login` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginConfig>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            login: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Token obtained by POSTing `credentials` as JSON to `path`, repeated
/// whenever the API answers `401`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginConfig {
    pub path: String,
    #[serde(default)]
    pub credentials: serde_json::Map<String, Value>,
    /// Field of the login response holding the token.
    #[serde(default = "default_token_field")]
    pub token_field: String,
}

/// One entity-type sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: JobId,
    #[serde(default)]
    pub name: Option<String>,
    pub schedule: Schedule,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub table: TableSpec,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

impl JobConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Column layout of a versioned source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table: String,
    pub primary_key: String,
    /// Defaults to `primary_key` for tables without an identity/version split.
    #[serde(default)]
    pub grouping_key: Option<String>,
    #[serde(default = "default_sequence")]
    pub sequence: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_message_column")]
    pub message_column: String,
    pub remote_id: String,
    /// Remote-id values that mean "no id".
    #[serde(default = "default_sentinels")]
    pub sentinels: Vec<String>,
    /// Rows with a lower sequence are never discovered.
    #[serde(default)]
    pub watermark: Option<i64>,
}

impl TableSpec {
    pub fn grouping_key(&self) -> &str {
        self.grouping_key.as_deref().unwrap_or(&self.primary_key)
    }

    /// `true` when `value` is absent in the remote-id sense.
    pub fn is_sentinel(&self, value: &str) -> bool {
        let value = value.trim();
        value.is_empty() || self.sentinels.iter().any(|s| s == value)
    }

    fn identifiers(&self) -> [&str; 7] {
        [
            &self.table,
            &self.primary_key,
            self.grouping_key(),
            &self.sequence,
            &self.status_column,
            &self.message_column,
            &self.remote_id,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: HttpMethod,
    /// Path template; `{id}` (see [`EndpointConfig::id_param`]) is filled on updates.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub create: Endpoint,
    pub update: Endpoint,
    /// Field of the response body that carries the remote id.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Path parameter receiving the remote id on updates.
    #[serde(default = "default_id_field")]
    pub id_param: String,
    /// Payload field receiving the remote id on updates, if the API wants it in the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id_field: Option<String>,
    /// Case-insensitive fragments of a 4xx error that mean "update target missing".
    #[serde(default = "default_not_found_markers")]
    pub not_found_markers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Raw,
    String,
    Integer,
    Float,
    Bool,
}

/// Source column to outbound field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub target: String,
    pub column: String,
    #[serde(default)]
    pub kind: FieldKind,
    /// Translate the column value through the local mapping table of this type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,
    /// A missing mapping skips the record instead of falling back.
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A column whose value must already be synced by another job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub job: JobId,
    pub column: String,
    /// Outbound field receiving the resolved remote id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_token_field() -> String {
    "access_token".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_sequence() -> String {
    "idd".to_string()
}

fn default_status_column() -> String {
    "fetchStatus".to_string()
}

fn default_message_column() -> String {
    "fetchMessage".to_string()
}

fn default_sentinels() -> Vec<String> {
    vec![String::new(), "0".to_string(), "1".to_string()]
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_not_found_markers() -> Vec<String> {
    vec!["not found".to_string()]
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.recsync/`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".recsync")
}

/// `<home>/.recsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load, apply process-environment overrides, and validate.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    load_from_with_env(path, |key| std::env::var(key).ok())
}

/// [`load_from`] with an explicit environment, for tests.
pub fn load_from_with_env(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: Config = serde_yaml::from_str(&contents).map_err(|source| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    config.apply_overrides(env)?;
    config.validate()?;
    Ok(config)
}

/// Load `<home>/.recsync/config.yaml`.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    load_from(&config_path_at(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// 3. Overrides and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Environment values win over the file.
    pub fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(db) = env(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database = Some(PathBuf::from(db));
        }
        if let Some(url) = env(ENV_API_BASE_URL).filter(|v| !v.is_empty()) {
            self.remote.base_url = Some(url);
        }
        if let Some(token) = env(ENV_API_TOKEN).filter(|v| !v.is_empty()) {
            self.remote.token = Some(token);
        }
        if let Some(login) = self.remote.login.as_mut() {
            if let Some(password) = env(ENV_API_PASSWORD).filter(|v| !v.is_empty()) {
                login
                    .credentials
                    .insert("password".to_string(), Value::String(password));
            }
        }
        if let Some(limit) = env(ENV_RECORD_LIMIT).filter(|v| !v.is_empty()) {
            let parsed = limit
                .parse::<usize>()
                .map_err(|_| ConfigError::invalid(ENV_RECORD_LIMIT, "expected a positive integer"))?;
            self.record_limit = Some(parsed);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.is_none() {
            return Err(ConfigError::Missing("database"));
        }
        match self.remote.base_url.as_deref() {
            None | Some("") => return Err(ConfigError::Missing("remote.base_url")),
            Some(_) => {}
        }
        if let Some(login) = &self.remote.login {
            if login.path.trim().is_empty() {
                return Err(ConfigError::invalid("remote.login.path", "must not be empty"));
            }
            if login.token_field.trim().is_empty() {
                return Err(ConfigError::invalid("remote.login.token_field", "must not be empty"));
            }
        }
        if self.record_limit == Some(0) {
            return Err(ConfigError::invalid("record_limit", "must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.id.clone()) {
                return Err(ConfigError::DuplicateJob(job.id.clone()));
            }
        }

        for job in &self.jobs {
            if job.id.as_str().is_empty() {
                return Err(ConfigError::invalid("jobs[].id", "must not be empty"));
            }
            if job.batch_size == 0 {
                return Err(ConfigError::invalid(
                    format!("jobs.{}.batch_size", job.id),
                    "must be greater than zero",
                ));
            }
            if !job.schedule.is_valid() {
                return Err(ConfigError::invalid(
                    format!("jobs.{}.schedule", job.id),
                    "hour must be < 24 and minute < 60",
                ));
            }
            for ident in job.table.identifiers() {
                if !is_identifier(ident) {
                    return Err(ConfigError::InvalidIdentifier {
                        job: job.id.clone(),
                        ident: ident.to_string(),
                    });
                }
            }
            for dep in &job.dependencies {
                if !seen.contains(&dep.job) {
                    return Err(ConfigError::UnknownDependency {
                        job: job.id.clone(),
                        dependency: dep.job.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn job(&self, id: &JobId) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| &job.id == id)
    }

    /// Validated database path.
    pub fn database_path(&self) -> Result<&Path, ConfigError> {
        self.database
            .as_deref()
            .ok_or(ConfigError::Missing("database"))
    }
}

/// Table and column names are spliced into SQL, so only plain identifiers
/// (optionally schema-qualified) are accepted.
fn is_identifier(ident: &str) -> bool {
    !ident.is_empty()
        && !ident.starts_with('.')
        && !ident.ends_with('.')
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
