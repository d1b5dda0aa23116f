//! Error types for recsync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::JobId;

/// Configuration problems. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure reading the config file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with file path and serde_yaml's line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    /// A required setting is absent after env overrides were applied.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("job '{0}' is defined more than once")]
    DuplicateJob(JobId),

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: JobId, dependency: JobId },

    #[error("job '{job}': '{ident}' is not a valid SQL identifier")]
    InvalidIdentifier { job: JobId, ident: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
