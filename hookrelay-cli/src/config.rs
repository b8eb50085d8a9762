use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::sys;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the user configuration directory")]
    NoConfigDir,

    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("invalid HOOKRELAY_* environment: {0}")]
    Environment(#[source] config::ConfigError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    profile: HashMap<String, ProfileConfig>,
}

/// Per-profile tunables. Anything left unset falls back to the built-in default.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ProfileConfig {
    pub api_base: Option<String>,
    pub ws_base: Option<String>,
    pub dashboard_base: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub outbound_capacity: Option<usize>,
    pub drain_deadline_secs: Option<u64>,
}

impl ProfileConfig {
    /// Fields set in `other` win.
    fn merge(self, other: ProfileConfig) -> ProfileConfig {
        ProfileConfig {
            api_base: other.api_base.or(self.api_base),
            ws_base: other.ws_base.or(self.ws_base),
            dashboard_base: other.dashboard_base.or(self.dashboard_base),
            request_timeout_secs: other.request_timeout_secs.or(self.request_timeout_secs),
            max_body_bytes: other.max_body_bytes.or(self.max_body_bytes),
            workers: other.workers.or(self.workers),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            outbound_capacity: other.outbound_capacity.or(self.outbound_capacity),
            drain_deadline_secs: other.drain_deadline_secs.or(self.drain_deadline_secs),
        }
    }
}

const USER_PATH: &str = "hookrelay/config.toml";
const CREDENTIALS_PATH: &str = "hookrelay/credentials.toml";

impl Config {
    pub fn user_path() -> Option<PathBuf> {
        sys::dirs::config_dir().map(|config_dir| config_dir.join(USER_PATH))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::user_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// A missing file is an empty config.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|source| ConfigError::Load {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Settings for `profile`, with `HOOKRELAY_*` variables layered on top.
    pub fn resolve_profile(&self, profile: &str) -> Result<ProfileConfig, ConfigError> {
        let file = self.profile.get(profile).cloned().unwrap_or_default();
        let env: ProfileConfig = config::Config::builder()
            .add_source(config::Environment::with_prefix("HOOKRELAY").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(ConfigError::Environment)?;
        Ok(file.merge(env))
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    profile: HashMap<String, ProfileCredentials>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfileCredentials {
    pub api_key: String,
    pub user: Option<String>,
    pub project: Option<String>,
}

impl Credentials {
    pub fn path() -> Option<PathBuf> {
        sys::dirs::config_dir().map(|config_dir| config_dir.join(CREDENTIALS_PATH))
    }

    /// Read-only: logging in and out is handled elsewhere.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get_profile(&self, profile: &str) -> Option<&ProfileCredentials> {
        self.profile.get(profile)
    }
}
