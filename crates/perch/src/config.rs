use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::pool::DEFAULT_WORKER_SLOTS;
use crate::session::DisplayMode;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub status_server: StatusServerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub defaults: SessionDefaults,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl Config {
    /// Load from a YAML file. A missing file yields the defaults; anything
    /// else that goes wrong is an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is; relative ones are anchored at the
/// config file's parent so behavior does not depend on the working
/// directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_link_host() -> String {
    "127.0.0.1".to_string()
}

fn default_link_port() -> u16 {
    4733
}

fn default_status_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    8640
}

fn default_api_base() -> String {
    "https://api.twitter.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_status_interval() -> u64 {
    60
}

fn default_dm_interval() -> u64 {
    90
}

fn default_worker_slots() -> usize {
    DEFAULT_WORKER_SLOTS
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_chatroom_name() -> String {
    "#timeline".to_string()
}

/// Serde default for bool fields that should be `true` (serde's default is `false`).
fn default_true() -> bool {
    true
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Shell-compatible syntax:
/// - `${VAR}` - required variable, errors if not set
/// - `${VAR:-default}` - variable with a fallback value
/// - `$$` - escaped `$` (only needed before `{`)
///
/// Nested references (`${A:-${B}}`) are not supported; an unclosed `${` is
/// an error. A plain `$` not followed by `{` passes through untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut reference = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    reference.push(c);
                }
                if !closed {
                    return Err(ConfigError::UnclosedVarReference);
                }
                out.push_str(&resolve_var(&reference)?);
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

/// Resolve the inside of a `${...}` reference.
fn resolve_var(reference: &str) -> Result<String, ConfigError> {
    let (name, default) = match reference.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (reference, None),
    };

    match env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => default
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string())),
    }
}

// ============================================================================
// LinkConfig
// ============================================================================

/// Where the messaging-network transport process listens.
#[derive(Debug, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_link_host")]
    pub host: String,
    #[serde(default = "default_link_port")]
    pub port: u16,
}

impl LinkConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: default_link_host(),
            port: default_link_port(),
        }
    }
}

// ============================================================================
// StatusServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_status_host")]
    pub host: String,
    #[serde(default = "default_status_port")]
    pub port: u16,
}

impl StatusServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_status_host(),
            port: default_status_port(),
        }
    }
}

// ============================================================================
// RemoteConfig
// ============================================================================

/// The remote microblogging service and our application credentials there.
#[derive(Debug, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// OAuth consumer key of this gateway installation.
    #[serde(default)]
    pub consumer_key: String,
    /// OAuth consumer secret; usually `${PERCH_CONSUMER_SECRET}`.
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ============================================================================
// PollingConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    #[serde(default = "default_dm_interval")]
    pub direct_message_interval_secs: u64,
    /// Remote calls running at once, across all sessions.
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
}

impl PollingConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn dm_interval(&self) -> Duration {
        Duration::from_secs(self.direct_message_interval_secs)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval(),
            direct_message_interval_secs: default_dm_interval(),
            worker_slots: default_worker_slots(),
        }
    }
}

// ============================================================================
// StorageConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// User record directory, relative to the config file unless absolute.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

// ============================================================================
// SessionDefaults
// ============================================================================

/// Starting points for users with no persisted preferences.
#[derive(Debug, Deserialize)]
pub struct SessionDefaults {
    #[serde(default)]
    pub mode: DisplayMode,
    #[serde(default = "default_chatroom_name")]
    pub chatroom_name: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            mode: DisplayMode::default(),
            chatroom_name: default_chatroom_name(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
