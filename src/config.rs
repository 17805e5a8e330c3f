//! Proxy configuration: backend launch profiles, timeouts, and permission
//! policy.
//!
//! The TOML file is optional; every key has a default and the built-in
//! backend profiles are merged underneath whatever the file declares.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::Framing;
use crate::{AppError, Result};

/// Backend selected when neither the file nor the CLI names one.
pub const DEFAULT_BACKEND: &str = "gemini";

/// Configurable timeout values in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Backend spawn plus handshake plus session establishment.
    #[serde(default = "default_initialize_seconds")]
    pub initialize_seconds: u64,
    /// One prompt turn.
    #[serde(default = "default_prompt_seconds")]
    pub prompt_seconds: u64,
    /// One permission round-trip to the client.
    #[serde(default = "default_permission_seconds")]
    pub permission_seconds: u64,
    /// Wait for the backend to acknowledge a cancel.
    #[serde(default = "default_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
    /// Wait for a backend process to exit before force-killing it.
    #[serde(default = "default_terminate_seconds")]
    pub terminate_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize_seconds: default_initialize_seconds(),
            prompt_seconds: default_prompt_seconds(),
            permission_seconds: default_permission_seconds(),
            cancel_grace_seconds: default_cancel_grace_seconds(),
            terminate_seconds: default_terminate_seconds(),
        }
    }
}

fn default_initialize_seconds() -> u64 {
    60
}

fn default_prompt_seconds() -> u64 {
    1800
}

fn default_permission_seconds() -> u64 {
    300
}

fn default_cancel_grace_seconds() -> u64 {
    10
}

fn default_terminate_seconds() -> u64 {
    5
}

/// Resolved timeouts used at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Backend initialization.
    pub initialize: Duration,
    /// One prompt turn.
    pub prompt: Duration,
    /// One permission round-trip.
    pub permission: Duration,
    /// Cancel acknowledgement grace period.
    pub cancel_grace: Duration,
    /// Graceful process exit before force-kill.
    pub terminate: Duration,
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(cfg: &TimeoutConfig) -> Self {
        Self {
            initialize: Duration::from_secs(cfg.initialize_seconds),
            prompt: Duration::from_secs(cfg.prompt_seconds),
            permission: Duration::from_secs(cfg.permission_seconds),
            cancel_grace: Duration::from_secs(cfg.cancel_grace_seconds),
            terminate: Duration::from_secs(cfg.terminate_seconds),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

/// Decision applied to permission requests when the client did not opt in
/// to answering them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnattendedDecision {
    /// Select the first allow option offered by the backend.
    Allow,
    /// Select the first reject option, or cancel when none is offered.
    #[default]
    Reject,
}

/// Permission policy.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PermissionsConfig {
    /// Decision for sessions created without `requestPermission`.
    #[serde(default)]
    pub unattended: UnattendedDecision,
}

/// Model advertised by a backend profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    /// Model identifier passed to the backend.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Capability flags reported through `models.list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
}

impl ModelInfo {
    fn new(id: &str, name: &str, capabilities: Value) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            capabilities: Some(capabilities),
        }
    }
}

/// Static launch description of one backend kind.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BackendProfile {
    /// Executable to spawn.
    pub command: String,
    /// Arguments that put the backend in agent-protocol mode.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Flag that carries the model on the command line.
    #[serde(default)]
    pub model_arg: Option<String>,
    /// Whether the model is switched with `session/set_model`.
    #[serde(default)]
    pub supports_set_model: bool,
    /// Wire framing on the backend's stdio.
    #[serde(default)]
    pub framing: Framing,
    /// Models reported by `models.list`; empty means "any".
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

impl BackendProfile {
    /// Command-line arguments for one launch.
    ///
    /// Profile arguments already present in `extra` are not repeated. When
    /// the profile selects models on the command line, `model` is appended
    /// as `<model_arg> <model>` unless `extra` already carries the flag.
    #[must_use]
    pub fn launch_args(&self, extra: &[String], model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = extra.to_vec();
        for arg in &self.args {
            if !args.contains(arg) {
                args.push(arg.clone());
            }
        }
        if !self.supports_set_model {
            if let (Some(flag), Some(model)) = (&self.model_arg, model) {
                if !args.contains(flag) {
                    args.push(flag.clone());
                    args.push(model.to_owned());
                }
            }
        }
        args
    }

    /// Whether `model_id` is acceptable for this profile.
    #[must_use]
    pub fn accepts_model(&self, model_id: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m.id == model_id)
    }
}

/// Built-in backend profiles.
#[must_use]
pub fn builtin_profiles() -> BTreeMap<String, BackendProfile> {
    let vision = serde_json::json!({ "supports": { "vision": true } });
    let reasoning = serde_json::json!({ "supports": { "vision": true, "reasoningEffort": true } });

    let mut profiles = BTreeMap::new();
    profiles.insert(
        "gemini".to_owned(),
        BackendProfile {
            command: "gemini".into(),
            args: vec!["--experimental-acp".into()],
            env: BTreeMap::new(),
            model_arg: Some("--model".into()),
            supports_set_model: false,
            framing: Framing::ContentLength,
            models: vec![
                ModelInfo::new("gemini-2.0-flash", "Gemini 2.0 Flash", vision.clone()),
                ModelInfo::new("gemini-1.5-pro", "Gemini 1.5 Pro", vision),
            ],
        },
    );
    profiles.insert(
        "claude-code-acp".to_owned(),
        BackendProfile {
            command: "claude-code-acp".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            model_arg: None,
            supports_set_model: true,
            framing: Framing::ContentLength,
            models: vec![
                ModelInfo::new("claude-sonnet-4-20250514", "Claude Sonnet 4", reasoning.clone()),
                ModelInfo::new("claude-opus-4-20250514", "Claude Opus 4", reasoning),
            ],
        },
    );
    profiles.insert(
        "copilot".to_owned(),
        BackendProfile {
            command: "copilot".into(),
            args: vec!["--acp".into()],
            env: BTreeMap::new(),
            model_arg: Some("--model".into()),
            supports_set_model: false,
            framing: Framing::ContentLength,
            models: Vec::new(),
        },
    );
    profiles
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_owned()
}

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProxyConfig {
    /// Backend kind used when `session.create` does not name one.
    #[serde(default = "default_backend")]
    pub default_backend: String,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Permission policy.
    #[serde(default)]
    pub permissions: PermissionsConfig,
    /// Backend profiles keyed by kind; built-ins fill in missing kinds.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendProfile>,
    /// Default working directory for sessions (populated from the CLI).
    #[serde(skip)]
    pub default_cwd: PathBuf,
    /// Extra arguments for launches of the default backend (populated from
    /// the CLI).
    #[serde(skip)]
    pub backend_args: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            timeouts: TimeoutConfig::default(),
            permissions: PermissionsConfig::default(),
            backends: builtin_profiles(),
            default_cwd: PathBuf::from("."),
            backend_args: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and merge built-in profiles.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        for (kind, profile) in builtin_profiles() {
            config.backends.entry(kind).or_insert(profile);
        }
        config.default_cwd = PathBuf::from(".");
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides and re-validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the selected backend is unknown.
    pub fn apply_overrides(
        &mut self,
        backend: Option<String>,
        backend_args: Vec<String>,
        cwd: Option<PathBuf>,
    ) -> Result<()> {
        if let Some(backend) = backend {
            self.default_backend = backend;
        }
        self.backend_args = backend_args;
        if let Some(cwd) = cwd {
            self.default_cwd = cwd;
        }
        self.validate()
    }

    /// Extra launch arguments for `kind`. `--backend-args` only reach the
    /// process-wide default backend.
    #[must_use]
    pub fn backend_args_for(&self, kind: &str) -> &[String] {
        if kind == self.default_backend {
            &self.backend_args
        } else {
            &[]
        }
    }

    /// Profile for a backend kind.
    #[must_use]
    pub fn profile(&self, kind: &str) -> Option<&BackendProfile> {
        self.backends.get(kind)
    }

    /// Profile of the default backend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the default backend has no profile.
    pub fn default_profile(&self) -> Result<&BackendProfile> {
        self.profile(&self.default_backend).ok_or_else(|| {
            AppError::Config(format!("unknown backend: {}", self.default_backend))
        })
    }

    /// Runtime timeouts.
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from(&self.timeouts)
    }

    fn validate(&self) -> Result<()> {
        if !self.backends.contains_key(&self.default_backend) {
            let known: Vec<&str> = self.backends.keys().map(String::as_str).collect();
            return Err(AppError::Config(format!(
                "unknown backend: {} (known: {})",
                self.default_backend,
                known.join(", ")
            )));
        }

        if let Some((kind, _)) = self
            .backends
            .iter()
            .find(|(_, p)| p.command.trim().is_empty())
        {
            return Err(AppError::Config(format!(
                "backend {kind} has an empty command"
            )));
        }

        let t = &self.timeouts;
        if [
            t.initialize_seconds,
            t.prompt_seconds,
            t.permission_seconds,
            t.cancel_grace_seconds,
            t.terminate_seconds,
        ]
        .contains(&0)
        {
            return Err(AppError::Config(
                "timeouts must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
