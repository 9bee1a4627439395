//! Dispatch configuration.
//!
//! Loads [`DispatchConfig`] from TOML with environment variable overrides
//! via `CLDISPATCH_*` prefixed variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Line terminator used when normalizing build logs for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// Carriage return, the convention of the classic host notice window.
    #[default]
    Cr,
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cr => "\r",
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }

    /// Rewrite every `\n`, `\r\n` or lone `\r` terminator in `text`.
    pub fn normalize(self, text: &str) -> String {
        let target = self.as_str();
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    out.push_str(target);
                }
                '\n' => out.push_str(target),
                other => out.push(other),
            }
        }
        out
    }
}

impl std::fmt::Display for LineEnding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cr => write!(f, "cr"),
            Self::Lf => write!(f, "lf"),
            Self::CrLf => write!(f, "crlf"),
        }
    }
}

impl std::str::FromStr for LineEnding {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cr" => Ok(Self::Cr),
            "lf" => Ok(Self::Lf),
            "crlf" => Ok(Self::CrLf),
            other => Err(format!("unknown line ending: {other}")),
        }
    }
}

/// Dispatch configuration loaded from TOML with environment overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Platform used when the caller does not name one.
    /// Override: `CLDISPATCH_PLATFORM`
    pub platform_index: usize,

    /// Device used when the caller does not name one.
    /// Override: `CLDISPATCH_DEVICE`
    pub device_index: usize,

    /// Options passed to the kernel compiler (e.g. `-cl-fast-relaxed-math`).
    /// Override: `CLDISPATCH_BUILD_OPTIONS`
    pub build_options: String,

    /// Line terminator for captured build logs.
    /// Override: `CLDISPATCH_LOG_LINE_ENDING`
    pub build_log_line_ending: LineEnding,

    /// Stage every buffer transfer through pinned host memory.
    /// Override: `CLDISPATCH_PINNED_STAGING`
    pub pinned_staging: bool,

    /// Create command queues with profiling enabled.
    /// Override: `CLDISPATCH_PROFILE_QUEUE`
    pub profile_queue: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            platform_index: 0,
            device_index: 0,
            build_options: String::new(),
            build_log_line_ending: LineEnding::Cr,
            pinned_staging: false,
            profile_queue: false,
        }
    }
}

/// Errors that can occur when loading or validating a [`DispatchConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl DispatchConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string; missing fields take their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: DispatchConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build_options.contains('\0') {
            return Err(ConfigError::Validation("build_options must not contain NUL bytes".into()));
        }
        if self.build_options.len() > 4096 {
            return Err(ConfigError::Validation(format!(
                "build_options must be <= 4096 bytes, got {}",
                self.build_options.len()
            )));
        }
        Ok(())
    }

    /// Apply `CLDISPATCH_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = env_var("CLDISPATCH_PLATFORM") {
            self.platform_index = parse_override("CLDISPATCH_PLATFORM", &val)?;
        }
        if let Some(val) = env_var("CLDISPATCH_DEVICE") {
            self.device_index = parse_override("CLDISPATCH_DEVICE", &val)?;
        }
        if let Some(val) = env_var("CLDISPATCH_BUILD_OPTIONS") {
            self.build_options = val;
        }
        if let Some(val) = env_var("CLDISPATCH_LOG_LINE_ENDING") {
            self.build_log_line_ending =
                val.parse::<LineEnding>().map_err(|reason| ConfigError::EnvOverride {
                    key: "CLDISPATCH_LOG_LINE_ENDING".into(),
                    value: val.clone(),
                    reason,
                })?;
        }
        if let Some(val) = env_var("CLDISPATCH_PINNED_STAGING") {
            self.pinned_staging = truthy(&val);
        }
        if let Some(val) = env_var("CLDISPATCH_PROFILE_QUEUE") {
            self.profile_queue = truthy(&val);
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_override(key: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse::<usize>().map_err(|e| ConfigError::EnvOverride {
        key: key.into(),
        value: val.into(),
        reason: e.to_string(),
    })
}
