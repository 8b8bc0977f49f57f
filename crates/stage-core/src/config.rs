use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

use crate::{
    normalize_path, DEFAULT_AUDIO_QUIESCE_MS, DEFAULT_ERROR_FLUSH_MS,
    DEFAULT_FETCH_CONNECT_TIMEOUT_MS, DEFAULT_FETCH_TIMEOUT_MS, STAGE_CONTENT_ROOT,
    STAGE_SCRATCH_DIR, STAGE_WORKING_ROOT,
};

pub const STAGE_ENV_WORKING_ROOT: &str = "STAGE_WORKING_ROOT";
pub const STAGE_ENV_SCRATCH_DIR: &str = "STAGE_SCRATCH_DIR";
pub const STAGE_ENV_CONTENT_ROOT: &str = "STAGE_CONTENT_ROOT";
pub const STAGE_ENV_FETCH_TIMEOUT_MS: &str = "STAGE_FETCH_TIMEOUT_MS";
pub const STAGE_ENV_FETCH_CONNECT_TIMEOUT_MS: &str = "STAGE_FETCH_CONNECT_TIMEOUT_MS";
pub const STAGE_ENV_AUDIO_QUIESCE_MS: &str = "STAGE_AUDIO_QUIESCE_MS";
pub const STAGE_ENV_ERROR_FLUSH_MS: &str = "STAGE_ERROR_FLUSH_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub working_root: String,
    pub scratch_dir: String,
    pub content_root: String,
    pub fetch_timeout_ms: u64,
    pub fetch_connect_timeout_ms: u64,
    pub audio_quiesce_ms: u64,
    pub error_flush_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            working_root: STAGE_WORKING_ROOT.to_string(),
            scratch_dir: STAGE_SCRATCH_DIR.to_string(),
            content_root: STAGE_CONTENT_ROOT.to_string(),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            fetch_connect_timeout_ms: DEFAULT_FETCH_CONNECT_TIMEOUT_MS,
            audio_quiesce_ms: DEFAULT_AUDIO_QUIESCE_MS,
            error_flush_ms: DEFAULT_ERROR_FLUSH_MS,
        }
    }
}

impl StageConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(root) = parse_optional_absolute_path_env(STAGE_ENV_WORKING_ROOT)? {
            config.working_root = root;
        }
        if let Some(dir) = parse_optional_absolute_path_env(STAGE_ENV_SCRATCH_DIR)? {
            config.scratch_dir = dir;
        }
        if let Some(root) = parse_optional_string_env(STAGE_ENV_CONTENT_ROOT)? {
            config.content_root = root;
        }
        if let Some(ms) = parse_optional_positive_u64_env(STAGE_ENV_FETCH_TIMEOUT_MS)? {
            config.fetch_timeout_ms = ms;
        }
        if let Some(ms) = parse_optional_positive_u64_env(STAGE_ENV_FETCH_CONNECT_TIMEOUT_MS)? {
            config.fetch_connect_timeout_ms = ms;
        }
        if let Some(ms) = parse_optional_positive_u64_env(STAGE_ENV_AUDIO_QUIESCE_MS)? {
            config.audio_quiesce_ms = ms;
        }
        if let Some(ms) = parse_optional_positive_u64_env(STAGE_ENV_ERROR_FLUSH_MS)? {
            config.error_flush_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_content_root(mut self, root: impl Into<String>) -> Self {
        self.content_root = root.into();
        self
    }

    /// The working root and the scratch area are both wiped on reset, so
    /// neither may contain the other.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("working_root", &self.working_root),
            ("scratch_dir", &self.scratch_dir),
        ] {
            if normalize_path(value, "/") != *value || value == "/" {
                return Err(anyhow!(
                    "{} must be a normalized absolute path other than / (got: {})",
                    name,
                    value
                ));
            }
        }
        let work = format!("{}/", self.working_root);
        let scratch = format!("{}/", self.scratch_dir);
        if work.starts_with(&scratch) || scratch.starts_with(&work) {
            return Err(anyhow!(
                "working_root {} and scratch_dir {} must not overlap",
                self.working_root,
                self.scratch_dir
            ));
        }
        if self.content_root.trim().is_empty() {
            return Err(anyhow!("content_root must not be empty"));
        }
        Ok(())
    }
}

pub fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_optional_string_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            Ok(Some(trimmed.to_string()))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_optional_absolute_path_env(name: &str) -> Result<Option<String>> {
    let Some(raw) = parse_optional_string_env(name)? else {
        return Ok(None);
    };
    if !raw.starts_with('/') {
        return Err(anyhow!("{} must be an absolute path (got: {})", name, raw));
    }
    Ok(Some(normalize_path(&raw, "/")))
}
