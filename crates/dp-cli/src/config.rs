use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dp_core::SessionConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCOPE: &str = "dataprep";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    pub scope: Option<String>,
    pub redis_url: Option<String>,
}

impl Settings {
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("could not determine config directory")?
            .join("dataprep");
        Ok(dir.join("session.toml"))
    }

    /// Load from `path`, or from [`default_path`](Self::default_path) when
    /// none is given. A missing default file yields defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::read(path)?,
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::read(&path)?
                } else {
                    Self::default()
                }
            }
        };
        settings
            .session
            .validate()
            .context("invalid [session] settings")?;
        Ok(settings)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Command-line and environment values win over the file.
    pub fn apply_overrides(&mut self, scope: Option<String>, redis_url: Option<String>) {
        if scope.is_some() {
            self.cache.scope = scope;
        }
        if redis_url.is_some() {
            self.cache.redis_url = redis_url;
        }
    }

    pub fn scope(&self) -> &str {
        self.cache.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    pub fn require_redis_url(&self) -> Result<&str> {
        self.cache
            .redis_url
            .as_deref()
            .context("no Redis URL configured; pass --redis-url or set DP_REDIS_URL")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize settings")
    }
}
