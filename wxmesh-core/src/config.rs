use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::model::DefaultLocation;

/// Configuration for a provider that only needs an API key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiKeyConfig {
    pub api_key: String,
}

/// OAuth client credentials and the long-lived refresh token.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NetatmoCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Optional seed token. Its expiry is unknown, so it is refreshed on first use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Example TOML:
/// [providers.weathercom]
/// api_key = "..."
///
/// [providers.netatmo]
/// client_id = "..."
/// client_secret = "..."
/// refresh_token = "..."
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weathercom: Option<ApiKeyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netatmo: Option<NetatmoCredentials>,

    /// Reverse geocoding; not a weather provider, but configured the same way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locationiq: Option<ApiKeyConfig>,
}

impl ProvidersConfig {
    pub fn weathercom_api_key(&self) -> Option<&str> {
        self.weathercom.as_ref().map(|cfg| cfg.api_key.as_str())
    }

    pub fn locationiq_api_key(&self) -> Option<&str> {
        self.locationiq.as_ref().map(|cfg| cfg.api_key.as_str())
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Point used when no coordinate is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_location: Option<DefaultLocation>,
}

impl Config {
    /// Load config from disk (or defaults on first run), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        let mut cfg = Self::load_from(&path)?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Load config from a specific file, returning an empty default if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "wxmesh", "wxmesh-cli")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Overlay credentials from the environment. Non-empty variables win over file values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("WEATHER_API_KEY") {
            self.set_weathercom_api_key(key);
        }

        if let Some(key) = get("LOCATIONIQ_API_KEY") {
            self.set_locationiq_api_key(key);
        }

        let netatmo_vars = [
            "NETATMO_CLIENT_ID",
            "NETATMO_CLIENT_SECRET",
            "NETATMO_REFRESH_TOKEN",
            "NETATMO_ACCESS_TOKEN",
        ];
        if netatmo_vars.iter().any(|&key| get(key).is_some()) {
            let creds = self.providers.netatmo.get_or_insert_with(Default::default);
            if let Some(v) = get("NETATMO_CLIENT_ID") {
                creds.client_id = v;
            }
            if let Some(v) = get("NETATMO_CLIENT_SECRET") {
                creds.client_secret = v;
            }
            if let Some(v) = get("NETATMO_REFRESH_TOKEN") {
                creds.refresh_token = v;
            }
            if let Some(v) = get("NETATMO_ACCESS_TOKEN") {
                creds.access_token = Some(v);
            }
        }
    }

    pub fn set_weathercom_api_key(&mut self, api_key: String) {
        self.providers.weathercom = Some(ApiKeyConfig { api_key });
    }

    pub fn set_locationiq_api_key(&mut self, api_key: String) {
        self.providers.locationiq = Some(ApiKeyConfig { api_key });
    }

    pub fn set_netatmo_credentials(&mut self, creds: NetatmoCredentials) {
        self.providers.netatmo = Some(creds);
    }

    pub fn default_location(&self) -> DefaultLocation {
        self.default_location.clone().unwrap_or_default()
    }
}
