use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const EMBEDDED_CONFIG: &str = include_str!("../config.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub geolocation: GeolocationConfig,
    pub network_manager: NetworkManagerConfig,
    pub timezones: TimezonesConfig,
    pub languages: LanguagesConfig,
    #[serde(default)]
    pub welcome: WelcomeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeolocationConfig {
    pub url: String,
    pub request_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_result_timeout_secs")]
    pub result_timeout_secs: u64,
}

impl GeolocationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_result_timeout_secs() -> u64 {
    5
}

// Which backend answers connectivity queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Dbus,   // Properties.Get on the system bus
    Nmcli,  // `nmcli networking connectivity`
    Online, // No check; assume the network is up
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkManagerConfig {
    pub probe: ProbeKind,
    pub service: String,
    pub path: String,
    pub interface: String,
    pub property: String,
    pub connected_global: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimezonesConfig {
    pub zone_tab: Vec<PathBuf>,
    #[serde(default)]
    pub iso3166_tab: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguagesConfig {
    pub list: PathBuf,
    #[serde(default)]
    pub skip_codes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WelcomeConfig {
    #[serde(default)]
    pub disable_tryit: bool,
    // Program and arguments started by "CLI Installer"
    #[serde(default = "default_cli_installer")]
    pub cli_installer: Vec<String>,
}

impl Default for WelcomeConfig {
    fn default() -> Self {
        Self {
            disable_tryit: false,
            cli_installer: default_cli_installer(),
        }
    }
}

fn default_cli_installer() -> Vec<String> {
    vec!["nebula".to_string()]
}

impl Config {
    // Parses and validates a TOML document
    pub fn from_toml(raw: &str) -> Result<Self> {
        let parsed: Config = toml::from_str(raw).context("parse config")?;
        validate_config(&parsed).map_err(anyhow::Error::msg)?;
        Ok(parsed)
    }

    pub fn embedded() -> Result<Self> {
        Self::from_toml(EMBEDDED_CONFIG).context("embedded config.toml")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("load config {}", path.display()))
    }
}

/// Loads the configuration named by `NEBULA_CONFIG`, falling back to the
/// copy embedded in the binary.
pub fn load_config() -> Result<Config> {
    match std::env::var_os("NEBULA_CONFIG") {
        Some(path) if !path.is_empty() => Config::from_file(Path::new(&path)),
        _ => Config::embedded(),
    }
}

fn validate_config(cfg: &Config) -> Result<(), String> {
    let geo = &cfg.geolocation;
    if geo.url.trim().is_empty() {
        return Err("geolocation.url must not be empty".to_string());
    }
    if !geo.url.starts_with("http://") && !geo.url.starts_with("https://") {
        return Err(format!("geolocation.url must be an http(s) URL: {}", geo.url));
    }
    if geo.request_timeout_secs == 0 {
        return Err("geolocation.request_timeout_secs must be greater than zero".to_string());
    }
    if geo.poll_interval_secs == 0 {
        return Err("geolocation.poll_interval_secs must be greater than zero".to_string());
    }

    let nm = &cfg.network_manager;
    validate_non_empty("network_manager.service", &nm.service)?;
    validate_non_empty("network_manager.path", &nm.path)?;
    validate_non_empty("network_manager.interface", &nm.interface)?;
    validate_non_empty("network_manager.property", &nm.property)?;
    if !nm.path.starts_with('/') {
        return Err(format!(
            "network_manager.path must be an object path: {}",
            nm.path
        ));
    }

    if cfg.timezones.zone_tab.is_empty() {
        return Err("timezones.zone_tab must not be empty".to_string());
    }
    if cfg.languages.list.as_os_str().is_empty() {
        return Err("languages.list must not be empty".to_string());
    }
    match cfg.welcome.cli_installer.first() {
        Some(program) if !program.trim().is_empty() => {}
        _ => return Err("welcome.cli_installer must name a program".to_string()),
    }

    Ok(())
}

fn validate_non_empty(key: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{key} must not be empty"));
    }
    Ok(())
}
