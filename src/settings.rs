use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Values the engine accepts for `log.loglevel`.
pub const ENGINE_LOG_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "none"];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    #[default]
    #[serde(rename = "global")]
    Global,
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "bypass-local-region", alias = "passcn")]
    BypassLocalRegion,
}

impl RoutingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Direct => "direct",
            Self::BypassLocalRegion => "bypass-local-region",
        }
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "direct" => Ok(Self::Direct),
            "bypass-local-region" | "bypass" | "passcn" => Ok(Self::BypassLocalRegion),
            other => Err(format!(
                "unknown routing mode '{other}' (expected global, direct or bypass-local-region)"
            )),
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSettings {
    #[serde(rename = "routingMode")]
    pub mode: RoutingMode,
    pub domain_strategy: String,
    pub custom_proxy_rules: String,
    pub custom_direct_rules: String,
    pub custom_block_rules: String,
    pub socks_host: String,
    #[serde(alias = "socksLocalPort")]
    pub socks_port: u16,
    pub socks_udp_enabled: bool,
    pub http_host: String,
    pub http_port: u16,
    pub log_level: String,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            mode: RoutingMode::Global,
            domain_strategy: "IPIfNonMatch".into(),
            custom_proxy_rules: String::new(),
            custom_direct_rules: String::new(),
            custom_block_rules: String::new(),
            socks_host: "127.0.0.1".into(),
            socks_port: 1088,
            socks_udp_enabled: true,
            http_host: "127.0.0.1".into(),
            http_port: 1087,
            log_level: "warning".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(flatten)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub start_at_login: bool,
    #[serde(default = "default_show_in_dock")]
    pub show_in_dock: bool,
    #[serde(default = "default_max_log_file_size_mb")]
    pub max_log_file_size_mb: u32,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

fn default_show_in_dock() -> bool {
    true
}

fn default_max_log_file_size_mb() -> u32 {
    10
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            routing: RoutingSettings::default(),
            auto_connect: false,
            start_at_login: false,
            show_in_dock: default_show_in_dock(),
            max_log_file_size_mb: default_max_log_file_size_mb(),
            last_updated: Utc::now(),
        }
    }
}

/// Result of a settings mutation, telling the caller whether a live engine
/// session has to be restarted to pick the change up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct SettingsChange {
    pub requires_reconnect: bool,
}

impl SettingsChange {
    pub const ENGINE: Self = Self {
        requires_reconnect: true,
    };
    pub const LOCAL: Self = Self {
        requires_reconnect: false,
    };
}

pub struct SettingsStore {
    path: PathBuf,
    settings: AppSettings,
}

impl SettingsStore {
    pub fn settings_file_path(data_directory: &Path) -> PathBuf {
        data_directory.join("settings.json")
    }

    /// Missing or unreadable files fall back to defaults, which are written
    /// back so the file exists for the next start.
    pub fn load(path: PathBuf) -> Self {
        let settings = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<AppSettings>(&content) {
                Ok(settings) => {
                    log::info!("[settings] loaded from {}", path.display());
                    Some(settings)
                }
                Err(error) => {
                    log::warn!("[settings] failed to parse {}: {error}", path.display());
                    None
                }
            },
            Err(_) => {
                log::info!(
                    "[settings] no settings file at {}, using defaults",
                    path.display()
                );
                None
            }
        };

        let loaded = settings.is_some();
        let mut store = Self {
            path,
            settings: settings.unwrap_or_default(),
        };
        if !loaded && let Err(error) = store.save() {
            log::warn!("[settings] failed to write defaults: {error}");
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn routing(&self) -> &RoutingSettings {
        &self.settings.routing
    }

    pub fn save(&mut self) -> Result<(), StoreError> {
        self.settings.last_updated = Utc::now();
        let content = to_sorted_json(&self.settings)?;
        write_file(&self.path, &content)?;
        log::debug!("[settings] saved {}", self.path.display());
        Ok(())
    }

    fn update(
        &mut self,
        change: SettingsChange,
        mutate: impl FnOnce(&mut AppSettings),
    ) -> Result<SettingsChange, StoreError> {
        let before = self.settings.routing.clone();
        mutate(&mut self.settings);
        self.save()?;
        if before == self.settings.routing {
            return Ok(SettingsChange::LOCAL);
        }
        Ok(change)
    }

    pub fn set_mode(&mut self, mode: RoutingMode) -> Result<SettingsChange, StoreError> {
        log::info!("[settings] routing mode -> {mode}");
        self.update(SettingsChange::ENGINE, |settings| {
            settings.routing.mode = mode
        })
    }

    pub fn set_domain_strategy(&mut self, strategy: &str) -> Result<SettingsChange, StoreError> {
        self.update(SettingsChange::ENGINE, |settings| {
            settings.routing.domain_strategy = strategy.trim().to_string()
        })
    }

    pub fn set_rules(
        &mut self,
        proxy: Option<String>,
        direct: Option<String>,
        block: Option<String>,
    ) -> Result<SettingsChange, StoreError> {
        self.update(SettingsChange::ENGINE, |settings| {
            if let Some(proxy) = proxy {
                settings.routing.custom_proxy_rules = proxy;
            }
            if let Some(direct) = direct {
                settings.routing.custom_direct_rules = direct;
            }
            if let Some(block) = block {
                settings.routing.custom_block_rules = block;
            }
        })
    }

    pub fn set_socks_listener(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
        udp: Option<bool>,
    ) -> Result<SettingsChange, StoreError> {
        self.update(SettingsChange::ENGINE, |settings| {
            if let Some(host) = host {
                settings.routing.socks_host = host;
            }
            if let Some(port) = port {
                settings.routing.socks_port = port;
            }
            if let Some(udp) = udp {
                settings.routing.socks_udp_enabled = udp;
            }
        })
    }

    pub fn set_http_listener(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<SettingsChange, StoreError> {
        self.update(SettingsChange::ENGINE, |settings| {
            if let Some(host) = host {
                settings.routing.http_host = host;
            }
            if let Some(port) = port {
                settings.routing.http_port = port;
            }
        })
    }

    pub fn set_log_level(&mut self, level: &str) -> Result<SettingsChange, StoreError> {
        let level = level.trim().to_ascii_lowercase();
        if !ENGINE_LOG_LEVELS.contains(&level.as_str()) {
            return Err(StoreError::InvalidSetting {
                key: "log level",
                value: level,
                expected: ENGINE_LOG_LEVELS.join(", "),
            });
        }
        self.update(SettingsChange::ENGINE, |settings| {
            settings.routing.log_level = level
        })
    }

    pub fn set_auto_connect(&mut self, enabled: bool) -> Result<SettingsChange, StoreError> {
        self.update(SettingsChange::LOCAL, |settings| {
            settings.auto_connect = enabled
        })
    }

    pub fn set_max_log_file_size_mb(&mut self, size: u32) -> Result<SettingsChange, StoreError> {
        self.update(SettingsChange::LOCAL, |settings| {
            settings.max_log_file_size_mb = size.max(1)
        })
    }

    pub fn reset(&mut self) -> Result<SettingsChange, StoreError> {
        self.update(SettingsChange::ENGINE, |settings| {
            *settings = AppSettings::default()
        })
    }
}

/// Pretty JSON with object keys in sorted order.
pub fn to_sorted_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    // serde_json::Value keeps objects in a BTreeMap, so a round trip sorts keys.
    let value = serde_json::to_value(value)?;
    serde_json::to_string_pretty(&value)
}

pub fn write_file(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, content).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
