use std::{path::PathBuf, sync::OnceLock};

use super::{
    proxy::{ProxyBackend, ProxyEndpoints},
    run_silent, run_silent_with_output,
};

const PROXY_SCHEMA: &str = "org.gnome.system.proxy";
const NO_PROXY_FOR: &str = "localhost,127.0.0.0/8,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

/// A GSettings value in the two spellings `gsettings` uses: how `get`
/// prints it and how `set` takes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GValue<'a> {
    Text(&'a str),
    Number(u16),
    Flag(bool),
}

impl GValue<'_> {
    fn displayed(self) -> String {
        match self {
            Self::Text(text) => format!("'{text}'"),
            Self::Number(number) => number.to_string(),
            Self::Flag(flag) => flag.to_string(),
        }
    }

    fn argument(self) -> String {
        match self {
            Self::Text(text) => text.to_string(),
            Self::Number(number) => number.to_string(),
            Self::Flag(flag) => flag.to_string(),
        }
    }
}

/// Writes through the dconf-backed GSettings API, skipping keys that
/// already hold the wanted value.
pub struct GSettingsProxy;

impl GSettingsProxy {
    fn schema_installed() -> bool {
        static AVAILABLE: OnceLock<bool> = OnceLock::new();
        *AVAILABLE.get_or_init(|| {
            let (success, schemas) = run_silent_with_output("gsettings", &["list-schemas"]);
            let available = success && schemas.lines().any(|line| line.trim() == PROXY_SCHEMA);
            log::info!("[proxy] GSettings proxy schema available: {available}");
            available
        })
    }

    /// Returns whether a write happened.
    fn write_if_changed(schema: &str, key: &str, value: GValue<'_>) -> Result<bool, String> {
        let (_, current) = run_silent_with_output("gsettings", &["get", schema, key]);
        if current.trim() == value.displayed() {
            return Ok(false);
        }
        let argument = value.argument();
        if run_silent("gsettings", &["set", schema, key, &argument]) {
            Ok(true)
        } else {
            Err(format!("gsettings set {schema} {key} {argument} failed"))
        }
    }
}

impl ProxyBackend for GSettingsProxy {
    fn name(&self) -> &str {
        "GSettings"
    }

    fn is_available(&self) -> bool {
        Self::schema_installed()
    }

    fn set(&mut self, endpoints: &ProxyEndpoints) -> Result<String, String> {
        let mut writes = 0;
        let listeners = [
            ("http", endpoints.http_host.as_str(), endpoints.http_port),
            ("https", endpoints.http_host.as_str(), endpoints.http_port),
            ("socks", endpoints.socks_host.as_str(), endpoints.socks_port),
        ];

        for (protocol, host, port) in listeners {
            let schema = format!("{PROXY_SCHEMA}.{protocol}");
            writes += usize::from(Self::write_if_changed(&schema, "host", GValue::Text(host))?);
            writes += usize::from(Self::write_if_changed(&schema, "port", GValue::Number(port))?);
        }
        writes += usize::from(Self::write_if_changed(
            PROXY_SCHEMA,
            "use-same-proxy",
            GValue::Flag(false),
        )?);
        writes += usize::from(Self::write_if_changed(
            PROXY_SCHEMA,
            "mode",
            GValue::Text("manual"),
        )?);

        Ok(format!(
            "System proxy configured via GSettings (HTTP {}:{}, SOCKS5 {}:{}, {writes} changed)",
            endpoints.http_host, endpoints.http_port, endpoints.socks_host, endpoints.socks_port,
        ))
    }

    fn clear(&mut self) -> Result<String, String> {
        let changed = Self::write_if_changed(PROXY_SCHEMA, "mode", GValue::Text("none"))?;
        Ok(if changed {
            "GSettings proxy mode set to none".into()
        } else {
            "GSettings proxy mode already none".into()
        })
    }
}

/// Writes `kioslaverc` with `kwriteconfig`, one command per key.
pub struct KdeProxy;

impl KdeProxy {
    fn kwriteconfig_command() -> &'static str {
        match std::env::var("KDE_SESSION_VERSION")
            .unwrap_or_default()
            .as_str()
        {
            "5" => "kwriteconfig5",
            _ => "kwriteconfig6",
        }
    }

    fn kioslaverc_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kioslaverc")
    }

    fn write_key(key: &str, value: &str) -> Result<(), String> {
        let kioslaverc = Self::kioslaverc_path().to_string_lossy().to_string();
        let arguments = [
            "--file",
            kioslaverc.as_str(),
            "--group",
            "Proxy Settings",
            "--key",
            key,
            value,
        ];
        if run_silent(Self::kwriteconfig_command(), &arguments) {
            Ok(())
        } else {
            Err(format!("{} failed for key {key}", Self::kwriteconfig_command()))
        }
    }

    fn notify_kio() {
        run_silent(
            "dbus-send",
            &[
                "--type=signal",
                "/KIO/Scheduler",
                "org.kde.KIO.Scheduler.reparseSlaveConfiguration",
                "string:''",
            ],
        );
    }
}

impl ProxyBackend for KdeProxy {
    fn name(&self) -> &str {
        "KDE KIO"
    }

    fn is_available(&self) -> bool {
        let desktop = std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_default();
        desktop.split(':').any(|d| d == "KDE" || d == "Trinity")
    }

    fn set(&mut self, endpoints: &ProxyEndpoints) -> Result<String, String> {
        let http = kio_proxy_value("http", &endpoints.http_host, endpoints.http_port);
        let socks = kio_proxy_value("socks", &endpoints.socks_host, endpoints.socks_port);

        Self::write_key("httpProxy", &http)?;
        Self::write_key("httpsProxy", &http)?;
        Self::write_key("socksProxy", &socks)?;
        Self::write_key("NoProxyFor", NO_PROXY_FOR)?;
        Self::write_key("ProxyType", "1")?;
        Self::notify_kio();

        Ok(format!("System proxy configured via KDE KIO ({http}, {socks})"))
    }

    fn clear(&mut self) -> Result<String, String> {
        Self::write_key("ProxyType", "0")?;
        Self::notify_kio();
        Ok("KDE proxy type reset to 0".into())
    }
}

/// kioslaverc separates host and port with a space.
fn kio_proxy_value(scheme: &str, host: &str, port: u16) -> String {
    format!("{scheme}://{host} {port}")
}
