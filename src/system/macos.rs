#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use std::sync::OnceLock;

use super::{
    proxy::{ProxyBackend, ProxyEndpoints},
    run_silent, run_silent_with_output,
};

#[cfg(target_os = "macos")]
mod preferences;

#[cfg(target_os = "macos")]
pub use preferences::PrimaryServiceProxy;

const NETWORKSETUP: &str = "networksetup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyKind {
    Web,
    SecureWeb,
    Socks,
}

impl ProxyKind {
    const ALL: [Self; 3] = [Self::Web, Self::SecureWeb, Self::Socks];

    fn stem(self) -> &'static str {
        match self {
            Self::Web => "webproxy",
            Self::SecureWeb => "securewebproxy",
            Self::Socks => "socksfirewallproxy",
        }
    }

    /// Key prefix in a service's `Proxies` dictionary (`HTTPEnable`, `SOCKSPort`, ...).
    fn key_prefix(self) -> &'static str {
        match self {
            Self::Web => "HTTP",
            Self::SecureWeb => "HTTPS",
            Self::Socks => "SOCKS",
        }
    }

    fn target(self, endpoints: &ProxyEndpoints) -> (&str, u16) {
        match self {
            Self::Web | Self::SecureWeb => (endpoints.http_host.as_str(), endpoints.http_port),
            Self::Socks => (endpoints.socks_host.as_str(), endpoints.socks_port),
        }
    }
}

/// One proxy entry of a network service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ProxyState {
    enabled: bool,
    server: String,
    port: u16,
}

/// New state for `kind` so it points at `endpoints`, or `None` when it already does.
fn enabled_state(
    kind: ProxyKind,
    current: &ProxyState,
    endpoints: &ProxyEndpoints,
) -> Option<ProxyState> {
    let (host, port) = kind.target(endpoints);
    if current.enabled && current.server == host && current.port == port {
        return None;
    }
    Some(ProxyState {
        enabled: true,
        server: host.to_string(),
        port,
    })
}

/// Host and port are kept so the user's own values survive a disable.
fn disabled_state(current: &ProxyState) -> Option<ProxyState> {
    current.enabled.then(|| ProxyState {
        enabled: false,
        ..current.clone()
    })
}

/// Indices of the services to configure: the primary one when it is known and
/// present, every service otherwise.
fn target_services(primary: Option<&str>, ids: &[String]) -> Vec<usize> {
    primary
        .and_then(|primary| ids.iter().position(|id| id == primary))
        .map(|index| vec![index])
        .unwrap_or_else(|| (0..ids.len()).collect())
}

/// Enabled services from `networksetup -listallnetworkservices`.
fn parse_service_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("An asterisk"))
        .filter(|line| !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

fn networksetup_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let (success, _) = run_silent_with_output(NETWORKSETUP, &["-listallnetworkservices"]);
        log::info!("[proxy] networksetup available: {success}");
        success
    })
}

fn all_services() -> Vec<String> {
    let (_, output) = run_silent_with_output(NETWORKSETUP, &["-listallnetworkservices"]);
    parse_service_list(&output)
}

fn networksetup(arguments: &[&str]) -> Result<(), String> {
    if run_silent(NETWORKSETUP, arguments) {
        Ok(())
    } else {
        Err(format!("networksetup {} failed", arguments.join(" ")))
    }
}

/// Unconditionally writes every proxy of every enabled service.
pub struct NetworkSetupProxy;

impl ProxyBackend for NetworkSetupProxy {
    fn name(&self) -> &str {
        "networksetup (all services)"
    }

    fn is_available(&self) -> bool {
        networksetup_available()
    }

    fn set(&mut self, endpoints: &ProxyEndpoints) -> Result<String, String> {
        let services = all_services();
        let mut failures = Vec::new();

        for service in &services {
            for kind in ProxyKind::ALL {
                let (host, port) = kind.target(endpoints);
                let set = format!("-set{}", kind.stem());
                let state = format!("-set{}state", kind.stem());
                let port = port.to_string();
                for result in [
                    networksetup(&[&set, service, host, &port]),
                    networksetup(&[&state, service, "on"]),
                ] {
                    if let Err(failure) = result {
                        failures.push(failure);
                    }
                }
            }
        }

        if services.is_empty() || failures.len() == services.len() * ProxyKind::ALL.len() * 2 {
            return Err(failures
                .first()
                .cloned()
                .unwrap_or_else(|| "no network service found".into()));
        }
        for failure in &failures {
            log::warn!("[proxy] {failure}");
        }
        Ok(format!("System proxy configured on {}", services.join(", ")))
    }

    fn clear(&mut self) -> Result<String, String> {
        let services = all_services();
        for service in &services {
            for kind in ProxyKind::ALL {
                let state = format!("-set{}state", kind.stem());
                if let Err(failure) = networksetup(&[&state, service, "off"]) {
                    log::warn!("[proxy] {failure}");
                }
            }
        }
        Ok(format!("System proxy cleared on {}", services.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> ProxyEndpoints {
        ProxyEndpoints {
            http_host: "127.0.0.1".into(),
            http_port: 1087,
            socks_host: "127.0.0.1".into(),
            socks_port: 1080,
        }
    }

    fn state(enabled: bool, server: &str, port: u16) -> ProxyState {
        ProxyState {
            enabled,
            server: server.into(),
            port,
        }
    }

    #[test]
    fn service_list_skips_header_and_disabled() {
        let output = "An asterisk (*) denotes that a network service is disabled.\n\
                      Wi-Fi\n*Bluetooth PAN\nThunderbolt Bridge\n";
        assert_eq!(parse_service_list(output), vec!["Wi-Fi", "Thunderbolt Bridge"]);
    }

    #[test]
    fn proxy_already_pointing_at_listener_is_left_alone() {
        let endpoints = endpoints();
        let current = state(true, "127.0.0.1", 1080);
        assert_eq!(enabled_state(ProxyKind::Socks, &current, &endpoints), None);
        assert_eq!(
            enabled_state(ProxyKind::Web, &current, &endpoints),
            Some(state(true, "127.0.0.1", 1087))
        );
        assert_eq!(
            enabled_state(ProxyKind::SecureWeb, &state(false, "127.0.0.1", 1087), &endpoints),
            Some(state(true, "127.0.0.1", 1087))
        );
    }

    #[test]
    fn disabling_keeps_host_and_port() {
        assert_eq!(
            disabled_state(&state(true, "10.0.0.2", 3128)),
            Some(state(false, "10.0.0.2", 3128))
        );
        assert_eq!(disabled_state(&state(false, "10.0.0.2", 3128)), None);
    }

    #[test]
    fn primary_service_is_preferred_over_all_services() {
        let ids = vec!["A1".to_string(), "B2".to_string(), "C3".to_string()];
        assert_eq!(target_services(Some("B2"), &ids), vec![1]);
        assert_eq!(target_services(Some("gone"), &ids), vec![0, 1, 2]);
        assert_eq!(target_services(None, &ids), vec![0, 1, 2]);
        assert!(target_services(None, &[]).is_empty());
    }

    #[test]
    fn dictionary_keys_follow_proxy_kind() {
        let keys: Vec<_> = ProxyKind::ALL.iter().map(|kind| kind.key_prefix()).collect();
        assert_eq!(keys, ["HTTP", "HTTPS", "SOCKS"]);
    }
}
