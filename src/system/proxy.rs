use std::sync::Mutex;

use crate::{error::ProxyError, settings::RoutingSettings};

/// Local listeners the OS should send traffic to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoints {
    pub http_host: String,
    pub http_port: u16,
    pub socks_host: String,
    pub socks_port: u16,
}

impl ProxyEndpoints {
    pub fn from_routing(routing: &RoutingSettings) -> Self {
        Self {
            http_host: routing.http_host.clone(),
            http_port: routing.http_port,
            socks_host: routing.socks_host.clone(),
            socks_port: routing.socks_port,
        }
    }
}

/// One way of changing the OS proxy configuration.
pub trait ProxyBackend: Send {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    fn set(&mut self, endpoints: &ProxyEndpoints) -> Result<String, String>;
    fn clear(&mut self) -> Result<String, String>;
}

pub trait SystemProxy: Send + Sync {
    fn enable(&self, endpoints: &ProxyEndpoints) -> Result<String, ProxyError>;
    fn disable(&self) -> Result<String, ProxyError>;
}

/// Tries each available backend in order until one succeeds.
pub struct ProxyToggle {
    backends: Mutex<Vec<Box<dyn ProxyBackend>>>,
}

impl ProxyToggle {
    pub fn new(backends: Vec<Box<dyn ProxyBackend>>) -> Self {
        Self {
            backends: Mutex::new(backends),
        }
    }

    pub fn detect() -> Self {
        Self::new(platform_backends())
    }

    fn apply(
        &self,
        action: &str,
        mut operation: impl FnMut(&mut dyn ProxyBackend) -> Result<String, String>,
    ) -> Result<String, ProxyError> {
        let mut backends = self
            .backends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut last_failure: Option<ProxyError> = None;

        for backend in backends.iter_mut() {
            if !backend.is_available() {
                log::debug!("[proxy] {} unavailable, skipping", backend.name());
                continue;
            }
            match operation(backend.as_mut()) {
                Ok(detail) => {
                    log::info!("[proxy] {} {action} OK: {detail}", backend.name());
                    return Ok(detail);
                }
                Err(detail) => {
                    log::warn!("[proxy] {} {action} FAILED: {detail}", backend.name());
                    last_failure = Some(ProxyError::Backend {
                        name: backend.name().to_string(),
                        detail,
                    });
                }
            }
        }

        Err(last_failure.unwrap_or(ProxyError::NoBackend))
    }
}

impl SystemProxy for ProxyToggle {
    fn enable(&self, endpoints: &ProxyEndpoints) -> Result<String, ProxyError> {
        self.apply("set", |backend| backend.set(endpoints))
    }

    fn disable(&self) -> Result<String, ProxyError> {
        self.apply("clear", |backend| backend.clear())
    }
}

/// Leaves the OS configuration alone.
pub struct NoopProxy;

impl SystemProxy for NoopProxy {
    fn enable(&self, endpoints: &ProxyEndpoints) -> Result<String, ProxyError> {
        Ok(format!(
            "system proxy untouched (http {}:{}, socks {}:{})",
            endpoints.http_host, endpoints.http_port, endpoints.socks_host, endpoints.socks_port
        ))
    }

    fn disable(&self) -> Result<String, ProxyError> {
        Ok("system proxy untouched".into())
    }
}

#[cfg(target_os = "linux")]
fn platform_backends() -> Vec<Box<dyn ProxyBackend>> {
    vec![
        Box::new(super::linux::GSettingsProxy),
        Box::new(super::linux::KdeProxy),
    ]
}

#[cfg(target_os = "macos")]
fn platform_backends() -> Vec<Box<dyn ProxyBackend>> {
    vec![
        Box::new(super::macos::PrimaryServiceProxy),
        Box::new(super::macos::NetworkSetupProxy),
    ]
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_backends() -> Vec<Box<dyn ProxyBackend>> {
    log::warn!("[proxy] no system proxy backend for this platform");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct FakeBackend {
        name: &'static str,
        available: bool,
        succeeds: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ProxyBackend for FakeBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn set(&mut self, endpoints: &ProxyEndpoints) -> Result<String, String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} set {}", self.name, endpoints.http_port));
            if self.succeeds {
                Ok(format!("{} applied", self.name))
            } else {
                Err("write refused".into())
            }
        }

        fn clear(&mut self) -> Result<String, String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} clear", self.name));
            if self.succeeds {
                Ok(format!("{} cleared", self.name))
            } else {
                Err("write refused".into())
            }
        }
    }

    fn backend(
        name: &'static str,
        available: bool,
        succeeds: bool,
        calls: &Arc<Mutex<Vec<String>>>,
    ) -> Box<dyn ProxyBackend> {
        Box::new(FakeBackend {
            name,
            available,
            succeeds,
            calls: calls.clone(),
        })
    }

    fn endpoints() -> ProxyEndpoints {
        ProxyEndpoints::from_routing(&RoutingSettings::default())
    }

    #[test]
    fn falls_back_when_primary_fails() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let toggle = ProxyToggle::new(vec![
            backend("primary", true, false, &calls),
            backend("fallback", true, true, &calls),
        ]);

        assert_eq!(toggle.enable(&endpoints()).unwrap(), "fallback applied");
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["primary set 1087", "fallback set 1087"]
        );
    }

    #[test]
    fn primary_success_skips_fallback() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let toggle = ProxyToggle::new(vec![
            backend("primary", true, true, &calls),
            backend("fallback", true, true, &calls),
        ]);

        assert_eq!(toggle.disable().unwrap(), "primary cleared");
        assert_eq!(*calls.lock().unwrap(), vec!["primary clear"]);
    }

    #[test]
    fn unavailable_backends_are_not_called() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let toggle = ProxyToggle::new(vec![backend("primary", false, true, &calls)]);

        assert_eq!(toggle.enable(&endpoints()), Err(ProxyError::NoBackend));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn last_failure_is_reported() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let toggle = ProxyToggle::new(vec![
            backend("primary", true, false, &calls),
            backend("fallback", true, false, &calls),
        ]);

        assert_eq!(
            toggle.enable(&endpoints()),
            Err(ProxyError::Backend {
                name: "fallback".into(),
                detail: "write refused".into(),
            })
        );
    }
}
