//! Proxy writes through the System Configuration preferences of the current
//! network set.

use std::{
    ffi::{CStr, c_char, c_void},
    ptr,
    sync::{Mutex, OnceLock},
};

use core_foundation::{
    base::{CFType, TCFType},
    dictionary::{CFDictionary, CFMutableDictionary},
    number::CFNumber,
    string::{CFString, CFStringRef},
};
use system_configuration::{
    dynamic_store::SCDynamicStoreBuilder,
    network_configuration::SCNetworkService,
    preferences::SCPreferences,
    sys::{
        network_configuration::{
            SCNetworkProtocolGetConfiguration, SCNetworkProtocolSetConfiguration,
            SCNetworkServiceCopyProtocol, SCNetworkServiceGetEnabled, SCNetworkServiceGetName,
            SCNetworkServiceGetServiceID, kSCNetworkProtocolTypeProxies,
        },
        preferences::{
            SCPreferencesApplyChanges, SCPreferencesCommitChanges,
            SCPreferencesCreateWithAuthorization, SCPreferencesLock, SCPreferencesSynchronize,
            SCPreferencesUnlock,
        },
    },
};

use super::{ProxyKind, ProxyState, disabled_state, enabled_state, target_services};
use crate::system::proxy::{ProxyBackend, ProxyEndpoints};

const CLIENT_NAME: &str = "v2rayctl";
const NETWORK_RIGHT: &CStr = c"system.preferences.network";
const PRIMARY_SERVICE_KEY: &str = "State:/Network/Global/IPv4";

// kAuthorizationFlagInteractionAllowed | kAuthorizationFlagExtendRights
// | kAuthorizationFlagPreAuthorize
const AUTHORIZATION_FLAGS: u32 = (1 << 0) | (1 << 1) | (1 << 4);

#[repr(C)]
struct AuthorizationItem {
    name: *const c_char,
    value_length: usize,
    value: *mut c_void,
    flags: u32,
}

#[repr(C)]
struct AuthorizationRights {
    count: u32,
    items: *mut AuthorizationItem,
}

#[link(name = "Security", kind = "framework")]
unsafe extern "C" {
    fn AuthorizationCreate(
        rights: *const AuthorizationRights,
        environment: *const c_void,
        flags: u32,
        authorization: *mut *const c_void,
    ) -> i32;
}

fn authorize() -> Result<*const c_void, String> {
    let mut item = AuthorizationItem {
        name: NETWORK_RIGHT.as_ptr(),
        value_length: 0,
        value: ptr::null_mut(),
        flags: 0,
    };
    let rights = AuthorizationRights {
        count: 1,
        items: &mut item,
    };
    let mut authorization: *const c_void = ptr::null();
    let status = unsafe {
        AuthorizationCreate(&rights, ptr::null(), AUTHORIZATION_FLAGS, &mut authorization)
    };
    if status != 0 || authorization.is_null() {
        return Err(format!("network preferences authorization refused (status {status})"));
    }
    Ok(authorization)
}

fn string_from(raw: CFStringRef) -> Option<String> {
    (!raw.is_null()).then(|| unsafe { CFString::wrap_under_get_rule(raw) }.to_string())
}

/// `PrimaryService` of the global IPv4 state in the dynamic store.
fn primary_service_id() -> Option<String> {
    let store = SCDynamicStoreBuilder::new(CLIENT_NAME).build();
    let global = store
        .get(CFString::from_static_string(PRIMARY_SERVICE_KEY))?
        .downcast_into::<CFDictionary>()?;
    let key = CFString::from_static_string("PrimaryService");
    let value = global.find(key.as_CFTypeRef())?;
    unsafe { CFType::wrap_under_get_rule(*value) }
        .downcast::<CFString>()
        .map(|id| id.to_string())
}

fn read_state(config: &CFDictionary<CFString, CFType>, kind: ProxyKind) -> ProxyState {
    let prefix = kind.key_prefix();
    let value = |suffix: &str| config.find(&CFString::new(&format!("{prefix}{suffix}")));
    let number = |suffix: &str| {
        value(suffix)
            .and_then(|value| value.downcast::<CFNumber>())
            .and_then(|number| number.to_i64())
    };
    ProxyState {
        enabled: number("Enable").is_some_and(|enabled| enabled != 0),
        server: value("Proxy")
            .and_then(|value| value.downcast::<CFString>())
            .map(|server| server.to_string())
            .unwrap_or_default(),
        port: number("Port")
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(0),
    }
}

fn write_state(
    config: &mut CFMutableDictionary<CFString, CFType>,
    kind: ProxyKind,
    state: &ProxyState,
) {
    let prefix = kind.key_prefix();
    let key = |suffix: &str| CFString::new(&format!("{prefix}{suffix}"));
    config.set(key("Enable"), CFNumber::from(i32::from(state.enabled)).into_CFType());
    config.set(key("Proxy"), CFString::new(&state.server).into_CFType());
    config.set(key("Port"), CFNumber::from(i32::from(state.port)).into_CFType());
}

/// Held while the preferences are modified; unlocks on drop.
struct PreferencesLock<'a>(&'a SCPreferences);

impl<'a> PreferencesLock<'a> {
    fn acquire(preferences: &'a SCPreferences) -> Result<Self, String> {
        let locked = unsafe { SCPreferencesLock(preferences.as_concrete_TypeRef(), 1) };
        if locked == 0 {
            return Err("could not lock network preferences".into());
        }
        Ok(Self(preferences))
    }
}

impl Drop for PreferencesLock<'_> {
    fn drop(&mut self) {
        unsafe { SCPreferencesUnlock(self.0.as_concrete_TypeRef()) };
    }
}

struct Service {
    id: String,
    name: String,
    raw: SCNetworkService,
}

/// An authorized preferences session, opened once per process.
struct Session {
    preferences: SCPreferences,
    _authorization: *const c_void,
}

// Only reached through the mutex in `session()`.
unsafe impl Send for Session {}

fn session() -> Result<&'static Mutex<Session>, String> {
    static SESSION: OnceLock<Result<Mutex<Session>, String>> = OnceLock::new();
    SESSION
        .get_or_init(|| {
            let session = Session::open().map(Mutex::new);
            if let Err(error) = &session {
                log::warn!("[proxy] system configuration unavailable: {error}");
            }
            session
        })
        .as_ref()
        .map_err(Clone::clone)
}

impl Session {
    fn open() -> Result<Self, String> {
        let authorization = authorize()?;
        let name = CFString::from_static_string(CLIENT_NAME);
        let raw = unsafe {
            SCPreferencesCreateWithAuthorization(
                ptr::null(),
                name.as_concrete_TypeRef(),
                ptr::null(),
                authorization as _,
            )
        };
        if raw.is_null() {
            return Err("SCPreferencesCreateWithAuthorization failed".into());
        }
        log::info!("[proxy] system configuration session opened");
        Ok(Self {
            preferences: unsafe { SCPreferences::wrap_under_create_rule(raw) },
            _authorization: authorization,
        })
    }

    fn services(&self) -> Vec<Service> {
        SCNetworkService::get_services(&self.preferences)
            .iter()
            .filter_map(|service| {
                let raw = service.as_concrete_TypeRef();
                if unsafe { SCNetworkServiceGetEnabled(raw) } == 0 {
                    return None;
                }
                let id = string_from(unsafe { SCNetworkServiceGetServiceID(raw) })?;
                let name = string_from(unsafe { SCNetworkServiceGetName(raw) })
                    .unwrap_or_else(|| id.clone());
                Some(Service {
                    id,
                    name,
                    raw: (*service).clone(),
                })
            })
            .collect()
    }

    /// Rewrites the proxies `change` asks for on the target services, then
    /// commits and applies. Returns the service names and the number of proxies
    /// changed.
    fn update(
        &self,
        change: impl Fn(ProxyKind, &ProxyState) -> Option<ProxyState>,
    ) -> Result<(Vec<String>, usize), String> {
        let preferences = self.preferences.as_concrete_TypeRef();
        unsafe { SCPreferencesSynchronize(preferences) };
        let _lock = PreferencesLock::acquire(&self.preferences)?;

        let services = self.services();
        let ids: Vec<String> = services.iter().map(|service| service.id.clone()).collect();
        let primary = primary_service_id();
        log::debug!("[proxy] primary service {primary:?} among {} services", ids.len());

        let mut names = Vec::new();
        let mut changed = 0;
        for index in target_services(primary.as_deref(), &ids) {
            let service = &services[index];
            let protocol = unsafe {
                SCNetworkServiceCopyProtocol(
                    service.raw.as_concrete_TypeRef(),
                    kSCNetworkProtocolTypeProxies,
                )
            };
            if protocol.is_null() {
                log::debug!("[proxy] {} has no proxies protocol", service.name);
                continue;
            }
            let _protocol = unsafe { CFType::wrap_under_create_rule(protocol as _) };

            let raw = unsafe { SCNetworkProtocolGetConfiguration(protocol) };
            let current = (!raw.is_null()).then(|| unsafe {
                CFDictionary::<CFString, CFType>::wrap_under_get_rule(raw as _)
            });
            let mut config = match &current {
                Some(current) => CFMutableDictionary::from(current),
                None => CFMutableDictionary::new(),
            };

            let mut writes = 0;
            for kind in ProxyKind::ALL {
                let state = current
                    .as_ref()
                    .map(|current| read_state(current, kind))
                    .unwrap_or_default();
                if let Some(next) = change(kind, &state) {
                    write_state(&mut config, kind, &next);
                    writes += 1;
                }
            }
            names.push(service.name.clone());
            if writes == 0 {
                continue;
            }

            let written = unsafe {
                SCNetworkProtocolSetConfiguration(protocol, config.as_concrete_TypeRef() as _)
            };
            if written == 0 {
                return Err(format!("could not write proxies of {}", service.name));
            }
            changed += writes;
        }

        if names.is_empty() {
            return Err("no network service found".into());
        }
        if changed > 0 {
            let committed = unsafe { SCPreferencesCommitChanges(preferences) } != 0;
            let applied = committed && unsafe { SCPreferencesApplyChanges(preferences) } != 0;
            if !applied {
                return Err(format!(
                    "network preferences not saved (committed={committed}, applied={applied})"
                ));
            }
        }
        Ok((names, changed))
    }
}

fn with_session<T>(
    operation: impl FnOnce(&Session) -> Result<T, String>,
) -> Result<T, String> {
    let session = session()?
        .lock()
        .map_err(|_| "system configuration session poisoned".to_string())?;
    operation(&session)
}

/// Targets the primary network service (or every service when it cannot be
/// determined) through System Configuration, reading each proxy before writing it.
pub struct PrimaryServiceProxy;

impl ProxyBackend for PrimaryServiceProxy {
    fn name(&self) -> &str {
        "system configuration (primary service)"
    }

    fn is_available(&self) -> bool {
        session().is_ok()
    }

    fn set(&mut self, endpoints: &ProxyEndpoints) -> Result<String, String> {
        let (services, changed) = with_session(|session| {
            session.update(|kind, current| enabled_state(kind, current, endpoints))
        })?;
        Ok(format!(
            "System proxy configured on {} ({changed} proxies changed)",
            services.join(", ")
        ))
    }

    fn clear(&mut self) -> Result<String, String> {
        let (services, _) =
            with_session(|session| session.update(|_, current| disabled_state(current)))?;
        Ok(format!("System proxy cleared on {}", services.join(", ")))
    }
}
