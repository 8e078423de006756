//! Decoding of `vmess://`, `vless://`, `trojan://` and `ss://` share links,
//! plus the profile JSON produced by `v2rayctl show`.
//!
//! Parsing is pure: nothing here touches the profile store.

use std::collections::HashMap;

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use url::{Host, Url};

use crate::{
    error::ParseError,
    profile::{Network, Profile, Protocol, TlsMode},
};

const SHADOWSOCKS_DEFAULT_PORT: u16 = 8388;
const DEFAULT_PORT: u16 = 443;

pub fn parse(raw_text: &str) -> Result<Profile, ParseError> {
    let text = raw_text.trim();
    let lower = text.to_ascii_lowercase();

    if let Some(rest) = strip_scheme(text, &lower, "vmess://") {
        return parse_vmess(rest);
    }
    if lower.starts_with("vless://") {
        return parse_vless(text);
    }
    if lower.starts_with("trojan://") {
        return parse_trojan(text);
    }
    if let Some(rest) = strip_scheme(text, &lower, "ss://")
        .or_else(|| strip_scheme(text, &lower, "shadowsocks://"))
    {
        return parse_shadowsocks(rest);
    }

    parse_profile_json(text).ok_or(ParseError::UnrecognizedFormat)
}

fn strip_scheme<'a>(text: &'a str, lower: &str, scheme: &str) -> Option<&'a str> {
    lower.starts_with(scheme).then(|| &text[scheme.len()..])
}

fn parse_vmess(payload: &str) -> Result<Profile, ParseError> {
    let unescaped = percent_decode_str(payload).decode_utf8_lossy().into_owned();
    let decoded = match decode_base64_to_string(&unescaped) {
        Some(decoded) => decoded,
        // Some exporters skip the base64 step and put the JSON in directly.
        None if unescaped.trim_start().starts_with('{') => unescaped,
        None => {
            return Err(ParseError::InvalidBase64(
                "vmess payload is not base64".into(),
            ));
        }
    };

    let object: serde_json::Map<String, Value> = serde_json::from_str(&decoded)
        .map_err(|error| ParseError::InvalidJson(error.to_string()))?;

    let field = |key: &str| -> Option<String> {
        match object.get(key)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    };

    let port_text = field("port")
        .filter(|port| !port.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PORT.to_string());
    let port = port_text
        .trim()
        .parse::<u16>()
        .map_err(|_| ParseError::InvalidPort(port_text.clone()))?;
    let alter_id = field("aid")
        .unwrap_or_else(|| "0".into())
        .trim()
        .parse::<u32>()
        .unwrap_or(0);

    let network = field("net")
        .unwrap_or_default()
        .parse::<Network>()
        .map_err(ParseError::InvalidUri)?;
    let tls_mode = field("tls")
        .unwrap_or_default()
        .parse::<TlsMode>()
        .map_err(ParseError::InvalidUri)?;

    let mut profile = Profile::new(Protocol::Vmess);
    profile.name = non_empty_or(field("ps"), Protocol::Vmess);
    profile.address = field("add").unwrap_or_default();
    profile.port = port;
    profile.user_id = field("id").unwrap_or_default();
    profile.alter_id = alter_id;
    profile.security = field("scy")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "auto".into());
    profile.network = network;
    profile.path = field("path").unwrap_or_default();
    profile.host = field("host").unwrap_or_default();
    profile.tls_mode = tls_mode;
    profile.fingerprint = field("fp").unwrap_or_default();

    log::debug!(
        "[share_link] vmess {} ({}, net={}, tls={})",
        profile.name,
        profile.endpoint(),
        profile.network,
        profile.tls_mode,
    );
    Ok(profile)
}

fn parse_vless(link: &str) -> Result<Profile, ParseError> {
    let url = Url::parse(link).map_err(|error| ParseError::InvalidUri(error.to_string()))?;
    let params = query_map(&url);

    let mut profile = Profile::new(Protocol::Vless);
    profile.name = fragment_name(&url, Protocol::Vless);
    profile.address = host_of(&url)?;
    profile.port = url.port().unwrap_or(DEFAULT_PORT);
    profile.user_id = decode_component(url.username());
    apply_transport(&mut profile, &params)?;

    log::debug!(
        "[share_link] vless {} ({}, net={}, security={})",
        profile.name,
        profile.endpoint(),
        profile.network,
        profile.tls_mode,
    );
    Ok(profile)
}

fn parse_trojan(link: &str) -> Result<Profile, ParseError> {
    let url = Url::parse(link).map_err(|error| ParseError::InvalidUri(error.to_string()))?;
    let params = query_map(&url);

    let mut password = decode_component(url.username());
    if let Some(rest) = url.password() {
        password = format!("{password}:{}", decode_component(rest));
    }

    let mut profile = Profile::new(Protocol::Trojan);
    profile.name = fragment_name(&url, Protocol::Trojan);
    profile.address = host_of(&url)?;
    profile.port = url.port().unwrap_or(DEFAULT_PORT);
    profile.password = password;
    apply_transport(&mut profile, &params)?;

    log::debug!(
        "[share_link] trojan {} ({}, security={})",
        profile.name,
        profile.endpoint(),
        profile.tls_mode,
    );
    Ok(profile)
}

fn parse_shadowsocks(rest: &str) -> Result<Profile, ParseError> {
    let (body, fragment) = rest.split_once('#').unwrap_or((rest, ""));

    // Legacy links base64-encode the whole `method:password@host:port`.
    let body = if body.contains('@') {
        body.to_string()
    } else {
        let (encoded, query) = body.split_once('?').unwrap_or((body, ""));
        let encoded = encoded.trim_end_matches('/');
        let decoded = decode_base64_to_string(encoded).ok_or_else(|| {
            ParseError::InvalidBase64("shadowsocks payload is not base64".into())
        })?;
        if query.is_empty() {
            decoded
        } else {
            format!("{decoded}?{query}")
        }
    };

    let link = if fragment.is_empty() {
        format!("ss://{body}")
    } else {
        format!("ss://{body}#{fragment}")
    };
    let url = Url::parse(&link).map_err(|error| ParseError::InvalidUri(error.to_string()))?;

    let (method, password) = match url.password() {
        Some(password) => (decode_component(url.username()), decode_component(password)),
        None => split_userinfo(&decode_component(url.username())),
    };

    let mut profile = Profile::new(Protocol::Shadowsocks);
    profile.name = fragment_name(&url, Protocol::Shadowsocks);
    profile.address = host_of(&url)?;
    profile.port = url.port().unwrap_or(SHADOWSOCKS_DEFAULT_PORT);
    profile.method = method;
    profile.password = password;

    log::debug!(
        "[share_link] shadowsocks {} ({}, method={})",
        profile.name,
        profile.endpoint(),
        profile.method,
    );
    Ok(profile)
}

/// `method:password`, or SIP002 base64 of the same.
fn split_userinfo(userinfo: &str) -> (String, String) {
    let plain = if userinfo.contains(':') {
        userinfo.to_string()
    } else {
        decode_base64_to_string(userinfo).unwrap_or_else(|| userinfo.to_string())
    };
    match plain.split_once(':') {
        Some((method, password)) => (method.to_string(), password.to_string()),
        None => (plain, String::new()),
    }
}

fn parse_profile_json(text: &str) -> Option<Profile> {
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("protocolType") || !object.contains_key("serverAddress") {
        return None;
    }
    match serde_json::from_value::<Profile>(value) {
        Ok(profile) => Some(profile),
        Err(error) => {
            log::debug!("[share_link] profile JSON rejected: {error}");
            None
        }
    }
}

fn apply_transport(
    profile: &mut Profile,
    params: &HashMap<String, String>,
) -> Result<(), ParseError> {
    let param = |key: &str| params.get(key).cloned().unwrap_or_default();

    profile.network = param("type")
        .parse::<Network>()
        .map_err(ParseError::InvalidUri)?;
    profile.tls_mode = param("security")
        .parse::<TlsMode>()
        .map_err(ParseError::InvalidUri)?;
    profile.path = match profile.network {
        Network::Grpc if params.contains_key("servicename") => param("servicename"),
        _ => param("path"),
    };
    profile.host = params
        .get("sni")
        .or_else(|| params.get("host"))
        .cloned()
        .unwrap_or_default();
    profile.xhttp_mode = param("mode");
    profile.public_key = param("pbk");
    profile.short_id = param("sid");
    profile.spider_x = param("spx");
    profile.fingerprint = param("fp");
    profile.allow_insecure = matches!(
        param("allowinsecure").as_str(),
        "1" | "true" | "True"
    );
    Ok(())
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(key, value)| (key.to_lowercase(), value.into_owned()))
        .collect()
}

fn host_of(url: &Url) -> Result<String, ParseError> {
    match url.host() {
        Some(Host::Ipv6(address)) => Ok(address.to_string()),
        Some(host) => Ok(host.to_string()),
        None => Err(ParseError::InvalidUri(format!(
            "missing server address in '{}://' link",
            url.scheme()
        ))),
    }
}

fn fragment_name(url: &Url, protocol: Protocol) -> String {
    non_empty_or(url.fragment().map(decode_component), protocol)
}

fn non_empty_or(name: Option<String>, protocol: Protocol) -> String {
    name.map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| protocol.as_str().to_string())
}

fn decode_component(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn decode_base64_to_string(input: &str) -> Option<String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    for engine in [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(cleaned.as_bytes())
            && let Ok(text) = String::from_utf8(bytes)
        {
            return Some(text);
        }
    }
    None
}
