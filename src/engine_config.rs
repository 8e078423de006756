//! The JSON document handed to the engine with `-config`.
//!
//! [`build`] is a pure function of the profile and the routing settings; the
//! serialized form has sorted keys, so equal inputs give equal bytes.

use serde::Serialize;

use crate::{
    profile::{Network, Profile, Protocol, TlsMode},
    settings::{RoutingMode, RoutingSettings, to_sorted_json},
};

pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";

const PRIVATE_IP: &str = "geoip:private";
const REGION_IP: &str = "geoip:cn";
const REGION_DOMAIN: &str = "geosite:cn";
const ADS_DOMAIN: &str = "geosite:category-ads-all";
const DEFAULT_SHADOWSOCKS_METHOD: &str = "aes-256-gcm";

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    pub log: LogSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
}

impl ConfigDocument {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        to_sorted_json(self)
    }

    #[cfg(test)]
    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|outbound| outbound.tag == tag)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LogSection {
    pub level: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Inbound {
    pub listen: String,
    pub port: u16,
    pub protocol: &'static str,
    pub settings: InboundSettings,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InboundSettings {
    pub auth: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<bool>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: &'static str,
    pub protocol: &'static str,
    pub settings: OutboundSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vnext { vnext: Vec<VnextServer> },
    Servers { servers: Vec<Server> },
    Empty {},
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<User>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<&'static str>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Server {
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub password: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<TlsMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<PathSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<PathSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<XhttpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xtls_settings: Option<XtlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PathSettings {
    pub path: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct XhttpSettings {
    pub mode: String,
    pub path: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub fingerprint: String,
    pub alpn: Vec<String>,
    pub server_name: String,
    pub allow_insecure: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct XtlsSettings {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub short_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub spider_x: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    pub outbound_tag: &'static str,
}

impl RoutingRule {
    fn ip(patterns: Vec<String>, outbound_tag: &'static str) -> Self {
        Self {
            kind: "field",
            ip: Some(patterns),
            domain: None,
            outbound_tag,
        }
    }

    fn domain(patterns: Vec<String>, outbound_tag: &'static str) -> Self {
        Self {
            kind: "field",
            ip: None,
            domain: Some(patterns),
            outbound_tag,
        }
    }
}

pub fn build(profile: &Profile, settings: &RoutingSettings) -> ConfigDocument {
    log::debug!(
        "[engine_config] profile={} protocol={} network={} tls={} mode={}",
        profile.name,
        profile.protocol,
        profile.network,
        profile.tls_mode,
        settings.mode,
    );

    let proxy = proxy_outbound(profile);
    let direct = Outbound {
        tag: DIRECT_TAG,
        protocol: "freedom",
        settings: OutboundSettings::Empty {},
        stream_settings: None,
    };
    let block = Outbound {
        tag: BLOCK_TAG,
        protocol: "blackhole",
        settings: OutboundSettings::Empty {},
        stream_settings: None,
    };

    // Engines treat the first outbound as the default route.
    let outbounds = match settings.mode {
        RoutingMode::Global | RoutingMode::BypassLocalRegion => vec![proxy, direct, block],
        RoutingMode::Direct => vec![direct, proxy, block],
    };

    let routing = match settings.mode {
        RoutingMode::Direct => None,
        mode => Some(Routing {
            domain_strategy: settings.domain_strategy.clone(),
            rules: routing_rules(mode, settings),
        }),
    };

    ConfigDocument {
        log: LogSection {
            level: settings.log_level.clone(),
        },
        inbounds: vec![
            Inbound {
                listen: settings.socks_host.clone(),
                port: settings.socks_port,
                protocol: "socks",
                settings: InboundSettings {
                    auth: "noauth",
                    udp: Some(settings.socks_udp_enabled),
                },
            },
            Inbound {
                listen: settings.http_host.clone(),
                port: settings.http_port,
                protocol: "http",
                settings: InboundSettings {
                    auth: "noauth",
                    udp: None,
                },
            },
        ],
        outbounds,
        routing,
    }
}

fn proxy_outbound(profile: &Profile) -> Outbound {
    let (settings, stream_settings) = match profile.protocol {
        Protocol::Vmess => (
            OutboundSettings::Vnext {
                vnext: vec![VnextServer {
                    address: profile.address.clone(),
                    port: profile.port,
                    users: vec![User {
                        id: profile.user_id.clone(),
                        alter_id: Some(profile.alter_id),
                        security: Some(profile.security.clone()),
                        encryption: None,
                    }],
                }],
            },
            Some(stream_settings(profile)),
        ),
        Protocol::Vless => (
            OutboundSettings::Vnext {
                vnext: vec![VnextServer {
                    address: profile.address.clone(),
                    port: profile.port,
                    users: vec![User {
                        id: profile.user_id.clone(),
                        alter_id: None,
                        security: None,
                        encryption: Some("none"),
                    }],
                }],
            },
            Some(stream_settings(profile)),
        ),
        Protocol::Trojan => (
            OutboundSettings::Servers {
                servers: vec![Server {
                    address: profile.address.clone(),
                    port: profile.port,
                    method: None,
                    password: profile.password.clone(),
                }],
            },
            Some(stream_settings(profile)),
        ),
        Protocol::Shadowsocks => {
            let method = if profile.method.trim().is_empty() {
                DEFAULT_SHADOWSOCKS_METHOD.to_string()
            } else {
                profile.method.clone()
            };
            (
                OutboundSettings::Servers {
                    servers: vec![Server {
                        address: profile.address.clone(),
                        port: profile.port,
                        method: Some(method),
                        password: profile.password.clone(),
                    }],
                },
                None,
            )
        }
    };

    Outbound {
        tag: PROXY_TAG,
        protocol: profile.protocol.as_str(),
        settings,
        stream_settings,
    }
}

fn stream_settings(profile: &Profile) -> StreamSettings {
    let mut stream = StreamSettings {
        network: profile.network,
        ..StreamSettings::default()
    };
    let path = profile.path.clone();

    match profile.network {
        Network::Ws if !path.is_empty() => stream.ws_settings = Some(PathSettings { path }),
        Network::H2 if !path.is_empty() => stream.http_settings = Some(PathSettings { path }),
        Network::Grpc if !path.is_empty() => {
            stream.grpc_settings = Some(GrpcSettings { service_name: path })
        }
        // Unlike the other transports the xhttp block is always written.
        Network::Xhttp => {
            stream.xhttp_settings = Some(XhttpSettings {
                mode: profile.xhttp_mode.clone(),
                path,
            })
        }
        _ => {}
    }

    match profile.tls_mode {
        TlsMode::None => {}
        TlsMode::Tls => {
            stream.security = Some(TlsMode::Tls);
            stream.tls_settings = Some(TlsSettings {
                fingerprint: profile.fingerprint.clone(),
                alpn: Vec::new(),
                server_name: profile.host.clone(),
                allow_insecure: profile.allow_insecure,
            });
        }
        TlsMode::Xtls => {
            stream.security = Some(TlsMode::Xtls);
            stream.xtls_settings = Some(XtlsSettings {
                server_name: profile.host.clone(),
            });
        }
        TlsMode::Reality => {
            stream.security = Some(TlsMode::Reality);
            stream.reality_settings = Some(RealitySettings {
                server_name: profile.host.clone(),
                public_key: profile.public_key.clone(),
                short_id: profile.short_id.clone(),
                spider_x: profile.spider_x.clone(),
                fingerprint: profile.fingerprint.clone(),
            });
        }
    }

    stream
}

fn routing_rules(mode: RoutingMode, settings: &RoutingSettings) -> Vec<RoutingRule> {
    let mut rules = match mode {
        RoutingMode::Global => vec![RoutingRule::ip(vec![PRIVATE_IP.into()], DIRECT_TAG)],
        RoutingMode::Direct => Vec::new(),
        RoutingMode::BypassLocalRegion => vec![
            RoutingRule::ip(vec![PRIVATE_IP.into()], DIRECT_TAG),
            RoutingRule::ip(vec![REGION_IP.into()], DIRECT_TAG),
            RoutingRule::domain(vec![REGION_DOMAIN.into()], DIRECT_TAG),
            RoutingRule::domain(vec![ADS_DOMAIN.into()], BLOCK_TAG),
        ],
    };

    for (text, tag) in [
        (&settings.custom_proxy_rules, PROXY_TAG),
        (&settings.custom_direct_rules, DIRECT_TAG),
        (&settings.custom_block_rules, BLOCK_TAG),
    ] {
        let patterns = rule_lines(text);
        if !patterns.is_empty() {
            rules.push(RoutingRule::domain(patterns, tag));
        }
    }

    rules
}

/// One pattern per line; blank lines are ignored.
pub fn rule_lines(text: &str) -> Vec<String> {
    text.split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::share_link;

    fn document_json(profile: &Profile, settings: &RoutingSettings) -> Value {
        let text = build(profile, settings).to_json().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    fn settings_with_mode(mode: RoutingMode) -> RoutingSettings {
        RoutingSettings {
            mode,
            ..RoutingSettings::default()
        }
    }

    #[test]
    fn every_scheme_produces_matching_proxy_outbound() {
        let links = [
            (
                "vmess://eyJhZGQiOiJ2bS5leGFtcGxlIiwiaWQiOiJiODMxMzgxZC02MzI0LTRkNTMtYWQ0Zi04Y2RhNDhiMzA4MTEifQ==",
                "vmess",
            ),
            (
                "vless://b831381d-6324-4d53-ad4f-8cda48b30811@vl.example:443?security=tls",
                "vless",
            ),
            ("trojan://secret@tj.example:443?security=tls", "trojan"),
            ("ss://aes-256-gcm:secret@ss.example:8388", "shadowsocks"),
        ];
        for (link, protocol) in links {
            let profile = share_link::parse(link).unwrap();
            let document = build(&profile, &RoutingSettings::default());
            let proxy = document.outbound(PROXY_TAG).unwrap();
            assert_eq!(proxy.protocol, protocol, "{link}");
        }
    }

    #[test]
    fn identical_inputs_give_identical_bytes() {
        let profile = Profile::sample();
        let settings = RoutingSettings {
            custom_block_rules: "ads.example\r\ntracker.example".into(),
            ..settings_with_mode(RoutingMode::BypassLocalRegion)
        };
        let first = build(&profile, &settings).to_json().unwrap();
        let second = build(&profile, &settings).to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn direct_mode_omits_routing_and_leads_with_direct() {
        let value = document_json(&Profile::sample(), &settings_with_mode(RoutingMode::Direct));
        assert!(value.get("routing").is_none());
        assert_eq!(value["outbounds"][0]["tag"], "direct");
        assert_eq!(value["outbounds"][1]["tag"], "proxy");
        assert_eq!(value["outbounds"][2]["tag"], "block");
    }

    #[test]
    fn global_mode_routes_private_ip_direct() {
        let value = document_json(&Profile::sample(), &settings_with_mode(RoutingMode::Global));
        assert_eq!(value["outbounds"][0]["tag"], "proxy");
        assert_eq!(value["routing"]["domainStrategy"], "IPIfNonMatch");
        assert_eq!(
            value["routing"]["rules"],
            json!([{"type": "field", "ip": ["geoip:private"], "outboundTag": "direct"}])
        );
    }

    #[test]
    fn bypass_mode_has_four_fixed_rules_in_order() {
        let value = document_json(
            &Profile::sample(),
            &settings_with_mode(RoutingMode::BypassLocalRegion),
        );
        assert_eq!(value["outbounds"][0]["tag"], "proxy");
        assert_eq!(
            value["routing"]["rules"],
            json!([
                {"type": "field", "ip": ["geoip:private"], "outboundTag": "direct"},
                {"type": "field", "ip": ["geoip:cn"], "outboundTag": "direct"},
                {"type": "field", "domain": ["geosite:cn"], "outboundTag": "direct"},
                {"type": "field", "domain": ["geosite:category-ads-all"], "outboundTag": "block"},
            ])
        );
    }

    #[test]
    fn custom_rules_follow_base_rules() {
        let settings = RoutingSettings {
            custom_proxy_rules: "  google.com \n\n domain:github.com\r".into(),
            custom_direct_rules: "\n \r\n".into(),
            custom_block_rules: "ads.example".into(),
            ..settings_with_mode(RoutingMode::Global)
        };
        let value = document_json(&Profile::sample(), &settings);
        let rules = value["routing"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(
            rules[1],
            json!({
                "type": "field",
                "domain": ["google.com", "domain:github.com"],
                "outboundTag": "proxy",
            })
        );
        assert_eq!(
            rules[2],
            json!({"type": "field", "domain": ["ads.example"], "outboundTag": "block"})
        );
    }

    #[test]
    fn ws_path_and_empty_xhttp_block() {
        let ws = Profile {
            network: Network::Ws,
            path: "/xyz".into(),
            ..Profile::sample()
        };
        let value = document_json(&ws, &RoutingSettings::default());
        assert_eq!(
            value["outbounds"][0]["streamSettings"]["wsSettings"]["path"],
            "/xyz"
        );

        let xhttp = Profile {
            network: Network::Xhttp,
            ..Profile::sample()
        };
        let value = document_json(&xhttp, &RoutingSettings::default());
        assert_eq!(
            value["outbounds"][0]["streamSettings"]["xhttpSettings"],
            json!({"mode": "", "path": ""})
        );
    }

    #[test]
    fn empty_ws_path_omits_block() {
        let ws = Profile {
            network: Network::Ws,
            ..Profile::sample()
        };
        let value = document_json(&ws, &RoutingSettings::default());
        let stream = &value["outbounds"][0]["streamSettings"];
        assert_eq!(stream["network"], "ws");
        assert!(stream.get("wsSettings").is_none());
    }

    #[test]
    fn grpc_path_becomes_service_name() {
        let grpc = Profile {
            network: Network::Grpc,
            path: "tunnel".into(),
            ..Profile::sample()
        };
        let value = document_json(&grpc, &RoutingSettings::default());
        assert_eq!(
            value["outbounds"][0]["streamSettings"]["grpcSettings"],
            json!({"serviceName": "tunnel"})
        );
    }

    #[test]
    fn tls_block_always_has_defaults() {
        let value = document_json(&Profile::sample(), &RoutingSettings::default());
        let stream = &value["outbounds"][0]["streamSettings"];
        assert_eq!(stream["security"], "tls");
        assert_eq!(
            stream["tlsSettings"],
            json!({"fingerprint": "", "alpn": [], "serverName": "", "allowInsecure": false})
        );
    }

    #[test]
    fn xtls_omits_empty_server_name() {
        let xtls = Profile {
            tls_mode: TlsMode::Xtls,
            ..Profile::sample()
        };
        let value = document_json(&xtls, &RoutingSettings::default());
        assert_eq!(value["outbounds"][0]["streamSettings"]["xtlsSettings"], json!({}));
    }

    #[test]
    fn reality_includes_only_present_fields() {
        let reality = Profile {
            tls_mode: TlsMode::Reality,
            host: "www.example.com".into(),
            public_key: "PUBKEY".into(),
            fingerprint: "chrome".into(),
            ..Profile::sample()
        };
        let value = document_json(&reality, &RoutingSettings::default());
        assert_eq!(
            value["outbounds"][0]["streamSettings"]["realitySettings"],
            json!({"serverName": "www.example.com", "publicKey": "PUBKEY", "fingerprint": "chrome"})
        );
    }

    #[test]
    fn outbound_settings_shapes() {
        let vmess = document_json(&Profile::sample(), &RoutingSettings::default());
        assert_eq!(
            vmess["outbounds"][0]["settings"]["vnext"][0]["users"][0],
            json!({"id": "12345678-1234-1234-1234-123456789abc", "alterId": 0, "security": "auto"})
        );
        assert_eq!(vmess["outbounds"][1]["settings"], json!({}));
        assert_eq!(vmess["outbounds"][2]["protocol"], "blackhole");

        let shadowsocks = Profile {
            address: "ss.example".into(),
            port: 8388,
            password: "pw".into(),
            ..Profile::new(Protocol::Shadowsocks)
        };
        let value = document_json(&shadowsocks, &RoutingSettings::default());
        let proxy = &value["outbounds"][0];
        assert!(proxy.get("streamSettings").is_none());
        assert_eq!(
            proxy["settings"]["servers"][0],
            json!({
                "address": "ss.example",
                "port": 8388,
                "method": "aes-256-gcm",
                "password": "pw",
            })
        );
    }

    #[test]
    fn inbounds_follow_listener_settings() {
        let settings = RoutingSettings {
            socks_host: "0.0.0.0".into(),
            socks_port: 7890,
            socks_udp_enabled: false,
            http_port: 7891,
            log_level: "debug".into(),
            ..RoutingSettings::default()
        };
        let value = document_json(&Profile::sample(), &settings);
        assert_eq!(value["log"]["level"], "debug");
        assert_eq!(
            value["inbounds"],
            json!([
                {
                    "listen": "0.0.0.0",
                    "port": 7890,
                    "protocol": "socks",
                    "settings": {"auth": "noauth", "udp": false},
                },
                {
                    "listen": "127.0.0.1",
                    "port": 7891,
                    "protocol": "http",
                    "settings": {"auth": "noauth"},
                },
            ])
        );
    }
}
