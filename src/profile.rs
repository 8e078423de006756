use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "shadowsocks",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Kcp,
    Ws,
    H2,
    Quic,
    Grpc,
    Xhttp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Kcp => "kcp",
            Self::Ws => "ws",
            Self::H2 => "h2",
            Self::Quic => "quic",
            Self::Grpc => "grpc",
            Self::Xhttp => "xhttp",
        }
    }
}

impl FromStr for Network {
    type Err = String;

    /// Share links in the wild use `http` for xhttp and `raw` for plain tcp.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" | "raw" => Ok(Self::Tcp),
            "kcp" | "mkcp" => Ok(Self::Kcp),
            "ws" | "websocket" => Ok(Self::Ws),
            "h2" => Ok(Self::H2),
            "quic" => Ok(Self::Quic),
            "grpc" => Ok(Self::Grpc),
            "xhttp" | "http" | "splithttp" => Ok(Self::Xhttp),
            other => Err(format!("unsupported network '{other}'")),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    #[serde(alias = "")]
    None,
    Tls,
    Xtls,
    Reality,
}

impl TlsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::Xtls => "xtls",
            Self::Reality => "reality",
        }
    }
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "tls" => Ok(Self::Tls),
            "xtls" => Ok(Self::Xtls),
            "reality" => Ok(Self::Reality),
            other => Err(format!("unsupported security '{other}'")),
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proxy server endpoint.
///
/// Serialized field names match the profile JSON accepted by
/// [`crate::share_link::parse`], so an exported profile can be re-imported.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "protocolType", default)]
    pub protocol: Protocol,
    #[serde(rename = "serverAddress", default)]
    pub address: String,
    #[serde(rename = "serverPort", default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub alter_id: u32,
    #[serde(default = "default_security")]
    pub security: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub host: String,
    #[serde(rename = "tls", default)]
    pub tls_mode: TlsMode,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(rename = "spiderX", default)]
    pub spider_x: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub xhttp_mode: String,
    #[serde(default)]
    pub is_enabled: bool,
}

fn default_port() -> u16 {
    443
}

fn default_security() -> String {
    "auto".into()
}

impl Profile {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: protocol.as_str().to_string(),
            protocol,
            address: String::new(),
            port: default_port(),
            user_id: String::new(),
            alter_id: 0,
            security: default_security(),
            password: String::new(),
            method: String::new(),
            network: Network::Tcp,
            path: String::new(),
            host: String::new(),
            tls_mode: TlsMode::None,
            allow_insecure: false,
            public_key: String::new(),
            short_id: String::new(),
            spider_x: String::new(),
            fingerprint: String::new(),
            xhttp_mode: String::new(),
            is_enabled: false,
        }
    }

    /// Placeholder written into an empty store so the user has something to edit.
    pub fn sample() -> Self {
        Self {
            name: "Sample profile".into(),
            address: "example.com".into(),
            user_id: "12345678-1234-1234-1234-123456789abc".into(),
            tls_mode: TlsMode::Tls,
            ..Self::new(Protocol::Vmess)
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Every protocol and REALITY rule the profile breaks; empty when usable.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::NameRequired);
        }
        if self.address.trim().is_empty() {
            errors.push(ValidationError::AddressRequired);
        }
        if self.port == 0 {
            errors.push(ValidationError::PortOutOfRange);
        }

        match self.protocol {
            Protocol::Vmess | Protocol::Vless => {
                let user_id = self.user_id.trim();
                if user_id.is_empty() {
                    errors.push(ValidationError::UserIdRequired);
                } else if Uuid::parse_str(user_id).is_err() {
                    errors.push(ValidationError::UserIdNotUuid);
                }
            }
            Protocol::Trojan => {
                if self.password.trim().is_empty() {
                    errors.push(ValidationError::PasswordRequired("trojan"));
                }
            }
            Protocol::Shadowsocks => {
                if self.password.trim().is_empty() {
                    errors.push(ValidationError::PasswordRequired("shadowsocks"));
                }
                if self.method.trim().is_empty() {
                    errors.push(ValidationError::MethodRequired);
                }
            }
        }

        if self.tls_mode == TlsMode::Reality && self.public_key.trim().is_empty() {
            errors.push(ValidationError::RealityPublicKeyRequired);
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_profile_is_valid() {
        assert!(Profile::sample().validate().is_empty());
    }

    #[test]
    fn shadowsocks_without_method_is_rejected() {
        let profile = Profile {
            address: "1.2.3.4".into(),
            password: "secret".into(),
            ..Profile::new(Protocol::Shadowsocks)
        };
        let errors = profile.validate();
        assert!(!errors.is_empty());
        assert!(errors.contains(&ValidationError::MethodRequired));
        assert!(!errors.contains(&ValidationError::PasswordRequired("shadowsocks")));
    }

    #[test]
    fn reality_requires_public_key() {
        let profile = Profile {
            tls_mode: TlsMode::Reality,
            ..Profile::sample()
        };
        assert_eq!(
            profile.validate(),
            vec![ValidationError::RealityPublicKeyRequired]
        );

        let with_key = Profile {
            public_key: "pbk".into(),
            ..profile
        };
        assert!(with_key.validate().is_empty());
    }

    #[test]
    fn vless_user_id_must_be_uuid() {
        let profile = Profile {
            address: "example.com".into(),
            user_id: "not-a-uuid".into(),
            ..Profile::new(Protocol::Vless)
        };
        assert_eq!(profile.validate(), vec![ValidationError::UserIdNotUuid]);
    }

    #[test]
    fn errors_are_aggregated() {
        let profile = Profile {
            name: " ".into(),
            port: 0,
            ..Profile::new(Protocol::Trojan)
        };
        assert_eq!(
            profile.validate(),
            vec![
                ValidationError::NameRequired,
                ValidationError::AddressRequired,
                ValidationError::PortOutOfRange,
                ValidationError::PasswordRequired("trojan"),
            ]
        );
    }

    #[test]
    fn network_aliases_normalize() {
        assert_eq!("http".parse::<Network>(), Ok(Network::Xhttp));
        assert_eq!("RAW".parse::<Network>(), Ok(Network::Tcp));
        assert!("carrier-pigeon".parse::<Network>().is_err());
    }

    #[test]
    fn profile_json_uses_camel_case_names() {
        let json = serde_json::to_value(Profile::sample()).unwrap();
        assert_eq!(json["protocolType"], "vmess");
        assert_eq!(json["serverAddress"], "example.com");
        assert_eq!(json["serverPort"], 443);
        assert_eq!(json["tls"], "tls");
        assert_eq!(json["spiderX"], "");
    }
}
