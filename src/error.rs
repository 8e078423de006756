use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized format: not a vmess/vless/trojan/ss link or profile JSON")]
    UnrecognizedFormat,

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("profile name must not be empty")]
    NameRequired,

    #[error("server address must not be empty")]
    AddressRequired,

    #[error("port must be between 1 and 65535")]
    PortOutOfRange,

    #[error("user id must not be empty")]
    UserIdRequired,

    #[error("user id must be a valid UUID")]
    UserIdNotUuid,

    #[error("{0} password must not be empty")]
    PasswordRequired(&'static str),

    #[error("shadowsocks method must not be empty")]
    MethodRequired,

    #[error("REALITY public key must not be empty")]
    RealityPublicKeyRequired,
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("engine executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("engine configuration file not found: {}", .0.display())]
    ConfigFileNotFound(PathBuf),

    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to write engine configuration {}: {source}", .path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode engine configuration: {0}")]
    ConfigEncode(#[from] serde_json::Error),

    #[error(transparent)]
    Start(#[from] StartError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("no system proxy backend available")]
    NoBackend,

    #[error("{name}: {detail}")]
    Backend { name: String, detail: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode TOML: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("failed to decode TOML: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("profile is invalid: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("a profile named '{0}' already exists")]
    DuplicateName(String),

    #[error("no profile matches '{0}'")]
    NotFound(String),

    #[error("invalid {key} '{value}' (expected one of: {expected})")]
    InvalidSetting {
        key: &'static str,
        value: String,
        expected: String,
    },
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_problem() {
        let error = StoreError::Validation(vec![
            ValidationError::MethodRequired,
            ValidationError::PasswordRequired("shadowsocks"),
        ]);
        assert_eq!(
            error.to_string(),
            "profile is invalid: shadowsocks method must not be empty; \
             shadowsocks password must not be empty"
        );
    }

    #[test]
    fn start_error_is_transparent_inside_connect_error() {
        let error: ConnectError =
            StartError::ExecutableNotFound(PathBuf::from("/nowhere/xray")).into();
        assert_eq!(
            error.to_string(),
            "engine executable not found: /nowhere/xray"
        );
    }
}
