use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing '{field}' for service '{service}'")]
    MissingField {
        service: String,
        field: &'static str,
    },
    #[error("'{field}' for service '{service}' must be a port between 1 and 65535, got {value}")]
    InvalidPort {
        service: String,
        field: &'static str,
        value: i64,
    },
    #[error("unknown detect_scope '{value}' for service '{service}'")]
    UnknownScope { service: String, value: String },
    #[error("environment value for '{service}:{key}' must be a string, number or boolean")]
    InvalidEnvValue { service: String, key: String },
    #[error("services '{first}' and '{second}' both claim port {port}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("setting '{field}' must be greater than zero")]
    ZeroSetting { field: &'static str },
    #[error("guest launcher must contain at least one argument")]
    EmptyLauncher,
    #[error("configuration declares no services")]
    NoServices,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
