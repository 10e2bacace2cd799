use std::collections::BTreeMap;

use serde::Deserialize;
use toml::Value;

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub supervisor: RawSupervisorConfig,
    #[serde(default)]
    pub guest: Option<RawGuestConfig>,
    #[serde(default)]
    pub proxy: Option<RawProxyConfig>,
    #[serde(default, rename = "service")]
    pub services: BTreeMap<String, RawService>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawSupervisorConfig {
    pub reconcile_interval_seconds: Option<u64>,
    pub grace_period_seconds: Option<u64>,
    pub log_capacity: Option<usize>,
    pub probe_timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawGuestConfig {
    pub distro: Option<String>,
    pub launcher: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawProxyConfig {
    pub listen_address: Option<String>,
    pub rule_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawService {
    pub start: Option<String>,
    pub port: Option<i64>,
    pub signature: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
    pub detect_scope: Option<String>,
    pub bridge: Option<RawBridge>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBridge {
    pub guest_port: Option<i64>,
}
