use std::{collections::BTreeMap, path::Path, time::Duration};

use crate::probe::Scope;

pub type ServiceName = String;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOG_CAPACITY: usize = 1000;
pub const DEFAULT_GUEST_DISTRO: &str = "Ubuntu";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_RULE_PREFIX: &str = "guestbridge proxy";

#[derive(Debug, Clone)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub guest: GuestConfig,
    pub proxy: ProxyConfig,
    /// Ordered by service name; the order defines the registry indices.
    pub services: Vec<ServiceDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            guest: GuestConfig::default(),
            proxy: ProxyConfig::default(),
            services: default_services(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub reconcile_interval: Duration,
    pub grace_period: Duration,
    pub log_capacity: usize,
    pub probe_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            log_capacity: DEFAULT_LOG_CAPACITY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// Argv prefix that runs one shell command line inside the guest.
    pub launcher: Vec<String>,
}

impl GuestConfig {
    pub fn for_distro(distro: &str) -> Self {
        Self {
            launcher: vec![
                "wsl".to_string(),
                "-d".to_string(),
                distro.to_string(),
                "-e".to_string(),
                "bash".to_string(),
                "-c".to_string(),
            ],
        }
    }
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self::for_distro(DEFAULT_GUEST_DISTRO)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_address: String,
    pub rule_prefix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            rule_prefix: DEFAULT_RULE_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    /// Command line or script path used to launch the worker.
    pub start: String,
    /// Port the worker is expected to listen on, on the host.
    pub port: u16,
    /// Text matched against process command lines to spot running instances.
    pub signature: String,
    pub env: BTreeMap<String, String>,
    pub detect_scope: Scope,
    pub bridge: Option<BridgeConfig>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, start: impl Into<String>, port: u16) -> Self {
        let start = start.into();
        Self {
            name: name.into(),
            signature: start.clone(),
            start,
            port,
            env: BTreeMap::new(),
            detect_scope: Scope::Host,
            bridge: None,
        }
    }

    pub fn with_bridge(mut self, guest_port: u16) -> Self {
        self.bridge = Some(BridgeConfig { guest_port });
        self
    }

    #[cfg(test)]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Directory holding the start script, used as the worker's cwd.
    /// Only known when the command starts with an absolute path.
    pub fn working_dir(&self) -> Option<&Path> {
        let program = self.start.split_whitespace().next()?;
        let program = Path::new(program);
        if !program.is_absolute() {
            return None;
        }
        program
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
    }

    pub fn is_bridged(&self) -> bool {
        self.bridge.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub guest_port: u16,
}

fn default_services() -> Vec<ServiceDescriptor> {
    vec![
        ServiceDescriptor::new("comfyui", "comfyui-start.bat", 8188),
        ServiceDescriptor::new("media-api", "start_media-api.bat", 5000).with_bridge(5000),
    ]
}
