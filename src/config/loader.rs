use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{
    error::{ConfigError, ConfigResult},
    model::{
        BridgeConfig, Config, GuestConfig, ProxyConfig, ServiceDescriptor, ServiceName,
        SupervisorConfig,
    },
    raw::{RawConfig, RawGuestConfig, RawProxyConfig, RawService, RawSupervisorConfig},
};
use crate::probe::Scope;

pub fn load_from_path<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
    let path_ref = path.as_ref();
    let raw_contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::ReadFailure {
        path: path_ref.to_path_buf(),
        source,
    })?;
    load_from_str(path_ref, &raw_contents)
}

/// Loads the config at `path`, or the built-in service registry when the file is absent.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        tracing::info!(
            path = %path_ref.display(),
            "configuration file not found; using built-in service registry"
        );
        return Ok(Config::default());
    }
    load_from_path(path_ref)
}

pub fn load_from_str(config_path: &Path, contents: &str) -> ConfigResult<Config> {
    let raw: RawConfig = toml::from_str(contents)?;
    convert_raw_config(config_path, raw)
}

fn convert_raw_config(config_path: &Path, raw: RawConfig) -> ConfigResult<Config> {
    let supervisor = convert_supervisor_config(raw.supervisor)?;
    let guest = convert_guest_config(raw.guest)?;
    let proxy = convert_proxy_config(raw.proxy);
    let services = convert_services(config_path, raw.services)?;

    Ok(Config {
        supervisor,
        guest,
        proxy,
        services,
    })
}

fn convert_supervisor_config(raw: RawSupervisorConfig) -> ConfigResult<SupervisorConfig> {
    let mut config = SupervisorConfig::default();
    if let Some(seconds) = raw.reconcile_interval_seconds {
        config.reconcile_interval = non_zero_seconds(seconds, "reconcile_interval_seconds")?;
    }
    if let Some(seconds) = raw.grace_period_seconds {
        config.grace_period = non_zero_seconds(seconds, "grace_period_seconds")?;
    }
    if let Some(seconds) = raw.probe_timeout_seconds {
        config.probe_timeout = non_zero_seconds(seconds, "probe_timeout_seconds")?;
    }
    if let Some(capacity) = raw.log_capacity {
        if capacity == 0 {
            return Err(ConfigError::ZeroSetting {
                field: "log_capacity",
            });
        }
        config.log_capacity = capacity;
    }
    Ok(config)
}

fn non_zero_seconds(seconds: u64, field: &'static str) -> ConfigResult<Duration> {
    if seconds == 0 {
        return Err(ConfigError::ZeroSetting { field });
    }
    Ok(Duration::from_secs(seconds))
}

fn convert_guest_config(raw: Option<RawGuestConfig>) -> ConfigResult<GuestConfig> {
    let Some(raw) = raw else {
        return Ok(GuestConfig::default());
    };

    if let Some(launcher) = raw.launcher {
        let launcher: Vec<String> = launcher
            .into_iter()
            .filter(|arg| !arg.trim().is_empty())
            .collect();
        if launcher.is_empty() {
            return Err(ConfigError::EmptyLauncher);
        }
        return Ok(GuestConfig { launcher });
    }

    Ok(raw
        .distro
        .as_deref()
        .map(str::trim)
        .filter(|distro| !distro.is_empty())
        .map(GuestConfig::for_distro)
        .unwrap_or_default())
}

fn convert_proxy_config(raw: Option<RawProxyConfig>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    if let Some(raw) = raw {
        if let Some(address) = raw.listen_address {
            config.listen_address = address;
        }
        if let Some(prefix) = raw.rule_prefix {
            config.rule_prefix = prefix;
        }
    }
    config
}

fn convert_services(
    config_path: &Path,
    raw_services: BTreeMap<ServiceName, RawService>,
) -> ConfigResult<Vec<ServiceDescriptor>> {
    if raw_services.is_empty() {
        return Err(ConfigError::NoServices);
    }

    let mut claimed: HashMap<u16, ServiceName> = HashMap::new();
    let mut services = Vec::with_capacity(raw_services.len());
    for (name, raw) in raw_services {
        let descriptor = convert_service(config_path, name, raw)?;
        if let Some(first) = claimed.insert(descriptor.port, descriptor.name.clone()) {
            return Err(ConfigError::DuplicatePort {
                port: descriptor.port,
                first,
                second: descriptor.name,
            });
        }
        services.push(descriptor);
    }
    Ok(services)
}

fn convert_service(
    config_path: &Path,
    name: ServiceName,
    raw: RawService,
) -> ConfigResult<ServiceDescriptor> {
    let RawService {
        start,
        port,
        signature,
        env,
        detect_scope,
        bridge,
    } = raw;

    let start = start
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingField {
            service: name.clone(),
            field: "start",
        })?;
    let start = resolve_start_command(config_path, start);

    let port = port.ok_or_else(|| ConfigError::MissingField {
        service: name.clone(),
        field: "port",
    })?;
    let port = parse_port(&name, "port", port)?;

    let signature = signature
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| start.clone());

    let detect_scope = match detect_scope.as_deref().map(str::to_ascii_lowercase) {
        None => Scope::Host,
        Some(value) => match value.as_str() {
            "host" => Scope::Host,
            "guest" => Scope::Guest,
            _ => {
                return Err(ConfigError::UnknownScope {
                    service: name,
                    value,
                });
            }
        },
    };

    let bridge = match bridge {
        None => None,
        Some(raw_bridge) => {
            let guest_port = raw_bridge
                .guest_port
                .ok_or_else(|| ConfigError::MissingField {
                    service: name.clone(),
                    field: "bridge.guest_port",
                })?;
            Some(BridgeConfig {
                guest_port: parse_port(&name, "bridge.guest_port", guest_port)?,
            })
        }
    };

    let env = convert_env_values(&name, env)?;

    Ok(ServiceDescriptor {
        name,
        start,
        port,
        signature,
        env,
        detect_scope,
        bridge,
    })
}

fn parse_port(service: &str, field: &'static str, value: i64) -> ConfigResult<u16> {
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort {
            service: service.to_string(),
            field,
            value,
        }),
    }
}

fn convert_env_values(
    service: &str,
    map: BTreeMap<String, toml::Value>,
) -> ConfigResult<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    for (key, value) in map {
        let rendered = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            _ => {
                return Err(ConfigError::InvalidEnvValue {
                    service: service.to_string(),
                    key,
                });
            }
        };
        result.insert(key, rendered);
    }
    Ok(result)
}

/// A bare relative script path is anchored to the config file's directory;
/// full command lines are left untouched.
fn resolve_start_command(config_path: &Path, start: String) -> String {
    if start.contains(char::is_whitespace) {
        return start;
    }
    let path = PathBuf::from(&start);
    if path.is_absolute() || (path.components().count() == 1 && !start.contains('.')) {
        return start;
    }

    let base_dir = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    base_dir.join(path).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use tempfile::NamedTempFile;

    fn fixture_path() -> &'static Path {
        Path::new("/srv/guestbridge/guestbridge.toml")
    }

    #[test]
    fn parses_sample_configuration() {
        let toml = r#"
[supervisor]
reconcile_interval_seconds = 3
grace_period_seconds = 7
log_capacity = 250

[guest]
distro = "Debian"

[proxy]
rule_prefix = "bridge"

[service.comfyui]
start = "/opt/comfy/comfyui-start.sh"
port = 8188
env.PYTHONUNBUFFERED = 1

[service.media-api]
start = "start_media-api.sh"
port = 5000
signature = "media_api.main"
detect_scope = "guest"
bridge.guest_port = 5001
"#;

        let config = load_from_str(fixture_path(), toml).expect("config parsed");

        assert_eq!(config.supervisor.reconcile_interval, Duration::from_secs(3));
        assert_eq!(config.supervisor.grace_period, Duration::from_secs(7));
        assert_eq!(config.supervisor.log_capacity, 250);
        assert_eq!(config.guest.launcher[2], "Debian");
        assert_eq!(config.proxy.rule_prefix, "bridge");
        assert_eq!(config.proxy.listen_address, "0.0.0.0");

        assert_eq!(config.services.len(), 2);
        let comfy = &config.services[0];
        assert_eq!(comfy.name, "comfyui");
        assert_eq!(comfy.signature, "/opt/comfy/comfyui-start.sh");
        assert_eq!(comfy.env.get("PYTHONUNBUFFERED"), Some(&"1".to_string()));
        assert_eq!(comfy.working_dir(), Some(Path::new("/opt/comfy")));
        assert!(!comfy.is_bridged());

        let media = &config.services[1];
        assert_eq!(media.start, "/srv/guestbridge/start_media-api.sh");
        assert_eq!(media.signature, "media_api.main");
        assert_eq!(media.detect_scope, Scope::Guest);
        assert_eq!(media.bridge, Some(BridgeConfig { guest_port: 5001 }));
    }

    #[test]
    fn rejects_missing_port() {
        let toml = r#"
[service.worker]
start = "run.sh"
"#;
        let error = load_from_str(fixture_path(), toml).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::MissingField { field: "port", .. }
        ));
    }

    #[test]
    fn rejects_out_of_range_ports() {
        let toml = r#"
[service.worker]
start = "run.sh"
port = 70000
"#;
        let error = load_from_str(fixture_path(), toml).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidPort { value: 70000, .. }));

        let toml = r#"
[service.worker]
start = "run.sh"
port = 0
"#;
        assert!(load_from_str(fixture_path(), toml).is_err());
    }

    #[test]
    fn rejects_duplicate_ports() {
        let toml = r#"
[service.a]
start = "a.sh"
port = 9000

[service.b]
start = "b.sh"
port = 9000
"#;
        let error = load_from_str(fixture_path(), toml).unwrap_err();
        assert!(matches!(error, ConfigError::DuplicatePort { port: 9000, .. }));
    }

    #[test]
    fn rejects_unknown_service_keys() {
        let toml = r#"
[service.a]
start = "a.sh"
port = 9000
restart = "always"
"#;
        assert!(matches!(
            load_from_str(fixture_path(), toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn command_lines_are_not_resolved_as_paths() {
        let toml = r#"
[service.a]
start = "python -m worker"
port = 9000
"#;
        let config = load_from_str(fixture_path(), toml).expect("config parsed");
        assert_eq!(config.services[0].start, "python -m worker");
        assert_eq!(config.services[0].working_dir(), None);
    }

    #[test]
    fn explicit_launcher_overrides_distro() {
        let toml = r#"
[guest]
distro = "Ubuntu"
launcher = ["docker", "exec", "guest", "sh", "-c"]

[service.a]
start = "a.sh"
port = 9000
"#;
        let config = load_from_str(fixture_path(), toml).expect("config parsed");
        assert_eq!(config.guest.launcher[0], "docker");
        assert_eq!(config.guest.launcher.len(), 5);
    }

    #[test]
    fn missing_file_falls_back_to_builtin_registry() {
        let config = load_or_default("/definitely/not/here/guestbridge.toml")
            .expect("default config");
        let names: Vec<_> = config.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["comfyui", "media-api"]);
        assert_eq!(config.supervisor.log_capacity, 1000);
    }

    #[test]
    fn loads_configuration_from_disk() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[service.api]\nstart = \"serve\"\nport = 8080")?;
        let config = load_from_path(file.path())?;
        assert_eq!(config.services[0].port, 8080);
        assert_eq!(config.services[0].start, "serve");
        Ok(())
    }
}
