use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    config::ProxyConfig,
    probe::{CommandOutput, CommandRunner, ProbeError},
};

use super::ProxyError;

/// One live address translation rule as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleEntry {
    pub listen_address: String,
    pub listen_port: u16,
    pub connect_address: String,
    pub connect_port: u16,
}

/// The host facility that actually forwards ports and opens the firewall.
///
/// Deleting a rule that does not exist must succeed.
#[async_trait]
pub trait RuleBackend: Send + Sync + fmt::Debug {
    async fn add_translation(
        &self,
        local_port: u16,
        target_address: &str,
        target_port: u16,
    ) -> Result<(), ProxyError>;

    async fn delete_translation(&self, local_port: u16) -> Result<(), ProxyError>;

    async fn add_allow(&self, local_port: u16) -> Result<(), ProxyError>;

    async fn delete_allow(&self, local_port: u16) -> Result<(), ProxyError>;

    async fn list_translations(&self) -> Result<Vec<RuleEntry>, ProxyError>;
}

/// `netsh interface portproxy` plus `netsh advfirewall` rules.
#[derive(Debug, Clone)]
pub struct NetshBackend {
    runner: Arc<dyn CommandRunner>,
    listen_address: String,
    rule_prefix: String,
}

impl NetshBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &ProxyConfig) -> Self {
        Self {
            runner,
            listen_address: config.listen_address.clone(),
            rule_prefix: config.rule_prefix.clone(),
        }
    }

    fn rule_name(&self, local_port: u16) -> String {
        format!("name={} {local_port}", self.rule_prefix)
    }

    async fn netsh(&self, args: Vec<String>) -> Result<CommandOutput, ProbeError> {
        self.runner.run("netsh", &args).await
    }
}

#[async_trait]
impl RuleBackend for NetshBackend {
    async fn add_translation(
        &self,
        local_port: u16,
        target_address: &str,
        target_port: u16,
    ) -> Result<(), ProxyError> {
        let output = self
            .netsh(vec![
                "interface".into(),
                "portproxy".into(),
                "add".into(),
                "v4tov4".into(),
                format!("listenport={local_port}"),
                format!("listenaddress={}", self.listen_address),
                format!("connectport={target_port}"),
                format!("connectaddress={target_address}"),
            ])
            .await
            .map_err(|error| ProxyError::Translation(error.to_string()))?;
        check(output, false).map_err(ProxyError::Translation)
    }

    async fn delete_translation(&self, local_port: u16) -> Result<(), ProxyError> {
        let output = self
            .netsh(vec![
                "interface".into(),
                "portproxy".into(),
                "delete".into(),
                "v4tov4".into(),
                format!("listenport={local_port}"),
                format!("listenaddress={}", self.listen_address),
            ])
            .await
            .map_err(|error| ProxyError::Translation(error.to_string()))?;
        check(output, true).map_err(ProxyError::Translation)
    }

    async fn add_allow(&self, local_port: u16) -> Result<(), ProxyError> {
        let output = self
            .netsh(vec![
                "advfirewall".into(),
                "firewall".into(),
                "add".into(),
                "rule".into(),
                self.rule_name(local_port),
                "dir=in".into(),
                "action=allow".into(),
                "protocol=TCP".into(),
                format!("localport={local_port}"),
            ])
            .await
            .map_err(|error| ProxyError::Allow(error.to_string()))?;
        check(output, false).map_err(ProxyError::Allow)
    }

    async fn delete_allow(&self, local_port: u16) -> Result<(), ProxyError> {
        let output = self
            .netsh(vec![
                "advfirewall".into(),
                "firewall".into(),
                "delete".into(),
                "rule".into(),
                self.rule_name(local_port),
            ])
            .await
            .map_err(|error| ProxyError::Allow(error.to_string()))?;
        check(output, true).map_err(ProxyError::Allow)
    }

    async fn list_translations(&self) -> Result<Vec<RuleEntry>, ProxyError> {
        let output = self
            .netsh(vec![
                "interface".into(),
                "portproxy".into(),
                "show".into(),
                "v4tov4".into(),
            ])
            .await
            .map_err(|error| ProxyError::Listing(error.to_string()))?;
        if !output.success() {
            return Err(ProxyError::Listing(describe(&output)));
        }
        Ok(parse_portproxy_show(&output.stdout))
    }
}

fn check(output: CommandOutput, absence_is_ok: bool) -> Result<(), String> {
    if output.success() || (absence_is_ok && reports_absence(&output)) {
        Ok(())
    } else {
        Err(describe(&output))
    }
}

fn reports_absence(output: &CommandOutput) -> bool {
    let text = format!("{} {}", output.stdout, output.stderr).to_lowercase();
    text.contains("cannot find") || text.contains("no rules match") || text.contains("not found")
}

fn describe(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    let detail = if stderr.is_empty() {
        output.stdout.trim()
    } else {
        stderr
    };
    format!("exit status {:?}: {detail}", output.code)
}

/// Rows of `netsh interface portproxy show v4tov4` below the `Listen on` banner.
pub(crate) fn parse_portproxy_show(output: &str) -> Vec<RuleEntry> {
    output
        .lines()
        .skip_while(|line| !line.contains("Listen on"))
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("---"))
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() != 4 {
                return None;
            }
            Some(RuleEntry {
                listen_address: columns[0].to_string(),
                listen_port: columns[1].parse().ok()?,
                connect_address: columns[2].to_string(),
                connect_port: columns[3].parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::atomic::{AtomicBool, Ordering},
    };

    use parking_lot::Mutex;

    use super::*;

    /// Rule set kept in memory, with switchable failures per half.
    #[derive(Debug, Default)]
    pub struct MemoryRules {
        translations: Mutex<BTreeMap<u16, RuleEntry>>,
        allows: Mutex<BTreeSet<u16>>,
        pub fail_translation: AtomicBool,
        pub fail_allow: AtomicBool,
        pub fail_listing: AtomicBool,
    }

    impl MemoryRules {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn has_translation(&self, port: u16) -> bool {
            self.translations.lock().contains_key(&port)
        }

        pub fn has_allow(&self, port: u16) -> bool {
            self.allows.lock().contains(&port)
        }

        pub fn set_failing(&self, translation: bool, allow: bool) {
            self.fail_translation.store(translation, Ordering::SeqCst);
            self.fail_allow.store(allow, Ordering::SeqCst);
        }

        /// A rule someone created by hand, bypassing the proxy table.
        pub fn inject(&self, local_port: u16, target_address: &str, target_port: u16) {
            self.translations.lock().insert(
                local_port,
                RuleEntry {
                    listen_address: "0.0.0.0".to_string(),
                    listen_port: local_port,
                    connect_address: target_address.to_string(),
                    connect_port: target_port,
                },
            );
        }
    }

    #[async_trait]
    impl RuleBackend for MemoryRules {
        async fn add_translation(
            &self,
            local_port: u16,
            target_address: &str,
            target_port: u16,
        ) -> Result<(), ProxyError> {
            if self.fail_translation.load(Ordering::SeqCst) {
                return Err(ProxyError::Translation("access denied".to_string()));
            }
            self.inject(local_port, target_address, target_port);
            Ok(())
        }

        async fn delete_translation(&self, local_port: u16) -> Result<(), ProxyError> {
            self.translations.lock().remove(&local_port);
            Ok(())
        }

        async fn add_allow(&self, local_port: u16) -> Result<(), ProxyError> {
            if self.fail_allow.load(Ordering::SeqCst) {
                return Err(ProxyError::Allow("access denied".to_string()));
            }
            self.allows.lock().insert(local_port);
            Ok(())
        }

        async fn delete_allow(&self, local_port: u16) -> Result<(), ProxyError> {
            self.allows.lock().remove(&local_port);
            Ok(())
        }

        async fn list_translations(&self) -> Result<Vec<RuleEntry>, ProxyError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(ProxyError::Listing("netsh unavailable".to_string()));
            }
            Ok(self.translations.lock().values().cloned().collect())
        }
    }
}
