//! Local port to guest address mappings, each made of a translation rule and
//! a firewall allow-rule that are applied and removed together.

mod rules;

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

pub use rules::{NetshBackend, RuleBackend};

#[cfg(test)]
pub(crate) use rules::testing;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("address translation rule failed: {0}")]
    Translation(String),
    #[error("firewall allow rule failed: {0}")]
    Allow(String),
    #[error("failed to list proxy rules: {0}")]
    Listing(String),
    #[error("invalid proxy port {0}")]
    InvalidPort(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMapping {
    pub local_port: u16,
    pub target_address: String,
    pub target_port: u16,
    /// Known only for mappings this process established.
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ProxyTable {
    backend: Arc<dyn RuleBackend>,
    mappings: Mutex<HashMap<u16, ProxyMapping>>,
    port_locks: Mutex<HashMap<u16, Arc<AsyncMutex<()>>>>,
}

impl ProxyTable {
    pub fn new(backend: Arc<dyn RuleBackend>) -> Self {
        Self {
            backend,
            mappings: Mutex::new(HashMap::new()),
            port_locks: Mutex::new(HashMap::new()),
        }
    }

    fn port_lock(&self, port: u16) -> Arc<AsyncMutex<()>> {
        self.port_locks
            .lock()
            .entry(port)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Replaces whatever is mapped on `local_port` with a fresh rule pair.
    pub async fn establish(
        &self,
        local_port: u16,
        target_address: &str,
        target_port: u16,
    ) -> Result<ProxyMapping, ProxyError> {
        validate_port(local_port)?;
        validate_port(target_port)?;

        let lock = self.port_lock(local_port);
        let _guard = lock.lock().await;

        self.mappings.lock().remove(&local_port);
        self.teardown(local_port).await;

        self.backend
            .add_translation(local_port, target_address, target_port)
            .await?;

        if let Err(error) = self.backend.add_allow(local_port).await {
            if let Err(cleanup) = self.backend.delete_translation(local_port).await {
                tracing::warn!(port = local_port, error = %cleanup, "failed to roll back translation rule");
            }
            return Err(error);
        }

        let mapping = ProxyMapping {
            local_port,
            target_address: target_address.to_string(),
            target_port,
            created_at: Some(Utc::now()),
        };
        self.mappings.lock().insert(local_port, mapping.clone());
        tracing::info!(
            port = local_port,
            target = %format!("{target_address}:{target_port}"),
            "proxy mapping established"
        );
        Ok(mapping)
    }

    /// Removes both rules for `local_port`. The in-memory record is dropped even on failure.
    pub async fn remove(&self, local_port: u16) -> Result<(), ProxyError> {
        validate_port(local_port)?;

        let lock = self.port_lock(local_port);
        let _guard = lock.lock().await;

        let had_record = self.mappings.lock().remove(&local_port).is_some();

        let translation = self.backend.delete_translation(local_port).await;
        let allow = self.backend.delete_allow(local_port).await;
        if had_record {
            tracing::info!(port = local_port, "proxy mapping removed");
        }
        translation.and(allow)
    }

    /// Mappings currently configured on the host, read live from the backend.
    pub async fn list(&self) -> Result<Vec<ProxyMapping>, ProxyError> {
        let entries = self.backend.list_translations().await?;
        let recorded = self.mappings.lock().clone();

        let mut mappings: Vec<ProxyMapping> = entries
            .into_iter()
            .map(|entry| {
                let created_at = recorded
                    .get(&entry.listen_port)
                    .filter(|mapping| {
                        mapping.target_address == entry.connect_address
                            && mapping.target_port == entry.connect_port
                    })
                    .and_then(|mapping| mapping.created_at);
                ProxyMapping {
                    local_port: entry.listen_port,
                    target_address: entry.connect_address,
                    target_port: entry.connect_port,
                    created_at,
                }
            })
            .collect();
        mappings.sort_by_key(|mapping| mapping.local_port);
        Ok(mappings)
    }

    pub async fn is_proxied(&self, port: u16) -> bool {
        match self.list().await {
            Ok(mappings) => mappings.iter().any(|mapping| mapping.local_port == port),
            Err(error) => {
                tracing::warn!(port, %error, "could not determine proxy state");
                false
            }
        }
    }

    /// Ports this process has established and not yet removed.
    pub fn recorded_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.mappings.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    async fn teardown(&self, local_port: u16) {
        if let Err(error) = self.backend.delete_translation(local_port).await {
            tracing::debug!(port = local_port, %error, "no translation rule to replace");
        }
        if let Err(error) = self.backend.delete_allow(local_port).await {
            tracing::debug!(port = local_port, %error, "no allow rule to replace");
        }
    }
}

fn validate_port(port: u16) -> Result<(), ProxyError> {
    if port == 0 {
        Err(ProxyError::InvalidPort(port))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::MemoryRules;

    fn table() -> (Arc<MemoryRules>, ProxyTable) {
        let rules = Arc::new(MemoryRules::new());
        let table = ProxyTable::new(rules.clone());
        (rules, table)
    }

    #[tokio::test]
    async fn setup_list_clear_round_trip() {
        let (rules, table) = table();

        table
            .establish(5000, "172.20.1.5", 5000)
            .await
            .expect("establish");
        let listed = table.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].local_port, 5000);
        assert_eq!(listed[0].target_address, "172.20.1.5");
        assert!(listed[0].created_at.is_some());
        assert!(rules.has_allow(5000));

        table.remove(5000).await.expect("remove");
        assert!(table.list().await.expect("list").is_empty());
        assert!(!rules.has_allow(5000));
        assert!(table.recorded_ports().is_empty());
    }

    #[tokio::test]
    async fn establishing_again_replaces_the_mapping() {
        let (_rules, table) = table();

        table.establish(5000, "172.20.1.5", 5000).await.expect("first");
        table.establish(5000, "172.20.9.9", 5001).await.expect("second");

        let listed = table.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target_address, "172.20.9.9");
        assert_eq!(listed[0].target_port, 5001);
    }

    #[tokio::test]
    async fn allow_failure_rolls_back_translation() {
        let (rules, table) = table();
        rules.set_failing(false, true);

        let error = table.establish(5000, "172.20.1.5", 5000).await.unwrap_err();
        assert!(matches!(error, ProxyError::Allow(_)));
        assert!(!rules.has_translation(5000));
        assert!(table.recorded_ports().is_empty());
        assert!(!table.is_proxied(5000).await);
    }

    #[tokio::test]
    async fn translation_failure_installs_nothing() {
        let (rules, table) = table();
        rules.set_failing(true, false);

        let error = table.establish(5000, "172.20.1.5", 5000).await.unwrap_err();
        assert!(matches!(error, ProxyError::Translation(_)));
        assert!(!rules.has_allow(5000));
        assert!(table.recorded_ports().is_empty());
    }

    #[tokio::test]
    async fn removing_an_absent_mapping_succeeds() {
        let (_rules, table) = table();
        table.remove(7000).await.expect("absent mapping");
        table.remove(7000).await.expect("still absent");
    }

    #[tokio::test]
    async fn listing_reflects_rules_added_outside_the_table() {
        let (rules, table) = table();
        rules.inject(9000, "10.0.0.7", 80);

        assert!(table.is_proxied(9000).await);
        let listed = table.list().await.expect("list");
        assert_eq!(listed[0].created_at, None);
        assert!(table.recorded_ports().is_empty());
    }

    #[tokio::test]
    async fn different_ports_do_not_block_each_other() {
        let (_rules, table) = table();
        let (first, second) = tokio::join!(
            table.establish(5000, "172.20.1.5", 5000),
            table.establish(8188, "172.20.1.5", 8188)
        );
        first.expect("first");
        second.expect("second");
        assert_eq!(table.recorded_ports(), vec![5000, 8188]);
    }

    #[tokio::test]
    async fn port_zero_is_rejected() {
        let (_rules, table) = table();
        assert!(matches!(
            table.establish(0, "172.20.1.5", 5000).await,
            Err(ProxyError::InvalidPort(0))
        ));
        assert!(matches!(table.remove(0).await, Err(ProxyError::InvalidPort(0))));
    }
}
