//! In-memory lifecycle state tracked for each supervised service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServiceName;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Who launched the process currently believed to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Spawned by this supervisor; output is captured.
    Managed,
    /// Found running by signature; nothing is captured.
    External,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub lifecycle: Lifecycle,
    /// Present exactly when `lifecycle` is not `Stopped`.
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ownership: Option<Ownership>,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        self.lifecycle != Lifecycle::Stopped
    }

    pub fn is_external(&self) -> bool {
        self.ownership == Some(Ownership::External)
    }

    pub fn begin(&mut self, pid: u32, ownership: Ownership) {
        self.lifecycle = Lifecycle::Starting;
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
        self.ownership = Some(ownership);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.is_running(),
            lifecycle: self.lifecycle,
            pid: self.pid,
            started_at: self.started_at,
            managed: self.ownership == Some(Ownership::Managed),
        }
    }
}

/// Public view of one service, as carried by status replies and events.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub running: bool,
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub managed: bool,
}

pub type StatusReport = BTreeMap<ServiceName, ServiceStatus>;

/// Whether the guest answers commands, and which guest-side ports are listening.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestReport {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub address: Option<String>,
    pub distros: Vec<String>,
    pub services: BTreeMap<ServiceName, GuestServiceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestServiceStatus {
    pub guest_port: u16,
    /// `None` when the guest could not be asked.
    pub listening: Option<bool>,
}
