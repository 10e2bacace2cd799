use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    CommandOutput, KillReport, NetworkProbe, PortUsage, ProbeError, ProcessInfo, Scope,
};

/// In-memory host and guest with scripted listeners and processes.
/// Clearing the guest address also makes the guest unreachable for commands.
#[derive(Debug)]
pub struct FakeProbe {
    listeners: Mutex<HashMap<(u16, Scope), Vec<u32>>>,
    processes: Mutex<Vec<(Scope, ProcessInfo)>>,
    guest_address: Mutex<Option<IpAddr>>,
    distros: Mutex<Vec<String>>,
    kills: Mutex<Vec<(u16, Scope)>>,
    process_queries: AtomicUsize,
    port_checks: AtomicUsize,
    port_check_delay: Mutex<Option<Duration>>,
    listing_broken: AtomicBool,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            processes: Mutex::new(Vec::new()),
            guest_address: Mutex::new(Some(IpAddr::V4(Ipv4Addr::new(172, 20, 1, 5)))),
            distros: Mutex::new(vec!["Ubuntu".to_string()]),
            kills: Mutex::new(Vec::new()),
            process_queries: AtomicUsize::new(0),
            port_checks: AtomicUsize::new(0),
            port_check_delay: Mutex::new(None),
            listing_broken: AtomicBool::new(false),
        }
    }
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupy(&self, port: u16, scope: Scope, pid: u32) {
        self.listeners
            .lock()
            .entry((port, scope))
            .or_default()
            .push(pid);
    }

    pub fn add_process(&self, scope: Scope, pid: u32, command: &str) {
        self.processes.lock().push((
            scope,
            ProcessInfo {
                pid,
                command: command.to_string(),
            },
        ));
    }

    pub fn remove_process(&self, pid: u32) {
        self.processes.lock().retain(|(_, info)| info.pid != pid);
    }

    pub fn set_guest_address(&self, address: Option<IpAddr>) {
        *self.guest_address.lock() = address;
    }

    pub fn set_distros(&self, distros: &[&str]) {
        *self.distros.lock() = distros.iter().map(|name| name.to_string()).collect();
    }

    /// Every port check sleeps this long before answering.
    pub fn delay_port_checks(&self, delay: Duration) {
        *self.port_check_delay.lock() = Some(delay);
    }

    /// Makes every listing call fail as if the tools were missing.
    pub fn break_listing(&self) {
        self.listing_broken.store(true, Ordering::SeqCst);
    }

    pub fn kills(&self) -> Vec<(u16, Scope)> {
        self.kills.lock().clone()
    }

    pub fn process_queries(&self) -> usize {
        self.process_queries.load(Ordering::SeqCst)
    }

    pub fn port_checks(&self) -> usize {
        self.port_checks.load(Ordering::SeqCst)
    }

    fn guest_down(&self) -> ProbeError {
        ProbeError::GuestUnavailable("fake guest is down".to_string())
    }

    fn unavailable(&self) -> ProbeError {
        ProbeError::Spawn {
            program: "ss".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "fake listing disabled"),
        }
    }
}

#[async_trait]
impl NetworkProbe for FakeProbe {
    async fn is_port_in_use(&self, port: u16, scope: Scope) -> Result<PortUsage, ProbeError> {
        self.port_checks.fetch_add(1, Ordering::SeqCst);
        let delay = *self.port_check_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.listing_broken.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }
        let pids = self
            .listeners
            .lock()
            .get(&(port, scope))
            .cloned()
            .unwrap_or_default();
        Ok(PortUsage {
            in_use: !pids.is_empty(),
            raw: pids
                .iter()
                .map(|pid| format!("LISTEN 0.0.0.0:{port} pid={pid}"))
                .collect::<Vec<_>>()
                .join("\n"),
            pids,
        })
    }

    async fn kill_process_on_port(
        &self,
        port: u16,
        scope: Scope,
    ) -> Result<KillReport, ProbeError> {
        self.kills.lock().push((port, scope));
        if self.listing_broken.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }
        let killed = self
            .listeners
            .lock()
            .remove(&(port, scope))
            .unwrap_or_default();
        let mut processes = self.processes.lock();
        processes.retain(|(_, info)| !killed.contains(&info.pid));
        Ok(KillReport {
            killed,
            failed: Vec::new(),
        })
    }

    async fn list_running_processes_matching(
        &self,
        signature: &str,
        scope: Scope,
    ) -> Vec<ProcessInfo> {
        self.process_queries.fetch_add(1, Ordering::SeqCst);
        let signature = signature.to_lowercase();
        self.processes
            .lock()
            .iter()
            .filter(|(process_scope, info)| {
                *process_scope == scope && info.command.to_lowercase().contains(&signature)
            })
            .map(|(_, info)| info.clone())
            .collect()
    }

    async fn resolve_guest_address(&self) -> Result<IpAddr, ProbeError> {
        (*self.guest_address.lock()).ok_or_else(|| self.guest_down())
    }

    async fn execute_in_guest(&self, command: &str) -> Result<CommandOutput, ProbeError> {
        if self.guest_address.lock().is_none() {
            return Err(self.guest_down());
        }
        Ok(CommandOutput::ok(format!("ran {command}")))
    }

    async fn list_guest_distros(&self) -> Result<Vec<String>, ProbeError> {
        Ok(self.distros.lock().clone())
    }
}
