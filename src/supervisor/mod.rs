//! Service lifecycle supervision.
//!
//! Every transition of one service happens under that service's record lock,
//! and each running instance carries an epoch. Exit watchers, grace timers,
//! bridge setup and reconciliation capture the epoch they were started for
//! and do nothing once it has moved on, which makes cleanup run exactly once.

mod events;
mod guest;
mod process;
mod signal;

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    process::Child,
    sync::Mutex as AsyncMutex,
    task::{JoinHandle, JoinSet},
    time::{MissedTickBehavior, timeout},
};

use crate::{
    config::{ServiceDescriptor, ServiceName, SupervisorConfig},
    logging::{LogBuffer, LogEntry, LogStream},
    probe::{NetworkProbe, Scope},
    proxy::ProxyTable,
    state::{Lifecycle, Ownership, ServiceState, ServiceStatus, StatusReport},
};

pub use events::{BroadcastSink, EventSink, SupervisorEvent};

#[cfg(test)]
pub(crate) use events::testing;

use process::{ManagedChild, ProcessHandle};

/// Index into the fixed service registry built from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(usize);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(i64),
    #[error("line count must be a positive integer, got {0}")]
    InvalidLineCount(i64),
    #[error("missing parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("service '{0}' does not run in the guest")]
    NotInGuest(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {service}: {source}")]
    Spawn {
        service: ServiceName,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { forced: bool },
    NotRunning,
    /// Another stop is in progress and the worker outlived the wait for it.
    StillStopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogQuery {
    Captured(Vec<LogEntry>),
    /// The instance was not spawned here, so there is no output to show.
    External { message: String },
}

#[derive(Debug)]
pub(crate) struct ServiceSlot {
    pub(crate) descriptor: ServiceDescriptor,
    record: AsyncMutex<ServiceRecord>,
    pub(crate) log: Mutex<LogBuffer>,
}

#[derive(Debug, Default)]
struct ServiceRecord {
    state: ServiceState,
    epoch: u64,
    child: Option<ManagedChild>,
}

#[derive(Debug)]
pub struct Supervisor {
    slots: Vec<Arc<ServiceSlot>>,
    probe: Arc<dyn NetworkProbe>,
    proxies: Arc<ProxyTable>,
    events: Arc<dyn EventSink>,
    settings: SupervisorConfig,
    /// Last published status per service; written only under that service's record lock.
    board: Mutex<Vec<ServiceStatus>>,
    env_file: HashMap<String, String>,
}

impl Supervisor {
    pub fn new(
        services: Vec<ServiceDescriptor>,
        settings: SupervisorConfig,
        probe: Arc<dyn NetworkProbe>,
        proxies: Arc<ProxyTable>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let slots: Vec<_> = services
            .into_iter()
            .map(|descriptor| {
                Arc::new(ServiceSlot {
                    descriptor,
                    record: AsyncMutex::new(ServiceRecord::default()),
                    log: Mutex::new(LogBuffer::new(settings.log_capacity)),
                })
            })
            .collect();
        let board = Mutex::new(vec![ServiceStatus::default(); slots.len()]);

        Self {
            slots,
            probe,
            proxies,
            events,
            settings,
            board,
            env_file: HashMap::new(),
        }
    }

    /// Variables merged beneath each service's own environment table.
    pub fn with_env_file(mut self, env_file: HashMap<String, String>) -> Self {
        self.env_file = env_file;
        self
    }

    pub fn proxies(&self) -> &Arc<ProxyTable> {
        &self.proxies
    }

    pub fn resolve(&self, name: &str) -> Result<ServiceId, ValidationError> {
        self.slots
            .iter()
            .position(|slot| slot.descriptor.name == name)
            .map(ServiceId)
            .ok_or_else(|| ValidationError::UnknownService(name.to_string()))
    }

    pub fn service_names(&self) -> Vec<ServiceName> {
        self.slots
            .iter()
            .map(|slot| slot.descriptor.name.clone())
            .collect()
    }

    pub fn descriptor(&self, id: ServiceId) -> &ServiceDescriptor {
        &self.slot(id).descriptor
    }

    fn slot(&self, id: ServiceId) -> &Arc<ServiceSlot> {
        &self.slots[id.0]
    }

    /// Last published status of every service, without reconciling.
    pub fn snapshot(&self) -> StatusReport {
        self.report(&self.board.lock())
    }

    fn report(&self, board: &[ServiceStatus]) -> StatusReport {
        self.slots
            .iter()
            .zip(board)
            .map(|(slot, status)| (slot.descriptor.name.clone(), status.clone()))
            .collect()
    }

    fn publish(&self, id: ServiceId, state: &ServiceState) {
        let mut board = self.board.lock();
        board[id.0] = state.status();
        let report = self.report(&board);
        self.events.status_changed(&report);
    }

    fn record_error(&self, id: ServiceId, message: String) {
        process::record_line(
            self.slot(id),
            self.events.as_ref(),
            LogEntry::new(LogStream::Error, message),
        );
    }

    pub async fn start(self: &Arc<Self>, id: ServiceId) -> Result<StartOutcome, SupervisorError> {
        let slot = Arc::clone(self.slot(id));
        let descriptor = &slot.descriptor;
        let mut record = slot.record.lock().await;

        if record.state.is_running() {
            tracing::info!(service = %descriptor.name, pid = ?record.state.pid, "service already running");
            return Ok(StartOutcome::AlreadyRunning {
                pid: record.state.pid,
            });
        }

        self.prepare_ports(descriptor).await;

        let spawned = process::worker_command(descriptor, &self.env_file)
            .spawn()
            .and_then(|child| match child.id() {
                Some(pid) => Ok((child, pid)),
                None => Err(std::io::Error::other("worker exited before its pid was read")),
            });
        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                tracing::error!(error = %source, service = %descriptor.name, "failed to spawn worker");
                self.record_error(id, format!("failed to start: {source}"));
                return Err(SupervisorError::Spawn {
                    service: descriptor.name.clone(),
                    source,
                });
            }
        };

        record.epoch += 1;
        let epoch = record.epoch;
        record.state.begin(pid, Ownership::Managed);
        let handle = Arc::new(ProcessHandle::new());
        record.child = Some(ManagedChild {
            pid,
            handle: handle.clone(),
        });

        if let Some(stdout) = child.stdout.take() {
            process::spawn_stream_task(slot.clone(), self.events.clone(), LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            process::spawn_stream_task(slot.clone(), self.events.clone(), LogStream::Stderr, stderr);
        }
        self.spawn_exit_watcher(id, epoch, child, handle);

        record.state.lifecycle = Lifecycle::Running;
        self.publish(id, &record.state);
        tracing::info!(service = %descriptor.name, pid, "service started");
        drop(record);

        if descriptor.is_bridged() {
            self.spawn_bridge_task(id, epoch);
        }

        Ok(StartOutcome::Started { pid })
    }

    async fn prepare_ports(&self, descriptor: &ServiceDescriptor) {
        if let Some(bridge) = descriptor.bridge {
            if let Err(error) = self.proxies.remove(descriptor.port).await {
                tracing::warn!(%error, service = %descriptor.name, port = descriptor.port, "failed to remove stale proxy mapping");
            }
            self.free_port(descriptor, descriptor.port, Scope::Host).await;
            self.free_port(descriptor, bridge.guest_port, Scope::Guest).await;
        } else {
            self.free_port(descriptor, descriptor.port, Scope::Host).await;
        }
    }

    async fn free_port(&self, descriptor: &ServiceDescriptor, port: u16, scope: Scope) {
        match self.probe.is_port_in_use(port, scope).await {
            Ok(usage) if !usage.in_use => return,
            Ok(usage) => {
                tracing::info!(service = %descriptor.name, port, %scope, pids = ?usage.pids, "port occupied, terminating holder");
            }
            Err(error) => {
                tracing::warn!(%error, service = %descriptor.name, port, %scope, "could not inspect port");
                return;
            }
        }

        match self.probe.kill_process_on_port(port, scope).await {
            Ok(report) if report.is_clean() => {}
            Ok(report) => {
                tracing::warn!(service = %descriptor.name, port, %scope, failed = ?report.failed, "some port holders survived");
            }
            Err(error) => {
                tracing::warn!(%error, service = %descriptor.name, port, %scope, "failed to free port");
            }
        }
    }

    fn spawn_exit_watcher(
        self: &Arc<Self>,
        id: ServiceId,
        epoch: u64,
        mut child: Child,
        handle: Arc<ProcessHandle>,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let name = supervisor.descriptor(id).name.clone();
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(service = %name, status = %process::exit_message(&status), "worker exited");
                }
                Err(error) => {
                    tracing::error!(%error, service = %name, "waiting on worker failed");
                    supervisor.record_error(id, format!("process error: {error}"));
                }
            }
            handle.signal_exit();
            supervisor.finish(id, epoch).await;
        });
    }

    fn spawn_bridge_task(self: &Arc<Self>, id: ServiceId, epoch: u64) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.attach_bridge(id, epoch).await;
        });
    }

    async fn attach_bridge(&self, id: ServiceId, epoch: u64) {
        let slot = self.slot(id);
        let descriptor = &slot.descriptor;
        let Some(bridge) = descriptor.bridge else {
            return;
        };

        let address = match self.probe.resolve_guest_address().await {
            Ok(address) => address,
            Err(error) => {
                tracing::warn!(%error, service = %descriptor.name, "guest address unavailable, bridge not established");
                self.record_error(id, format!("bridge not established: {error}"));
                return;
            }
        };

        let record = slot.record.lock().await;
        if record.epoch != epoch || record.state.lifecycle != Lifecycle::Running {
            tracing::debug!(service = %descriptor.name, "instance gone before bridge setup");
            return;
        }

        if let Err(error) = self
            .proxies
            .establish(descriptor.port, &address.to_string(), bridge.guest_port)
            .await
        {
            tracing::warn!(%error, service = %descriptor.name, port = descriptor.port, "proxy setup failed");
            self.record_error(id, format!("proxy setup failed: {error}"));
        }
    }

    /// Cleanup for the instance identified by `epoch`, unless someone already did it.
    async fn finish(&self, id: ServiceId, epoch: u64) -> bool {
        let mut record = self.slot(id).record.lock().await;
        if record.epoch != epoch || !record.state.is_running() {
            return false;
        }
        self.cleanup(id, &mut record).await;
        true
    }

    async fn cleanup(&self, id: ServiceId, record: &mut ServiceRecord) {
        let descriptor = self.descriptor(id);
        record.child = None;
        record.epoch += 1;
        record.state.reset();
        self.publish(id, &record.state);
        tracing::info!(service = %descriptor.name, "service stopped");

        if descriptor.is_bridged() {
            if let Err(error) = self.proxies.remove(descriptor.port).await {
                tracing::warn!(%error, service = %descriptor.name, port = descriptor.port, "failed to remove proxy mapping");
                self.record_error(id, format!("proxy removal failed: {error}"));
            }
        }
    }

    pub async fn stop(self: &Arc<Self>, id: ServiceId) -> Result<StopOutcome, SupervisorError> {
        let slot = Arc::clone(self.slot(id));
        let name = &slot.descriptor.name;
        let mut record = slot.record.lock().await;

        if !record.state.is_running() {
            tracing::info!(service = %name, "stop requested but service is not running");
            return Ok(StopOutcome::NotRunning);
        }

        let Some(child) = record.child.clone() else {
            self.terminate_external(&slot.descriptor).await;
            self.cleanup(id, &mut record).await;
            return Ok(StopOutcome::Stopped { forced: false });
        };

        let epoch = record.epoch;
        if record.state.lifecycle == Lifecycle::Stopping {
            drop(record);
            return Ok(self.await_pending_stop(id, epoch, &child).await);
        }

        record.state.lifecycle = Lifecycle::Stopping;
        self.publish(id, &record.state);
        // A reaped pid may already belong to someone else.
        if !child.handle.has_exited() {
            if let Err(error) = signal::request_termination(child.pid, false).await {
                tracing::warn!(%error, service = %name, pid = child.pid, "failed to request graceful termination");
            }
        }
        drop(record);

        if timeout(self.settings.grace_period, child.handle.wait_for_exit())
            .await
            .is_ok()
        {
            self.finish(id, epoch).await;
            return Ok(StopOutcome::Stopped { forced: false });
        }

        let mut record = slot.record.lock().await;
        let current = record.epoch == epoch && record.state.is_running();
        let forced = current && !child.handle.has_exited();
        if forced {
            tracing::warn!(service = %name, pid = child.pid, grace = ?self.settings.grace_period, "worker ignored termination request, killing");
            if let Err(error) = signal::request_termination(child.pid, true).await {
                tracing::error!(%error, service = %name, pid = child.pid, "failed to kill worker");
            }
        }
        if current {
            self.cleanup(id, &mut record).await;
        }
        drop(record);

        if forced {
            let _ = timeout(self.settings.grace_period, child.handle.wait_for_exit()).await;
        }
        Ok(StopOutcome::Stopped { forced })
    }

    /// Waits on a stop someone else already began, then reports what became of it.
    async fn await_pending_stop(
        &self,
        id: ServiceId,
        epoch: u64,
        child: &ManagedChild,
    ) -> StopOutcome {
        if timeout(self.settings.grace_period * 2, child.handle.wait_for_exit())
            .await
            .is_ok()
        {
            return StopOutcome::Stopped { forced: false };
        }

        let record = self.slot(id).record.lock().await;
        if record.epoch == epoch && record.state.is_running() {
            tracing::warn!(service = %self.descriptor(id).name, pid = child.pid, "worker still shutting down");
            StopOutcome::StillStopping
        } else {
            // Torn down without its exit being observed, so it was killed.
            StopOutcome::Stopped { forced: true }
        }
    }

    async fn terminate_external(&self, descriptor: &ServiceDescriptor) {
        let (port, scope) = match descriptor.bridge {
            Some(bridge) => (bridge.guest_port, Scope::Guest),
            None => (descriptor.port, descriptor.detect_scope),
        };
        match self.probe.kill_process_on_port(port, scope).await {
            Ok(report) if report.is_clean() => {
                tracing::info!(service = %descriptor.name, killed = ?report.killed, "terminated external instance");
            }
            Ok(report) => {
                tracing::warn!(service = %descriptor.name, failed = ?report.failed, "external instance partly survived");
            }
            Err(error) => {
                tracing::warn!(%error, service = %descriptor.name, "failed to terminate external instance");
            }
        }
    }

    /// One pass comparing believed state with what is observably running.
    pub async fn reconcile(self: &Arc<Self>) {
        for index in 0..self.slots.len() {
            self.reconcile_service(ServiceId(index)).await;
        }
    }

    async fn reconcile_service(self: &Arc<Self>, id: ServiceId) {
        let slot = Arc::clone(self.slot(id));
        let descriptor = &slot.descriptor;

        // A command holding the record owns this service for now.
        let (running, epoch) = match slot.record.try_lock() {
            Ok(record) if record.state.is_running() && !record.state.is_external() => return,
            Ok(record) => (record.state.is_running(), record.epoch),
            Err(_) => return,
        };

        let found = self
            .probe
            .list_running_processes_matching(&descriptor.signature, descriptor.detect_scope)
            .await;

        let mut record = slot.record.lock().await;
        if record.epoch != epoch {
            return;
        }

        match (running, found.first()) {
            (false, Some(process)) => {
                record.epoch += 1;
                let epoch = record.epoch;
                record.state.begin(process.pid, Ownership::External);
                record.state.lifecycle = Lifecycle::Running;
                self.publish(id, &record.state);
                tracing::info!(service = %descriptor.name, pid = process.pid, "detected instance started outside supervision");
                drop(record);

                if descriptor.is_bridged() {
                    self.spawn_bridge_task(id, epoch);
                }
            }
            (true, None) => {
                tracing::info!(service = %descriptor.name, "external instance is gone");
                self.cleanup(id, &mut record).await;
            }
            _ => {}
        }
    }

    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let period = self.settings.reconcile_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.reconcile().await;
            }
        })
    }

    /// Freshly reconciled status of every service.
    pub async fn get_status(self: &Arc<Self>) -> StatusReport {
        self.reconcile().await;
        self.snapshot()
    }

    pub async fn get_service_status(self: &Arc<Self>, id: ServiceId) -> ServiceStatus {
        self.reconcile_service(id).await;
        self.board.lock()[id.0].clone()
    }

    pub fn get_log(&self, id: ServiceId, count: usize) -> LogQuery {
        let slot = self.slot(id);
        let status = self.board.lock()[id.0].clone();
        if status.running && !status.managed {
            let pid = status
                .pid
                .map(|pid| format!(" (pid {pid})"))
                .unwrap_or_default();
            return LogQuery::External {
                message: format!(
                    "{name} is running{pid} but was started outside guestbridge; its output is not captured",
                    name = slot.descriptor.name
                ),
            };
        }
        LogQuery::Captured(slot.log.lock().tail(count))
    }

    /// Lines the service's log buffer has discarded to stay within capacity.
    pub fn log_evicted(&self, id: ServiceId) -> u64 {
        self.slot(id).log.lock().dropped()
    }

    /// Stops every instance this supervisor spawned and drops the bridges it created.
    pub async fn stop_all(self: &Arc<Self>) {
        let mut tasks = JoinSet::new();
        for index in 0..self.slots.len() {
            let id = ServiceId(index);
            let managed = self.board.lock()[index].managed;
            if !managed {
                continue;
            }
            let supervisor = Arc::clone(self);
            tasks.spawn(async move { (id, supervisor.stop(id).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(outcome))) => {
                    tracing::debug!(service = %self.descriptor(id).name, ?outcome, "stopped during shutdown");
                }
                Ok((id, Err(error))) => {
                    tracing::warn!(%error, service = %self.descriptor(id).name, "failed to stop during shutdown");
                }
                Err(error) => tracing::warn!(%error, "shutdown stop task failed"),
            }
        }

        for port in self.proxies.recorded_ports() {
            if let Err(error) = self.proxies.remove(port).await {
                tracing::warn!(%error, port, "failed to remove proxy mapping during shutdown");
            }
        }
    }
}
