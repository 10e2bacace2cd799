//! Host and guest introspection: listening sockets, process listings,
//! termination, and guest address discovery.
//!
//! Every operation here is advisory. Callers treat a [`ProbeError`] as
//! "unknown" and keep going with their own lifecycle transition.

mod command;
#[cfg(test)]
pub(crate) mod fake;
mod parse;
mod system;

use std::{fmt, net::IpAddr, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use system::SystemProbe;

#[cfg(test)]
pub(crate) use command::testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Host,
    Guest,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Host => "host",
            Scope::Guest => "guest",
        })
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("'{program}' exited with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("guest environment unavailable: {0}")]
    GuestUnavailable(String),
}

/// Who, if anyone, is listening on a port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortUsage {
    pub in_use: bool,
    /// Owning process ids, when the listing exposes them.
    pub pids: Vec<u32>,
    /// Matching rows from the underlying listing.
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KillReport {
    pub killed: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

impl KillReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
}

#[async_trait]
pub trait NetworkProbe: Send + Sync + fmt::Debug {
    /// Fails only when no listing mechanism could be executed.
    async fn is_port_in_use(&self, port: u16, scope: Scope) -> Result<PortUsage, ProbeError>;

    /// Terminates every process owning `port`. Finding nothing is success.
    async fn kill_process_on_port(&self, port: u16, scope: Scope)
    -> Result<KillReport, ProbeError>;

    /// Processes whose command line contains `signature`. Enumeration failure
    /// yields an empty list so a missing tool never blocks a start.
    async fn list_running_processes_matching(
        &self,
        signature: &str,
        scope: Scope,
    ) -> Vec<ProcessInfo>;

    async fn resolve_guest_address(&self) -> Result<IpAddr, ProbeError>;

    async fn execute_in_guest(&self, command: &str) -> Result<CommandOutput, ProbeError>;

    /// Guest environments installed on the host, by name.
    async fn list_guest_distros(&self) -> Result<Vec<String>, ProbeError>;
}
