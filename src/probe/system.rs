use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;

use crate::config::GuestConfig;

use super::{
    CommandOutput, CommandRunner, KillReport, NetworkProbe, PortUsage, ProbeError, ProcessInfo,
    Scope, command::argv, parse,
};

const GUEST_LISTING: &str = "ss -Hltnp 2>/dev/null || netstat -tlnp 2>/dev/null";
const PROCESS_LISTING: &str = "ps -eo pid=,args=";
const PROCESS_LISTING_FALLBACK: &str = "pgrep -af .";
const WINDOWS_PROCESS_FALLBACK: &str =
    "Get-CimInstance Win32_Process | ForEach-Object { \"$($_.ProcessId) $($_.CommandLine)\" }";

/// [`NetworkProbe`] backed by the platform's own command line tools.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    runner: Arc<dyn CommandRunner>,
    guest: GuestConfig,
}

impl SystemProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, guest: GuestConfig) -> Self {
        Self { runner, guest }
    }

    async fn listing(&self, scope: Scope) -> Result<String, ProbeError> {
        match scope {
            Scope::Guest => {
                let output = self.execute_in_guest(GUEST_LISTING).await?;
                Ok(require_success("guest listing", output)?.stdout)
            }
            Scope::Host if cfg!(windows) => {
                let output = self.runner.run("netstat", &argv(&["-ano"])).await?;
                Ok(require_success("netstat", output)?.stdout)
            }
            Scope::Host => {
                let primary = self
                    .runner
                    .run("ss", &argv(&["-Hltnp"]))
                    .await
                    .and_then(|output| require_success("ss", output));
                match primary {
                    Ok(output) => Ok(output.stdout),
                    Err(error) => {
                        tracing::debug!(%error, "ss unavailable, falling back to netstat");
                        let output = self.runner.run("netstat", &argv(&["-tlnp"])).await?;
                        Ok(require_success("netstat", output)?.stdout)
                    }
                }
            }
        }
    }

    /// Pids from `lsof`, used when the socket listing did not expose owners.
    async fn lsof_pids(&self, port: u16, scope: Scope) -> Result<Option<Vec<u32>>, ProbeError> {
        let output = match scope {
            Scope::Guest => {
                self.execute_in_guest(&format!("lsof -t -iTCP:{port} -sTCP:LISTEN 2>/dev/null"))
                    .await?
            }
            Scope::Host if cfg!(windows) => return Ok(None),
            Scope::Host => {
                self.runner
                    .run(
                        "lsof",
                        &argv(&[
                            "-nP",
                            &format!("-iTCP:{port}"),
                            "-sTCP:LISTEN",
                            "-t",
                        ]),
                    )
                    .await?
            }
        };
        // lsof exits 1 when nothing matched; the output alone is authoritative.
        Ok(Some(parse::pid_list(&output.stdout)))
    }

    async fn terminate_pid(&self, pid: u32, scope: Scope) -> Result<(), String> {
        let result = match scope {
            Scope::Guest => self.execute_in_guest(&format!("kill -9 {pid}")).await,
            Scope::Host if cfg!(windows) => {
                self.runner
                    .run("taskkill", &argv(&["/PID", &pid.to_string(), "/F"]))
                    .await
            }
            Scope::Host => self.runner.run("kill", &argv(&["-9", &pid.to_string()])).await,
        };

        match result {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(format!(
                "exit status {:?}: {}",
                output.code,
                output.stderr.trim()
            )),
            Err(error) => Err(error.to_string()),
        }
    }

    async fn process_table(&self, scope: Scope) -> Result<Vec<ProcessInfo>, ProbeError> {
        match scope {
            Scope::Guest => {
                let output = self.execute_in_guest(PROCESS_LISTING).await?;
                Ok(parse::process_listing(
                    &require_success("ps", output)?.stdout,
                ))
            }
            Scope::Host if cfg!(windows) => {
                let output = self
                    .runner
                    .run(
                        "wmic",
                        &argv(&["process", "get", "ProcessId,CommandLine", "/format:csv"]),
                    )
                    .await?;
                Ok(parse::wmic_csv(&require_success("wmic", output)?.stdout))
            }
            Scope::Host => {
                let output = self.runner.run("ps", &argv(&["-eo", "pid=,args="])).await?;
                Ok(parse::process_listing(
                    &require_success("ps", output)?.stdout,
                ))
            }
        }
    }

    async fn process_table_fallback(&self, scope: Scope) -> Result<Vec<ProcessInfo>, ProbeError> {
        let output = match scope {
            Scope::Guest => self.execute_in_guest(PROCESS_LISTING_FALLBACK).await?,
            Scope::Host if cfg!(windows) => {
                self.runner
                    .run(
                        "powershell",
                        &argv(&["-NoProfile", "-Command", WINDOWS_PROCESS_FALLBACK]),
                    )
                    .await?
            }
            Scope::Host => self.runner.run("pgrep", &argv(&["-af", "."])).await?,
        };
        Ok(parse::process_listing(
            &require_success("process listing fallback", output)?.stdout,
        ))
    }
}

#[async_trait]
impl NetworkProbe for SystemProbe {
    async fn is_port_in_use(&self, port: u16, scope: Scope) -> Result<PortUsage, ProbeError> {
        let listing = self.listing(scope).await?;
        let rows = parse::listening_rows(&listing, port);
        Ok(PortUsage {
            in_use: !rows.is_empty(),
            pids: parse::collect_pids(rows.iter().copied()),
            raw: rows.join("\n"),
        })
    }

    async fn kill_process_on_port(
        &self,
        port: u16,
        scope: Scope,
    ) -> Result<KillReport, ProbeError> {
        let (mut pids, mut listing_error) = match self.is_port_in_use(port, scope).await {
            Ok(usage) => (usage.pids, None),
            Err(error) => (Vec::new(), Some(error)),
        };

        if pids.is_empty() {
            match self.lsof_pids(port, scope).await {
                Ok(Some(found)) => {
                    pids = found;
                    listing_error = None;
                }
                Ok(None) => {}
                Err(error) => tracing::debug!(%error, port, %scope, "lsof unavailable"),
            }
        }

        if let Some(error) = listing_error {
            return Err(error);
        }

        let own_pid = std::process::id();
        let mut report = KillReport::default();
        for pid in pids {
            if scope == Scope::Host && pid == own_pid {
                continue;
            }
            match self.terminate_pid(pid, scope).await {
                Ok(()) => {
                    tracing::info!(pid, port, %scope, "terminated process holding port");
                    report.killed.push(pid);
                }
                Err(reason) => {
                    tracing::warn!(pid, port, %scope, %reason, "failed to terminate process");
                    report.failed.push((pid, reason));
                }
            }
        }

        Ok(report)
    }

    async fn list_running_processes_matching(
        &self,
        signature: &str,
        scope: Scope,
    ) -> Vec<ProcessInfo> {
        let table = match self.process_table(scope).await {
            Ok(table) => table,
            Err(primary) => match self.process_table_fallback(scope).await {
                Ok(table) => table,
                Err(fallback) => {
                    tracing::warn!(%primary, %fallback, %scope, "process enumeration unavailable");
                    return Vec::new();
                }
            },
        };

        let own_pid = std::process::id();
        table
            .into_iter()
            .filter(|info| !(scope == Scope::Host && info.pid == own_pid))
            .filter(|info| parse::matches_signature(&info.command, signature))
            .collect()
    }

    async fn resolve_guest_address(&self) -> Result<IpAddr, ProbeError> {
        let output = require_success("hostname", self.execute_in_guest("hostname -I").await?)?;
        parse::pick_guest_address(&output.stdout).ok_or_else(|| {
            ProbeError::GuestUnavailable(format!(
                "no address in 'hostname -I' output: {:?}",
                output.stdout.trim()
            ))
        })
    }

    async fn execute_in_guest(&self, command: &str) -> Result<CommandOutput, ProbeError> {
        let Some((program, prefix)) = self.guest.launcher.split_first() else {
            return Err(ProbeError::GuestUnavailable(
                "guest launcher is empty".to_string(),
            ));
        };

        let mut args = prefix.to_vec();
        args.push(command.to_string());
        let output = self.runner.run(program, &args).await?;

        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            tracing::warn!(command, stderr, "guest command wrote to stderr");
        }
        Ok(output)
    }

    async fn list_guest_distros(&self) -> Result<Vec<String>, ProbeError> {
        let Some(program) = self.guest.launcher.first() else {
            return Err(ProbeError::GuestUnavailable(
                "guest launcher is empty".to_string(),
            ));
        };
        let output = self.runner.run(program, &argv(&["-l", "-q"])).await?;
        Ok(parse::distro_list(
            &require_success("distro listing", output)?.stdout,
        ))
    }
}

fn require_success(program: &str, output: CommandOutput) -> Result<CommandOutput, ProbeError> {
    if output.success() {
        Ok(output)
    } else {
        Err(ProbeError::Failed {
            program: program.to_string(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}
