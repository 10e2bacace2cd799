use super::*;
use std::{
    collections::HashMap,
    io::{self, Write},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use chrono::SecondsFormat;
use serde_json::Value;
use tokio::{signal, time::sleep};

use crate::config::{self, ServiceName};
use crate::env::load_env_overrides;
use crate::ipc::{
    ClientCommand, CommandReply, DaemonOptions, RuntimePaths, connect_existing_client,
    require_daemon_client, run_daemon,
};
use crate::probe::{CommandRunner, SystemProbe, TokioCommandRunner};
use crate::proxy::{NetshBackend, ProxyMapping, ProxyTable};
use crate::state::{GuestReport, ServiceStatus, StatusReport};
use crate::supervisor::{BroadcastSink, Supervisor};

const EVENT_CAPACITY: usize = 1024;

pub async fn daemon(args: DaemonArgs) -> Result<()> {
    let DaemonArgs { config, env_file } = args;

    let loaded = config::load_or_default(&config)
        .with_context(|| format!("loading configuration from {:?}", config))?;
    let env_overrides = match env_file {
        Some(path) => load_env_overrides(&path)?,
        None => HashMap::new(),
    };

    let runner: Arc<dyn CommandRunner> =
        Arc::new(TokioCommandRunner::new(loaded.supervisor.probe_timeout));
    let probe = Arc::new(SystemProbe::new(runner.clone(), loaded.guest.clone()));
    let proxies = Arc::new(ProxyTable::new(Arc::new(NetshBackend::new(
        runner,
        &loaded.proxy,
    ))));
    let events = Arc::new(BroadcastSink::new(EVENT_CAPACITY));
    let supervisor = Arc::new(
        Supervisor::new(
            loaded.services,
            loaded.supervisor,
            probe,
            proxies,
            events.clone(),
        )
        .with_env_file(env_overrides),
    );

    println!("guestbridge daemon running (press Ctrl+C to stop)");
    run_daemon(DaemonOptions {
        supervisor,
        events,
        paths: RuntimePaths::default(),
        config_path: Some(config),
    })
    .await
}

pub async fn start(args: ServiceArgs) -> Result<()> {
    let reply = request(ClientCommand::Start {
        service: Some(args.service),
    })
    .await?;
    print_message(&reply);
    Ok(())
}

pub async fn stop(args: ServiceArgs) -> Result<()> {
    let reply = request(ClientCommand::Stop {
        service: Some(args.service),
    })
    .await?;
    print_message(&reply);
    Ok(())
}

pub async fn status(args: StatusArgs) -> Result<()> {
    let StatusArgs { service } = args;
    let reply = request(ClientCommand::Status {
        service: service.clone(),
    })
    .await?;
    let payload = reply.payload.unwrap_or(Value::Null);

    let report: StatusReport = match service {
        Some(name) => {
            let status: ServiceStatus =
                serde_json::from_value(payload).context("decoding service status")?;
            StatusReport::from([(name, status)])
        }
        None => serde_json::from_value(payload).context("decoding status report")?,
    };
    write_status_table(io::stdout().lock(), &report)?;
    Ok(())
}

pub async fn log(args: LogArgs) -> Result<()> {
    let reply = request(ClientCommand::Log {
        service: Some(args.service),
        lines: Some(args.lines),
    })
    .await?;
    let lines = reply
        .payload
        .as_ref()
        .and_then(|payload| payload.get("lines"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let dropped = reply
        .payload
        .as_ref()
        .and_then(|payload| payload.get("dropped"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let mut stdout = io::stdout().lock();
    if dropped > 0 && (lines.len() as i64) < args.lines {
        writeln!(stdout, "({dropped} earlier lines were discarded)")?;
    }
    for line in lines.iter().filter_map(Value::as_str) {
        writeln!(stdout, "{line}")?;
    }
    Ok(())
}

pub async fn proxy(command: ProxyCommand) -> Result<()> {
    match command {
        ProxyCommand::Set {
            local_port,
            target_address,
            target_port,
        } => {
            let reply = request(ClientCommand::SetupProxy {
                local_port: Some(local_port),
                target_address: Some(target_address),
                target_port: Some(target_port),
            })
            .await?;
            print_message(&reply);
        }
        ProxyCommand::Clear { local_port } => {
            let reply = request(ClientCommand::ClearProxy {
                local_port: Some(local_port),
            })
            .await?;
            print_message(&reply);
        }
        ProxyCommand::List => {
            let reply = request(ClientCommand::ListProxies).await?;
            let mappings: Vec<ProxyMapping> =
                serde_json::from_value(reply.payload.unwrap_or(Value::Array(Vec::new())))
                    .context("decoding proxy list")?;
            write_proxy_table(io::stdout().lock(), &mappings)?;
        }
        ProxyCommand::Check { local_port } => {
            let reply = request(ClientCommand::ProxyStatus {
                local_port: Some(local_port),
            })
            .await?;
            print_message(&reply);
        }
    }
    Ok(())
}

pub async fn guest(command: GuestCommand) -> Result<()> {
    match command {
        GuestCommand::Status(StatusArgs { service }) => {
            let reply = request(ClientCommand::GuestStatus { service }).await?;
            let report: GuestReport =
                serde_json::from_value(reply.payload.unwrap_or(Value::Null))
                    .context("decoding guest status")?;
            write_guest_report(io::stdout().lock(), &report)?;
        }
    }
    Ok(())
}

pub async fn events() -> Result<()> {
    let client = require_daemon_client(&RuntimePaths::default()).await?;
    let mut feed = client.subscribe().await?;
    loop {
        tokio::select! {
            line = feed.next_line() => match line? {
                Some(line) => println!("{line}"),
                None => {
                    println!("guestbridge daemon closed the event stream");
                    return Ok(());
                }
            },
            _ = signal::ctrl_c() => return Ok(()),
        }
    }
}

pub async fn shutdown() -> Result<()> {
    let paths = RuntimePaths::default();
    let Some(client) = connect_existing_client(&paths).await? else {
        println!("guestbridge daemon is not running");
        return Ok(());
    };
    let reply = client.send(ClientCommand::Shutdown).await?;
    if !reply.success {
        bail!(reply.message.unwrap_or_else(|| "shutdown failed".to_string()));
    }
    wait_for_shutdown(&paths, Duration::from_secs(10)).await?;
    println!("guestbridge daemon stopped");
    Ok(())
}

pub fn completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    let mut cmd = crate::cli::Cli::command();
    let shell: Shell = args.shell.into();
    clap_complete::generate(shell, &mut cmd, "guestbridge", &mut std::io::stdout());
    Ok(())
}

async fn request(command: ClientCommand) -> Result<CommandReply> {
    let client = require_daemon_client(&RuntimePaths::default()).await?;
    let reply = client.send(command).await?;
    if !reply.success {
        bail!(
            reply
                .message
                .unwrap_or_else(|| "daemon reported a failure".to_string())
        );
    }
    Ok(reply)
}

async fn wait_for_shutdown(paths: &RuntimePaths, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if paths.read_lock().ok().flatten().is_none() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            bail!("guestbridge daemon did not shut down within {:?}", timeout);
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn print_message(reply: &CommandReply) {
    if let Some(message) = &reply.message {
        println!("{message}");
    }
}

fn write_status_table<W: Write>(mut writer: W, report: &StatusReport) -> io::Result<()> {
    let width = report
        .keys()
        .map(ServiceName::len)
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());
    writeln!(
        writer,
        "{:<width$}  {:<8}  {:>7}  {:<8}  STARTED",
        "SERVICE", "STATE", "PID", "MODE"
    )?;
    for (name, status) in report {
        let state = serde_json::to_value(status.lifecycle)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        let pid = status.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string());
        let mode = match (status.running, status.managed) {
            (false, _) => "-",
            (true, true) => "managed",
            (true, false) => "external",
        };
        let started = status
            .started_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            writer,
            "{name:<width$}  {state:<8}  {pid:>7}  {mode:<8}  {started}"
        )?;
    }
    Ok(())
}

fn write_proxy_table<W: Write>(mut writer: W, mappings: &[ProxyMapping]) -> io::Result<()> {
    if mappings.is_empty() {
        return writeln!(writer, "no proxy mappings");
    }
    for mapping in mappings {
        let since = mapping
            .created_at
            .map(|at| format!("  (since {})", at.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .unwrap_or_default();
        writeln!(
            writer,
            "{local} -> {address}:{port}{since}",
            local = mapping.local_port,
            address = mapping.target_address,
            port = mapping.target_port
        )?;
    }
    Ok(())
}

fn write_guest_report<W: Write>(mut writer: W, report: &GuestReport) -> io::Result<()> {
    if report.available {
        let address = report.address.as_deref().unwrap_or("unknown address");
        writeln!(writer, "guest: reachable ({address})")?;
    } else {
        let reason = report.error.as_deref().unwrap_or("no answer");
        writeln!(writer, "guest: unreachable ({reason})")?;
    }
    if !report.distros.is_empty() {
        writeln!(writer, "distributions: {}", report.distros.join(", "))?;
    }
    for (name, status) in &report.services {
        let state = match status.listening {
            Some(true) => "listening",
            Some(false) => "not listening",
            None => "unknown",
        };
        writeln!(writer, "{name}: guest port {} {state}", status.guest_port)?;
    }
    Ok(())
}
