use std::sync::Arc;

use serde_json::json;

use crate::supervisor::{
    LogQuery, ServiceId, StartOutcome, StopOutcome, Supervisor, ValidationError,
};

use super::protocol::{ClientCommand, CommandReply};

/// What the connection handler should do after a command has been interpreted.
#[derive(Debug)]
pub enum Dispatch {
    Reply(CommandReply),
    Subscribe,
    Shutdown,
}

pub async fn dispatch(supervisor: &Arc<Supervisor>, command: ClientCommand) -> Dispatch {
    let reply = match command {
        ClientCommand::Ping => CommandReply::ok_with("pong"),
        ClientCommand::Subscribe => return Dispatch::Subscribe,
        ClientCommand::Shutdown => return Dispatch::Shutdown,
        ClientCommand::Start { service } => start(supervisor, service).await,
        ClientCommand::Stop { service } => stop(supervisor, service).await,
        ClientCommand::Status { service } => status(supervisor, service).await,
        ClientCommand::Log { service, lines } => log(supervisor, service, lines),
        ClientCommand::SetupProxy {
            local_port,
            target_address,
            target_port,
        } => setup_proxy(supervisor, local_port, target_address, target_port).await,
        ClientCommand::ClearProxy { local_port } => clear_proxy(supervisor, local_port).await,
        ClientCommand::ListProxies => list_proxies(supervisor).await,
        ClientCommand::ProxyStatus { local_port } => proxy_status(supervisor, local_port).await,
        ClientCommand::GuestStatus { service } => guest_status(supervisor, service).await,
    };
    Dispatch::Reply(reply)
}

fn require<T>(value: Option<T>, name: &'static str) -> Result<T, ValidationError> {
    value.ok_or(ValidationError::MissingParameter(name))
}

fn port(value: Option<i64>, name: &'static str) -> Result<u16, ValidationError> {
    let value = require(value, name)?;
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ValidationError::InvalidPort(value)),
    }
}

fn line_count(value: Option<i64>) -> Result<usize, ValidationError> {
    let value = require(value, "lines")?;
    match usize::try_from(value) {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(ValidationError::InvalidLineCount(value)),
    }
}

fn service(supervisor: &Supervisor, name: Option<String>) -> Result<ServiceId, ValidationError> {
    let name = require(name, "service")?;
    supervisor.resolve(&name)
}

async fn start(supervisor: &Arc<Supervisor>, name: Option<String>) -> CommandReply {
    let id = match service(supervisor, name) {
        Ok(id) => id,
        Err(error) => return CommandReply::failure(error.to_string()),
    };
    let name = &supervisor.descriptor(id).name;
    match supervisor.start(id).await {
        Ok(StartOutcome::Started { pid }) => {
            CommandReply::ok_with(format!("started {name} (pid {pid})"))
                .with_payload(json!({ "pid": pid }))
        }
        Ok(StartOutcome::AlreadyRunning { pid }) => {
            CommandReply::ok_with(format!("{name} is already running"))
                .with_payload(json!({ "pid": pid }))
        }
        Err(error) => CommandReply::failure(error.to_string()),
    }
}

async fn stop(supervisor: &Arc<Supervisor>, name: Option<String>) -> CommandReply {
    let id = match service(supervisor, name) {
        Ok(id) => id,
        Err(error) => return CommandReply::failure(error.to_string()),
    };
    let name = &supervisor.descriptor(id).name;
    match supervisor.stop(id).await {
        Ok(StopOutcome::Stopped { forced: false }) => {
            CommandReply::ok_with(format!("stopped {name}"))
        }
        Ok(StopOutcome::Stopped { forced: true }) => {
            CommandReply::ok_with(format!("stopped {name} (forced after grace period)"))
        }
        Ok(StopOutcome::NotRunning) => CommandReply::ok_with(format!("{name} is not running")),
        Ok(StopOutcome::StillStopping) => {
            CommandReply::failure(format!("{name} is still shutting down"))
        }
        Err(error) => CommandReply::failure(error.to_string()),
    }
}

async fn status(supervisor: &Arc<Supervisor>, name: Option<String>) -> CommandReply {
    let payload = match name {
        None => serde_json::to_value(supervisor.get_status().await),
        Some(name) => match supervisor.resolve(&name) {
            Ok(id) => serde_json::to_value(supervisor.get_service_status(id).await),
            Err(error) => return CommandReply::failure(error.to_string()),
        },
    };
    match payload {
        Ok(payload) => CommandReply::ok().with_payload(payload),
        Err(error) => CommandReply::failure(format!("failed to encode status: {error}")),
    }
}

fn log(supervisor: &Arc<Supervisor>, name: Option<String>, lines: Option<i64>) -> CommandReply {
    let request = service(supervisor, name).and_then(|id| Ok((id, line_count(lines)?)));
    let (id, count) = match request {
        Ok(request) => request,
        Err(error) => return CommandReply::failure(error.to_string()),
    };
    match supervisor.get_log(id, count) {
        LogQuery::Captured(entries) => {
            let lines: Vec<String> = entries.iter().map(|entry| entry.format_line()).collect();
            let dropped = supervisor.log_evicted(id);
            CommandReply::ok().with_payload(json!({ "lines": lines, "dropped": dropped }))
        }
        LogQuery::External { message } => {
            CommandReply::ok_with(message.clone()).with_payload(json!({ "lines": [message] }))
        }
    }
}

async fn setup_proxy(
    supervisor: &Arc<Supervisor>,
    local_port: Option<i64>,
    target_address: Option<String>,
    target_port: Option<i64>,
) -> CommandReply {
    let (local_port, target_address, target_port) =
        match proxy_request(local_port, target_address, target_port) {
            Ok(request) => request,
            Err(error) => return CommandReply::failure(error.to_string()),
        };

    match supervisor
        .proxies()
        .establish(local_port, &target_address, target_port)
        .await
    {
        Ok(mapping) => CommandReply::ok_with(format!(
            "forwarding {} to {}:{}",
            mapping.local_port, mapping.target_address, mapping.target_port
        )),
        Err(error) => CommandReply::failure(error.to_string()),
    }
}

fn proxy_request(
    local_port: Option<i64>,
    target_address: Option<String>,
    target_port: Option<i64>,
) -> Result<(u16, String, u16), ValidationError> {
    let local_port = port(local_port, "local_port")?;
    let target_address = require(target_address, "target_address")?;
    let target_address = target_address.trim();
    if target_address.is_empty() {
        return Err(ValidationError::MissingParameter("target_address"));
    }
    let target_port = port(target_port, "target_port")?;
    Ok((local_port, target_address.to_string(), target_port))
}

async fn clear_proxy(supervisor: &Arc<Supervisor>, local_port: Option<i64>) -> CommandReply {
    let local_port = match port(local_port, "local_port") {
        Ok(port) => port,
        Err(error) => return CommandReply::failure(error.to_string()),
    };
    match supervisor.proxies().remove(local_port).await {
        Ok(()) => CommandReply::ok_with(format!("cleared proxy on {local_port}")),
        Err(error) => CommandReply::failure(error.to_string()),
    }
}

async fn list_proxies(supervisor: &Arc<Supervisor>) -> CommandReply {
    match supervisor.proxies().list().await {
        Ok(mappings) => match serde_json::to_value(mappings) {
            Ok(payload) => CommandReply::ok().with_payload(payload),
            Err(error) => CommandReply::failure(format!("failed to encode proxies: {error}")),
        },
        Err(error) => CommandReply::failure(error.to_string()),
    }
}

async fn proxy_status(supervisor: &Arc<Supervisor>, local_port: Option<i64>) -> CommandReply {
    let local_port = match port(local_port, "local_port") {
        Ok(port) => port,
        Err(error) => return CommandReply::failure(error.to_string()),
    };
    let proxied = supervisor.proxies().is_proxied(local_port).await;
    let message = if proxied {
        format!("port {local_port} is forwarded")
    } else {
        format!("port {local_port} is not forwarded")
    };
    CommandReply::ok_with(message)
        .with_payload(json!({ "local_port": local_port, "proxied": proxied }))
}

async fn guest_status(supervisor: &Arc<Supervisor>, name: Option<String>) -> CommandReply {
    let id = match name.map(|name| supervisor.resolve(&name)).transpose() {
        Ok(id) => id,
        Err(error) => return CommandReply::failure(error.to_string()),
    };
    let report = match supervisor.guest_status(id).await {
        Ok(report) => report,
        Err(error) => return CommandReply::failure(error.to_string()),
    };
    match serde_json::to_value(&report) {
        Ok(payload) => CommandReply::ok().with_payload(payload),
        Err(error) => CommandReply::failure(format!("failed to encode guest status: {error}")),
    }
}
