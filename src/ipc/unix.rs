use std::{path::PathBuf, process, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        UnixListener, UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, broadcast::error::RecvError},
};

use crate::supervisor::{BroadcastSink, Supervisor, SupervisorEvent};

use super::{
    dispatch::{Dispatch, dispatch},
    lock::{LockInfo, RuntimePaths},
    protocol::{ClientCommand, CommandReply},
};

#[derive(Debug, Clone)]
pub struct IpcClient {
    lock: LockInfo,
}

impl IpcClient {
    pub fn new(lock: LockInfo) -> Self {
        Self { lock }
    }

    pub fn daemon_pid(&self) -> u32 {
        self.lock.pid
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(self.lock.socket_path())
            .await
            .with_context(|| format!("failed to connect to {:?}", self.lock.socket_path()))
    }

    pub async fn send(&self, command: ClientCommand) -> Result<CommandReply> {
        let stream = self.connect().await?;
        send_command_over_stream(stream, command).await
    }

    pub async fn ping(&self) -> Result<CommandReply> {
        self.send(ClientCommand::Ping).await
    }

    /// Opens the event feed. The first line after the acknowledgement is a status snapshot.
    pub async fn subscribe(&self) -> Result<EventStream> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        write_line(&mut write_half, &ClientCommand::Subscribe).await?;

        let mut lines = BufReader::new(read_half).lines();
        let Some(first) = lines.next_line().await? else {
            bail!("daemon closed connection without response");
        };
        let reply: CommandReply = serde_json::from_str(first.trim())
            .map_err(|err| anyhow!("failed to parse daemon response: {err}"))?;
        if !reply.success {
            bail!(
                "subscription refused: {}",
                reply.message.unwrap_or_default()
            );
        }

        Ok(EventStream {
            lines,
            _writer: write_half,
        })
    }
}

/// Raw JSON event lines pushed by the daemon.
#[derive(Debug)]
pub struct EventStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Closing the write half ends the subscription on the daemon side.
    _writer: OwnedWriteHalf,
}

impl EventStream {
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }
}

pub async fn connect_existing_client(paths: &RuntimePaths) -> Result<Option<IpcClient>> {
    let Some(lock_info) = paths
        .read_lock()
        .with_context(|| format!("reading {:?}", paths.lock_file()))?
    else {
        return Ok(None);
    };

    let client = IpcClient::new(lock_info.clone());
    match client.ping().await {
        Ok(reply) if reply.success => Ok(Some(client)),
        Ok(reply) => {
            tracing::warn!(message = ?reply.message, "guestbridge daemon refused ping; cleaning up lock");
            cleanup_stale(paths, &lock_info);
            Ok(None)
        }
        Err(error) => {
            tracing::warn!(%error, "failed to reach existing guestbridge daemon; cleaning up lock");
            cleanup_stale(paths, &lock_info);
            Ok(None)
        }
    }
}

pub async fn require_daemon_client(paths: &RuntimePaths) -> Result<IpcClient> {
    connect_existing_client(paths).await?.ok_or_else(|| {
        anyhow!("guestbridge daemon is not running; launch it with `guestbridge daemon`")
    })
}

fn cleanup_stale(paths: &RuntimePaths, lock_info: &LockInfo) {
    tracing::debug!(socket = %lock_info.socket_path, "cleaning up stale guestbridge lock/socket");
    paths.cleanup_lock(lock_info);
}

/// Everything the daemon needs besides its socket.
#[derive(Debug)]
pub struct DaemonOptions {
    pub supervisor: Arc<Supervisor>,
    pub events: Arc<BroadcastSink>,
    pub paths: RuntimePaths,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug)]
struct ServerContext {
    supervisor: Arc<Supervisor>,
    events: Arc<BroadcastSink>,
    shutdown: Notify,
}

/// Serves commands until a `Shutdown` command or ctrl-c, then stops every managed worker.
pub async fn run_daemon(options: DaemonOptions) -> Result<()> {
    let DaemonOptions {
        supervisor,
        events,
        paths,
        config_path,
    } = options;

    if let Some(client) = connect_existing_client(&paths).await? {
        bail!(
            "guestbridge daemon is already running (pid {})",
            client.daemon_pid()
        );
    }

    let socket_path = paths
        .allocate_socket_path()
        .context("allocating socket path")?;
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding IPC socket at {:?}", socket_path))?;

    let lock_info = LockInfo {
        pid: process::id(),
        socket_path: socket_path.to_string_lossy().into_owned(),
        config_path: config_path.map(|path| path.display().to_string()),
    };
    paths
        .write_lock(&lock_info)
        .with_context(|| format!("writing {:?}", paths.lock_file()))?;
    let guard = DaemonGuard {
        paths: paths.clone(),
        lock_info: lock_info.clone(),
    };

    tracing::info!(
        socket = %lock_info.socket_path,
        pid = lock_info.pid,
        services = ?supervisor.service_names(),
        "guestbridge daemon started"
    );

    supervisor.reconcile().await;
    let reconcile_loop = supervisor.spawn_reconcile_loop();

    let context = Arc::new(ServerContext {
        supervisor,
        events,
        shutdown: Notify::new(),
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::error!(%error, "accepting IPC connection");
                        continue;
                    }
                };
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, &context).await {
                        tracing::warn!(%error, "error handling IPC connection");
                    }
                });
            }
            _ = context.shutdown.notified() => {
                tracing::info!("shutdown command received; stopping daemon");
                break;
            }
            signal = &mut ctrl_c => {
                if let Err(error) = signal {
                    tracing::warn!(%error, "failed to listen for ctrl-c");
                }
                tracing::info!("interrupted; stopping daemon");
                break;
            }
        }
    }

    reconcile_loop.abort();
    context.supervisor.stop_all().await;
    drop(guard);
    Ok(())
}

async fn send_command_over_stream(
    stream: UnixStream,
    command: ClientCommand,
) -> Result<CommandReply> {
    let (read_half, mut write_half) = stream.into_split();
    write_line(&mut write_half, &command).await?;
    write_half.shutdown().await?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    let bytes = reader.read_line(&mut response_line).await?;
    if bytes == 0 {
        bail!("daemon closed connection without response");
    }
    let reply: CommandReply = serde_json::from_str(response_line.trim())
        .map_err(|err| anyhow!("failed to parse daemon response: {err}"))?;
    Ok(reply)
}

async fn handle_connection(stream: UnixStream, context: &ServerContext) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let command: ClientCommand = match serde_json::from_str(line.trim()) {
        Ok(command) => command,
        Err(err) => {
            let reply = CommandReply::failure(format!("failed to parse command: {err}"));
            return write_response(&mut write_half, &reply).await;
        }
    };
    tracing::debug!(?command, "received command");

    match dispatch(&context.supervisor, command).await {
        Dispatch::Reply(reply) => write_response(&mut write_half, &reply).await,
        Dispatch::Subscribe => stream_events(reader, write_half, context).await,
        Dispatch::Shutdown => {
            context.supervisor.stop_all().await;
            let written =
                write_response(&mut write_half, &CommandReply::ok_with("daemon stopping")).await;
            context.shutdown.notify_one();
            written
        }
    }
}

async fn stream_events(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    context: &ServerContext,
) -> Result<()> {
    let mut receiver = context.events.subscribe();
    write_line(&mut writer, &CommandReply::ok()).await?;

    let snapshot = SupervisorEvent::StatusChanged {
        services: context.supervisor.get_status().await,
    };
    write_line(&mut writer, &snapshot).await?;

    let mut discard = String::new();
    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Ok(event) => write_line(&mut writer, &event).await?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            read = reader.read_line(&mut discard) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => discard.clear(),
            },
        }
    }
    tracing::debug!("event subscriber disconnected");
    Ok(())
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
    let mut payload =
        serde_json::to_vec(message).map_err(|err| anyhow!("failed to serialize message: {err}"))?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, reply: &CommandReply) -> Result<()> {
    write_line(writer, reply).await?;
    writer.shutdown().await?;
    Ok(())
}

struct DaemonGuard {
    paths: RuntimePaths,
    lock_info: LockInfo,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        self.paths.cleanup_lock(&self.lock_info);
    }
}
