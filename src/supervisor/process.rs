use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::Notify,
};

use crate::{
    config::ServiceDescriptor,
    logging::{LogEntry, LogStream},
};

use super::{ServiceSlot, events::EventSink};

const UTF8_ENV: [(&str, &str); 4] = [
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
    ("LANG", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
];

/// Exit latch shared between the wait task and anyone stopping the worker.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    exit_notify: Notify,
    exited: AtomicBool,
}

impl ProcessHandle {
    pub(crate) fn new() -> Self {
        Self {
            exit_notify: Notify::new(),
            exited: AtomicBool::new(false),
        }
    }

    pub(crate) async fn wait_for_exit(&self) {
        let notified = self.exit_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub(crate) fn signal_exit(&self) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.exit_notify.notify_waiters();
        }
    }
}

/// A worker this supervisor spawned and still holds.
#[derive(Debug, Clone)]
pub(crate) struct ManagedChild {
    pub(crate) pid: u32,
    pub(crate) handle: Arc<ProcessHandle>,
}

/// Shell invocation for a worker, with UTF-8 output forced and overrides applied
/// in order: env file, encoding defaults, then the service's own table.
pub(crate) fn worker_command(
    descriptor: &ServiceDescriptor,
    env_file: &HashMap<String, String>,
) -> Command {
    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("cmd");
        command
            .arg("/C")
            .arg(format!("chcp 65001 >nul && {}", descriptor.start));
        command
    };

    #[cfg(not(windows))]
    let mut command = {
        let mut command = Command::new("bash");
        command.arg("-c").arg(&descriptor.start);
        #[cfg(unix)]
        command.process_group(0);
        command
    };

    if let Some(dir) = descriptor.working_dir() {
        command.current_dir(dir);
    }

    command.envs(env_file);
    command.envs(UTF8_ENV);
    command.envs(&descriptor.env);

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

/// Appends every line of `reader` to the service log and forwards it to the sink.
pub(crate) fn spawn_stream_task<R>(
    slot: Arc<ServiceSlot>,
    events: Arc<dyn EventSink>,
    stream: LogStream,
    reader: R,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buffer);
                    let text = text.trim_end_matches(['\r', '\n']);
                    if text.is_empty() {
                        continue;
                    }
                    record_line(&slot, events.as_ref(), LogEntry::new(stream, text));
                }
                Err(error) => {
                    tracing::warn!(%error, service = %slot.descriptor.name, ?stream, "stopped reading worker output");
                    break;
                }
            }
        }
    });
}

pub(crate) fn record_line(slot: &ServiceSlot, events: &dyn EventSink, entry: LogEntry) {
    let line = entry.format_line();
    slot.log.lock().push(entry);
    events.log_line(&slot.descriptor.name, &line);
}

pub(crate) fn exit_message(status: &std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with code {code}")
    } else if let Some(signal) = exit_signal(status) {
        format!("terminated by signal {signal}")
    } else {
        "process exited".to_string()
    }
}

fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }

    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn exit_latch_releases_late_and_early_waiters() {
        let handle = Arc::new(ProcessHandle::new());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_exit().await })
        };
        tokio::task::yield_now().await;

        handle.signal_exit();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("task joined");

        tokio::time::timeout(Duration::from_millis(100), handle.wait_for_exit())
            .await
            .expect("already exited");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_environment_layers_overrides() {
        let mut descriptor = ServiceDescriptor::new("env", "echo \"$PYTHONUTF8:$LANG:$MODE\"", 1);
        descriptor.env.insert("LANG".to_string(), "en_US.UTF-8".to_string());
        let env_file = HashMap::from([
            ("MODE".to_string(), "file".to_string()),
            ("PYTHONUTF8".to_string(), "0".to_string()),
        ]);

        let output = worker_command(&descriptor, &env_file)
            .output()
            .await
            .expect("bash runs");
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            "1:en_US.UTF-8:file"
        );
    }
}
