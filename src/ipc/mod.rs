mod dispatch;
mod lock;
mod protocol;

pub use lock::RuntimePaths;
pub use protocol::{ClientCommand, CommandReply};

#[cfg(unix)]
mod unix;

pub use unix::{DaemonOptions, connect_existing_client, require_daemon_client, run_daemon};

#[cfg(not(unix))]
mod unix {
    use std::{path::PathBuf, sync::Arc};

    use anyhow::{Result, bail};

    use super::{ClientCommand, CommandReply, RuntimePaths};
    use crate::supervisor::{BroadcastSink, Supervisor};

    #[derive(Debug, Clone)]
    pub struct IpcClient;

    #[derive(Debug)]
    pub struct EventStream;

    #[derive(Debug)]
    pub struct DaemonOptions {
        pub supervisor: Arc<Supervisor>,
        pub events: Arc<BroadcastSink>,
        pub paths: RuntimePaths,
        pub config_path: Option<PathBuf>,
    }

    pub async fn connect_existing_client(_paths: &RuntimePaths) -> Result<Option<IpcClient>> {
        Ok(None)
    }

    pub async fn require_daemon_client(_paths: &RuntimePaths) -> Result<IpcClient> {
        bail!("IPC is not supported on this platform")
    }

    pub async fn run_daemon(_options: DaemonOptions) -> Result<()> {
        bail!("IPC is not supported on this platform")
    }

    impl IpcClient {
        pub async fn send(&self, _command: ClientCommand) -> Result<CommandReply> {
            bail!("IPC is not supported on this platform")
        }

        pub async fn subscribe(&self) -> Result<EventStream> {
            bail!("IPC is not supported on this platform")
        }
    }

    impl EventStream {
        pub async fn next_line(&mut self) -> Result<Option<String>> {
            bail!("IPC is not supported on this platform")
        }
    }
}
