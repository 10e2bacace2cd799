use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum, builder::PossibleValue};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "guestbridge",
    version,
    about = "Supervisor for host workers with guest port bridging"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Command::Daemon(args) => handlers::daemon(args).await,
            Command::Start(args) => handlers::start(args).await,
            Command::Stop(args) => handlers::stop(args).await,
            Command::Status(args) => handlers::status(args).await,
            Command::Log(args) => handlers::log(args).await,
            Command::Proxy(command) => handlers::proxy(command).await,
            Command::Guest(command) => handlers::guest(command).await,
            Command::Events => handlers::events().await,
            Command::Shutdown => handlers::shutdown().await,
            Command::Completions(args) => handlers::completions(args),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the supervisor daemon in the foreground
    Daemon(DaemonArgs),
    /// Start a service
    Start(ServiceArgs),
    /// Stop a service, forcing it after the grace period
    Stop(ServiceArgs),
    /// Show the reconciled status of one or all services
    Status(StatusArgs),
    /// Print captured output of a service
    Log(LogArgs),
    /// Manage host-to-guest port mappings
    #[command(subcommand)]
    Proxy(ProxyCommand),
    /// Inspect the guest environment
    #[command(subcommand)]
    Guest(GuestCommand),
    /// Stream status and output events until interrupted
    Events,
    /// Stop every managed service and the daemon
    Shutdown,
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Service registry to load
    #[arg(long, short = 'c', value_name = "FILE", default_value = "guestbridge.toml")]
    pub config: PathBuf,

    /// Load worker environment variables from the given file
    #[arg(long = "env", short = 'e', value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ServiceArgs {
    /// Service name from the registry
    pub service: String,
}

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Restrict output to one service
    pub service: Option<String>,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Service name from the registry
    pub service: String,

    /// Number of most recent lines to print
    #[arg(long = "lines", short = 'n', default_value_t = 100)]
    pub lines: i64,
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommand {
    /// Forward a host port to an address and port
    Set {
        local_port: i64,
        target_address: String,
        target_port: i64,
    },
    /// Remove the mapping on a host port
    Clear { local_port: i64 },
    /// List mappings configured on the host
    List,
    /// Report whether a host port is forwarded
    Check { local_port: i64 },
}

#[derive(Subcommand, Debug)]
pub enum GuestCommand {
    /// Show guest reachability and the guest ports of bridged services
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: CompletionShell,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl ValueEnum for CompletionShell {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            CompletionShell::Bash,
            CompletionShell::Zsh,
            CompletionShell::Fish,
            CompletionShell::PowerShell,
            CompletionShell::Elvish,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        Some(match self {
            CompletionShell::Bash => PossibleValue::new("bash"),
            CompletionShell::Zsh => PossibleValue::new("zsh"),
            CompletionShell::Fish => PossibleValue::new("fish"),
            CompletionShell::PowerShell => PossibleValue::new("powershell"),
            CompletionShell::Elvish => PossibleValue::new("elvish"),
        })
    }
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

mod handlers;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_and_log_commands() {
        let cli = Cli::parse_from(["guestbridge", "proxy", "set", "5000", "172.20.1.5", "5000"]);
        match cli.command {
            Command::Proxy(ProxyCommand::Set {
                local_port,
                target_address,
                target_port,
            }) => {
                assert_eq!(local_port, 5000);
                assert_eq!(target_address, "172.20.1.5");
                assert_eq!(target_port, 5000);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["guestbridge", "log", "comfyui", "-n", "20"]);
        match cli.command {
            Command::Log(args) => {
                assert_eq!(args.service, "comfyui");
                assert_eq!(args.lines, 20);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_guest_and_proxy_check_commands() {
        let cli = Cli::parse_from(["guestbridge", "guest", "status", "media-api"]);
        match cli.command {
            Command::Guest(GuestCommand::Status(args)) => {
                assert_eq!(args.service.as_deref(), Some("media-api"));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["guestbridge", "proxy", "check", "5000"]);
        assert!(matches!(
            cli.command,
            Command::Proxy(ProxyCommand::Check { local_port: 5000 })
        ));
    }

    #[test]
    fn daemon_defaults_to_local_config() {
        let cli = Cli::parse_from(["guestbridge", "daemon"]);
        match cli.command {
            Command::Daemon(args) => {
                assert_eq!(args.config, PathBuf::from("guestbridge.toml"));
                assert!(args.env_file.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
