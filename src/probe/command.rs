use std::{fmt, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{process::Command, time::timeout};

use super::ProbeError;

/// Captured result of one finished command. A non-zero exit is not an error at this level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    #[cfg(test)]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[cfg(test)]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs `program` to completion. Fails only when it cannot be executed or times out.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ProbeError> {
        tracing::debug!(program, ?args, "running introspection command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ProbeError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ProbeError::Timeout {
                    program: program.to_string(),
                    after: self.timeout,
                });
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Replays canned responses keyed by the full command line; unmatched commands fail to spawn.
    #[derive(Debug, Default)]
    pub struct ScriptedRunner {
        responses: Mutex<Vec<(String, VecDeque<Reply>)>>,
        calls: Mutex<Vec<String>>,
    }

    #[derive(Debug, Clone)]
    pub enum Reply {
        Output(CommandOutput),
        Unavailable,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a reply for any command line starting with `prefix`.
        pub fn on(&self, prefix: &str, reply: Reply) -> &Self {
            let mut responses = self.responses.lock();
            if let Some((_, queue)) = responses.iter_mut().find(|(key, _)| key == prefix) {
                queue.push_back(reply);
            } else {
                responses.push((prefix.to_string(), VecDeque::from([reply])));
            }
            self
        }

        pub fn on_ok(&self, prefix: &str, stdout: &str) -> &Self {
            self.on(prefix, Reply::Output(CommandOutput::ok(stdout)))
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|call| call.starts_with(prefix))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ProbeError> {
            let line = std::iter::once(program.to_string())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().push(line.clone());

            let reply = {
                let mut responses = self.responses.lock();
                // Longest matching prefix wins; the last queued reply is sticky.
                responses
                    .iter_mut()
                    .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                    .max_by_key(|(prefix, _)| prefix.len())
                    .and_then(|(_, queue)| {
                        if queue.len() > 1 {
                            queue.pop_front()
                        } else {
                            queue.front().cloned()
                        }
                    })
            };

            match reply {
                Some(Reply::Output(output)) => Ok(output),
                Some(Reply::Unavailable) | None => Err(ProbeError::Spawn {
                    program: program.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
                }),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let runner = TokioCommandRunner::new(Duration::from_secs(5));
        let output = runner
            .run("sh", &argv(&["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .expect("sh runs");
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn missing_program_is_a_probe_error() {
        let runner = TokioCommandRunner::new(Duration::from_secs(5));
        let error = runner
            .run("definitely-not-a-real-program-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(error, ProbeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let runner = TokioCommandRunner::new(Duration::from_millis(100));
        let error = runner.run("sleep", &argv(&["5"])).await.unwrap_err();
        assert!(matches!(error, ProbeError::Timeout { .. }));
    }
}
