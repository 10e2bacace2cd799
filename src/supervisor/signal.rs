//! Termination requests for a spawned worker and everything it started.

use std::io;

#[cfg(unix)]
pub(crate) async fn request_termination(pid: u32, force: bool) -> io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };

    // Workers lead their own process group, so the group id is the pid.
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

#[cfg(not(unix))]
pub(crate) async fn request_termination(pid: u32, force: bool) -> io::Result<()> {
    use std::process::Stdio;

    let mut command = tokio::process::Command::new("taskkill");
    command.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        command.arg("/F");
    }
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") {
            return Ok(());
        }
        Err(io::Error::other(format!(
            "taskkill exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signalling_a_vanished_group_is_not_an_error() {
        let mut child = tokio::process::Command::new("true")
            .process_group(0)
            .spawn()
            .expect("spawn true");
        let pid = child.id().expect("pid");
        child.wait().await.expect("wait");

        request_termination(pid, false)
            .await
            .expect("already gone is fine");
    }
}
