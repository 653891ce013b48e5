use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use helm_core::tools::ToolError;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a shell command in its own process group, with a hard timeout and
/// cooperative cancellation.
///
/// Termination is two-phase: SIGTERM to the group, a grace period, then
/// SIGKILL for anything still alive. The group signal reaches children the
/// shell spawned, not just the shell itself.
pub async fn run_shell(
    command: &str,
    working_directory: &Path,
    timeout: Duration,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ToolError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn shell: {e}")))?;

    // Drain pipes while waiting so a chatty child can't fill the pipe
    // buffer and deadlock against our wait().
    let stdout_task = tokio::spawn(read_all(child.stdout.take()));
    let stderr_task = tokio::spawn(read_all(child.stderr.take()));

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| ToolError::ExecutionFailed(format!("wait failed: {e}")))?
        }
        _ = tokio::time::sleep(timeout) => {
            terminate_with_grace(&mut child, grace).await;
            return Err(ToolError::Timeout(timeout));
        }
        _ = cancel.cancelled() => {
            terminate_with_grace(&mut child, grace).await;
            return Err(ToolError::Cancelled);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code().unwrap_or(-1),
    })
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
pub async fn terminate_with_grace(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return; // already exited
    };

    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!(pid, grace_secs = grace.as_secs(), "process ignored SIGTERM, sending SIGKILL");
            signal_group(pid, libc::SIGKILL);
            let _ = child.wait().await;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.kill().await;
        warn!(pid, "killed process without grace period");
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    // Negative pid addresses the whole process group.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}
