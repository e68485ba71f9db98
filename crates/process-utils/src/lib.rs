//! Small process-related helpers shared across the workspace.
//!
//! Child pipelines are opaque to their supervisor: the helpers here only deal
//! with spawning, waiting, graceful-stop escalation, and guaranteed reaping.

use std::ffi::OsStr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// How a supervised child left the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The child exited on its own with the given code (`None` on signal death).
    Exited(Option<i32>),
    /// The child was asked to stop and exited within the grace period.
    Stopped(Option<i32>),
    /// The child ignored the stop request and was killed at the deadline.
    Killed,
}

impl ExitOutcome {
    /// Exit code if the child produced one.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Exited(code) | ExitOutcome::Stopped(code) => *code,
            ExitOutcome::Killed => None,
        }
    }

    /// True when the exit was requested by the supervisor rather than the child.
    pub fn was_requested(&self) -> bool {
        matches!(self, ExitOutcome::Stopped(_) | ExitOutcome::Killed)
    }
}

/// Spawn a task that waits for a child and guarantees it is reaped.
///
/// While the token is untriggered the task simply waits. When the token fires,
/// `quit_bytes` (if any) are written to the child's stdin to request a graceful
/// stop; if the child is still alive after `grace`, it is killed. In every
/// branch the child is `wait()`ed before the result is sent, so no zombie
/// survives the waiter.
///
/// The receiver yields the [`ExitOutcome`]. Dropping the
/// receiver does not cancel the reap.
pub fn spawn_reaping_waiter(
    mut child: Child,
    stop: CancellationToken,
    quit_bytes: Option<&'static [u8]>,
    grace: Duration,
) -> oneshot::Receiver<ExitOutcome> {
    let (tx, rx) = oneshot::channel();
    let mut stdin = child.stdin.take();

    tokio::spawn(async move {
        let outcome = tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(exit) => {
                        if let Some(code) = exit.code()
                            && code != 0
                        {
                            warn!(code, "child exited non-zero");
                        }
                        ExitOutcome::Exited(exit.code())
                    }
                    Err(e) => {
                        error!(error = %e, "failed waiting for child");
                        ExitOutcome::Exited(Some(-1))
                    }
                }
            }
            _ = stop.cancelled() => {
                if let (Some(bytes), Some(mut pipe)) = (quit_bytes, stdin.take()) {
                    debug!("requesting graceful child stop");
                    let _ = pipe.write_all(bytes).await;
                    let _ = pipe.flush().await;
                    let _ = pipe.shutdown().await;
                }

                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(exit)) => ExitOutcome::Stopped(exit.code()),
                    Ok(Err(e)) => {
                        error!(error = %e, "failed waiting for child after stop request");
                        ExitOutcome::Stopped(Some(-1))
                    }
                    Err(_) => {
                        warn!("child ignored stop request; killing");
                        let _ = child.kill().await;
                        // kill() already reaps on success, wait() again is a
                        // no-op that covers the error path.
                        let _ = child.wait().await;
                        ExitOutcome::Killed
                    }
                }
            }
        };

        let _ = tx.send(outcome);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn sh(script: &str) -> tokio::process::Command {
        let mut cmd = tokio_command("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waiter_reports_normal_exit() {
        let child = sh("exit 0")
            .stdin(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let rx = spawn_reaping_waiter(
            child,
            CancellationToken::new(),
            None,
            Duration::from_secs(1),
        );
        assert_eq!(rx.await.unwrap(), ExitOutcome::Exited(Some(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waiter_reports_nonzero_exit() {
        let child = sh("exit 3")
            .stdin(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let rx = spawn_reaping_waiter(
            child,
            CancellationToken::new(),
            None,
            Duration::from_secs(1),
        );
        assert_eq!(rx.await.unwrap(), ExitOutcome::Exited(Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waiter_kills_at_grace_deadline() {
        let child = sh("sleep 30")
            .stdin(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let stop = CancellationToken::new();
        let rx = spawn_reaping_waiter(child, stop.clone(), None, Duration::from_millis(100));
        stop.cancel();
        assert_eq!(rx.await.unwrap(), ExitOutcome::Killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waiter_honors_quit_bytes() {
        // `read x` exits once stdin closes after the quit byte arrives.
        let child = sh("read x; exit 0")
            .stdin(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let stop = CancellationToken::new();
        let rx = spawn_reaping_waiter(child, stop.clone(), Some(b"q\n"), Duration::from_secs(5));
        stop.cancel();
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Stopped(Some(0))));
    }

    #[test]
    fn exit_outcome_code() {
        assert_eq!(ExitOutcome::Exited(Some(2)).code(), Some(2));
        assert_eq!(ExitOutcome::Killed.code(), None);
        assert!(ExitOutcome::Killed.was_requested());
        assert!(!ExitOutcome::Exited(Some(0)).was_requested());
    }
}
