use std::{process::Stdio, sync::Arc, time::Duration};

use command_group::AsyncCommandGroup;
#[cfg(unix)]
use nix::{
    sys::signal::{Signal, killpg},
    unistd::{Pid, getpgid},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{Notify, oneshot},
};
use tracing::warn;
use utils::log_sink::LogSink;

use backends::CommandPlan;

#[derive(Debug, Error)]
pub enum ProcessSupervisorError {
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("child already running")]
    AlreadyRunning,
}

/// Exit reason delivered to the owning `Instance` when the child terminates.
#[derive(Debug, Clone, Copy)]
pub enum ExitReason {
    /// Exited with the given status code.
    Code(i32),
    /// Terminated by a signal (Unix only; reported as a best-effort signal number).
    Signal(i32),
    /// Exit status could not be determined.
    Unknown,
}

/// Owns one child OS process. Spawns it as its own process group leader
/// (Unix) so `terminate` can reach helper processes the backend forks.
///
/// The child handle itself is owned exclusively by the task spawned in
/// `launch`; `terminate` communicates with it only via the recorded pid and a
/// `Notify`, so sending a signal never contends with the task blocked in
/// `wait()`.
pub struct ProcessSupervisor {
    pid: Arc<std::sync::Mutex<Option<i32>>>,
    exited: Arc<Notify>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            pid: Arc::new(std::sync::Mutex::new(None)),
            exited: Arc::new(Notify::new()),
        }
    }

    /// Spawn the child, multiplexing its stdout/stderr into `log_sink`, and
    /// return a one-shot receiver fired when the child exits.
    pub async fn launch(
        &self,
        plan: &CommandPlan,
        log_sink: Arc<LogSink>,
    ) -> Result<oneshot::Receiver<ExitReason>, ProcessSupervisorError> {
        {
            let guard = self.pid.lock().unwrap();
            if guard.is_some() {
                return Err(ProcessSupervisorError::AlreadyRunning);
            }
        }

        let mut command = Command::new(&plan.program);
        command
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .args(&plan.args);

        if let Some(cwd) = &plan.cwd {
            command.current_dir(cwd);
        }
        for (k, v) in &plan.env {
            command.env(k, v);
        }

        let mut child = command.group_spawn().map_err(ProcessSupervisorError::Spawn)?;

        let pid = child.inner().id().map(|p| p as i32);
        *self.pid.lock().unwrap() = pid;
        tracing::info!(pid, program = %plan.program, "spawned child process");

        if let Some(stdout) = child.inner().stdout.take() {
            spawn_line_forwarder(stdout, log_sink.clone());
        }
        if let Some(stderr) = child.inner().stderr.take() {
            spawn_line_forwarder(stderr, log_sink);
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let exited = self.exited.clone();
        let pid_slot = self.pid.clone();

        tokio::spawn(async move {
            let status = child.wait().await;
            let reason = match status {
                Ok(status) => exit_reason_from_status(status),
                Err(e) => {
                    warn!(error = %e, "failed to wait on child process");
                    ExitReason::Unknown
                }
            };
            *pid_slot.lock().unwrap() = None;
            exited.notify_waiters();
            let _ = exit_tx.send(reason);
        });

        Ok(exit_rx)
    }

    /// Send the platform's graceful termination signal, wait up to
    /// `grace_period`, then forcibly kill. Idempotent: a no-op if no child is
    /// currently recorded as running.
    pub async fn terminate(&self, grace_period: Duration) {
        let Some(pid) = *self.pid.lock().unwrap() else { return };

        #[cfg(unix)]
        {
            let pgid = getpgid(Some(Pid::from_raw(pid))).unwrap_or(Pid::from_raw(pid));

            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                warn!(pid, error = %e, "failed to send SIGTERM to process group");
            }

            tokio::select! {
                _ = tokio::time::sleep(grace_period) => {
                    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                        warn!(pid, error = %e, "failed to send SIGKILL to process group");
                    }
                }
                _ = self.exited.notified() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::time::sleep(grace_period) => {}
                _ = self.exited.notified() => {}
            }
        }

        *self.pid.lock().unwrap() = None;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.lock().unwrap().map(|p| p as u32)
    }
}

fn exit_reason_from_status(status: std::process::ExitStatus) -> ExitReason {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            return ExitReason::Code(code);
        }
        if let Some(sig) = status.signal() {
            return ExitReason::Signal(sig);
        }
        ExitReason::Unknown
    }
    #[cfg(not(unix))]
    {
        status.code().map(ExitReason::Code).unwrap_or(ExitReason::Unknown)
    }
}

fn spawn_line_forwarder<R>(reader: R, sink: Arc<LogSink>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.push_line(line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_plan(script: &str) -> CommandPlan {
        CommandPlan {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![],
            cwd: None,
            health_path: "/health".to_string(),
        }
    }

    #[tokio::test]
    async fn launch_captures_stdout_into_log_sink() {
        let sup = ProcessSupervisor::new();
        let sink = Arc::new(LogSink::new(10));
        let exit_rx = sup.launch(&shell_plan("echo hello; echo world"), sink.clone()).await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), exit_rx).await.unwrap().unwrap();
        assert!(matches!(reason, ExitReason::Code(0)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.all(), vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn second_launch_while_running_is_rejected() {
        let sup = ProcessSupervisor::new();
        let sink = Arc::new(LogSink::new(10));
        let _rx = sup.launch(&shell_plan("sleep 5"), sink.clone()).await.unwrap();

        let err = sup.launch(&shell_plan("sleep 5"), sink).await.unwrap_err();
        assert!(matches!(err, ProcessSupervisorError::AlreadyRunning));

        sup.terminate(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn terminate_kills_long_running_child_promptly() {
        let sup = ProcessSupervisor::new();
        let sink = Arc::new(LogSink::new(10));
        let exit_rx = sup.launch(&shell_plan("sleep 30"), sink).await.unwrap();

        let start = std::time::Instant::now();
        sup.terminate(Duration::from_millis(300)).await;
        tokio::time::timeout(Duration::from_secs(2), exit_rx).await.unwrap().unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn terminate_on_already_exited_child_is_a_no_op() {
        let sup = ProcessSupervisor::new();
        let sink = Arc::new(LogSink::new(10));
        let exit_rx = sup.launch(&shell_plan("true"), sink).await.unwrap();
        exit_rx.await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.terminate(Duration::from_millis(100)).await;
    }

    /// Mirrors `InstanceManager::shutdown`'s force-kill path: a `stop()` with
    /// a long grace period is already in flight when the shutdown ceiling
    /// elapses and a second, zero-grace `terminate` is issued straight at the
    /// supervisor. The child must still die promptly rather than surviving
    /// until the first call's grace period runs out.
    #[tokio::test]
    async fn zero_grace_terminate_kills_promptly_despite_a_slower_terminate_in_flight() {
        let sup = Arc::new(ProcessSupervisor::new());
        let sink = Arc::new(LogSink::new(10));
        let exit_rx = sup.launch(&shell_plan("sleep 30"), sink).await.unwrap();

        let slow = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.terminate(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        sup.terminate(Duration::ZERO).await;
        tokio::time::timeout(Duration::from_secs(2), exit_rx).await.unwrap().unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        slow.await.unwrap();
    }
}
