use std::{sync::Arc, time::Duration};

use backends::{CommandSpecError, command_spec_for};
use serde::Serialize;
use store::InstanceRecord;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::log_sink::LogSink;

use crate::{
    health_prober::{HealthProber, HealthStatus},
    process_supervisor::{ExitReason, ProcessSupervisor, ProcessSupervisorError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance is not running")]
    NotRunning,
    #[error("instance is in a failed state")]
    Failed,
    #[error("timed out waiting for the instance to become ready")]
    NotReady,
    #[error("failed to build launch command: {0}")]
    CommandSpec(#[from] CommandSpecError),
    #[error("failed to spawn child process: {0}")]
    Spawn(#[from] ProcessSupervisorError),
}

struct State {
    record: InstanceRecord,
    status: Status,
    restart_count: u32,
    last_error: Option<String>,
}

/// A snapshot of an instance's persisted record plus its current runtime
/// fields, for `list`/`get` responses.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub record: InstanceRecord,
    pub status: Status,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
}

/// A single named entity binding persisted configuration, a
/// `ProcessSupervisor`, an allocated port, and an auto-restart policy FSM.
///
/// Public operations (`start`/`stop`/`restart`/`update_options`) are
/// serialized by `op_lock`, held for the duration of the call. Runtime fields
/// are additionally guarded by a plain `std::sync::Mutex` so the supervising
/// background task can read/write them without ever awaiting while holding
/// the lock.
pub struct Instance {
    pub name: String,
    op_lock: AsyncMutex<()>,
    state: std::sync::Mutex<State>,
    generation: std::sync::atomic::AtomicU64,
    cancel: std::sync::Mutex<CancellationToken>,
    supervisor: Arc<ProcessSupervisor>,
    pub log_sink: Arc<LogSink>,
    http_client: reqwest::Client,
}

impl Instance {
    pub fn new(record: InstanceRecord, http_client: reqwest::Client, log_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: record.name.clone(),
            op_lock: AsyncMutex::new(()),
            state: std::sync::Mutex::new(State {
                record,
                status: Status::Stopped,
                restart_count: 0,
                last_error: None,
            }),
            generation: std::sync::atomic::AtomicU64::new(0),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            supervisor: Arc::new(ProcessSupervisor::new()),
            log_sink: Arc::new(LogSink::new(log_capacity)),
            http_client,
        })
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().unwrap();
        InstanceSnapshot {
            record: state.record.clone(),
            status: state.status,
            restart_count: state.restart_count,
            last_error: state.last_error.clone(),
            pid: self.supervisor.pid(),
        }
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    pub fn port(&self) -> u16 {
        self.state.lock().unwrap().record.port as u16
    }

    /// User-initiated start. Resets `restart_count` when coming from
    /// `stopped` or `failed`; a no-op if already starting/running/restarting.
    pub async fn start(self: &Arc<Self>, startup_timeout: Duration) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;
        self.launch(true, startup_timeout).await
    }

    /// Start triggered by an on-demand proxy resolution. Only valid from
    /// `stopped`; unlike `start`, it does not reset `restart_count`.
    pub async fn start_on_demand(self: &Arc<Self>, startup_timeout: Duration) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;
        self.launch(false, startup_timeout).await
    }

    async fn launch(self: &Arc<Self>, reset_restart_count: bool, startup_timeout: Duration) -> Result<(), InstanceError> {
        {
            let state = self.state.lock().unwrap();
            if matches!(state.status, Status::Running | Status::Starting | Status::Restarting) {
                return Ok(());
            }
        }

        let record = {
            let mut state = self.state.lock().unwrap();
            if reset_restart_count {
                state.restart_count = 0;
            }
            state.last_error = None;
            state.status = Status::Starting;
            state.record.clone()
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();
        let generation = self.generation.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;

        self.spawn_one(record, generation, cancel, startup_timeout).await
    }

    async fn spawn_one(
        self: &Arc<Self>,
        record: InstanceRecord,
        generation: u64,
        cancel: CancellationToken,
        startup_timeout: Duration,
    ) -> Result<(), InstanceError> {
        let backend_type = record.backend_type.parse().map_err(|_| {
            InstanceError::CommandSpec(backends::CommandSpecError::MissingOption("backend_type"))
        })?;
        let spec = command_spec_for(backend_type);
        let plan = spec.build(record.port as u16, &record.backend_options)?;

        let exit_rx = self.supervisor.launch(&plan, self.log_sink.clone()).await?;

        let prober = HealthProber::spawn(
            self.http_client.clone(),
            record.port as u16,
            plan.health_path.clone(),
            Duration::from_secs(60),
            Duration::from_secs(2),
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.supervise(record, generation, cancel, exit_rx, prober, startup_timeout).await;
        });

        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        record: InstanceRecord,
        generation: u64,
        cancel: CancellationToken,
        mut exit_rx: tokio::sync::oneshot::Receiver<ExitReason>,
        prober: HealthProber,
        startup_timeout: Duration,
    ) {
        let mut health_rx = prober.subscribe();

        let startup_outcome = tokio::select! {
            _ = cancel.cancelled() => { prober.stop(); return; }
            exit = &mut exit_rx => StartupOutcome::Exited(exit.unwrap_or(ExitReason::Unknown)),
            () = wait_for_first_ok(&mut health_rx) => StartupOutcome::Ready,
            () = tokio::time::sleep(startup_timeout) => StartupOutcome::TimedOut,
        };

        match startup_outcome {
            StartupOutcome::Ready => {
                self.mark_ready_if_current(generation);
                info!(instance = %self.name, port = record.port, "instance became ready");
            }
            StartupOutcome::TimedOut => {
                warn!(instance = %self.name, "startup timed out waiting for health check");
                prober.stop();
                self.supervisor.terminate(Duration::from_secs(10)).await;
                self.fail_if_current(generation, "startup timeout".to_string());
                return;
            }
            StartupOutcome::Exited(reason) => {
                prober.stop();
                self.handle_exit(record, generation, reason).await;
                return;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => { prober.stop(); return; }
                exit = &mut exit_rx => {
                    prober.stop();
                    self.handle_exit(record, generation, exit.unwrap_or(ExitReason::Unknown)).await;
                    return;
                }
                health = health_rx.recv() => {
                    if let Ok(HealthStatus::Error(msg)) = health {
                        self.state.lock().unwrap().last_error = Some(msg);
                    }
                }
            }
        }
    }

    async fn handle_exit(self: Arc<Self>, _record: InstanceRecord, generation: u64, reason: ExitReason) {
        if self.generation.load(std::sync::atomic::Ordering::SeqCst) != generation {
            return;
        }

        let message = match reason {
            ExitReason::Code(0) => "exited cleanly".to_string(),
            ExitReason::Code(c) => format!("exited with code {c}"),
            ExitReason::Signal(s) => format!("terminated by signal {s}"),
            ExitReason::Unknown => "exited for an unknown reason".to_string(),
        };

        let (should_restart, restart_delay, new_count) = {
            let mut state = self.state.lock().unwrap();
            if matches!(state.status, Status::Stopped) {
                return;
            }
            state.last_error = Some(message.clone());
            let restart_count = state.restart_count + 1;
            let should_restart = state.record.auto_restart && restart_count <= state.record.max_restarts as u32;
            if should_restart {
                state.status = Status::Restarting;
                state.restart_count = restart_count;
            } else {
                state.status = Status::Failed;
            }
            (should_restart, state.record.restart_delay_seconds, restart_count)
        };

        if !should_restart {
            warn!(instance = %self.name, %message, "instance failed, auto-restart exhausted or disabled");
            return;
        }

        info!(instance = %self.name, attempt = new_count, %message, "scheduling restart");

        let cancel = self.cancel.lock().unwrap().clone();
        tokio::select! {
            _ = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(restart_delay as u64)) => {}
        }

        if self.generation.load(std::sync::atomic::Ordering::SeqCst) != generation {
            return;
        }

        let fresh_record = self.state.lock().unwrap().record.clone();
        let new_generation = self.generation.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let new_cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = new_cancel.clone();

        if let Err(e) = self.spawn_one(fresh_record, new_generation, new_cancel, Duration::from_secs(120)).await {
            warn!(instance = %self.name, error = %e, "failed to relaunch after restart delay");
            self.fail_if_current(new_generation, format!("relaunch failed: {e}"));
        }
    }

    /// A successful health poll after (re)launch resets `restart_count` to 0,
    /// so a long-healthy instance doesn't inherit a stale retry budget from
    /// an earlier, unrelated crash.
    fn mark_ready_if_current(&self, generation: u64) {
        if self.generation.load(std::sync::atomic::Ordering::SeqCst) != generation {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.status = Status::Running;
        state.restart_count = 0;
    }

    fn fail_if_current(&self, generation: u64, message: String) {
        if self.generation.load(std::sync::atomic::Ordering::SeqCst) != generation {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.status = Status::Failed;
        state.last_error = Some(message);
    }

    /// Cancel any pending restart, stop the prober, terminate the child, and
    /// transition to `stopped`, resetting `restart_count`.
    pub async fn stop(&self, grace_period: Duration) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;
        self.cancel.lock().unwrap().cancel();
        self.supervisor.terminate(grace_period).await;

        let mut state = self.state.lock().unwrap();
        state.status = Status::Stopped;
        state.restart_count = 0;
        state.last_error = None;
        Ok(())
    }

    /// Immediately escalate to a forceful kill of the child, bypassing
    /// `op_lock`. Used by `InstanceManager::shutdown` once its overall
    /// ceiling elapses, when a concurrent `stop()` may still be sitting
    /// inside its own (longer) grace period holding `op_lock` — this call
    /// reaches the supervisor directly so shutdown never leaves an orphaned
    /// child running past process exit.
    pub async fn force_kill(&self) {
        self.supervisor.terminate(Duration::ZERO).await;
    }

    pub async fn restart(self: &Arc<Self>, grace_period: Duration, startup_timeout: Duration) -> Result<(), InstanceError> {
        self.stop(grace_period).await?;
        self.start(startup_timeout).await
    }

    /// Replace the persisted fields. If currently running, the caller is
    /// expected to have already decided whether a restart is warranted (the
    /// manager restarts after a successful persist when the instance was
    /// running at update time).
    pub fn apply_record(&self, record: InstanceRecord) {
        self.state.lock().unwrap().record = record;
    }

    pub fn tail_logs(&self, n: usize) -> Vec<String> {
        self.log_sink.tail(n)
    }

    /// Wait until the instance reaches `running` or `failed`, or until
    /// `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), InstanceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status() {
                Status::Running => return Ok(()),
                Status::Failed => return Err(InstanceError::Failed),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(InstanceError::NotReady);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

enum StartupOutcome {
    Ready,
    TimedOut,
    Exited(ExitReason),
}

async fn wait_for_first_ok(rx: &mut tokio::sync::broadcast::Receiver<HealthStatus>) {
    loop {
        match rx.recv().await {
            Ok(HealthStatus::Ok) => return,
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(name: &str, port: i64, backend_type: &str) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            backend_type: backend_type.to_string(),
            backend_options: serde_json::json!({"model": "/m.gguf"}),
            auto_restart: false,
            max_restarts: 0,
            restart_delay_seconds: 1,
            on_demand_start: true,
            port,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn new_instance_starts_stopped() {
        let instance = Instance::new(sample_record("alpha", 20001, "llama_cpp"), reqwest::Client::new(), 100);
        assert_eq!(instance.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn start_with_unknown_backend_fails_fast() {
        let instance = Instance::new(sample_record("alpha", 20001, "not_a_backend"), reqwest::Client::new(), 100);
        let err = instance.start(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, InstanceError::CommandSpec(_)));
        assert_eq!(instance.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_harmless_no_op() {
        let instance = Instance::new(sample_record("alpha", 20001, "llama_cpp"), reqwest::Client::new(), 100);
        instance.stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(instance.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn mark_ready_resets_restart_count_inherited_from_an_earlier_crash() {
        let instance = Instance::new(sample_record("alpha", 20001, "llama_cpp"), reqwest::Client::new(), 100);
        {
            let mut state = instance.state.lock().unwrap();
            state.restart_count = 2;
            state.status = Status::Restarting;
        }
        let generation = instance.generation.load(std::sync::atomic::Ordering::SeqCst);

        instance.mark_ready_if_current(generation);

        let snapshot = instance.snapshot();
        assert_eq!(snapshot.status, Status::Running);
        assert_eq!(snapshot.restart_count, 0);
    }

    #[tokio::test]
    async fn mark_ready_ignores_a_stale_generation() {
        let instance = Instance::new(sample_record("alpha", 20001, "llama_cpp"), reqwest::Client::new(), 100);
        {
            let mut state = instance.state.lock().unwrap();
            state.restart_count = 3;
            state.status = Status::Restarting;
        }
        let stale_generation = instance.generation.load(std::sync::atomic::Ordering::SeqCst);
        instance.generation.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        instance.mark_ready_if_current(stale_generation);

        let snapshot = instance.snapshot();
        assert_eq!(snapshot.status, Status::Restarting);
        assert_eq!(snapshot.restart_count, 3);
    }
}
