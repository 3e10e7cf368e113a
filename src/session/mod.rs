//! Probe session lifecycle.
//!
//! A session owns one slot's probe loop: it launches the invoker, feeds every
//! line through the parser into its statistics and run log, and tears the
//! invocation down on stop or when the configured count is exhausted.

mod logger;
mod stats;

pub use logger::*;
pub use stats::*;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::events::SupervisorEvent;
use crate::probe::{
    Invocation, InvocationError, InvocationExit, LineClass, Measurement, ProbeConfig,
    ProbeInvoker, ResultParser, StopSignal, Target,
};

/// Default time an invoker gets to release its resource after stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Default number of raw lines kept for display.
pub const DEFAULT_HISTORY_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
    Completed,
}

impl SessionState {
    /// Whether a new `start` is allowed.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Completed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {slot} is already running")]
    Busy { slot: usize },
    #[error("session {slot} has no target address")]
    Unconfigured { slot: usize },
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("probe for slot {slot} did not release within {grace:?}")]
    ReleaseTimeout { slot: usize, grace: Duration },
}

/// Collaborators shared by every session of a supervisor.
#[derive(Clone)]
pub struct SessionContext {
    pub invoker: Arc<dyn ProbeInvoker>,
    pub parser: Arc<ResultParser>,
    pub logger: Option<SessionLogger>,
    pub stop_grace: Duration,
    pub history_lines: usize,
    pub events: broadcast::Sender<SupervisorEvent>,
}

impl SessionContext {
    pub fn new(invoker: Arc<dyn ProbeInvoker>, events: broadcast::Sender<SupervisorEvent>) -> Self {
        Self {
            invoker,
            parser: Arc::new(ResultParser::default()),
            logger: None,
            stop_grace: DEFAULT_STOP_GRACE,
            history_lines: DEFAULT_HISTORY_LINES,
            events,
        }
    }
}

/// Read-only view of a session for display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub slot: usize,
    pub address: String,
    pub state: SessionState,
    pub statistics: Statistics,
    pub average_rtt: Option<f64>,
    pub last_lines: Vec<String>,
    pub last_error: Option<String>,
    pub leak_flagged: bool,
    pub started_at: Option<DateTime<Local>>,
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ping {} [{}] {}: {}",
            self.slot, self.address, self.state, self.statistics
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " ({})", err)?;
        }
        if self.leak_flagged {
            write!(f, " [probe leaked]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunMeta {
    address: String,
    started_at: Option<DateTime<Local>>,
    last_error: Option<String>,
    leak_flagged: bool,
}

/// State read by observers and written by the session's own loop.
struct Shared {
    slot: usize,
    state: watch::Sender<SessionState>,
    stats: StatisticsAccumulator,
    recent: Mutex<VecDeque<String>>,
    meta: Mutex<RunMeta>,
    history_lines: usize,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        if self.state.send_replace(state) != state {
            let _ = self.events.send(SupervisorEvent::StateChanged {
                slot: self.slot,
                state,
            });
        }
    }

    /// Move `from` -> `to` only if the session is still in `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.events.send(SupervisorEvent::StateChanged {
                slot: self.slot,
                state: to,
            });
        }
        changed
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, RunMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_recent(&self, line: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == self.history_lines {
            recent.pop_front();
        }
        if self.history_lines > 0 {
            recent.push_back(line.to_string());
        }
    }

    fn log_line(&self, log: &mut Option<RunLog>, line: &str) {
        self.push_recent(line);
        if let Some(run_log) = log {
            if let Err(e) = run_log.append(line) {
                tracing::warn!(slot = self.slot, "Disabling run log: {}", e);
                *log = None;
            }
        }
    }

    /// Log a line and fold it into the statistics. Returns whether it counted.
    fn record(&self, parser: &ResultParser, log: &mut Option<RunLog>, line: &str) -> bool {
        self.log_line(log, line);

        let measurement = match parser.classify(line) {
            LineClass::Success(rtt) => Measurement::success(rtt),
            LineClass::Failure => Measurement::failure(),
            LineClass::MissingRtt => {
                tracing::debug!(slot = self.slot, line, "Latency marker without a value");
                return false;
            }
            LineClass::Unmatched => return false,
        };

        self.stats.apply(&measurement);
        let _ = self.events.send(SupervisorEvent::Measured {
            slot: self.slot,
            measurement,
        });
        true
    }

    fn snapshot(&self) -> SessionSnapshot {
        let statistics = self.stats.snapshot();
        let last_lines = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        let meta = self.meta();
        SessionSnapshot {
            slot: self.slot,
            address: meta.address.clone(),
            state: self.state(),
            average_rtt: statistics.average_rtt(),
            statistics,
            last_lines,
            last_error: meta.last_error.clone(),
            leak_flagged: meta.leak_flagged,
            started_at: meta.started_at,
        }
    }
}

/// How a run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunEnd {
    exit: Option<InvocationExit>,
    leaked: bool,
}

struct RunHandle {
    stop_tx: broadcast::Sender<()>,
    task: JoinHandle<RunEnd>,
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        // a session dropped mid-run must not leave its probe behind
        let _ = self.stop_tx.send(());
    }
}

struct Control {
    target: Target,
    config: ProbeConfig,
    run: Option<RunHandle>,
}

/// One slot's probe loop and statistics.
pub struct ProbeSession {
    shared: Arc<Shared>,
    ctx: SessionContext,
    control: tokio::sync::Mutex<Control>,
}

impl fmt::Debug for ProbeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSession")
            .field("slot", &self.shared.slot)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl ProbeSession {
    /// Create an idle session with empty statistics.
    pub fn new(slot: usize, config: ProbeConfig, ctx: SessionContext) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let shared = Arc::new(Shared {
            slot,
            state,
            stats: StatisticsAccumulator::new(),
            recent: Mutex::new(VecDeque::with_capacity(ctx.history_lines)),
            meta: Mutex::new(RunMeta::default()),
            history_lines: ctx.history_lines,
            events: ctx.events.clone(),
        });

        Self {
            shared,
            ctx,
            control: tokio::sync::Mutex::new(Control {
                target: Target::new(slot, ""),
                config,
                run: None,
            }),
        }
    }

    pub fn slot(&self) -> usize {
        self.shared.slot
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    pub async fn address(&self) -> String {
        self.control.lock().await.target.address.clone()
    }

    pub async fn config(&self) -> ProbeConfig {
        self.control.lock().await.config
    }

    /// Set the target address used by the next start.
    pub async fn set_address(&self, address: &str) {
        let mut control = self.control.lock().await;
        control.target = Target::new(self.shared.slot, address);
        self.shared.meta().address = control.target.address.clone();
    }

    /// Set the probe config used by the next start.
    pub async fn set_config(&self, config: ProbeConfig) {
        self.control.lock().await.config = config;
    }

    /// Clear statistics and history. Rejected while running.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let _control = self.control.lock().await;
        if !self.shared.state().can_start() {
            return Err(SessionError::Busy {
                slot: self.shared.slot,
            });
        }
        self.clear_run_data(None);
        Ok(())
    }

    fn clear_run_data(&self, started_at: Option<DateTime<Local>>) {
        self.shared.stats.reset();
        self.shared
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let mut meta = self.shared.meta();
        meta.started_at = started_at;
        meta.last_error = None;
        meta.leak_flagged = false;
    }

    /// Launch a new run. Only legal from `Idle` or `Completed`.
    pub async fn start(&self) -> Result<(), SessionError> {
        let slot = self.shared.slot;
        let mut control = self.control.lock().await;

        if !self.shared.state().can_start() {
            return Err(SessionError::Busy { slot });
        }
        if let Some(mut previous) = control.run.take() {
            // the loop already set its final state; just reap it
            let _ = (&mut previous.task).await;
        }
        if !control.target.is_configured() {
            return Err(SessionError::Unconfigured { slot });
        }

        let target = control.target.clone();
        let config = control.config;
        let started_at = Local::now();
        self.clear_run_data(Some(started_at));

        let (stop_tx, _) = broadcast::channel(1);
        let invocation = match self
            .ctx
            .invoker
            .invoke(&target, &config, stop_tx.subscribe())
            .await
        {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!(slot, address = %target.address, "Probe failed to start: {}", e);
                self.shared.meta().last_error = Some(e.to_string());
                self.shared.set_state(SessionState::Idle);
                let _ = self.ctx.events.send(SupervisorEvent::InvocationFailed {
                    slot,
                    error: e.clone(),
                });
                return Err(e.into());
            }
        };

        let run_log = match self.ctx.logger.clone() {
            Some(logger) => {
                let address = target.address.clone();
                let opened =
                    tokio::task::spawn_blocking(move || logger.open_run(&address, &started_at))
                        .await;
                match opened {
                    Ok(Ok(log)) => Some(log),
                    Ok(Err(e)) => {
                        tracing::warn!(slot, "Run log unavailable: {}", e);
                        None
                    }
                    Err(e) => {
                        tracing::warn!(slot, "Run log task failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        self.shared.set_state(SessionState::Running);
        tracing::info!(
            slot,
            address = %target.address,
            interval_ms = config.interval_millis,
            count = config.count,
            "Session started"
        );

        let task = tokio::spawn(run_loop(RunLoop {
            shared: self.shared.clone(),
            parser: self.ctx.parser.clone(),
            log: run_log,
            invocation,
            stop: stop_tx.subscribe(),
            stop_tx: stop_tx.clone(),
            count: config.count,
            grace: self.ctx.stop_grace,
        }));
        control.run = Some(RunHandle { stop_tx, task });

        Ok(())
    }

    /// Stop the current run and wait for the invoker to release its resource.
    ///
    /// A no-op when nothing is running, including a run that already ended on
    /// its own. If the invoker misses the grace
    /// period the session still ends up `Idle` and `ReleaseTimeout` is
    /// returned so the leak can be reported.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let slot = self.shared.slot;
        let mut control = self.control.lock().await;
        let Some(mut run) = control.run.take() else {
            return Ok(());
        };

        if self.shared.state().can_start() {
            // the run already ended on its own; a leak was reported when it ended
            let _ = (&mut run.task).await;
            return Ok(());
        }

        self.shared
            .transition(SessionState::Running, SessionState::Stopping);
        let _ = run.stop_tx.send(());

        let end = (&mut run.task).await;
        self.shared
            .transition(SessionState::Stopping, SessionState::Idle);

        match end {
            Ok(RunEnd { leaked: true, .. }) => Err(SessionError::ReleaseTimeout {
                slot,
                grace: self.ctx.stop_grace,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(slot, "Probe loop ended abnormally: {}", e);
                self.shared.set_state(SessionState::Idle);
                Ok(())
            }
        }
    }
}

struct RunLoop {
    shared: Arc<Shared>,
    parser: Arc<ResultParser>,
    log: Option<RunLog>,
    invocation: Invocation,
    stop: StopSignal,
    stop_tx: broadcast::Sender<()>,
    count: u32,
    grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Stopped,
    StreamEnded,
    Exhausted,
}

async fn run_loop(run: RunLoop) -> RunEnd {
    let RunLoop {
        shared,
        parser,
        mut log,
        invocation,
        mut stop,
        stop_tx,
        count,
        grace,
    } = run;
    let Invocation { mut lines, exit } = invocation;
    let slot = shared.slot;
    let mut classified = 0u32;

    let end = loop {
        let line = tokio::select! {
            biased;
            _ = stop.recv() => break LoopEnd::Stopped,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            break LoopEnd::StreamEnded;
        };

        if shared.record(&parser, &mut log, &line) {
            classified += 1;
        }
        if count > 0 && classified >= count {
            break LoopEnd::Exhausted;
        }
    };

    let mut stopped = end == LoopEnd::Stopped;
    if end == LoopEnd::Exhausted {
        // let the invoker finish on its own so trailing summary lines reach the log
        let drain = async {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.recv() => return true,
                    line = lines.recv() => match line {
                        Some(line) => shared.log_line(&mut log, &line),
                        None => return false,
                    },
                }
            }
        };
        stopped = tokio::time::timeout(grace, drain).await.unwrap_or(false);
    }

    let _ = stop_tx.send(());
    drop(lines);
    let (exit, leaked) = release(exit, grace).await;

    if leaked {
        tracing::warn!(slot, ?grace, "Probe did not release its resource in time");
        shared.meta().leak_flagged = true;
        let _ = shared.events.send(SupervisorEvent::ReleaseTimeout { slot });
    }

    match &exit {
        Some(InvocationExit::Failed(reason)) => {
            shared.meta().last_error = Some(format!("probe failed: {}", reason));
        }
        Some(InvocationExit::Finished(Some(code))) if *code != 0 && classified == 0 => {
            shared.meta().last_error = Some(format!("probe exited with status {}", code));
        }
        _ => {}
    }

    let final_state = match end {
        LoopEnd::Exhausted if !stopped => SessionState::Completed,
        LoopEnd::StreamEnded if count > 0 => SessionState::Completed,
        _ => SessionState::Idle,
    };
    shared.set_state(final_state);
    tracing::info!(slot, state = %final_state, classified, "Session ended");

    RunEnd { exit, leaked }
}

/// Wait for the invocation to release its resource, aborting it after `grace`.
async fn release(mut exit: JoinHandle<InvocationExit>, grace: Duration) -> (Option<InvocationExit>, bool) {
    match tokio::time::timeout(grace, &mut exit).await {
        Ok(Ok(exit)) => (Some(exit), false),
        Ok(Err(e)) => (Some(InvocationExit::Failed(e.to_string())), false),
        Err(_) => {
            exit.abort();
            let _ = exit.await;
            (None, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EVENT_BUFFER;
    use crate::probe::scripted::{AfterScript, ScriptedInvoker};
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    const REPLY: &str = "Reply from 8.8.8.8: bytes=32 time=23ms TTL=64";
    const TIMEOUT: &str = "Request timed out.";

    fn context(invoker: Arc<dyn ProbeInvoker>) -> SessionContext {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut ctx = SessionContext::new(invoker, events);
        ctx.stop_grace = Duration::from_millis(200);
        ctx
    }

    async fn session_with(invoker: Arc<dyn ProbeInvoker>, config: ProbeConfig) -> ProbeSession {
        let session = ProbeSession::new(1, config, context(invoker));
        session.set_address("8.8.8.8").await;
        session
    }

    async fn wait_for_state(session: &ProbeSession, state: SessionState) {
        let mut rx = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state reached in time")
            .expect("session alive");
    }

    #[tokio::test]
    async fn test_count_exhaustion_completes() {
        let invoker = Arc::new(ScriptedInvoker::new(
            &[
                "Pinging 8.8.8.8 with 32 bytes of data:",
                REPLY,
                TIMEOUT,
                "Reply from 8.8.8.8: bytes=32 time=41ms TTL=64",
                "Ping statistics for 8.8.8.8:",
            ],
            AfterScript::Exit,
        ));
        let session = session_with(invoker.clone(), ProbeConfig::new(0, 3)).await;

        assert_ok!(session.start().await);
        wait_for_state(&session, SessionState::Completed).await;

        let snap = session.snapshot();
        assert_eq!(snap.statistics.success_count, 2);
        assert_eq!(snap.statistics.failure_count, 1);
        assert_eq!(snap.statistics.min_rtt, Some(23));
        assert_eq!(snap.statistics.max_rtt, Some(41));
        assert_eq!(snap.average_rtt, Some(32.0));
        assert_eq!(snap.last_lines.len(), 5);
        assert_eq!(invoker.live_invocations(), 0);
    }

    #[tokio::test]
    async fn test_count_exhaustion_releases_open_stream() {
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY, REPLY, REPLY], AfterScript::HoldOpen));
        let session = session_with(invoker.clone(), ProbeConfig::new(0, 3)).await;

        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Completed).await;
        assert_eq!(session.snapshot().statistics.success_count, 3);
        assert_eq!(invoker.live_invocations(), 0);
        assert!(!session.snapshot().leak_flagged);
    }

    #[tokio::test]
    async fn test_start_while_running_is_busy() {
        let invoker = Arc::new(ScriptedInvoker::idle_forever());
        let session = session_with(invoker.clone(), ProbeConfig::default()).await;

        session.start().await.unwrap();
        assert_eq!(
            session.start().await,
            Err(SessionError::Busy { slot: 1 })
        );
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(invoker.invocations(), 1);
        assert_eq!(invoker.live_invocations(), 1);

        session.stop().await.unwrap();
        assert_eq!(invoker.live_invocations(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let invoker = Arc::new(ScriptedInvoker::idle_forever());
        let session = session_with(invoker.clone(), ProbeConfig::default()).await;

        // stopping an idle session is a no-op
        assert_ok!(session.stop().await);
        assert_eq!(session.state(), SessionState::Idle);

        session.start().await.unwrap();
        assert_ok!(session.stop().await);
        assert_eq!(session.state(), SessionState::Idle);
        assert_ok!(session.stop().await);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(invoker.live_invocations(), 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_mid_stream() {
        let invoker = Arc::new(
            ScriptedInvoker::new(&[REPLY; 100], AfterScript::Exit)
                .with_line_delay(Duration::from_millis(50)),
        );
        let session = session_with(invoker.clone(), ProbeConfig::default()).await;

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(180)).await;
        let started = std::time::Instant::now();
        session.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Idle);
        let stats = session.snapshot().statistics;
        assert!(stats.success_count < 100);
        assert_eq!(invoker.live_invocations(), 0);

        // statistics survive until the next start
        let before = session.snapshot().statistics;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.snapshot().statistics, before);
    }

    #[tokio::test]
    async fn test_invocation_error_returns_to_idle() {
        let invoker = Arc::new(ScriptedInvoker::failing(InvocationError::Resolve {
            address: "nowhere.invalid".to_string(),
            reason: "unknown host".to_string(),
        }));
        let session = session_with(invoker, ProbeConfig::default()).await;

        let err = assert_err!(session.start().await);
        assert!(matches!(err, SessionError::Invocation(InvocationError::Resolve { .. })));

        let snap = session.snapshot();
        assert_eq!(snap.state, SessionState::Idle);
        assert_eq!(snap.statistics.processed(), 0);
        assert!(snap.last_error.unwrap().contains("unknown host"));
    }

    #[tokio::test]
    async fn test_unconfigured_session_rejected() {
        let invoker = Arc::new(ScriptedInvoker::idle_forever());
        let session = ProbeSession::new(2, ProbeConfig::default(), context(invoker.clone()));
        assert_eq!(
            session.start().await,
            Err(SessionError::Unconfigured { slot: 2 })
        );
        assert_eq!(invoker.invocations(), 0);
    }

    #[tokio::test]
    async fn test_release_timeout_is_flagged() {
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY], AfterScript::Hang));
        let session = session_with(invoker.clone(), ProbeConfig::default()).await;

        session.start().await.unwrap();
        let result = session.stop().await;
        assert!(matches!(result, Err(SessionError::ReleaseTimeout { slot: 1, .. })));

        let snap = session.snapshot();
        assert_eq!(snap.state, SessionState::Idle);
        assert!(snap.leak_flagged);
        // the stuck task was aborted, so nothing lingers
        assert_eq!(invoker.live_invocations(), 0);
    }

    #[tokio::test]
    async fn test_stop_after_leaky_completion_is_noop() {
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY], AfterScript::Hang));
        let session = session_with(invoker.clone(), ProbeConfig::new(0, 1)).await;

        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Completed).await;
        assert!(session.snapshot().leak_flagged);

        // the leak was already reported when the run ended
        assert_ok!(session.stop().await);
        assert_ok!(session.stop().await);
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(invoker.live_invocations(), 0);
    }

    #[tokio::test]
    async fn test_restart_resets_statistics() {
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY, TIMEOUT], AfterScript::Exit));
        let session = session_with(invoker.clone(), ProbeConfig::new(0, 2)).await;

        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Completed).await;
        assert_eq!(session.snapshot().statistics.processed(), 2);

        // Completed behaves like Idle for a new start
        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Completed).await;
        assert_eq!(session.snapshot().statistics.processed(), 2);
        assert_eq!(invoker.invocations(), 2);
    }

    #[tokio::test]
    async fn test_continuous_stream_end_returns_to_idle() {
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY, "garbage", ""], AfterScript::Exit));
        let session = session_with(invoker, ProbeConfig::new(0, 0)).await;

        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Idle).await;
        let snap = session.snapshot();
        assert_eq!(snap.statistics.success_count, 1);
        assert_eq!(snap.statistics.failure_count, 0);
        assert_eq!(snap.last_lines, vec![REPLY, "garbage", ""]);
    }

    #[tokio::test]
    async fn test_reset_clears_statistics() {
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY], AfterScript::Exit));
        let session = session_with(invoker, ProbeConfig::new(0, 1)).await;

        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Completed).await;
        session.reset().await.unwrap();
        assert_eq!(session.snapshot().statistics, Statistics::default());
        assert!(session.snapshot().last_lines.is_empty());
    }

    #[tokio::test]
    async fn test_lines_written_to_run_log() {
        let dir = TempDir::new().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY, "summary"], AfterScript::Exit));
        let mut ctx = context(invoker);
        ctx.logger = Some(SessionLogger::new(dir.path()));
        let session = ProbeSession::new(1, ProbeConfig::new(0, 1), ctx);
        session.set_address("8.8.8.8").await;

        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Completed).await;

        let snap = session.snapshot();
        let started = snap.started_at.unwrap();
        let path = SessionLogger::new(dir.path()).run_path("8.8.8.8", &started);
        let content = std::fs::read_to_string(path).unwrap();
        let prefix = started.format(RUN_START_FORMAT).to_string();
        assert_eq!(
            content,
            format!("{prefix}: {REPLY}\n{prefix}: summary\n")
        );
    }

    #[tokio::test]
    async fn test_unusable_log_root_does_not_block_run() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, "").unwrap();

        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY, TIMEOUT], AfterScript::Exit));
        let mut ctx = context(invoker);
        ctx.logger = Some(SessionLogger::new(&not_a_dir));
        let session = ProbeSession::new(1, ProbeConfig::new(0, 2), ctx);
        session.set_address("8.8.8.8").await;

        assert_ok!(session.start().await);
        wait_for_state(&session, SessionState::Completed).await;
        assert_eq!(session.snapshot().statistics.processed(), 2);
    }

    #[tokio::test]
    async fn test_events_published() {
        let invoker = Arc::new(ScriptedInvoker::new(&[REPLY], AfterScript::Exit));
        let ctx = context(invoker);
        let mut events = ctx.events.subscribe();
        let session = ProbeSession::new(1, ProbeConfig::new(0, 1), ctx);
        session.set_address("8.8.8.8").await;

        session.start().await.unwrap();
        wait_for_state(&session, SessionState::Completed).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().any(|e| matches!(
            e,
            SupervisorEvent::StateChanged { slot: 1, state: SessionState::Running }
        )));
        assert!(seen.iter().any(|e| matches!(
            e,
            SupervisorEvent::Measured { slot: 1, measurement } if measurement.rtt_millis == Some(23)
        )));
    }
}
