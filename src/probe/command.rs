//! Ping probes backed by the operating system's `ping` command.
//!
//! `CommandInvoker` keeps one process alive for the whole run and streams its
//! output. `CycleInvoker` launches a single-packet process per cycle and
//! sleeps the configured interval in between.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use std::sync::Arc;

use super::{
    resolve_address, sleep_or_stop, Invocation, InvocationError, InvocationExit, ProbeConfig,
    ProbeInvoker, ResourceTracker, ResultParser, StopSignal, Target, LINE_BUFFER,
};

/// Smallest interval an unprivileged Linux `ping -i` accepts.
const MIN_UNIX_INTERVAL_MS: u64 = 200;

/// Per-packet reply timeout used in cycle mode.
const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Line emitted when a single-packet ping fails without printing a classifiable line.
const SYNTHETIC_TIMEOUT_LINE: &str = "Request timed out.";

/// Flavour of the `ping` command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    /// macOS and the BSDs.
    Bsd,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Bsd
        }
    }

    /// Arguments for a continuous or counted stream.
    pub fn stream_args(&self, address: &str, config: &ProbeConfig) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Self::Windows => {
                // Windows ping has no interval option
                if config.is_continuous() {
                    args.push("-t".to_string());
                } else {
                    args.extend(["-n".to_string(), config.count.to_string()]);
                }
            }
            Self::Linux | Self::Bsd => {
                if !config.is_continuous() {
                    args.extend(["-c".to_string(), config.count.to_string()]);
                }
                if config.interval_millis > 0 {
                    let millis = config.interval_millis.max(MIN_UNIX_INTERVAL_MS);
                    args.extend(["-i".to_string(), format!("{:.3}", millis as f64 / 1000.0)]);
                }
                if *self == Self::Linux {
                    // report lost packets instead of staying silent
                    args.push("-O".to_string());
                }
            }
        }
        args.push(address.to_string());
        args
    }

    /// Arguments for exactly one echo request.
    pub fn single_args(&self, address: &str, timeout: Duration) -> Vec<String> {
        let mut args = match self {
            Self::Windows => vec![
                "-n".to_string(),
                "1".to_string(),
                "-w".to_string(),
                timeout.as_millis().to_string(),
            ],
            Self::Linux => vec![
                "-c".to_string(),
                "1".to_string(),
                "-W".to_string(),
                timeout.as_secs().max(1).to_string(),
            ],
            Self::Bsd => vec![
                "-c".to_string(),
                "1".to_string(),
                "-W".to_string(),
                timeout.as_millis().to_string(),
            ],
        };
        args.push(address.to_string());
        args
    }
}

/// Streams one `ping` process per run.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    program: String,
    platform: Platform,
    tracker: ResourceTracker,
}

impl Default for CommandInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandInvoker {
    pub fn new() -> Self {
        Self::with_program("ping", Platform::current())
    }

    pub fn with_program(program: impl Into<String>, platform: Platform) -> Self {
        Self {
            program: program.into(),
            platform,
            tracker: ResourceTracker::new(),
        }
    }
}

#[async_trait]
impl ProbeInvoker for CommandInvoker {
    async fn invoke(
        &self,
        target: &Target,
        config: &ProbeConfig,
        mut stop: StopSignal,
    ) -> Result<Invocation, InvocationError> {
        resolve_address(&target.address).await?;

        let args = self.platform.stream_args(&target.address, config);
        tracing::debug!(slot = target.slot, program = %self.program, ?args, "Launching ping stream");
        let child = spawn_ping(&self.program, &args)?;

        let guard = self.tracker.acquire();
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let exit = tokio::spawn(async move {
            let _guard = guard;
            pump(child, &tx, &mut stop, None).await.exit
        });

        Ok(Invocation { lines: rx, exit })
    }

    fn live_invocations(&self) -> usize {
        self.tracker.live()
    }
}

/// Launches a single-packet `ping` per cycle.
#[derive(Debug, Clone)]
pub struct CycleInvoker {
    program: String,
    platform: Platform,
    timeout: Duration,
    parser: Arc<ResultParser>,
    tracker: ResourceTracker,
}

impl Default for CycleInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleInvoker {
    pub fn new() -> Self {
        Self::with_program("ping", Platform::current())
    }

    pub fn with_program(program: impl Into<String>, platform: Platform) -> Self {
        Self {
            program: program.into(),
            platform,
            timeout: DEFAULT_CYCLE_TIMEOUT,
            parser: Arc::new(ResultParser::default()),
            tracker: ResourceTracker::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parser used to tell whether a cycle already reported its own outcome.
    pub fn with_parser(mut self, parser: Arc<ResultParser>) -> Self {
        self.parser = parser;
        self
    }
}

#[async_trait]
impl ProbeInvoker for CycleInvoker {
    async fn invoke(
        &self,
        target: &Target,
        config: &ProbeConfig,
        mut stop: StopSignal,
    ) -> Result<Invocation, InvocationError> {
        resolve_address(&target.address).await?;

        let program = self.program.clone();
        let platform = self.platform;
        let args = platform.single_args(&target.address, self.timeout);
        // first cycle launches synchronously so a missing binary is reported up front
        let first = spawn_ping(&program, &args)?;
        let parser = self.parser.clone();

        let guard = self.tracker.acquire();
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let count = config.count;
        let interval = config.interval();

        let exit = tokio::spawn(async move {
            let _guard = guard;
            let mut next = Some(first);
            let mut cycles = 0u32;

            loop {
                let child = match next.take() {
                    Some(child) => child,
                    None => match spawn_ping(&program, &args) {
                        Ok(child) => child,
                        Err(e) => return InvocationExit::Failed(e.to_string()),
                    },
                };

                let pumped = pump(child, &tx, &mut stop, Some(&parser)).await;
                match pumped.exit {
                    // a lost packet exits non-zero (1 on Linux, 2 on macOS) and may print nothing for it
                    InvocationExit::Finished(Some(code)) if code != 0 && pumped.classified == 0 => {
                        if tx.send(SYNTHETIC_TIMEOUT_LINE.to_string()).await.is_err() {
                            return InvocationExit::Cancelled;
                        }
                    }
                    InvocationExit::Finished(_) => {}
                    other => return other,
                }

                cycles += 1;
                if count > 0 && cycles >= count {
                    return InvocationExit::Finished(Some(0));
                }
                if !sleep_or_stop(interval, &mut stop).await {
                    return InvocationExit::Cancelled;
                }
            }
        });

        Ok(Invocation { lines: rx, exit })
    }

    fn live_invocations(&self) -> usize {
        self.tracker.live()
    }
}

fn spawn_ping(program: &str, args: &[String]) -> Result<Child, InvocationError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| InvocationError::Spawn(format!("failed to execute {}: {}", program, e)))
}

/// Result of pumping one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pumped {
    pub(crate) exit: InvocationExit,
    /// Forwarded lines the parser classified as success or failure.
    pub(crate) classified: usize,
}

/// Forward stdout and stderr lines until the process ends or stop is signalled.
///
/// On stop, or when the receiving side has gone away, the process is killed and
/// reaped before returning.
pub(crate) async fn pump(
    mut child: Child,
    tx: &mpsc::Sender<String>,
    stop: &mut StopSignal,
    parser: Option<&ResultParser>,
) -> Pumped {
    let mut out = child.stdout.take().map(line_reader);
    let mut err = child.stderr.take().map(line_reader);
    let mut classified = 0;
    let done = |exit, classified| Pumped { exit, classified };

    while out.is_some() || err.is_some() {
        let (from_stdout, line) = tokio::select! {
            _ = stop.recv() => return done(terminate(&mut child).await, classified),
            line = next_line(&mut out), if out.is_some() => (true, line),
            line = next_line(&mut err), if err.is_some() => (false, line),
        };

        match line {
            Ok(Some(line)) => {
                if parser.is_some_and(|p| p.classify(&line).is_classified()) {
                    classified += 1;
                }
                if tx.send(line).await.is_err() {
                    return done(terminate(&mut child).await, classified);
                }
            }
            Ok(None) | Err(_) => {
                if from_stdout {
                    out = None;
                } else {
                    err = None;
                }
            }
        }
    }

    let exit = tokio::select! {
        _ = stop.recv() => terminate(&mut child).await,
        status = child.wait() => match status {
            Ok(status) => InvocationExit::Finished(status.code()),
            Err(e) => InvocationExit::Failed(e.to_string()),
        },
    };
    done(exit, classified)
}

type LineReader = tokio::io::Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

fn line_reader<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> LineReader {
    let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
    BufReader::new(boxed).lines()
}

async fn next_line(reader: &mut Option<LineReader>) -> std::io::Result<Option<String>> {
    match reader {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

async fn terminate(child: &mut Child) -> InvocationExit {
    match child.kill().await {
        Ok(()) => InvocationExit::Cancelled,
        Err(e) => {
            tracing::warn!("Failed to kill probe process: {}", e);
            InvocationExit::Failed(format!("kill failed: {}", e))
        }
    }
}
