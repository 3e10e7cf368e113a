//! Probe module for reachability checks.
//!
//! An invoker turns a target and a probe config into a stream of raw text
//! lines; the parser turns those lines into measurements.

mod command;
mod parser;
mod tcp;

#[cfg(test)]
pub(crate) mod scripted;

pub use command::*;
pub use parser::*;
pub use tcp::*;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Capacity of the line channel between an invocation and its session.
pub const LINE_BUFFER: usize = 256;

/// Errors raised while launching a probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("target address is empty")]
    EmptyAddress,
    #[error("failed to resolve {address}: {reason}")]
    Resolve { address: String, reason: String },
    #[error("failed to launch probe: {0}")]
    Spawn(String),
    #[error("probe i/o error: {0}")]
    Io(String),
}

/// One monitored host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub slot: usize,
    pub address: String,
}

impl Target {
    pub fn new(slot: usize, address: impl Into<String>) -> Self {
        Self {
            slot,
            address: address.into().trim().to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.address.is_empty()
    }
}

/// Probe parameters, fixed for the duration of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Delay between probe cycles (discrete mode) or packets (stream mode).
    pub interval_millis: u64,
    /// Number of probes; 0 means run until stopped.
    pub count: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_millis: 500,
            count: 0,
        }
    }
}

impl ProbeConfig {
    pub fn new(interval_millis: u64, count: u32) -> Self {
        Self {
            interval_millis,
            count,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    pub fn is_continuous(&self) -> bool {
        self.count == 0
    }
}

/// A single parsed probe outcome. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub timestamp: DateTime<Local>,
    pub success: bool,
    /// Round-trip time in milliseconds, absent on failure.
    pub rtt_millis: Option<u64>,
}

impl Measurement {
    pub fn success(rtt_millis: u64) -> Self {
        Self {
            timestamp: Local::now(),
            success: true,
            rtt_millis: Some(rtt_millis),
        }
    }

    pub fn failure() -> Self {
        Self {
            timestamp: Local::now(),
            success: false,
            rtt_millis: None,
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationExit {
    /// The underlying mechanism finished by itself; `None` when no code is
    /// available (e.g. killed by a signal).
    Finished(Option<i32>),
    /// Terminated because stop was requested.
    Cancelled,
    /// The mechanism failed mid-run.
    Failed(String),
}

impl fmt::Display for InvocationExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished(Some(code)) => write!(f, "exited with status {}", code),
            Self::Finished(None) => write!(f, "exited without status"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Stop signal handed to an invoker. A sent value or a dropped sender both
/// mean "stop now".
pub type StopSignal = broadcast::Receiver<()>;

/// A running probe: its output lines and the task owning the OS resource.
///
/// The task resolves once the resource has been released.
pub struct Invocation {
    pub lines: mpsc::Receiver<String>,
    pub exit: JoinHandle<InvocationExit>,
}

/// Runs reachability checks against a host.
#[async_trait]
pub trait ProbeInvoker: Send + Sync + 'static {
    /// Launch a probe. Failures to start surface before any line is produced.
    async fn invoke(
        &self,
        target: &Target,
        config: &ProbeConfig,
        stop: StopSignal,
    ) -> Result<Invocation, InvocationError>;

    /// Number of invocations whose OS resource has not been released yet.
    fn live_invocations(&self) -> usize;
}

/// Counts live invocations for leak detection.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    live: Arc<AtomicUsize>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live resource; it is released when the guard drops.
    pub fn acquire(&self) -> ResourceGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        ResourceGuard {
            live: self.live.clone(),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// RAII handle for one tracked resource.
#[derive(Debug)]
pub struct ResourceGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolve hostname to IP address.
pub async fn resolve_address(address: &str) -> Result<IpAddr, InvocationError> {
    if address.is_empty() {
        return Err(InvocationError::EmptyAddress);
    }

    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| InvocationError::Resolve {
            address: address.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| InvocationError::Resolve {
            address: address.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Sleep for `duration`, returning `false` early if stop was signalled.
pub(crate) async fn sleep_or_stop(duration: Duration, stop: &mut StopSignal) -> bool {
    tokio::select! {
        _ = stop.recv() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
