//! TCP connect probe.
//!
//! Measures reachability by opening a TCP connection once per cycle. Output is
//! phrased like a `ping` reply so the same parser classifies it.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{
    resolve_address, sleep_or_stop, Invocation, InvocationError, InvocationExit, ProbeConfig,
    ProbeInvoker, ResourceTracker, StopSignal, Target, LINE_BUFFER,
};

const DEFAULT_PORT: u16 = 80;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connects to `address:port` once per cycle.
#[derive(Debug, Clone)]
pub struct TcpConnectInvoker {
    port: u16,
    timeout: Duration,
    tracker: ResourceTracker,
}

impl Default for TcpConnectInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

impl TcpConnectInvoker {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timeout: DEFAULT_TIMEOUT,
            tracker: ResourceTracker::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ProbeInvoker for TcpConnectInvoker {
    async fn invoke(
        &self,
        target: &Target,
        config: &ProbeConfig,
        mut stop: StopSignal,
    ) -> Result<Invocation, InvocationError> {
        let ip = resolve_address(&target.address).await?;
        let dst = SocketAddr::new(ip, self.port);
        let timeout = self.timeout;
        let count = config.count;
        let interval = config.interval();

        let guard = self.tracker.acquire();
        let (tx, rx) = mpsc::channel(LINE_BUFFER);

        let exit = tokio::spawn(async move {
            let _guard = guard;

            // Add jitter to avoid thundering herd when many slots start together
            let jitter = rand::random::<u64>() % 100;
            if !sleep_or_stop(Duration::from_millis(jitter), &mut stop).await {
                return InvocationExit::Cancelled;
            }

            let mut cycles = 0u32;
            loop {
                let line = tokio::select! {
                    _ = stop.recv() => return InvocationExit::Cancelled,
                    line = connect_once(dst, timeout) => line,
                };
                if tx.send(line).await.is_err() {
                    return InvocationExit::Cancelled;
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

/// One connect attempt, rendered as a ping-style output line.
async fn connect_once(dst: SocketAddr, timeout: Duration) -> String {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(dst)).await {
        Ok(Ok(_stream)) => format!(
            "Reply from {}: time={}ms",
            dst,
            start.elapsed().as_millis()
        ),
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            format!("Reply from {}: Destination port unreachable.", dst)
        }
        Ok(Err(e)) => format!("Connect to {} failed: {} (General failure)", dst, e),
        Err(_) => "Request timed out.".to_string(),
    }
}
