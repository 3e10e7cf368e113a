//! Deterministic invoker used by the lifecycle tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Invocation, InvocationError, InvocationExit, ProbeConfig, ProbeInvoker, ResourceTracker,
    StopSignal, Target, LINE_BUFFER,
};

/// What the scripted process does once its lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterScript {
    /// Exit with status 0.
    Exit,
    /// Keep running until stopped.
    HoldOpen,
    /// Keep running and ignore stop requests.
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptedInvoker {
    lines: Vec<String>,
    line_delay: Duration,
    after: AfterScript,
    fail_with: Option<InvocationError>,
    invoked: Arc<AtomicUsize>,
    tracker: ResourceTracker,
}

impl ScriptedInvoker {
    pub(crate) fn new<S: AsRef<str>>(lines: &[S], after: AfterScript) -> Self {
        Self {
            lines: lines.iter().map(|l| l.as_ref().to_string()).collect(),
            line_delay: Duration::ZERO,
            after,
            fail_with: None,
            invoked: Arc::new(AtomicUsize::new(0)),
            tracker: ResourceTracker::new(),
        }
    }

    /// Runs until stopped, producing no output.
    pub(crate) fn idle_forever() -> Self {
        Self::new::<&str>(&[], AfterScript::HoldOpen)
    }

    pub(crate) fn failing(error: InvocationError) -> Self {
        let mut invoker = Self::new::<&str>(&[], AfterScript::Exit);
        invoker.fail_with = Some(error);
        invoker
    }

    pub(crate) fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    pub(crate) fn invocations(&self) -> usize {
        self.invoked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        target: &Target,
        _config: &ProbeConfig,
        mut stop: StopSignal,
    ) -> Result<Invocation, InvocationError> {
        if target.address.is_empty() {
            return Err(InvocationError::EmptyAddress);
        }
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        self.invoked.fetch_add(1, Ordering::SeqCst);

        let guard = self.tracker.acquire();
        let lines = self.lines.clone();
        let delay = self.line_delay;
        let after = self.after;
        let (tx, rx) = mpsc::channel(LINE_BUFFER);

        let exit = tokio::spawn(async move {
            let _guard = guard;
            for line in lines {
                if !delay.is_zero() && !super::sleep_or_stop(delay, &mut stop).await {
                    return InvocationExit::Cancelled;
                }
                tokio::select! {
                    _ = stop.recv() => return InvocationExit::Cancelled,
                    sent = tx.send(line) => if sent.is_err() {
                        return InvocationExit::Cancelled;
                    },
                }
            }
            match after {
                AfterScript::Exit => InvocationExit::Finished(Some(0)),
                AfterScript::HoldOpen => {
                    let _ = stop.recv().await;
                    InvocationExit::Cancelled
                }
                AfterScript::Hang => {
                    let _held = tx;
                    std::future::pending::<()>().await;
                    InvocationExit::Cancelled
                }
            }
        });

        Ok(Invocation { lines: rx, exit })
    }

    fn live_invocations(&self) -> usize {
        self.tracker.live()
    }
}
