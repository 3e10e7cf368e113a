//! Supervisor owning one probe session per slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::events::SupervisorEvent;
use crate::preset::Preset;
use crate::probe::ProbeConfig;
use crate::session::{ProbeSession, SessionContext, SessionError, SessionSnapshot};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("slot {0} does not exist")]
    UnknownSlot(usize),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Per-slot failures of a batch operation.
pub type BatchErrors = Vec<(usize, SessionError)>;

struct Slots {
    sessions: BTreeMap<usize, Arc<ProbeSession>>,
    config: ProbeConfig,
}

/// Manages the set of sessions, one per slot `1..=n`.
///
/// Slot-set changes and batch start/stop take the write lock so they never
/// interleave; single-slot operations share the read lock.
pub struct SessionSupervisor {
    slots: RwLock<Slots>,
    ctx: SessionContext,
}

impl SessionSupervisor {
    pub fn new(ctx: SessionContext) -> Self {
        Self::with_config(ctx, ProbeConfig::default())
    }

    pub fn with_config(ctx: SessionContext, config: ProbeConfig) -> Self {
        Self {
            slots: RwLock::new(Slots {
                sessions: BTreeMap::new(),
                config,
            }),
            ctx,
        }
    }

    /// Subscribe to supervisor and session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.ctx.events.subscribe()
    }

    /// Invocations whose OS resource has not been released yet.
    pub fn live_invocations(&self) -> usize {
        self.ctx.invoker.live_invocations()
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.sessions.len()
    }

    pub async fn probe_config(&self) -> ProbeConfig {
        self.slots.read().await.config
    }

    /// Grow or shrink to exactly `count` slots.
    ///
    /// Removed slots are stopped first and only dropped once their invoker
    /// has released. Release timeouts are reported but do not keep the slot.
    pub async fn set_slot_count(&self, count: usize) -> BatchErrors {
        let mut slots = self.slots.write().await;
        self.resize(&mut slots, count).await
    }

    async fn resize(&self, slots: &mut Slots, count: usize) -> BatchErrors {
        let current = slots.sessions.len();
        let mut errors = Vec::new();

        if count < current {
            let removed: Vec<Arc<ProbeSession>> = slots
                .sessions
                .range(count + 1..)
                .map(|(_, session)| session.clone())
                .collect();

            let results = join_all(removed.iter().map(|session| session.stop())).await;
            for (session, result) in removed.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(slot = session.slot(), "Removing slot after failed stop: {}", e);
                    errors.push((session.slot(), e));
                }
                slots.sessions.remove(&session.slot());
            }
        }

        for slot in current + 1..=count {
            let session = ProbeSession::new(slot, slots.config, self.ctx.clone());
            slots.sessions.insert(slot, Arc::new(session));
        }

        if count != current {
            tracing::info!(from = current, to = count, "Slot count changed");
            let _ = self.ctx.events.send(SupervisorEvent::SlotsChanged { count });
        }
        errors
    }

    /// Set the config used by every slot's next start, including slots added later.
    pub async fn set_probe_config(&self, config: ProbeConfig) {
        let mut slots = self.slots.write().await;
        Self::apply_config(&mut slots, config).await;
    }

    async fn apply_config(slots: &mut Slots, config: ProbeConfig) {
        slots.config = config;
        for session in slots.sessions.values() {
            session.set_config(config).await;
        }
    }

    async fn session(&self, slot: usize) -> Result<Arc<ProbeSession>, SupervisorError> {
        self.slots
            .read()
            .await
            .sessions
            .get(&slot)
            .cloned()
            .ok_or(SupervisorError::UnknownSlot(slot))
    }

    pub async fn set_address(&self, slot: usize, address: &str) -> Result<(), SupervisorError> {
        let slots = self.slots.read().await;
        let session = slots
            .sessions
            .get(&slot)
            .ok_or(SupervisorError::UnknownSlot(slot))?;
        session.set_address(address).await;
        Ok(())
    }

    pub async fn start(&self, slot: usize) -> Result<(), SupervisorError> {
        let slots = self.slots.read().await;
        let session = slots
            .sessions
            .get(&slot)
            .ok_or(SupervisorError::UnknownSlot(slot))?;
        session.start().await?;
        Ok(())
    }

    pub async fn stop(&self, slot: usize) -> Result<(), SupervisorError> {
        let slots = self.slots.read().await;
        let session = slots
            .sessions
            .get(&slot)
            .ok_or(SupervisorError::UnknownSlot(slot))?;
        session.stop().await?;
        Ok(())
    }

    /// Clear a slot's statistics. Rejected while it is running.
    pub async fn reset(&self, slot: usize) -> Result<(), SupervisorError> {
        self.session(slot).await?.reset().await?;
        Ok(())
    }

    /// Start every idle or completed slot that has an address.
    ///
    /// Running slots and slots without an address are skipped.
    pub async fn start_all(&self) -> BatchErrors {
        let slots = self.slots.write().await;

        let mut startable = Vec::new();
        for session in slots.sessions.values() {
            if !session.state().can_start() {
                continue;
            }
            if session.address().await.is_empty() {
                tracing::debug!(slot = session.slot(), "Skipping unconfigured slot");
                continue;
            }
            startable.push(session.clone());
        }

        let results = join_all(startable.iter().map(|session| session.start())).await;
        startable
            .iter()
            .zip(results)
            .filter_map(|(session, result)| match result {
                // raced with a start on the same slot; that is still "running"
                Err(SessionError::Busy { .. }) | Ok(()) => None,
                Err(e) => Some((session.slot(), e)),
            })
            .collect()
    }

    /// Stop every slot concurrently. Idle slots are a no-op.
    pub async fn stop_all(&self) -> BatchErrors {
        let slots = self.slots.write().await;
        let sessions: Vec<_> = slots.sessions.values().cloned().collect();

        let results = join_all(sessions.iter().map(|session| session.stop())).await;
        sessions
            .iter()
            .zip(results)
            .filter_map(|(session, result)| result.err().map(|e| (session.slot(), e)))
            .collect()
    }

    pub async fn snapshot(&self, slot: usize) -> Result<SessionSnapshot, SupervisorError> {
        Ok(self.session(slot).await?.snapshot())
    }

    /// Snapshots of every slot in slot order.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.slots
            .read()
            .await
            .sessions
            .values()
            .map(|session| session.snapshot())
            .collect()
    }

    /// Resize to the preset's slot count and load its config and addresses.
    ///
    /// Slots past the preset's address list are cleared.
    pub async fn apply_preset(&self, preset: &Preset) -> BatchErrors {
        let mut slots = self.slots.write().await;
        let errors = self.resize(&mut slots, preset.slot_count).await;
        Self::apply_config(&mut slots, preset.config()).await;

        for (slot, session) in slots.sessions.iter() {
            let address = preset
                .addresses
                .get(slot - 1)
                .map(String::as_str)
                .unwrap_or("");
            session.set_address(address).await;
        }
        tracing::info!(name = %preset.name, slots = preset.slot_count, "Applied preset");
        errors
    }

    /// Capture the current slot count, config and addresses as a preset.
    pub async fn capture_preset(&self, name: &str) -> Preset {
        let slots = self.slots.read().await;
        let mut addresses = Vec::with_capacity(slots.sessions.len());
        for session in slots.sessions.values() {
            addresses.push(session.address().await);
        }
        while addresses.last().is_some_and(|a| a.is_empty()) {
            addresses.pop();
        }

        Preset::new(
            name,
            slots.sessions.len().max(1),
            slots.config.interval_millis,
            slots.config.count,
            &addresses,
        )
    }
}
