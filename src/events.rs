//! Change notifications published to observers.

use crate::probe::{InvocationError, Measurement};
use crate::session::SessionState;

/// Default capacity of the event channel.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// The slot mapping now holds exactly `count` slots.
    SlotsChanged { count: usize },
    StateChanged { slot: usize, state: SessionState },
    Measured { slot: usize, measurement: Measurement },
    /// A start attempt failed before producing any measurement.
    InvocationFailed { slot: usize, error: InvocationError },
    /// A probe did not release its resource within the stop grace period.
    ReleaseTimeout { slot: usize },
}
