//! Running statistics for one session.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use crate::probe::Measurement;

/// Success/failure counts and round-trip extremes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub success_count: u64,
    pub failure_count: u64,
    /// Undefined until the first successful measurement.
    pub min_rtt: Option<u64>,
    pub max_rtt: Option<u64>,
    pub total_rtt: u64,
}

impl Statistics {
    /// Fold one measurement into the counters.
    pub fn apply(&mut self, measurement: &Measurement) {
        if !measurement.success {
            self.failure_count += 1;
            return;
        }

        let rtt = measurement.rtt_millis.unwrap_or(0);
        self.success_count += 1;
        self.total_rtt = self.total_rtt.saturating_add(rtt);
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
        self.max_rtt = Some(self.max_rtt.map_or(rtt, |m| m.max(rtt)));
    }

    pub fn processed(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// `total_rtt / success_count`, once at least one success was recorded.
    pub fn average_rtt(&self) -> Option<f64> {
        if self.success_count == 0 {
            return None;
        }
        Some(self.total_rtt as f64 / self.success_count as f64)
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Success: {} | Failed: {} | Data: ",
            self.success_count, self.failure_count
        )?;
        match (self.max_rtt, self.min_rtt, self.average_rtt()) {
            (Some(max), Some(min), Some(avg)) => {
                write!(f, "Max: {}ms. Min: {}ms. AVG: {:.0}ms.", max, min, avg)
            }
            _ => write!(f, "-"),
        }
    }
}

/// Thread-safe holder for a session's statistics.
///
/// Each `apply` happens under a single write lock, so a `snapshot` sees
/// either all or none of it.
#[derive(Debug, Default)]
pub struct StatisticsAccumulator {
    inner: RwLock<Statistics>,
}

impl StatisticsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, measurement: &Measurement) {
        let mut stats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        stats.apply(measurement);
    }

    pub fn snapshot(&self) -> Statistics {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Statistics::default();
    }
}
