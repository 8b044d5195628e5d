//! Per-phase counters collected during a run.

use std::time::Duration;

#[cfg(feature = "persistence")]
use serde::{Deserialize, Serialize};

use crate::config::Phase;
use crate::data::Status;

/// Test function calls made during one phase, by outcome
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub struct PhaseStatistics {
    pub test_cases: usize,
    pub valid: usize,
    pub invalid: usize,
    pub overrun: usize,
    pub interesting: usize,
    /// Calls answered from the cache or the choice tree
    pub cache_hits: usize,
    pub duration: Duration,
}

impl PhaseStatistics {
    /// Record one executed test case
    pub fn record(&mut self, status: Status) {
        self.test_cases += 1;
        match status {
            Status::Valid => self.valid += 1,
            Status::Invalid => self.invalid += 1,
            Status::Overrun => self.overrun += 1,
            Status::Interesting => self.interesting += 1,
        }
    }
}

/// Statistics for a whole run
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub struct RunStatistics {
    pub reuse: PhaseStatistics,
    pub generate: PhaseStatistics,
    pub target: PhaseStatistics,
    pub shrink: PhaseStatistics,
    /// Successful shrinks across all interesting origins
    pub shrinks: usize,
}

impl RunStatistics {
    pub fn phase(&self, phase: Phase) -> &PhaseStatistics {
        match phase {
            Phase::Reuse => &self.reuse,
            Phase::Generate => &self.generate,
            Phase::Target => &self.target,
            Phase::Shrink => &self.shrink,
        }
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseStatistics {
        match phase {
            Phase::Reuse => &mut self.reuse,
            Phase::Generate => &mut self.generate,
            Phase::Target => &mut self.target,
            Phase::Shrink => &mut self.shrink,
        }
    }

    /// Test cases executed across all phases
    pub fn total_test_cases(&self) -> usize {
        Phase::all().into_iter().map(|p| self.phase(p).test_cases).sum()
    }

    /// Add another run's counters into this one
    pub fn merge(&mut self, other: &RunStatistics) {
        for phase in Phase::all() {
            let theirs = other.phase(phase);
            let ours = self.phase_mut(phase);
            ours.test_cases += theirs.test_cases;
            ours.valid += theirs.valid;
            ours.invalid += theirs.invalid;
            ours.overrun += theirs.overrun;
            ours.interesting += theirs.interesting;
            ours.cache_hits += theirs.cache_hits;
            ours.duration += theirs.duration;
        }
        self.shrinks += other.shrinks;
    }
}

#[cfg(feature = "persistence")]
impl RunStatistics {
    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<String, crate::config::ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::config::ConfigError::Load(e.to_string()))
    }
}
