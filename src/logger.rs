//! Pressure-driven periodic digest logging (§4.7): log interval shortens as
//! memory pressure rises, and a pressure transition always triggers an
//! immediate (near-zero-delay) re-log rather than waiting out the old period.

use std::time::Duration;

/// Kernel memory pressure levels. Identity comparison only (§3: "monotonic
/// ordering is not required"); `Imminent-OOM` is not "more severe than
/// Critical" in the ordering sense, it is a distinct event with its own
/// (deliberately long) logging cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    ImminentOom,
}

impl PressureLevel {
    const ALL: [PressureLevel; 4] =
        [PressureLevel::Normal, PressureLevel::Warning, PressureLevel::Critical, PressureLevel::ImminentOom];

    fn index(self) -> usize {
        Self::ALL.iter().position(|&l| l == self).expect("PressureLevel::ALL is exhaustive")
    }
}

/// Log period for each [`PressureLevel`] (§4.7 example defaults):
/// Critical=30s, Warning=1min, Normal=5min, Imminent-OOM=10min.
const LOG_DURATIONS: [Duration; 4] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(60),
    Duration::from_secs(30),
    Duration::from_secs(10 * 60),
];

/// The near-zero delay used to force an immediate re-log on a pressure
/// transition, rather than a literal zero delay which some schedulers treat
/// as "run synchronously, reentrantly" instead of "run next tick".
pub const IMMEDIATE_RELOG_DELAY: Duration = Duration::from_micros(1);

/// Tracks the current pressure level and the delay the caller should wait
/// before its next digest-and-log pass. Doesn't own a scheduler itself —
/// [`crate::scheduler`] drives it by calling [`Logger::set_pressure_level`]
/// on pressure-change notifications and [`Logger::next_delay`] after each
/// log pass completes.
pub struct Logger {
    level: PressureLevel,
    next_delay: Duration,
}

impl Logger {
    #[must_use]
    pub fn new(level: PressureLevel) -> Self {
        Self { level, next_delay: LOG_DURATIONS[level.index()] }
    }

    #[must_use]
    pub fn level(&self) -> PressureLevel {
        self.level
    }

    /// Updates the tracked pressure level and forces the next log pass to
    /// run almost immediately, regardless of how long is left on the
    /// previous level's period.
    pub fn set_pressure_level(&mut self, level: PressureLevel) {
        self.level = level;
        self.next_delay = IMMEDIATE_RELOG_DELAY;
    }

    /// Call after a log pass completes to get the delay before the next one,
    /// and to arm that delay to the current level's steady-state period
    /// (undoing any immediate-relog delay that pass consumed).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_delay;
        self.next_delay = LOG_DURATIONS[self.level.index()];
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_delay_matches_level() {
        let mut logger = Logger::new(PressureLevel::Normal);
        assert_eq!(logger.next_delay(), LOG_DURATIONS[0]);
        assert_eq!(logger.next_delay(), LOG_DURATIONS[0]);
    }

    #[test]
    fn pressure_transition_forces_immediate_relog() {
        let mut logger = Logger::new(PressureLevel::Normal);
        let _ = logger.next_delay();
        logger.set_pressure_level(PressureLevel::Critical);
        assert_eq!(logger.next_delay(), IMMEDIATE_RELOG_DELAY);
        // Subsequent delays settle into the new level's steady-state period.
        assert_eq!(logger.next_delay(), LOG_DURATIONS[2]);
    }

    #[test]
    fn more_severe_levels_log_more_frequently() {
        assert!(LOG_DURATIONS[PressureLevel::Critical.index()] < LOG_DURATIONS[PressureLevel::Warning.index()]);
        assert!(LOG_DURATIONS[PressureLevel::Warning.index()] < LOG_DURATIONS[PressureLevel::Normal.index()]);
    }

    #[test]
    fn setting_the_same_level_still_forces_an_immediate_relog() {
        let mut logger = Logger::new(PressureLevel::Warning);
        let _ = logger.next_delay();
        logger.set_pressure_level(PressureLevel::Warning);
        assert_eq!(logger.next_delay(), IMMEDIATE_RELOG_DELAY);
    }
}
