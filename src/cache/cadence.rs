use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::timeframe::Timeframe;

/// Last synchronization attempt per timeframe. Lives as long as the process,
/// so a restart forces a full pass.
#[derive(Debug, Clone, Default)]
pub struct UpdateCadenceState {
    last_update: HashMap<Timeframe, DateTime<Utc>>,
}

impl UpdateCadenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if never synced, or the timeframe's update interval has elapsed.
    pub fn should_sync(&self, timeframe: Timeframe, now: DateTime<Utc>) -> bool {
        match self.last_update.get(&timeframe) {
            None => true,
            Some(last) => now.signed_duration_since(*last) >= timeframe.update_interval(),
        }
    }

    pub fn record(&mut self, timeframe: Timeframe, at: DateTime<Utc>) {
        self.last_update.insert(timeframe, at);
    }

    pub fn last_update(&self, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        self.last_update.get(&timeframe).copied()
    }

    pub fn clear(&mut self) {
        self.last_update.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn due_when_never_synced() {
        let state = UpdateCadenceState::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(state.should_sync(Timeframe::D1, now));
    }

    #[test]
    fn respects_per_timeframe_interval() {
        let mut state = UpdateCadenceState::new();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        state.record(Timeframe::M1, t0);
        state.record(Timeframe::H4, t0);

        let later = t0 + Duration::seconds(60);
        assert!(state.should_sync(Timeframe::M1, later));
        assert!(!state.should_sync(Timeframe::H4, later));
        assert!(state.should_sync(Timeframe::H4, t0 + Duration::hours(4)));
    }

    #[test]
    fn clear_forces_everything_due() {
        let mut state = UpdateCadenceState::new();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        state.record(Timeframe::W1, t0);
        state.clear();
        assert!(state.should_sync(Timeframe::W1, t0));
    }
}
