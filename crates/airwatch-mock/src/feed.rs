//! In-memory station feed backing the mock hub and REST API.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use airwatch_core::ObservationEvent;

/// Default number of readings kept for `/history`.
pub const DEFAULT_HISTORY_CAP: usize = 500;

#[derive(Debug, Default)]
struct FeedState {
    latest: BTreeMap<String, ObservationEvent>,
    history: VecDeque<ObservationEvent>,
}

/// Shared, cloneable store of what the mock backend has published.
#[derive(Debug, Clone)]
pub struct StationFeed {
    cap: usize,
    state: Arc<RwLock<FeedState>>,
}

impl StationFeed {
    pub fn new(history_cap: usize) -> Self {
        Self {
            cap: history_cap.max(1),
            state: Arc::new(RwLock::new(FeedState::default())),
        }
    }

    /// Record a reading. Readings older than the station's latest still go
    /// to history (the backend does not reconcile) but never replace latest.
    pub fn record(&self, event: ObservationEvent) {
        let mut state = self.state.write();

        let newer = state
            .latest
            .get(&event.station_id)
            .map_or(true, |current| event.observed_at > current.observed_at);
        if newer {
            state.latest.insert(event.station_id.clone(), event.clone());
        }

        state.history.push_back(event);
        while state.history.len() > self.cap {
            state.history.pop_front();
        }
    }

    /// One reading per station, ordered by station id.
    pub fn latest(&self) -> Vec<ObservationEvent> {
        self.state.read().latest.values().cloned().collect()
    }

    /// Recorded readings sorted oldest first.
    pub fn history(&self) -> Vec<ObservationEvent> {
        let mut history: Vec<_> = self.state.read().history.iter().cloned().collect();
        history.sort_by_key(|event| event.observed_at);
        history
    }

    pub fn station_count(&self) -> usize {
        self.state.read().latest.len()
    }
}

impl Default for StationFeed {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwatch_core::Location;
    use chrono::{TimeZone, Utc};

    fn reading(station: &str, minute: u32) -> ObservationEvent {
        ObservationEvent::new(
            station,
            Utc.with_ymd_and_hms(2025, 3, 1, 8, minute, 0).unwrap(),
            Location::new(21.0, 105.8),
        )
    }

    #[test]
    fn test_latest_keeps_newest_per_station() {
        let feed = StationFeed::new(10);
        feed.record(reading("S2", 5));
        feed.record(reading("S1", 10));
        feed.record(reading("S1", 3));

        let latest = feed.latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].station_id, "S1");
        assert_eq!(latest[0].observed_at, reading("S1", 10).observed_at);
        assert_eq!(feed.station_count(), 2);
    }

    #[test]
    fn test_history_is_bounded_and_sorted() {
        let feed = StationFeed::new(3);
        for minute in [4, 1, 2, 9] {
            feed.record(reading("S1", minute));
        }

        let minutes: Vec<_> = feed
            .history()
            .iter()
            .map(|e| e.observed_at.format("%M").to_string())
            .collect();
        assert_eq!(minutes, vec!["01", "02", "09"]);
    }
}
