//! Update reconciler.
//!
//! The reconciler maintains the canonical per-station latest values and a
//! bounded, arrival-ordered history. It accepts an event only when it is
//! strictly newer than the station's current latest, which makes the final
//! state a pure function of the ingested sequence.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::ObservationEvent;

/// Default number of history entries kept.
pub const DEFAULT_HISTORY_CAP: usize = 20;

/// Reasons an event is rejected. These are expected during normal operation
/// (transport switch-over, explicit pulls) and carry no failure semantics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StaleEventError {
    /// Same station and timestamp as the current latest.
    #[error("duplicate observation for station {station_id} at {observed_at}")]
    Duplicate {
        station_id: String,
        observed_at: DateTime<Utc>,
    },

    /// Older than the current latest for the station.
    #[error("out-of-order observation for station {station_id}: {observed_at} is older than {latest}")]
    OutOfOrder {
        station_id: String,
        observed_at: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
}

/// Read-only view of reconciled state handed to subscribers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconciledSnapshot {
    pub latest_by_station: BTreeMap<String, ObservationEvent>,
    pub history: Vec<ObservationEvent>,
}

impl ReconciledSnapshot {
    pub fn latest(&self, station_id: &str) -> Option<&ObservationEvent> {
        self.latest_by_station.get(station_id)
    }
}

/// Result of an accepted ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledUpdate {
    /// The accepted event (now the station's latest and the newest history entry)
    pub appended: ObservationEvent,
    /// State after the update, shared with every reader of this update
    pub snapshot: Arc<ReconciledSnapshot>,
}

/// Canonical latest/history state.
#[derive(Debug, Clone)]
pub struct Reconciler {
    cap: usize,
    latest_by_station: BTreeMap<String, ObservationEvent>,
    history: VecDeque<ObservationEvent>,
}

impl Reconciler {
    /// Create an empty reconciler keeping at most `history_cap` entries.
    ///
    /// A cap of zero is raised to one.
    pub fn new(history_cap: usize) -> Self {
        let cap = history_cap.max(1);
        Self {
            cap,
            latest_by_station: BTreeMap::new(),
            history: VecDeque::with_capacity(cap + 1),
        }
    }

    /// Accept or reject one event.
    pub fn ingest(&mut self, event: ObservationEvent) -> Result<ReconciledUpdate, StaleEventError> {
        if let Some(existing) = self.latest_by_station.get(&event.station_id) {
            if event.observed_at == existing.observed_at {
                return Err(StaleEventError::Duplicate {
                    station_id: event.station_id,
                    observed_at: event.observed_at,
                });
            }
            if event.observed_at < existing.observed_at {
                return Err(StaleEventError::OutOfOrder {
                    station_id: event.station_id,
                    observed_at: event.observed_at,
                    latest: existing.observed_at,
                });
            }
        }

        self.latest_by_station
            .insert(event.station_id.clone(), event.clone());
        self.history.push_back(event.clone());
        while self.history.len() > self.cap {
            self.history.pop_front();
        }

        Ok(ReconciledUpdate {
            appended: event,
            snapshot: Arc::new(self.snapshot()),
        })
    }

    /// Ingest a batch ordered oldest to newest, returning how many were accepted.
    pub fn preload<I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = ObservationEvent>,
    {
        events
            .into_iter()
            .map(|event| self.ingest(event))
            .filter(Result::is_ok)
            .count()
    }

    /// Current latest event for a station.
    pub fn latest(&self, station_id: &str) -> Option<&ObservationEvent> {
        self.latest_by_station.get(station_id)
    }

    pub fn latest_by_station(&self) -> &BTreeMap<String, ObservationEvent> {
        &self.latest_by_station
    }

    /// History, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ObservationEvent> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_cap(&self) -> usize {
        self.cap
    }

    pub fn station_count(&self) -> usize {
        self.latest_by_station.len()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ReconciledSnapshot {
        ReconciledSnapshot {
            latest_by_station: self.latest_by_station.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(station: &str, secs: i64, aqi: f64) -> ObservationEvent {
        ObservationEvent::new(station, at(secs), Location::new(21.0, 105.8)).with_aqi(aqi)
    }

    #[test]
    fn test_first_event_is_accepted() {
        let mut reconciler = Reconciler::new(20);
        let update = reconciler.ingest(event("S1", 1, 40.0)).unwrap();

        assert_eq!(update.appended.station_id, "S1");
        assert_eq!(update.snapshot.history.len(), 1);
        assert_eq!(reconciler.latest("S1").unwrap().aqi, Some(40.0));
    }

    #[test]
    fn test_update_snapshot_is_shared() {
        let mut reconciler = Reconciler::new(20);
        let update = reconciler.ingest(event("S1", 1, 40.0)).unwrap();

        let view = update.snapshot.clone();
        assert!(Arc::ptr_eq(&view, &update.snapshot));
        assert_eq!(*view, reconciler.snapshot());
    }

    #[test]
    fn test_out_of_order_event_is_rejected() {
        let mut reconciler = Reconciler::new(20);
        reconciler.ingest(event("S1", 2, 60.0)).unwrap();

        let err = reconciler.ingest(event("S1", 1, 30.0)).unwrap_err();
        assert_eq!(
            err,
            StaleEventError::OutOfOrder {
                station_id: "S1".to_string(),
                observed_at: at(1),
                latest: at(2),
            }
        );
        assert_eq!(reconciler.latest("S1").unwrap().observed_at, at(2));
        assert_eq!(reconciler.history_len(), 1);
    }

    #[test]
    fn test_duplicate_event_is_a_no_op() {
        let mut reconciler = Reconciler::new(20);
        let first = event("S1", 1, 40.0);
        reconciler.ingest(first.clone()).unwrap();
        let before = reconciler.snapshot();

        let err = reconciler.ingest(first).unwrap_err();
        assert!(matches!(err, StaleEventError::Duplicate { .. }));
        assert_eq!(reconciler.snapshot(), before);
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let cap = 5;
        let mut reconciler = Reconciler::new(cap);
        for i in 0..(cap as i64 + 3) {
            reconciler.ingest(event("S1", i, i as f64)).unwrap();
        }

        let kept: Vec<i64> = reconciler
            .history()
            .map(|e| e.observed_at.timestamp() - 1_700_000_000)
            .collect();
        assert_eq!(kept, vec![3, 4, 5, 6, 7]);
        assert_eq!(reconciler.history_len(), cap);
    }

    #[test]
    fn test_history_interleaves_stations_in_arrival_order() {
        let mut reconciler = Reconciler::new(20);
        reconciler.ingest(event("S1", 5, 10.0)).unwrap();
        reconciler.ingest(event("S2", 1, 20.0)).unwrap();
        reconciler.ingest(event("S1", 6, 30.0)).unwrap();

        let stations: Vec<&str> = reconciler
            .history()
            .map(|e| e.station_id.as_str())
            .collect();
        assert_eq!(stations, vec!["S1", "S2", "S1"]);
        assert_eq!(reconciler.station_count(), 2);
    }

    #[test]
    fn test_final_state_independent_of_stale_interleaving() {
        let sequence_a = vec![event("S1", 1, 1.0), event("S1", 3, 3.0), event("S1", 2, 2.0)];
        let sequence_b = vec![
            event("S1", 1, 1.0),
            event("S1", 1, 1.0),
            event("S1", 3, 3.0),
            event("S1", 2, 2.0),
            event("S1", 3, 3.0),
        ];

        let mut a = Reconciler::new(20);
        let mut b = Reconciler::new(20);
        a.preload(sequence_a);
        b.preload(sequence_b);

        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_preload_counts_accepted() {
        let mut reconciler = Reconciler::new(20);
        let accepted = reconciler.preload(vec![
            event("S1", 1, 1.0),
            event("S1", 2, 2.0),
            event("S1", 2, 2.0),
            event("S2", 1, 5.0),
        ]);
        assert_eq!(accepted, 3);
    }

    #[test]
    fn test_zero_cap_is_raised() {
        let mut reconciler = Reconciler::new(0);
        reconciler.ingest(event("S1", 1, 1.0)).unwrap();
        reconciler.ingest(event("S1", 2, 2.0)).unwrap();
        assert_eq!(reconciler.history_cap(), 1);
        assert_eq!(reconciler.history_len(), 1);
    }
}
