//! Location groups for push connections.
//!
//! A connection that joined no group receives every observation. Once it
//! joins one or more groups it only receives observations from those
//! stations. Alerts and device status changes always go to everyone.

use std::collections::BTreeSet;

use crate::hub::HubEvent;

/// Groups joined by a single connection.
#[derive(Debug, Clone, Default)]
pub struct LocationGroups {
    stations: BTreeSet<String>,
}

impl LocationGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups from a `stations=S1,S2` handshake query.
    pub fn from_query(query: &str) -> Self {
        let mut groups = Self::new();
        for param in query.split('&') {
            if let Some(("stations", value)) = param.split_once('=') {
                for station in value.split(',').filter(|s| !s.is_empty()) {
                    groups.join(station);
                }
            }
        }
        groups
    }

    /// Returns `false` when already joined.
    pub fn join(&mut self, station_id: &str) -> bool {
        self.stations.insert(station_id.to_string())
    }

    /// Returns `false` when not joined.
    pub fn leave(&mut self, station_id: &str) -> bool {
        self.stations.remove(station_id)
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn stations(&self) -> impl Iterator<Item = &str> {
        self.stations.iter().map(String::as_str)
    }

    /// Observations from this station reach the connection.
    pub fn wants(&self, station_id: &str) -> bool {
        self.stations.is_empty() || self.stations.contains(station_id)
    }

    /// Should this event be forwarded to the connection?
    pub fn accepts(&self, event: &HubEvent) -> bool {
        match event {
            HubEvent::NewData(event) | HubEvent::Update(event) => self.wants(&event.station_id),
            HubEvent::Alert(_) | HubEvent::DeviceStatus(_) => true,
        }
    }
}
