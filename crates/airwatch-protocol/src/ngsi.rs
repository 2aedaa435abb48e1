//! NGSI-LD `AirQualityObserved` documents.
//!
//! The backend stores and serves observations as NGSI-LD entities following
//! the FIWARE smart data model. This module mirrors that document shape and
//! converts it to and from the normalized [`ObservationEvent`].
//!
//! ```json
//! {
//!   "id": "urn:ngsi-ld:AirQualityObserved:hanoi-01:1709280000",
//!   "type": "AirQualityObserved",
//!   "sosa:hasFeatureOfInterest": { "type": "Relationship", "object": "urn:ngsi-ld:Station:hanoi-01" },
//!   "location": { "type": "GeoProperty", "value": { "type": "Point", "coordinates": [105.85, 21.03] } },
//!   "dateObserved": { "type": "Property", "value": "2025-03-01T08:00:00Z" },
//!   "PM25": { "type": "Property", "value": 35.2, "unitCode": "GQ" },
//!   "airQualityIndex": { "type": "Property", "value": 99 }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use airwatch_core::{Location, Measurement, ObservationEvent, Pollutant};

/// Entity type of air-quality observations.
pub const AIR_QUALITY_OBSERVED: &str = "AirQualityObserved";

/// Errors converting a document into an observation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NgsiError {
    #[error("document has no station reference or id")]
    MissingStation,

    #[error("document for {0} has no observation time")]
    MissingTimestamp(String),

    #[error("document for {0} has an invalid location")]
    InvalidLocation(String),
}

/// Numeric property with unit and optional observation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericProperty {
    #[serde(rename = "type", default = "property_type")]
    pub property_type: String,
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

/// GeoJSON point; coordinates are `[longitude, latitude]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoValue {
    #[serde(rename = "type", default = "point_type")]
    pub geo_type: String,
    pub coordinates: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationProperty {
    #[serde(rename = "type", default = "geo_property_type")]
    pub property_type: String,
    pub value: GeoValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateTimeProperty {
    #[serde(rename = "type", default = "property_type")]
    pub property_type: String,
    pub value: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type", default = "relationship_type")]
    pub relationship_type: String,
    pub object: String,
}

impl Relationship {
    pub fn new(object: &str) -> Self {
        Self {
            relationship_type: relationship_type(),
            object: object.to_string(),
        }
    }
}

fn property_type() -> String {
    "Property".to_string()
}

fn point_type() -> String {
    "Point".to_string()
}

fn geo_property_type() -> String {
    "GeoProperty".to_string()
}

fn relationship_type() -> String {
    "Relationship".to_string()
}

fn entity_type() -> String {
    AIR_QUALITY_OBSERVED.to_string()
}

/// An NGSI-LD air-quality observation entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityObserved {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default = "entity_type")]
    pub entity_type: String,

    #[serde(rename = "sosa:madeBySensor", default, skip_serializing_if = "Option::is_none")]
    pub made_by_sensor: Option<Relationship>,

    #[serde(rename = "sosa:hasFeatureOfInterest", default, skip_serializing_if = "Option::is_none")]
    pub has_feature_of_interest: Option<Relationship>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationProperty>,

    #[serde(rename = "dateObserved", default, skip_serializing_if = "Option::is_none")]
    pub date_observed: Option<DateTimeProperty>,

    #[serde(rename = "PM25", default, skip_serializing_if = "Option::is_none")]
    pub pm25: Option<NumericProperty>,

    #[serde(rename = "PM10", default, skip_serializing_if = "Option::is_none")]
    pub pm10: Option<NumericProperty>,

    #[serde(rename = "O3", default, skip_serializing_if = "Option::is_none")]
    pub o3: Option<NumericProperty>,

    #[serde(rename = "NO2", default, skip_serializing_if = "Option::is_none")]
    pub no2: Option<NumericProperty>,

    #[serde(rename = "SO2", default, skip_serializing_if = "Option::is_none")]
    pub so2: Option<NumericProperty>,

    #[serde(rename = "CO", default, skip_serializing_if = "Option::is_none")]
    pub co: Option<NumericProperty>,

    #[serde(rename = "airQualityIndex", default, skip_serializing_if = "Option::is_none")]
    pub air_quality_index: Option<NumericProperty>,
}

impl AirQualityObserved {
    /// Property for a pollutant.
    pub fn pollutant(&self, pollutant: Pollutant) -> Option<&NumericProperty> {
        match pollutant {
            Pollutant::Pm25 => self.pm25.as_ref(),
            Pollutant::Pm10 => self.pm10.as_ref(),
            Pollutant::O3 => self.o3.as_ref(),
            Pollutant::No2 => self.no2.as_ref(),
            Pollutant::So2 => self.so2.as_ref(),
            Pollutant::Co => self.co.as_ref(),
        }
    }

    fn pollutant_mut(&mut self, pollutant: Pollutant) -> &mut Option<NumericProperty> {
        match pollutant {
            Pollutant::Pm25 => &mut self.pm25,
            Pollutant::Pm10 => &mut self.pm10,
            Pollutant::O3 => &mut self.o3,
            Pollutant::No2 => &mut self.no2,
            Pollutant::So2 => &mut self.so2,
            Pollutant::Co => &mut self.co,
        }
    }

    /// Station reference: feature of interest, then sensor, then entity id.
    pub fn station_id(&self) -> Option<&str> {
        self.has_feature_of_interest
            .as_ref()
            .map(|r| r.object.as_str())
            .or_else(|| self.made_by_sensor.as_ref().map(|r| r.object.as_str()))
            .or(self.id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Observation time: `dateObserved`, else the newest metric `observedAt`.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.date_observed.as_ref().map(|d| d.value).or_else(|| {
            Pollutant::ALL
                .iter()
                .filter_map(|p| self.pollutant(*p).and_then(|prop| prop.observed_at))
                .chain(self.air_quality_index.as_ref().and_then(|p| p.observed_at))
                .max()
        })
    }
}

impl TryFrom<AirQualityObserved> for ObservationEvent {
    type Error = NgsiError;

    fn try_from(doc: AirQualityObserved) -> Result<Self, Self::Error> {
        let station_id = doc.station_id().ok_or(NgsiError::MissingStation)?.to_string();

        let observed_at = doc
            .observed_at()
            .ok_or_else(|| NgsiError::MissingTimestamp(station_id.clone()))?;

        let location = match doc.location.as_ref().map(|l| l.value.coordinates.as_slice()) {
            Some([longitude, latitude, ..]) if longitude.is_finite() && latitude.is_finite() => {
                Location::new(*latitude, *longitude)
            }
            _ => return Err(NgsiError::InvalidLocation(station_id)),
        };

        let mut event = ObservationEvent::new(&station_id, observed_at, location);
        for pollutant in Pollutant::ALL {
            if let Some(prop) = doc.pollutant(pollutant) {
                event.metrics.insert(
                    pollutant,
                    Measurement {
                        value: prop.value,
                        unit: prop.unit_code.clone(),
                    },
                );
            }
        }
        event.aqi = doc.air_quality_index.as_ref().and_then(|p| p.value);

        Ok(event)
    }
}

impl From<&ObservationEvent> for AirQualityObserved {
    fn from(event: &ObservationEvent) -> Self {
        let mut doc = AirQualityObserved {
            id: Some(format!(
                "urn:ngsi-ld:AirQualityObserved:{}:{}",
                event.station_id,
                event.observed_at.timestamp()
            )),
            entity_type: entity_type(),
            made_by_sensor: None,
            has_feature_of_interest: Some(Relationship::new(&event.station_id)),
            location: Some(LocationProperty {
                property_type: geo_property_type(),
                value: GeoValue {
                    geo_type: point_type(),
                    coordinates: vec![event.location.longitude, event.location.latitude],
                },
            }),
            date_observed: Some(DateTimeProperty {
                property_type: property_type(),
                value: event.observed_at,
            }),
            pm25: None,
            pm10: None,
            o3: None,
            no2: None,
            so2: None,
            co: None,
            air_quality_index: None,
        };

        for (pollutant, measurement) in &event.metrics {
            *doc.pollutant_mut(*pollutant) = Some(NumericProperty {
                property_type: property_type(),
                value: measurement.value,
                unit_code: measurement.unit.clone(),
                observed_at: Some(event.observed_at),
            });
        }

        doc.air_quality_index = event.aqi.map(|aqi| NumericProperty {
            property_type: property_type(),
            value: Some(aqi),
            unit_code: None,
            observed_at: Some(event.observed_at),
        });

        doc
    }
}
