//! AQI derivation from particulate concentrations.
//!
//! Uses the US EPA breakpoint tables. Only PM2.5 and PM10 contribute; the
//! composite index is the maximum of the available sub-indices.

use std::collections::BTreeMap;

use crate::model::{Measurement, Pollutant};

/// Highest index the tables describe.
pub const MAX_AQI: f64 = 500.0;

struct Breakpoint {
    c_lo: f64,
    c_hi: f64,
    i_lo: f64,
    i_hi: f64,
}

const fn bp(c_lo: f64, c_hi: f64, i_lo: f64, i_hi: f64) -> Breakpoint {
    Breakpoint {
        c_lo,
        c_hi,
        i_lo,
        i_hi,
    }
}

// µg/m³, 24-hour
const PM25: [Breakpoint; 7] = [
    bp(0.0, 12.0, 0.0, 50.0),
    bp(12.1, 35.4, 51.0, 100.0),
    bp(35.5, 55.4, 101.0, 150.0),
    bp(55.5, 150.4, 151.0, 200.0),
    bp(150.5, 250.4, 201.0, 300.0),
    bp(250.5, 350.4, 301.0, 400.0),
    bp(350.5, 500.4, 401.0, 500.0),
];

// µg/m³, 24-hour
const PM10: [Breakpoint; 7] = [
    bp(0.0, 54.0, 0.0, 50.0),
    bp(55.0, 154.0, 51.0, 100.0),
    bp(155.0, 254.0, 101.0, 150.0),
    bp(255.0, 354.0, 151.0, 200.0),
    bp(355.0, 424.0, 201.0, 300.0),
    bp(425.0, 504.0, 301.0, 400.0),
    bp(505.0, 604.0, 401.0, 500.0),
];

/// Sub-index for one pollutant concentration.
///
/// Returns `None` for pollutants without a table or for negative / non-finite
/// concentrations. Concentrations above the last breakpoint map to 500.
pub fn sub_index(pollutant: Pollutant, concentration: f64) -> Option<f64> {
    if !concentration.is_finite() || concentration < 0.0 {
        return None;
    }

    let (table, truncated) = match pollutant {
        Pollutant::Pm25 => (&PM25, (concentration * 10.0).floor() / 10.0),
        Pollutant::Pm10 => (&PM10, concentration.floor()),
        _ => return None,
    };

    let Some(band) = table.iter().find(|b| truncated <= b.c_hi) else {
        return Some(MAX_AQI);
    };

    let index =
        (band.i_hi - band.i_lo) / (band.c_hi - band.c_lo) * (truncated - band.c_lo) + band.i_lo;
    Some(index.round())
}

/// Composite AQI for a set of readings, or `None` if no particulate reading
/// is available.
pub fn composite(metrics: &BTreeMap<Pollutant, Measurement>) -> Option<f64> {
    metrics
        .iter()
        .filter_map(|(pollutant, m)| m.value.and_then(|v| sub_index(*pollutant, v)))
        .reduce(f64::max)
}
