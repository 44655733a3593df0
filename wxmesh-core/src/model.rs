use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Fallback point used when a caller supplies no coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
}

impl DefaultLocation {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

impl Default for DefaultLocation {
    fn default() -> Self {
        Self {
            latitude: 46.30,
            longitude: 25.30,
            name: "Odorheiu Secuiesc".to_string(),
        }
    }
}

/// One reading from one physical station.
///
/// Temperature is mandatory: sources only build an observation once a
/// temperature value has parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationObservation {
    pub station_id: String,
    pub temperature_c: f64,
    pub humidity_pct: Option<f64>,
    pub pressure_mb: Option<f64>,
    pub source_name: String,
}

/// A discoverable station near a query point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyStation {
    pub id: String,
    pub display_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance_km: Option<f64>,
    pub source_name: String,
}

/// How many observations one source contributed to a consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContribution {
    pub source_name: String,
    pub count: usize,
}

/// The merged, averaged snapshot for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReading {
    pub temperature_c: f64,
    pub humidity_pct: Option<f64>,
    pub pressure_mb: Option<f64>,
    pub source_label: String,
    pub location_label: String,
    pub station_count: usize,
    pub contributions: Vec<SourceContribution>,
    pub captured_at: DateTime<Utc>,
}

impl ConsensusReading {
    /// A reading that carries no observations ("no data").
    pub fn empty(location_label: impl Into<String>) -> Self {
        Self {
            temperature_c: 0.0,
            humidity_pct: None,
            pressure_mb: None,
            source_label: String::new(),
            location_label: location_label.into(),
            station_count: 0,
            contributions: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.station_count == 0
    }
}
