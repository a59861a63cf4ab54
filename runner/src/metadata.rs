use crate::work::parse_date;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to read metadata file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse metadata file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid setup for sensor {sensor}: {reason}")]
    InvalidSetup { sensor: String, reason: String },
}

/// Everything the scheduler needs to know about a sensor on a given day
#[derive(Debug, Clone, PartialEq)]
pub struct SensorMetadata {
    pub sensor_id: String,
    pub serial_number: u32,
    pub location_id: String,
    pub utc_offset: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl SensorMetadata {
    /// coarse coordinates as used in profile file names, e.g. `48N011E`
    pub fn coordinates_slug(&self) -> String {
        let lat = self.lat.round() as i64;
        let lon = self.lon.round() as i64;

        format!(
            "{:02}{}{:03}{}",
            lat.abs(),
            if lat < 0 { "S" } else { "N" },
            lon.abs(),
            if lon < 0 { "W" } else { "E" }
        )
    }
}

/// Read-only lookup of sensor serial numbers and locations
pub trait MetadataProvider: Send + Sync {
    fn get(&self, sensor_id: &str, date: NaiveDate) -> Option<SensorMetadata>;
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct Setup {
    from_date: String,
    to_date: String,
    location_id: String,
    #[serde(default)]
    utc_offset: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct Sensor {
    serial_number: u32,
    #[serde(default)]
    setups: Vec<Setup>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
#[serde(deny_unknown_fields)]
struct Location {
    lat: f64,
    lon: f64,
    alt: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
struct MetadataFile {
    #[serde(default)]
    sensors: BTreeMap<String, Sensor>,
    #[serde(default)]
    locations: BTreeMap<String, Location>,
}

#[derive(Debug, Clone)]
struct ResolvedSetup {
    from: NaiveDate,
    to: NaiveDate,
    location_id: String,
    utc_offset: f64,
}

/// Metadata provider backed by a single JSON document
#[derive(Debug, Clone)]
pub struct JsonMetadata {
    serial_numbers: BTreeMap<String, u32>,
    setups: BTreeMap<String, Vec<ResolvedSetup>>,
    locations: BTreeMap<String, Location>,
}

impl JsonMetadata {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self, MetadataError> {
        let file: MetadataFile = serde_json::from_str(content)?;
        let mut serial_numbers = BTreeMap::new();
        let mut setups = BTreeMap::new();

        for (sensor_id, sensor) in file.sensors {
            let mut resolved = Vec::with_capacity(sensor.setups.len());

            for setup in sensor.setups {
                let invalid = |reason: String| MetadataError::InvalidSetup {
                    sensor: sensor_id.clone(),
                    reason,
                };
                let from = parse_date(&setup.from_date)
                    .ok_or_else(|| invalid(format!("from_date {}", setup.from_date)))?;
                let to = parse_date(&setup.to_date)
                    .ok_or_else(|| invalid(format!("to_date {}", setup.to_date)))?;

                if to < from {
                    return Err(invalid(format!(
                        "setup ends ({}) before it starts ({})",
                        setup.to_date, setup.from_date
                    )));
                }
                if !file.locations.contains_key(&setup.location_id) {
                    return Err(invalid(format!("unknown location {}", setup.location_id)));
                }

                resolved.push(ResolvedSetup {
                    from,
                    to,
                    location_id: setup.location_id,
                    utc_offset: setup.utc_offset,
                });
            }

            serial_numbers.insert(sensor_id.clone(), sensor.serial_number);
            setups.insert(sensor_id, resolved);
        }

        Ok(Self {
            serial_numbers,
            setups,
            locations: file.locations,
        })
    }
}

impl MetadataProvider for JsonMetadata {
    fn get(&self, sensor_id: &str, date: NaiveDate) -> Option<SensorMetadata> {
        let serial_number = *self.serial_numbers.get(sensor_id)?;
        let setup = self
            .setups
            .get(sensor_id)?
            .iter()
            .find(|setup| setup.from <= date && date <= setup.to);

        let Some(setup) = setup else {
            debug!(sensor = sensor_id, %date, "No setup covers this date");
            return None;
        };
        let location = self.locations.get(&setup.location_id)?;

        Some(SensorMetadata {
            sensor_id: sensor_id.to_string(),
            serial_number,
            location_id: setup.location_id.clone(),
            utc_offset: setup.utc_offset,
            lat: location.lat,
            lon: location.lon,
            alt: location.alt,
        })
    }
}
