use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CatalogError;

pub const SIDECAR_SUFFIX: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub id: i64,
    pub sitename: Option<String>,
    pub bounds: BoundingBox,
    pub cultivar_id: i64,
}

impl Site {
    pub fn plot_name(&self) -> String {
        match &self.sitename {
            Some(name) => name.clone(),
            None => format!("unknown {}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Season {
    pub id: i64,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub sites: Vec<Site>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cultivar {
    pub id: i64,
    pub name: String,
}

/// One discovered capture file; ids are assigned when the catalog is written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileRecord {
    pub directory: String,
    pub filename: String,
    pub format: String,
    pub sensor: String,
    pub start_time: Option<NaiveDateTime>,
    pub finish_time: Option<NaiveDateTime>,
    pub gantry_x: Option<f64>,
    pub gantry_y: Option<f64>,
    pub gantry_z: Option<f64>,
    pub sidecar: Option<String>,
    pub season_id: Option<i64>,
    pub plot_id: Option<i64>,
}

impl FileRecord {
    pub fn new(directory: &str, filename: &str, sensor: &str) -> Self {
        Self {
            directory: directory.to_string(),
            filename: filename.to_string(),
            format: file_format(filename),
            sensor: sensor.to_string(),
            ..Self::default()
        }
    }

    pub fn path(&self) -> String {
        join_path(&self.directory, &self.filename)
    }

    pub fn is_sidecar(&self) -> bool {
        self.filename.ends_with(SIDECAR_SUFFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeatherReading {
    pub timestamp: Option<NaiveDateTime>,
    pub temperature: Option<f64>,
    pub illuminance: Option<f64>,
    pub precipitation: Option<f64>,
    pub sun_direction: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub relative_humidity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeatherFileLink {
    pub file_id: i64,
    pub min_weather_id: i64,
    pub max_weather_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SidecarStrategy {
    Direct,
    Timestamp,
    Indirect,
}

impl SidecarStrategy {
    /// Strategy used by a sensor when the config does not name one.
    pub fn for_sensor(sensor: &str) -> Self {
        match sensor {
            "rgb_geotiff" | "ir_geotiff" | "rgb_fullfield" | "ir_fullfield" => {
                SidecarStrategy::Timestamp
            }
            "laser3d_las" | "laser3d_heightmap" => SidecarStrategy::Indirect,
            _ => SidecarStrategy::Direct,
        }
    }
}

impl fmt::Display for SidecarStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarStrategy::Direct => write!(f, "direct"),
            SidecarStrategy::Timestamp => write!(f, "timestamp"),
            SidecarStrategy::Indirect => write!(f, "indirect"),
        }
    }
}

/// Raw sensor whose capture tree holds the sidecars of a derived product.
pub fn default_raw_sensor(sensor: &str) -> Option<&'static str> {
    match sensor {
        "rgb_geotiff" | "rgb_fullfield" => Some("stereoTop"),
        "ir_geotiff" | "ir_fullfield" => Some("flirIrCamera"),
        "laser3d_las" | "laser3d_heightmap" => Some("scanner3DTop"),
        _ => None,
    }
}

pub fn default_extensions(sensor: &str) -> Vec<String> {
    let extensions: &[&str] = match sensor {
        "stereoTop" | "flirIrCamera" | "ps2Top" => &["bin"],
        "scanner3DTop" => &["ply"],
        "VNIR" | "SWIR" => &["raw", "hdr"],
        "rgb_geotiff" | "ir_geotiff" | "rgb_fullfield" | "ir_fullfield" => &["tif"],
        "laser3d_las" => &["las"],
        "laser3d_heightmap" => &["tif"],
        _ => &["*"],
    };
    extensions.iter().map(|ext| ext.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorPaths {
    pub sensor: String,
    pub paths: Vec<String>,
}

/// Parses `sensor=path` pairs; one sensor may be listed with several paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorPathList(pub Vec<SensorPaths>);

impl FromStr for SensorPathList {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut sensors: Vec<SensorPaths> = Vec::new();
        let mut problems = Vec::new();

        for pair in value.split(',') {
            if pair.trim().is_empty() {
                continue;
            }
            let Some((sensor, path)) = pair.split_once('=') else {
                warn!("Sensor path pair is invalid: '{pair}'");
                problems.push(pair.to_string());
                continue;
            };
            let (sensor, path) = (sensor.trim(), path.trim());
            if sensor.is_empty() || path.is_empty() {
                warn!("Sensor path pair is only partially formed: '{pair}'");
                problems.push(pair.to_string());
                continue;
            }

            match sensors.iter_mut().find(|entry| entry.sensor == sensor) {
                Some(entry) => {
                    if !entry.paths.iter().any(|existing| existing == path) {
                        entry.paths.push(path.to_string());
                    }
                }
                None => sensors.push(SensorPaths {
                    sensor: sensor.to_string(),
                    paths: vec![path.to_string()],
                }),
            }
        }

        if !problems.is_empty() {
            return Err(CatalogError::InvalidSensorPaths(problems.join(", ")));
        }
        if sensors.is_empty() {
            return Err(CatalogError::MissingSensors);
        }
        Ok(Self(sensors))
    }
}

pub fn file_format(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_string(),
        _ => String::new(),
    }
}

pub fn join_path(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", directory.trim_end_matches('/'), name.trim_start_matches('/'))
}
