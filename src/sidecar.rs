//! Locating and reading the JSON metadata sidecar that accompanies a capture.
//!
//! Raw captures keep their sidecar in the same folder. Derived products only
//! carry the capture timestamp in their file name, or in a merge descriptor
//! next to them, and their sidecar has to be looked up in the raw tree.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::SensorProfile;
use crate::dates::parse_timestamp;
use crate::domain::{FileRecord, SIDECAR_SUFFIX, SidecarStrategy, join_path};
use crate::error::CatalogError;
use crate::storage::{EntryKind, StorageBackend, StorageEntry};

pub const CAPTURE_TOKEN_PATTERN: &str = r"(\d{4}-\d{2}-\d{2})__\d{2}-\d{2}-\d{2}-\d{3}";

const MEASUREMENT_ROOT: &str = "lemnatec_measurement_metadata";
const VARIABLE_BLOCKS: [&str; 2] = ["gantry_system_variable_metadata", "sensor_variable_metadata"];
const FIXED_BLOCKS: [&str; 2] = ["gantry_system_fixed_metadata", "sensor_fixed_metadata"];
const GANTRY_VARIABLE: &str = "gantry_system_variable_metadata";

/// Capture timestamp embedded in a name, e.g. `2018-05-01__10-20-30-123`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureToken {
    pub date: String,
    pub token: String,
}

pub fn capture_token(text: &str) -> Option<CaptureToken> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(CAPTURE_TOKEN_PATTERN).unwrap());
    let captures = pattern.captures(text)?;
    Some(CaptureToken {
        date: captures.get(1)?.as_str().to_string(),
        token: captures.get(0)?.as_str().to_string(),
    })
}

pub trait SidecarResolver {
    /// Path of the sidecar for `file_name`, or `None` when there is none to find.
    ///
    /// `siblings` is the listing of `directory` the file was found in.
    fn resolve(
        &self,
        storage: &dyn StorageBackend,
        directory: &str,
        file_name: &str,
        siblings: &[StorageEntry],
    ) -> Result<Option<String>, CatalogError>;
}

/// Sidecar listed in the same folder, if any.
pub fn sibling_sidecar(directory: &str, siblings: &[StorageEntry]) -> Option<String> {
    siblings
        .iter()
        .find(|entry| entry.kind == EntryKind::File && entry.name.ends_with(SIDECAR_SUFFIX))
        .map(|entry| join_path(directory, &entry.name))
}

/// Picks the resolver for a sensor once, before discovery starts.
pub fn resolver_for(
    profile: &SensorProfile,
    raw_data_root: Option<&str>,
) -> Result<Box<dyn SidecarResolver>, CatalogError> {
    let derived = || -> Result<TimestampResolver, CatalogError> {
        let root = raw_data_root.ok_or_else(|| {
            CatalogError::MissingSetting(format!("raw data root for sensor {}", profile.name))
        })?;
        let raw_sensor = profile.raw_sensor.as_deref().ok_or_else(|| {
            CatalogError::MissingSetting(format!("raw sensor for sensor {}", profile.name))
        })?;
        Ok(TimestampResolver::new(root, raw_sensor))
    };

    Ok(match profile.strategy {
        SidecarStrategy::Direct => Box::new(DirectResolver),
        SidecarStrategy::Timestamp => Box::new(derived()?),
        SidecarStrategy::Indirect => {
            Box::new(IndirectResolver::new(derived()?, &profile.reference_suffix))
        }
    })
}

/// Sidecar sits next to the capture.
#[derive(Debug, Clone, Default)]
pub struct DirectResolver;

impl SidecarResolver for DirectResolver {
    fn resolve(
        &self,
        _storage: &dyn StorageBackend,
        directory: &str,
        _file_name: &str,
        siblings: &[StorageEntry],
    ) -> Result<Option<String>, CatalogError> {
        Ok(sibling_sidecar(directory, siblings))
    }
}

/// Sidecar lives in `<raw root>/<raw sensor>/<date>/<token>/` of the capture the name points at.
pub struct TimestampResolver {
    raw_root: String,
    raw_sensor: String,
    found: RefCell<HashMap<String, Option<String>>>,
}

impl TimestampResolver {
    pub fn new(raw_root: &str, raw_sensor: &str) -> Self {
        Self {
            raw_root: raw_root.to_string(),
            raw_sensor: raw_sensor.to_string(),
            found: RefCell::new(HashMap::new()),
        }
    }

    pub fn capture_folder(&self, token: &CaptureToken) -> String {
        let sensor_root = join_path(&self.raw_root, &self.raw_sensor);
        join_path(&join_path(&sensor_root, &token.date), &token.token)
    }

    fn sidecar_for(
        &self,
        storage: &dyn StorageBackend,
        token: &CaptureToken,
    ) -> Result<Option<String>, CatalogError> {
        if let Some(known) = self.found.borrow().get(&token.token) {
            return Ok(known.clone());
        }

        let folder = self.capture_folder(token);
        let sidecar = match storage.list(&folder) {
            Ok(entries) => sibling_sidecar(&folder, &entries),
            Err(err) => {
                debug!("No raw capture folder {folder}: {err}");
                None
            }
        };
        self.found
            .borrow_mut()
            .insert(token.token.clone(), sidecar.clone());
        Ok(sidecar)
    }
}

impl SidecarResolver for TimestampResolver {
    fn resolve(
        &self,
        storage: &dyn StorageBackend,
        directory: &str,
        file_name: &str,
        siblings: &[StorageEntry],
    ) -> Result<Option<String>, CatalogError> {
        if let Some(sidecar) = sibling_sidecar(directory, siblings) {
            return Ok(Some(sidecar));
        }
        match capture_token(file_name) {
            Some(token) => self.sidecar_for(storage, &token),
            None => {
                debug!("No capture timestamp in file name {file_name}");
                Ok(None)
            }
        }
    }
}

/// Capture timestamp comes from a reference JSON file (merge descriptor) in the folder.
pub struct IndirectResolver {
    timestamp: TimestampResolver,
    reference_suffix: String,
    tokens: RefCell<HashMap<String, CaptureToken>>,
}

impl IndirectResolver {
    pub fn new(timestamp: TimestampResolver, reference_suffix: &str) -> Self {
        Self {
            timestamp,
            reference_suffix: reference_suffix.to_string(),
            tokens: RefCell::new(HashMap::new()),
        }
    }

    fn folder_token(
        &self,
        storage: &dyn StorageBackend,
        directory: &str,
        siblings: &[StorageEntry],
    ) -> Result<CaptureToken, CatalogError> {
        if let Some(token) = self.tokens.borrow().get(directory) {
            return Ok(token.clone());
        }

        let reference = siblings
            .iter()
            .find(|entry| {
                entry.kind == EntryKind::File && entry.name.ends_with(&self.reference_suffix)
            })
            .map(|entry| join_path(directory, &entry.name))
            .ok_or_else(|| {
                CatalogError::SidecarReference(format!(
                    "no '*{}' file in {directory}",
                    self.reference_suffix
                ))
            })?;

        let local = storage
            .retrieve(std::slice::from_ref(&reference))?
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::Transfer(format!("nothing retrieved for {reference}")))?;
        let content = fs::read_to_string(&local).map_err(|err| {
            CatalogError::SidecarReference(format!("unable to read {reference}: {err}"))
        })?;
        let value: Value =
            serde_json::from_str(&content).map_err(|err| CatalogError::MalformedJson {
                path: reference.clone(),
                message: err.to_string(),
            })?;

        let token = first_token_field(&value).ok_or_else(|| {
            CatalogError::SidecarReference(format!("no capture timestamp field in {reference}"))
        })?;
        self.tokens
            .borrow_mut()
            .insert(directory.to_string(), token.clone());
        Ok(token)
    }
}

impl SidecarResolver for IndirectResolver {
    fn resolve(
        &self,
        storage: &dyn StorageBackend,
        directory: &str,
        _file_name: &str,
        siblings: &[StorageEntry],
    ) -> Result<Option<String>, CatalogError> {
        if let Some(sidecar) = sibling_sidecar(directory, siblings) {
            return Ok(Some(sidecar));
        }
        let token = self.folder_token(storage, directory, siblings)?;
        self.timestamp.sidecar_for(storage, &token)
    }
}

/// First top-level string value holding a capture token, keys taken in lexicographic order.
pub fn first_token_field(value: &Value) -> Option<CaptureToken> {
    let object = value.as_object()?;
    let mut keys = object.keys().collect::<Vec<_>>();
    keys.sort();
    keys.into_iter()
        .filter_map(|key| object.get(key).and_then(Value::as_str))
        .find_map(capture_token)
}

/// What a sidecar tells about its capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarMetadata {
    pub variable: Map<String, Value>,
    pub fixed: Map<String, Value>,
    pub gantry_x: Option<f64>,
    pub gantry_y: Option<f64>,
    pub gantry_z: Option<f64>,
    pub start_time: Option<NaiveDateTime>,
    pub finish_time: Option<NaiveDateTime>,
}

impl SidecarMetadata {
    pub fn parse(
        content: &str,
        path: &str,
        finish_time_field: Option<&str>,
    ) -> Result<Self, CatalogError> {
        let value: Value =
            serde_json::from_str(content).map_err(|err| CatalogError::MalformedJson {
                path: path.to_string(),
                message: err.to_string(),
            })?;

        let mut metadata = Self::default();
        let Some(root) = value.get(MEASUREMENT_ROOT) else {
            debug!("Sidecar {path} has no {MEASUREMENT_ROOT} block");
            return Ok(metadata);
        };

        for key in VARIABLE_BLOCKS {
            if let Some(block) = root.get(key) {
                metadata.variable.insert(key.to_string(), block.clone());
            }
        }
        for key in FIXED_BLOCKS {
            if let Some(block) = root.get(key) {
                metadata.fixed.insert(key.to_string(), block.clone());
            }
        }

        if let Some(gantry) = metadata.variable.get(GANTRY_VARIABLE) {
            metadata.gantry_x = number(gantry.get("position x [m]"));
            metadata.gantry_y = number(gantry.get("position y [m]"));
            metadata.gantry_z = number(gantry.get("position z [m]"));
            metadata.start_time = timestamp(gantry.get("time"), path);
        }

        metadata.finish_time = finish_time_field
            .and_then(|field| {
                VARIABLE_BLOCKS
                    .iter()
                    .find_map(|block| metadata.variable.get(*block)?.get(field))
            })
            .and_then(|value| timestamp(Some(value), path))
            .or(metadata.start_time);

        Ok(metadata)
    }

    pub fn apply(&self, record: &mut FileRecord) {
        if self.gantry_x.is_some() {
            record.gantry_x = self.gantry_x;
        }
        if self.gantry_y.is_some() {
            record.gantry_y = self.gantry_y;
        }
        if self.gantry_z.is_some() {
            record.gantry_z = self.gantry_z;
        }
        if self.start_time.is_some() {
            record.start_time = self.start_time;
            record.finish_time = self.finish_time;
        }
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn timestamp(value: Option<&Value>, path: &str) -> Option<NaiveDateTime> {
    let text = value?.as_str()?;
    let parsed = parse_timestamp(text);
    if parsed.is_none() {
        warn!("Unrecognized capture time '{text}' in {path}");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dates::format_timestamp;

    #[test]
    fn token_from_file_name() {
        let token = capture_token("rgb_geotiff_L1_ua-mac_2018-05-01__10-20-30-123_left.tif").unwrap();
        assert_eq!(token.date, "2018-05-01");
        assert_eq!(token.token, "2018-05-01__10-20-30-123");
        assert!(capture_token("fullfield_L1_ua-mac_2018-05-01.tif").is_none());
    }

    #[test]
    fn direct_sidecar_comes_from_folder_listing() {
        let storage = crate::storage::LocalStorage::new();
        let siblings = vec![
            StorageEntry::dir("a_metadata.json"),
            StorageEntry::file("a_left.bin"),
            StorageEntry::file("a_metadata.json"),
        ];
        assert_eq!(
            DirectResolver
                .resolve(&storage, "/raw/cap", "a_left.bin", &siblings)
                .unwrap()
                .as_deref(),
            Some("/raw/cap/a_metadata.json")
        );
        assert_eq!(
            DirectResolver
                .resolve(&storage, "/raw/cap", "a_left.bin", &siblings[1..2])
                .unwrap(),
            None
        );
    }

    #[test]
    fn token_field_scan_is_key_ordered() {
        let value = json!({
            "zz_source": "scanner3DTop - 2018-05-02__08-00-00-000",
            "east": "scanner3DTop - 2018-05-01__08-00-00-000",
            "count": 2,
            "nested": {"a": "2017-01-01__00-00-00-000"}
        });
        let token = first_token_field(&value).unwrap();
        assert_eq!(token.date, "2018-05-01");
        assert!(first_token_field(&json!({"nested": {"a": "2017-01-01__00-00-00-000"}})).is_none());
    }

    #[test]
    fn parse_gantry_metadata() {
        let content = json!({"lemnatec_measurement_metadata": {
            "gantry_system_variable_metadata": {
                "time": "08/09/2017 11:24:53",
                "position x [m]": "207.013",
                "position y [m]": 3.5,
                "position z [m]": "0"
            },
            "sensor_fixed_metadata": {"model": "x"}
        }})
        .to_string();
        let metadata = SidecarMetadata::parse(&content, "a_metadata.json", None).unwrap();
        assert_eq!(metadata.gantry_x, Some(207.013));
        assert_eq!(metadata.gantry_y, Some(3.5));
        assert_eq!(metadata.gantry_z, Some(0.0));
        assert_eq!(metadata.start_time, metadata.finish_time);
        assert_eq!(
            format_timestamp(&metadata.start_time.unwrap()),
            "2017-08-09 11:24:53"
        );
        assert!(metadata.fixed.contains_key("sensor_fixed_metadata"));
    }

    #[test]
    fn finish_time_override() {
        let content = json!({"lemnatec_measurement_metadata": {
            "gantry_system_variable_metadata": {"time": "08/09/2017 11:24:53"},
            "sensor_variable_metadata": {"scan end time": "08/09/2017 11:29:10"}
        }})
        .to_string();
        let metadata =
            SidecarMetadata::parse(&content, "a_metadata.json", Some("scan end time")).unwrap();
        assert_eq!(
            format_timestamp(&metadata.finish_time.unwrap()),
            "2017-08-09 11:29:10"
        );
    }

    #[test]
    fn malformed_sidecar_is_an_error() {
        let err = SidecarMetadata::parse("{", "bad_metadata.json", None).unwrap_err();
        assert!(matches!(err, CatalogError::MalformedJson { .. }));
    }
}
