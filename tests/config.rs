use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use assert_matches::assert_matches;

use field_catalog::config::{
    ConfigLoader, ConfigOverrides, CsvImportEntry, ExperimentSource, StorageSettings,
};
use field_catalog::domain::SidecarStrategy;
use field_catalog::error::CatalogError;

fn overrides(sensors: &str) -> ConfigOverrides {
    ConfigOverrides {
        sensor_paths: Some(sensors.parse().unwrap()),
        dates: vec!["2018-05-01".to_string()],
        output: Some(PathBuf::from("catalog.sqlite")),
        betydb_url: Some("https://terraref.ncsa.illinois.edu/bety".to_string()),
        betydb_key: Some("secret".to_string()),
        ..ConfigOverrides::default()
    }
}

#[test]
fn config_file_shapes_sensor_profiles() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("field-catalog.json");
    fs::write(
        &path,
        r#"{
            "raw_data_root": "/ua-mac/raw_data",
            "sensor_profiles": [
                {"name": "laser3d_heightmap", "extensions": ["tif", "png"], "exclude": ["_mask"]},
                {"name": "VNIR", "finish_time_field": "scan end time"}
            ],
            "inclusion_filters": {"city": "Maricopa", "state": "Arizona"},
            "batch_size": 25,
            "storage": {"kind": "remote", "url": "https://transfer.example.org/v0.10",
                        "endpoint": "ua-mac", "local_endpoint": "workstation"},
            "transfer_timeout_secs": 120,
            "gene_markers": {"path": "markers.csv", "key_column": 1}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(
        path.to_str(),
        overrides("laser3d_heightmap=/ua-mac/Level_2/laser3d_heightmap,VNIR=/ua-mac/raw_data/VNIR"),
    )
    .unwrap();

    let heightmap = &resolved.sensors[0];
    assert_eq!(heightmap.strategy, SidecarStrategy::Indirect);
    assert_eq!(heightmap.raw_sensor.as_deref(), Some("scanner3DTop"));
    assert_eq!(heightmap.extensions, vec!["tif", "png"]);
    assert_eq!(heightmap.exclude, vec!["_mask"]);

    let vnir = &resolved.sensors[1];
    assert_eq!(vnir.strategy, SidecarStrategy::Direct);
    assert_eq!(vnir.finish_time_field.as_deref(), Some("scan end time"));

    assert_eq!(resolved.batch_size, 25);
    assert_eq!(resolved.inclusion_filters.len(), 2);
    assert_eq!(resolved.transfer.timeout, Duration::from_secs(120));
    assert_eq!(resolved.transfer.poll_interval, Duration::from_secs(5));
    assert_matches!(
        resolved.storage,
        StorageSettings::Remote { ref token_env, .. } if token_env == "TRANSFER_TOKEN"
    );
    assert_eq!(
        resolved.gene_markers,
        Some(CsvImportEntry {
            path: "markers.csv".to_string(),
            key_column: 1
        })
    );
    assert_matches!(resolved.experiments, ExperimentSource::Service { .. });
}

#[test]
fn command_line_wins_over_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("field-catalog.json");
    fs::write(&path, r#"{"batch_size": 25, "weather_path": "/ua-mac/weather"}"#).unwrap();

    let mut overrides = overrides("stereoTop=/ua-mac/raw_data/stereoTop");
    overrides.batch_size = Some(3);
    overrides.weather_path = Some("/mirror/weather".to_string());
    let resolved = ConfigLoader::resolve(path.to_str(), overrides).unwrap();

    assert_eq!(resolved.batch_size, 3);
    assert_eq!(resolved.weather_path.as_deref(), Some("/mirror/weather"));
}

#[test]
fn explicit_config_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("nope.json");
    let err = ConfigLoader::resolve(missing.to_str(), overrides("stereoTop=/raw")).unwrap_err();
    assert_matches!(err, CatalogError::ConfigRead(_));
}

#[test]
fn malformed_config_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("field-catalog.json");
    fs::write(&path, r#"{"batch_size": "many"}"#).unwrap();
    let err = ConfigLoader::resolve(path.to_str(), overrides("stereoTop=/raw")).unwrap_err();
    assert_matches!(err, CatalogError::ConfigParse(_));
}

#[test]
fn zero_batch_size_is_rejected() {
    let mut overrides = overrides("stereoTop=/raw");
    overrides.batch_size = Some(0);
    let err = ConfigLoader::resolve_config(Default::default(), overrides).unwrap_err();
    assert_matches!(err, CatalogError::ConfigParse(_));
}
