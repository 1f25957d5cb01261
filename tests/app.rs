use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value, json};

use field_catalog::app::{App, ProgressEvent, ProgressSink};
use field_catalog::config::{Config, ConfigLoader, ConfigOverrides, ResolvedConfig};
use field_catalog::error::CatalogError;
use field_catalog::storage::LocalStorage;
use field_catalog::traitdb::{
    BrapiClient, ExperimentRecord, LayoutEntry, SiteRecord, TraitDbClient,
};
use field_catalog::workspace::Workspace;

const PLOT_A: &str = "MAC Field Scanner Season 6 Range 4 Column 7";
const PLOT_B: &str = "MAC Field Scanner Season 6 Range 4 Column 8";
const PLOT_C: &str = "MAC Field Scanner Season 6 Range 9 Column 1";
const CAPTURE: &str = "2018-05-01__10-00-00-000";

struct MockTraitDb {
    experiments: Vec<ExperimentRecord>,
}

impl TraitDbClient for MockTraitDb {
    fn fetch_experiments(&self) -> Result<Vec<ExperimentRecord>, CatalogError> {
        Ok(self.experiments.clone())
    }
}

#[derive(Default)]
struct MockBrapi {
    studies: Mutex<Vec<i64>>,
}

impl BrapiClient for MockBrapi {
    fn fetch_study_layouts(&self, study_id: i64) -> Result<Vec<LayoutEntry>, CatalogError> {
        self.studies.lock().unwrap().push(study_id);
        Ok([(11, 5), (12, 6), (13, 99)]
            .into_iter()
            .map(|(site, germplasm)| LayoutEntry {
                observation_unit_id: site.to_string(),
                germplasm_id: germplasm,
                germplasm_name: format!("PI {germplasm}"),
            })
            .collect())
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn site(id: i64, name: &str, city: &str) -> SiteRecord {
    let mut attributes = Map::new();
    attributes.insert("city".to_string(), Value::String(city.to_string()));
    SiteRecord {
        id,
        sitename: Some(name.to_string()),
        geometry: Some(
            "MULTIPOLYGON (((-111.97 33.07 358, -111.96 33.07 358, -111.96 33.08 358, -111.97 33.07 358)))"
                .to_string(),
        ),
        attributes,
    }
}

fn experiments() -> Vec<ExperimentRecord> {
    vec![ExperimentRecord {
        id: 6,
        name: "MAC Season 6".to_string(),
        start_date: "2018-04-20".to_string(),
        end_date: "2018-08-01".to_string(),
        sites: vec![
            site(11, PLOT_A, "Maricopa"),
            site(12, PLOT_B, "Maricopa"),
            site(13, PLOT_C, "Tucson"),
        ],
    }]
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Plot-clipped RGB products, the raw stereo captures holding their sidecars, and weather logs.
fn archive(root: &Path) {
    let day = root.join("plots/rgb_geotiff/2018-05-01");
    write(&day.join(PLOT_A).join(format!("rgb_geotiff_L1_ua-mac_{CAPTURE}_left.tif")), "tif");
    write(&day.join(PLOT_A).join(format!("rgb_geotiff_L1_ua-mac_{CAPTURE}_left.txt")), "log");
    write(&day.join(PLOT_B).join("rgb_geotiff_L1_ua-mac_right.tif"), "tif");
    fs::create_dir_all(day.join("empty capture")).unwrap();

    write(
        &root
            .join("raw_data/stereoTop/2018-05-01")
            .join(CAPTURE)
            .join(format!("{CAPTURE}_metadata.json")),
        &json!({"lemnatec_measurement_metadata": {
            "gantry_system_variable_metadata": {
                "time": "05/01/2018 10:00:00",
                "end time": "05/01/2018 10:05:00",
                "position x [m]": "207.013",
                "position y [m]": 3.5,
                "position z [m]": 0.7
            }
        }})
        .to_string(),
    );

    write(
        &root.join("weather/2018-05-01/2018-05-01_envlog.json"),
        &json!({"environment_sensor_readings": [
            {"timestamp": "2018.05.01-10:10:00", "weather_station": {"temperature": {"value": 24.0}}},
            {"timestamp": "2018.05.01-09:58:00", "weather_station": {"temperature": {"value": 21.0}}},
            {"timestamp": "2018.05.01-10:02:00", "weather_station": {"temperature": {"value": 22.0}}}
        ]})
        .to_string(),
    );
}

fn config(root: &Path, output: PathBuf, extra: Value) -> ResolvedConfig {
    let mut body = json!({
        "raw_data_root": root.join("raw_data").display().to_string(),
        "weather_path": root.join("weather").display().to_string(),
        "sensor_profiles": [{"name": "rgb_geotiff", "finish_time_field": "end time"}],
        "commit_threshold": 2
    });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    let config: Config = serde_json::from_value(body).unwrap();
    let overrides = ConfigOverrides {
        sensor_paths: Some(
            format!("rgb_geotiff={}", root.join("plots/rgb_geotiff").display())
                .parse()
                .unwrap(),
        ),
        dates: vec!["2018-05-01".to_string(), "2018-05-02".to_string()],
        output: Some(output),
        experiment_json: Some(root.join("unused.json")),
        ..ConfigOverrides::default()
    };
    ConfigLoader::resolve_config(config, overrides).unwrap()
}

fn app(root: &Path) -> App {
    App::new(
        Box::new(MockTraitDb {
            experiments: experiments(),
        }),
        Box::new(MockBrapi::default()),
        Box::new(LocalStorage::new()),
        Workspace::with_cache_root(Utf8PathBuf::from_path_buf(root.join("cache")).unwrap()),
    )
}

#[test]
fn build_correlates_all_sources() {
    let temp = tempfile::tempdir().unwrap();
    archive(temp.path());
    let output = temp.path().join("out/catalog.sqlite");
    let config = config(temp.path(), output.clone(), json!({}));
    let sink = RecordingSink::default();

    let summary = app(temp.path()).build(&config, &sink).unwrap();

    assert_eq!(summary.seasons, 1);
    assert_eq!(summary.sites, 2);
    assert_eq!(summary.cultivars, 2);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.weather_readings, 3);
    assert_eq!(summary.weather_links, 1);
    assert_eq!(summary.sidecar_batches, 1);
    assert!(summary.unmatched_dates.is_empty());
    assert!(
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .any(|message| message.starts_with("phase=Discover"))
    );

    let conn = Connection::open(&output).unwrap();

    let excluded: Option<i64> = conn
        .query_row("SELECT id FROM season_info WHERE id = 13", [], |row| row.get(0))
        .optional()
        .unwrap();
    assert_eq!(excluded, None);
    let stray_cultivar: i64 = conn
        .query_row("SELECT COUNT(*) FROM cultivars WHERE id = 99", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stray_cultivar, 0);

    let (plot, cultivar, start, gantry_x): (String, String, String, f64) = conn
        .query_row(
            "SELECT plot_name, cultivar_name, start_time, gantry_x FROM cultivar_files
             WHERE filename LIKE '%_left.tif'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(plot, PLOT_A);
    assert_eq!(cultivar, "PI 5");
    assert_eq!(start, "2018-05-01 10:00:00");
    assert_eq!(gantry_x, 207.013);

    let (min_id, max_id): (i64, i64) = conn
        .query_row(
            "SELECT m.min_weather_id, m.max_weather_id FROM weather_file_map AS m
             JOIN files AS f ON f.id = m.file_id WHERE f.filename LIKE '%_left.tif'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!((min_id, max_id), (1, 2));

    let temperature: f64 = conn
        .query_row(
            "SELECT temperature FROM unified WHERE filename LIKE '%_left.tif'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(temperature, 21.0);
}

#[test]
fn untimed_file_is_kept_with_null_metadata() {
    let temp = tempfile::tempdir().unwrap();
    archive(temp.path());
    let output = temp.path().join("catalog.sqlite");
    let config = config(temp.path(), output.clone(), json!({}));

    app(temp.path()).build(&config, &RecordingSink::default()).unwrap();

    let conn = Connection::open(&output).unwrap();
    let (plot_id, start, gantry_x): (i64, Option<String>, Option<f64>) = conn
        .query_row(
            "SELECT plot_id, start_time, gantry_x FROM files WHERE filename = 'rgb_geotiff_L1_ua-mac_right.tif'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(plot_id, 12);
    assert_eq!(start, None);
    assert_eq!(gantry_x, None);

    let unified_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM unified", [], |row| row.get(0))
        .unwrap();
    assert_eq!(unified_rows, 2);
}

#[test]
fn cultivar_genes_join_into_unified() {
    let temp = tempfile::tempdir().unwrap();
    archive(temp.path());
    let genes = temp.path().join("cultivar_genes.csv");
    write(&genes, "Cultivar,Marker Count,Gene.Score\nPI 5,12,0.75\nPI 6,3,0.10\n");
    let output = temp.path().join("catalog.sqlite");
    let config = config(
        temp.path(),
        output.clone(),
        json!({"cultivar_genes": {"path": genes.display().to_string(), "key_column": 0}}),
    );

    let summary = app(temp.path()).build(&config, &RecordingSink::default()).unwrap();
    assert_eq!(summary.cultivar_genes, Some(2));
    assert_eq!(summary.gene_markers, None);

    let conn = Connection::open(&output).unwrap();
    let markers: i64 = conn
        .query_row(
            "SELECT gene_marker_count FROM unified WHERE plot_id = 11",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(markers, 12);
}

#[test]
fn unmatched_plot_leaves_no_output() {
    let temp = tempfile::tempdir().unwrap();
    archive(temp.path());
    write(
        &temp
            .path()
            .join("plots/rgb_geotiff/2018-05-01/Unknown Plot/rgb_geotiff_L1_ua-mac_x.tif"),
        "tif",
    );
    let output = temp.path().join("catalog.sqlite");
    let config = config(temp.path(), output.clone(), json!({}));

    let result = app(temp.path()).build(&config, &RecordingSink::default());

    assert_matches!(result, Err(CatalogError::PlotNotMatched(_)));
    assert!(!output.exists());
    let leftovers = fs::read_dir(temp.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".field-catalog"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn missing_weather_coverage_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    archive(temp.path());
    fs::remove_file(temp.path().join("weather/2018-05-01/2018-05-01_envlog.json")).unwrap();
    let output = temp.path().join("catalog.sqlite");
    let config = config(temp.path(), output.clone(), json!({}));

    let result = app(temp.path()).build(&config, &RecordingSink::default());

    assert_matches!(result, Err(CatalogError::NoWeatherCoverage(_)));
    assert!(!output.exists());
}

#[test]
fn without_weather_path_weather_tables_are_empty() {
    let temp = tempfile::tempdir().unwrap();
    archive(temp.path());
    let output = temp.path().join("catalog.sqlite");
    let mut config = config(temp.path(), output.clone(), json!({}));
    config.weather_path = None;

    let summary = app(temp.path()).build(&config, &RecordingSink::default()).unwrap();

    assert_eq!(summary.weather_readings, 0);
    assert_eq!(summary.weather_links, 0);
    let conn = Connection::open(&output).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM weather_files", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 0);
}
