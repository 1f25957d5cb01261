use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{SensorPathList, SidecarStrategy, default_extensions, default_raw_sensor};
use crate::error::CatalogError;

pub const DEFAULT_CONFIG_FILE: &str = "field-catalog.json";
pub const DEFAULT_BRAPI_URL: &str = "https://brapi.workbench.terraref.org/brapi/v1";
pub const BETYDB_ENV_URL: &str = "BETYDB_URL";
pub const BETYDB_ENV_KEY: &str = "BETYDB_KEY";
pub const DEFAULT_TOKEN_ENV: &str = "TRANSFER_TOKEN";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_COMMIT_THRESHOLD: usize = 1000;
pub const DEFAULT_REFERENCE_SUFFIX: &str = "_merge.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub sensor_profiles: Vec<SensorProfileEntry>,
    #[serde(default)]
    pub raw_data_root: Option<String>,
    #[serde(default)]
    pub weather_path: Option<String>,
    #[serde(default)]
    pub inclusion_filters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub commit_threshold: Option<usize>,
    #[serde(default)]
    pub storage: Option<StorageEntry>,
    #[serde(default)]
    pub transfer_timeout_secs: Option<u64>,
    #[serde(default)]
    pub transfer_poll_secs: Option<u64>,
    #[serde(default)]
    pub gene_markers: Option<CsvImportEntry>,
    #[serde(default)]
    pub cultivar_genes: Option<CsvImportEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorProfileEntry {
    pub name: String,
    #[serde(default)]
    pub strategy: Option<SidecarStrategy>,
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
    #[serde(default)]
    pub raw_sensor: Option<String>,
    #[serde(default)]
    pub reference_suffix: Option<String>,
    #[serde(default)]
    pub finish_time_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageEntry {
    Local,
    Remote {
        url: String,
        endpoint: String,
        local_endpoint: String,
        #[serde(default)]
        token_env: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CsvImportEntry {
    pub path: String,
    pub key_column: usize,
}

/// Settings given on the command line; these win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub sensor_paths: Option<SensorPathList>,
    pub dates: Vec<String>,
    pub output: Option<PathBuf>,
    pub betydb_url: Option<String>,
    pub betydb_key: Option<String>,
    pub brapi_url: Option<String>,
    pub experiment_json: Option<PathBuf>,
    pub cultivar_json: Option<PathBuf>,
    pub raw_data_root: Option<String>,
    pub weather_path: Option<String>,
    pub batch_size: Option<usize>,
    pub commit_threshold: Option<usize>,
    pub gene_markers: Option<CsvImportEntry>,
    pub cultivar_genes: Option<CsvImportEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorProfile {
    pub name: String,
    pub paths: Vec<String>,
    pub strategy: SidecarStrategy,
    pub extensions: Vec<String>,
    pub exclude: Vec<String>,
    pub raw_sensor: Option<String>,
    pub reference_suffix: String,
    pub finish_time_field: Option<String>,
}

impl SensorProfile {
    /// Profile for a sensor with no config entry.
    pub fn builtin(name: &str, paths: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            paths,
            strategy: SidecarStrategy::for_sensor(name),
            extensions: default_extensions(name),
            exclude: Vec::new(),
            raw_sensor: default_raw_sensor(name).map(str::to_string),
            reference_suffix: DEFAULT_REFERENCE_SUFFIX.to_string(),
            finish_time_field: None,
        }
    }

    fn with_entry(mut self, entry: &SensorProfileEntry) -> Self {
        if let Some(strategy) = entry.strategy {
            self.strategy = strategy;
        }
        if let Some(extensions) = &entry.extensions {
            self.extensions = extensions.clone();
        }
        if let Some(exclude) = &entry.exclude {
            self.exclude = exclude.clone();
        }
        if let Some(raw_sensor) = &entry.raw_sensor {
            self.raw_sensor = Some(raw_sensor.clone());
        }
        if let Some(suffix) = &entry.reference_suffix {
            self.reference_suffix = suffix.clone();
        }
        if let Some(field) = &entry.finish_time_field {
            self.finish_time_field = Some(field.clone());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentSource {
    File(PathBuf),
    Service { url: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutSource {
    File(PathBuf),
    Service { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSettings {
    Local,
    Remote {
        url: String,
        endpoint: String,
        local_endpoint: String,
        token_env: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub sensors: Vec<SensorProfile>,
    pub dates: Vec<String>,
    pub output: PathBuf,
    pub experiments: ExperimentSource,
    pub layouts: LayoutSource,
    pub raw_data_root: Option<String>,
    pub weather_path: Option<String>,
    pub inclusion_filters: BTreeMap<String, String>,
    pub batch_size: usize,
    pub commit_threshold: usize,
    pub storage: StorageSettings,
    pub transfer: TransferSettings,
    pub gene_markers: Option<CsvImportEntry>,
    pub cultivar_genes: Option<CsvImportEntry>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, CatalogError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| CatalogError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| CatalogError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(config, overrides)
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, CatalogError> {
        let sensor_paths = overrides.sensor_paths.ok_or(CatalogError::MissingSensors)?;
        if overrides.dates.is_empty() {
            return Err(CatalogError::InvalidDateSpec(
                "dates parameter is missing values".to_string(),
            ));
        }
        let output = overrides
            .output
            .ok_or_else(|| CatalogError::MissingSetting("output file".to_string()))?;

        let raw_data_root = overrides.raw_data_root.or(config.raw_data_root);
        let sensors = sensor_paths
            .0
            .into_iter()
            .map(|entry| {
                let profile = SensorProfile::builtin(&entry.sensor, entry.paths);
                match config
                    .sensor_profiles
                    .iter()
                    .find(|candidate| candidate.name == entry.sensor)
                {
                    Some(found) => profile.with_entry(found),
                    None => profile,
                }
            })
            .collect::<Vec<_>>();

        for sensor in &sensors {
            if sensor.strategy == SidecarStrategy::Direct {
                continue;
            }
            if raw_data_root.is_none() {
                return Err(CatalogError::MissingSetting(format!(
                    "raw data root (needed by {} sidecar strategy of sensor {})",
                    sensor.strategy, sensor.name
                )));
            }
            if sensor.raw_sensor.is_none() {
                return Err(CatalogError::MissingSetting(format!(
                    "raw sensor for sensor {}",
                    sensor.name
                )));
            }
        }

        let experiments = match overrides.experiment_json {
            Some(path) => ExperimentSource::File(path),
            None => ExperimentSource::Service {
                url: non_empty(overrides.betydb_url).ok_or_else(|| {
                    CatalogError::MissingSetting(format!(
                        "{BETYDB_ENV_URL} (set the environment variable or --betydb-url)"
                    ))
                })?,
                key: non_empty(overrides.betydb_key).ok_or_else(|| {
                    CatalogError::MissingSetting(format!(
                        "{BETYDB_ENV_KEY} (set the environment variable or --betydb-key)"
                    ))
                })?,
            },
        };

        let layouts = match overrides.cultivar_json {
            Some(path) => LayoutSource::File(path),
            None => LayoutSource::Service {
                url: non_empty(overrides.brapi_url)
                    .unwrap_or_else(|| DEFAULT_BRAPI_URL.to_string()),
            },
        };

        let batch_size = overrides
            .batch_size
            .or(config.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let commit_threshold = overrides
            .commit_threshold
            .or(config.commit_threshold)
            .unwrap_or(DEFAULT_COMMIT_THRESHOLD);
        if batch_size == 0 || commit_threshold == 0 {
            return Err(CatalogError::ConfigParse(
                "batch_size and commit_threshold must be positive".to_string(),
            ));
        }

        let storage = match config.storage.unwrap_or(StorageEntry::Local) {
            StorageEntry::Local => StorageSettings::Local,
            StorageEntry::Remote {
                url,
                endpoint,
                local_endpoint,
                token_env,
            } => StorageSettings::Remote {
                url,
                endpoint,
                local_endpoint,
                token_env: token_env.unwrap_or_else(|| DEFAULT_TOKEN_ENV.to_string()),
            },
        };

        let defaults = TransferSettings::default();
        let transfer = TransferSettings {
            timeout: config
                .transfer_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            poll_interval: config
                .transfer_poll_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
        };

        Ok(ResolvedConfig {
            sensors,
            dates: overrides.dates,
            output,
            experiments,
            layouts,
            raw_data_root,
            weather_path: overrides.weather_path.or(config.weather_path),
            inclusion_filters: config
                .inclusion_filters
                .unwrap_or_else(default_inclusion_filters),
            batch_size,
            commit_threshold,
            storage,
            transfer,
            gene_markers: overrides.gene_markers.or(config.gene_markers),
            cultivar_genes: overrides.cultivar_genes.or(config.cultivar_genes),
        })
    }
}

pub fn default_inclusion_filters() -> BTreeMap<String, String> {
    BTreeMap::from([("city".to_string(), "Maricopa".to_string())])
}

/// Command line value if given, otherwise the environment variable.
pub fn setting_or_env(value: Option<String>, var: &str) -> Option<String> {
    non_empty(value).or_else(|| non_empty(std::env::var(var).ok()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
