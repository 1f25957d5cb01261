use std::env;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::catalog::{CULTIVAR_GENES, Catalog, FileWriter, GENE_MARKERS};
use crate::config::{ExperimentSource, LayoutSource, ResolvedConfig, StorageSettings};
use crate::discovery::Walker;
use crate::error::CatalogError;
use crate::fetcher::SidecarFetcher;
use crate::genotype::{CsvTable, read_csv_table};
use crate::plots::match_plot;
use crate::sidecar::resolver_for;
use crate::storage::{LocalStorage, RemoteStorage, StorageBackend};
use crate::traitdb::{
    BetyHttpClient, BrapiClient, BrapiHttpClient, ExperimentFile, LayoutFile, SeasonSelection,
    TraitDbClient, select_seasons,
};
use crate::weather::{CaptureWindow, WeatherIndex, link_files, load_weather, number_readings};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub output: String,
    pub seasons: usize,
    pub sites: usize,
    pub cultivars: usize,
    pub files: usize,
    pub sidecar_batches: usize,
    pub weather_readings: usize,
    pub weather_links: usize,
    pub gene_markers: Option<usize>,
    pub cultivar_genes: Option<usize>,
    pub unmatched_dates: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn phase(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

/// Builds one catalog from its four sources.
pub struct App {
    traitdb: Box<dyn TraitDbClient>,
    brapi: Box<dyn BrapiClient>,
    storage: Box<dyn StorageBackend>,
    workspace: Workspace,
}

impl App {
    pub fn new(
        traitdb: Box<dyn TraitDbClient>,
        brapi: Box<dyn BrapiClient>,
        storage: Box<dyn StorageBackend>,
        workspace: Workspace,
    ) -> Self {
        Self {
            traitdb,
            brapi,
            storage,
            workspace,
        }
    }

    /// Clients and storage as the resolved config describes them.
    pub fn from_config(config: &ResolvedConfig, workspace: Workspace) -> Result<Self, CatalogError> {
        let traitdb: Box<dyn TraitDbClient> = match &config.experiments {
            ExperimentSource::File(path) => Box::new(ExperimentFile::new(path)),
            ExperimentSource::Service { url, key } => Box::new(BetyHttpClient::new(url, key)?),
        };
        let brapi: Box<dyn BrapiClient> = match &config.layouts {
            LayoutSource::File(path) => Box::new(LayoutFile::new(path)),
            LayoutSource::Service { url } => Box::new(BrapiHttpClient::new(url)?),
        };
        let storage: Box<dyn StorageBackend> = match &config.storage {
            StorageSettings::Local => Box::new(LocalStorage::new()),
            StorageSettings::Remote {
                url,
                endpoint,
                local_endpoint,
                token_env,
            } => {
                let token = env::var(token_env)
                    .map_err(|_| CatalogError::MissingSetting(format!("env {token_env}")))?;
                workspace.ensure_cache_root()?;
                Box::new(RemoteStorage::new(
                    url,
                    endpoint,
                    local_endpoint,
                    &token,
                    workspace.cache_root().to_owned(),
                    config.transfer,
                )?)
            }
        };
        Ok(Self::new(traitdb, brapi, storage, workspace))
    }

    pub fn build(
        &self,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<BuildSummary, CatalogError> {
        let started = Instant::now();

        phase(sink, format!("phase=Seasons; {} dates", config.dates.len()));
        let experiments = self.traitdb.fetch_experiments()?;
        let selection = select_seasons(
            experiments,
            &config.dates,
            &config.inclusion_filters,
            self.brapi.as_ref(),
        )?;
        let dates = selection.date_seasons.keys().cloned().collect::<Vec<_>>();

        let staged = self.workspace.stage(&config.output)?;
        let catalog = Catalog::create(staged.path(), config.commit_threshold)?;
        let sites = catalog.write_seasons(&selection.seasons)?;
        let cultivars = catalog.write_cultivars(&selection.cultivars)?;

        phase(
            sink,
            format!("phase=Discover; {} sensors, {} dates", config.sensors.len(), dates.len()),
        );
        let mut files = catalog.files_writer()?;
        let discovered = self.discover(config, &selection, &dates, &mut files)?;
        let stored = files.finish()?;

        phase(sink, format!("phase=Weather; {stored} files"));
        let readings = match &config.weather_path {
            Some(path) => number_readings(load_weather(self.storage.as_ref(), path, &dates)?),
            None => {
                warn!("No weather path configured; weather tables will be empty");
                Vec::new()
            }
        };
        catalog.write_weather(&readings)?;
        let links = if config.weather_path.is_some() {
            let index = WeatherIndex::from_readings(&readings);
            link_files(&index, &discovered.windows)?
        } else {
            Vec::new()
        };
        catalog.write_weather_map(&links)?;

        phase(sink, "phase=Genotype; importing CSV tables".to_string());
        let gene_markers = config
            .gene_markers
            .as_ref()
            .map(|entry| read_csv_table(Path::new(&entry.path), entry.key_column))
            .transpose()?;
        let cultivar_genes = config
            .cultivar_genes
            .as_ref()
            .map(|entry| read_csv_table(Path::new(&entry.path), entry.key_column))
            .transpose()?;
        let gene_marker_rows = write_optional(&catalog, GENE_MARKERS, gene_markers.as_ref())?;
        let cultivar_gene_rows = write_optional(&catalog, CULTIVAR_GENES, cultivar_genes.as_ref())?;

        catalog.create_views(cultivar_genes.as_ref())?;
        catalog.close()?;
        let output = staged.publish()?;

        sink.event(ProgressEvent {
            message: format!("phase=Done; {}", output.display()),
            elapsed: Some(started.elapsed()),
        });

        Ok(BuildSummary {
            output: output.display().to_string(),
            seasons: selection.seasons.len(),
            sites,
            cultivars,
            files: stored,
            sidecar_batches: discovered.sidecar_batches,
            weather_readings: readings.len(),
            weather_links: links.len(),
            gene_markers: gene_marker_rows,
            cultivar_genes: cultivar_gene_rows,
            unmatched_dates: selection.unmatched_dates,
        })
    }

    /// Streams every sensor's files into the catalog with seasons and plots assigned.
    fn discover(
        &self,
        config: &ResolvedConfig,
        selection: &SeasonSelection,
        dates: &[String],
        files: &mut FileWriter<'_>,
    ) -> Result<Discovered, CatalogError> {
        let keep_windows = config.weather_path.is_some();
        let mut discovered = Discovered::default();

        for profile in &config.sensors {
            let resolver = resolver_for(profile, config.raw_data_root.as_deref())?;
            let walker = Walker::new(self.storage.as_ref(), profile, resolver.as_ref());
            for path in &profile.paths {
                let mut fetcher = SidecarFetcher::new(
                    self.storage.as_ref(),
                    config.batch_size,
                    profile.finish_time_field.clone(),
                );
                let windows = &mut discovered.windows;
                let emitted = walker.walk(path, dates, &mut fetcher, &mut |(date, mut record)| {
                    let Some(&season_id) = selection.date_seasons.get(&date) else {
                        return Ok(());
                    };
                    record.season_id = Some(season_id);
                    record.plot_id = Some(match_plot(&record.path(), season_id, &selection.seasons)?);
                    let id = files.insert(&record)?;
                    if keep_windows {
                        windows.extend(CaptureWindow::of(id, &record));
                    }
                    Ok(())
                })?;
                discovered.sidecar_batches += fetcher.stats().batches;
                if emitted == 0 {
                    warn!("Unable to find files for dates for sensor {}", profile.name);
                }
            }
        }
        Ok(discovered)
    }
}

/// What discovery leaves behind once its files are stored.
#[derive(Debug, Default)]
struct Discovered {
    windows: Vec<CaptureWindow>,
    sidecar_batches: usize,
}

fn write_optional(
    catalog: &Catalog,
    table: &'static str,
    csv: Option<&CsvTable>,
) -> Result<Option<usize>, CatalogError> {
    csv.map(|csv| catalog.write_csv_table(table, csv)).transpose()
}
