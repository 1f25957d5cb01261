use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use field_catalog::app::App;
use field_catalog::config::{
    BETYDB_ENV_KEY, BETYDB_ENV_URL, ConfigLoader, ConfigOverrides, CsvImportEntry, setting_or_env,
};
use field_catalog::dates::parse_date_spec;
use field_catalog::domain::SensorPathList;
use field_catalog::error::CatalogError;
use field_catalog::output::{JsonOutput, LogProgress};
use field_catalog::workspace::Workspace;

#[derive(Parser, Debug)]
#[command(name = "field-catalog")]
#[command(about = "Build a SQLite catalog correlating field sensor files with plots, cultivars and weather")]
#[command(version, author)]
struct Cli {
    /// Comma separated sensor=path pairs, e.g. stereoTop=/ua-mac/raw_data/stereoTop
    sensor_paths: String,

    /// Comma separated dates and date ranges, e.g. 2018-05-01,2018-05-03:2018-05-09
    dates: String,

    /// Path of the catalog file to write
    output_file: PathBuf,

    #[arg(long)]
    config: Option<String>,

    #[arg(long, help = "Trait database URL (defaults to $BETYDB_URL)")]
    betydb_url: Option<String>,

    #[arg(long, help = "Trait database API key (defaults to $BETYDB_KEY)")]
    betydb_key: Option<String>,

    #[arg(long)]
    brapi_url: Option<String>,

    #[arg(short = 'e', long, help = "Experiments saved from the trait database")]
    experiment_json: Option<PathBuf>,

    #[arg(short = 'c', long, help = "Study layouts saved from the BrAPI service")]
    cultivar_json: Option<PathBuf>,

    #[arg(long)]
    raw_root: Option<String>,

    #[arg(long)]
    weather_path: Option<String>,

    #[arg(long, help = "Sidecars retrieved per transfer batch")]
    batch_size: Option<usize>,

    #[arg(long, help = "Rows inserted between commits")]
    commit_every: Option<usize>,

    #[arg(long)]
    gene_markers: Option<String>,

    #[arg(long, default_value_t = 0, requires = "gene_markers")]
    gene_markers_key: usize,

    #[arg(long)]
    cultivar_genes: Option<String>,

    #[arg(long, default_value_t = 0, requires = "cultivar_genes")]
    cultivar_genes_key: usize,

    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CatalogError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CatalogError) -> u8 {
    if error.is_input_error() {
        return 2;
    }
    if error.is_correlation_error() {
        return 4;
    }
    match error {
        CatalogError::TraitDbHttp(_)
        | CatalogError::TraitDbStatus { .. }
        | CatalogError::BrapiHttp(_)
        | CatalogError::BrapiStatus { .. }
        | CatalogError::StorageHttp(_)
        | CatalogError::StorageStatus { .. }
        | CatalogError::Transfer(_)
        | CatalogError::TransferTimeout { .. }
        | CatalogError::MalformedJson { .. }
        | CatalogError::MissingKey { .. }
        | CatalogError::SidecarReference(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    debug!("Command line args: {cli:?}");

    let sensor_paths: SensorPathList = cli.sensor_paths.parse()?;
    let dates = parse_date_spec(&cli.dates)?;

    let overrides = ConfigOverrides {
        sensor_paths: Some(sensor_paths),
        dates,
        output: Some(cli.output_file),
        betydb_url: setting_or_env(cli.betydb_url, BETYDB_ENV_URL),
        betydb_key: setting_or_env(cli.betydb_key, BETYDB_ENV_KEY),
        brapi_url: cli.brapi_url,
        experiment_json: cli.experiment_json,
        cultivar_json: cli.cultivar_json,
        raw_data_root: cli.raw_root,
        weather_path: cli.weather_path,
        batch_size: cli.batch_size,
        commit_threshold: cli.commit_every,
        gene_markers: cli.gene_markers.map(|path| CsvImportEntry {
            path,
            key_column: cli.gene_markers_key,
        }),
        cultivar_genes: cli.cultivar_genes.map(|path| CsvImportEntry {
            path,
            key_column: cli.cultivar_genes_key,
        }),
    };
    let config = ConfigLoader::resolve(cli.config.as_deref(), overrides)?;

    let workspace = Workspace::new()?;
    let app = App::from_config(&config, workspace)?;
    let summary = app.build(&config, &LogProgress)?;
    JsonOutput::print_summary(&summary).into_diagnostic()?;
    Ok(())
}
