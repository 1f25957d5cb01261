use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dates::expand_range;
use crate::domain::{Cultivar, Season, Site};
use crate::error::CatalogError;
use crate::geometry::wkt_bounds;
use crate::http::{build_client, check_status, send_with_retries};

/// One experiment as the trait database reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub id: i64,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub sites: Vec<SiteRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteRecord {
    pub id: i64,
    pub sitename: Option<String>,
    pub geometry: Option<String>,
    pub attributes: Map<String, Value>,
}

/// Study layout row linking an observation unit (a site) to its germplasm.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutEntry {
    pub observation_unit_id: String,
    pub germplasm_id: i64,
    pub germplasm_name: String,
}

pub trait TraitDbClient {
    fn fetch_experiments(&self) -> Result<Vec<ExperimentRecord>, CatalogError>;
}

pub trait BrapiClient {
    fn fetch_study_layouts(&self, study_id: i64) -> Result<Vec<LayoutEntry>, CatalogError>;
}

#[derive(Clone)]
pub struct BetyHttpClient {
    client: Client,
    base_url: String,
    key: String,
}

impl BetyHttpClient {
    pub fn new(base_url: &str, key: &str) -> Result<Self, CatalogError> {
        let client = build_client(
            Duration::from_secs(120),
            HeaderMap::new(),
            CatalogError::TraitDbHttp,
        )?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    fn experiments_url(&self) -> String {
        format!("{}/api/v1/experiments", self.base_url)
    }
}

impl TraitDbClient for BetyHttpClient {
    fn fetch_experiments(&self) -> Result<Vec<ExperimentRecord>, CatalogError> {
        let url = self.experiments_url();
        let response = send_with_retries(
            || {
                self.client.get(&url).query(&[
                    ("key", self.key.as_str()),
                    ("limit", "none"),
                    ("associations_mode", "full_info"),
                ])
            },
            CatalogError::TraitDbHttp,
        )?;
        let response = check_status(response, "trait database request failed")
            .map_err(|(status, message)| CatalogError::TraitDbStatus { status, message })?;
        let body: Value = response
            .json()
            .map_err(|err| CatalogError::TraitDbHttp(err.to_string()))?;
        parse_experiments(&body)
    }
}

#[derive(Clone)]
pub struct BrapiHttpClient {
    client: Client,
    base_url: String,
}

impl BrapiHttpClient {
    pub fn new(base_url: &str) -> Result<Self, CatalogError> {
        let client = build_client(
            Duration::from_secs(60),
            HeaderMap::new(),
            CatalogError::BrapiHttp,
        )?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn layouts_url(&self, study_id: i64) -> String {
        format!("{}/studies/{study_id}/layouts", self.base_url)
    }
}

impl BrapiClient for BrapiHttpClient {
    fn fetch_study_layouts(&self, study_id: i64) -> Result<Vec<LayoutEntry>, CatalogError> {
        let url = self.layouts_url(study_id);
        let mut entries = Vec::new();
        let mut page = 0u32;
        loop {
            let response = send_with_retries(
                || self.client.get(&url).query(&[("page", page)]),
                CatalogError::BrapiHttp,
            )?;
            let response = check_status(response, "BrAPI request failed")
                .map_err(|(status, message)| CatalogError::BrapiStatus { status, message })?;
            let body: Value = response
                .json()
                .map_err(|err| CatalogError::BrapiHttp(err.to_string()))?;

            match layout_page(&body) {
                PageOutcome::Rows(rows) => entries.extend(rows),
                PageOutcome::Done => break,
                PageOutcome::Malformed(reason) => {
                    warn!("{reason} from BrAPI studies request. Stopping fetch of studies");
                    break;
                }
            }
            page += 1;
        }
        Ok(entries)
    }
}

/// Experiments read from a JSON file saved from the trait database.
pub struct ExperimentFile {
    path: PathBuf,
}

impl ExperimentFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl TraitDbClient for ExperimentFile {
    fn fetch_experiments(&self) -> Result<Vec<ExperimentRecord>, CatalogError> {
        parse_experiments(&read_json(&self.path)?)
    }
}

/// Study layouts read from a saved JSON file, shared by every study.
pub struct LayoutFile {
    path: PathBuf,
}

impl LayoutFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl BrapiClient for LayoutFile {
    fn fetch_study_layouts(&self, _study_id: i64) -> Result<Vec<LayoutEntry>, CatalogError> {
        let body = read_json(&self.path)?;
        let rows = match &body {
            Value::Array(rows) => rows.as_slice(),
            other => other
                .get("result")
                .and_then(|result| result.get("data"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .ok_or_else(|| CatalogError::MissingKey {
                    key: "result.data".to_string(),
                    context: self.path.display().to_string(),
                })?,
        };
        Ok(rows.iter().filter_map(LayoutEntry::from_value).collect())
    }
}

#[derive(Debug)]
enum PageOutcome {
    Rows(Vec<LayoutEntry>),
    Done,
    Malformed(&'static str),
}

fn layout_page(body: &Value) -> PageOutcome {
    if body.is_null() || body.as_object().is_some_and(Map::is_empty) {
        return PageOutcome::Malformed("Received an empty JSON response");
    }
    let Some(data) = body.get("result").and_then(|result| result.get("data")) else {
        return PageOutcome::Malformed("Unknown JSON format received");
    };
    let Some(rows) = data.as_array() else {
        return PageOutcome::Malformed("Unexpected non-list data type result");
    };
    if rows.is_empty() {
        return PageOutcome::Done;
    }
    PageOutcome::Rows(rows.iter().filter_map(LayoutEntry::from_value).collect())
}

impl LayoutEntry {
    fn from_value(value: &Value) -> Option<Self> {
        let observation_unit_id = value.get("observationUnitDbId").and_then(id_string)?;
        let germplasm_id = value
            .get("germplasmDbId")
            .or_else(|| value.get("germPlasmDbId"))
            .and_then(id_string)
            .and_then(|id| id.parse::<i64>().ok())?;
        let germplasm_name = value
            .get("germplasmName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| germplasm_id.to_string());
        Some(Self {
            observation_unit_id,
            germplasm_id,
            germplasm_name,
        })
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn id_number(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn read_json(path: &Path) -> Result<Value, CatalogError> {
    let content = fs::read_to_string(path)
        .map_err(|err| CatalogError::Filesystem(format!("read {}: {err}", path.display())))?;
    serde_json::from_str(&content).map_err(|err| CatalogError::MalformedJson {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

pub fn parse_experiments(body: &Value) -> Result<Vec<ExperimentRecord>, CatalogError> {
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| CatalogError::MissingKey {
            key: "data".to_string(),
            context: "experiment JSON".to_string(),
        })?;

    data.iter()
        .map(|item| {
            let experiment = item.get("experiment").unwrap_or(item);
            parse_experiment(experiment)
        })
        .collect()
}

fn parse_experiment(value: &Value) -> Result<ExperimentRecord, CatalogError> {
    let missing = |key: &str| CatalogError::MissingKey {
        key: key.to_string(),
        context: "experiment".to_string(),
    };
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing(key))
    };

    let id = id_number(value.get("id")).ok_or_else(|| missing("id"))?;
    let sites = value
        .get("sites")
        .and_then(Value::as_array)
        .map(|sites| sites.iter().map(parse_site).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    Ok(ExperimentRecord {
        id,
        name: text("name")?,
        start_date: date_part(&text("start_date")?),
        end_date: date_part(&text("end_date")?),
        sites,
    })
}

fn parse_site(value: &Value) -> Result<SiteRecord, CatalogError> {
    let site = value.get("site").unwrap_or(value);
    let attributes = site.as_object().cloned().unwrap_or_default();
    let id = id_number(site.get("id")).ok_or_else(|| CatalogError::MissingKey {
        key: "id".to_string(),
        context: "site".to_string(),
    })?;
    Ok(SiteRecord {
        id,
        sitename: site
            .get("sitename")
            .and_then(Value::as_str)
            .map(str::to_string),
        geometry: site
            .get("geometry")
            .and_then(Value::as_str)
            .map(str::to_string),
        attributes,
    })
}

fn date_part(value: &str) -> String {
    value.trim().chars().take(10).collect()
}

/// Seasons covering the requested dates, with their filtered sites and cultivars.
#[derive(Debug, Clone, Default)]
pub struct SeasonSelection {
    pub seasons: Vec<Season>,
    pub cultivars: Vec<Cultivar>,
    pub date_seasons: BTreeMap<String, i64>,
    pub unmatched_dates: Vec<String>,
}

impl SeasonSelection {
    pub fn season(&self, id: i64) -> Option<&Season> {
        self.seasons.iter().find(|season| season.id == id)
    }
}

pub fn select_seasons(
    experiments: Vec<ExperimentRecord>,
    dates: &[String],
    filters: &BTreeMap<String, String>,
    layouts: &dyn BrapiClient,
) -> Result<SeasonSelection, CatalogError> {
    let mut selection = SeasonSelection::default();
    let mut remaining: Vec<String> = dates.to_vec();
    let mut found = Vec::new();

    for experiment in experiments {
        let covered: HashSet<String> = expand_range(&experiment.start_date, &experiment.end_date)?
            .into_iter()
            .collect();
        let (matched, rest): (Vec<String>, Vec<String>) =
            remaining.into_iter().partition(|date| covered.contains(date));
        remaining = rest;
        if matched.is_empty() {
            continue;
        }
        for date in matched {
            selection.date_seasons.insert(date, experiment.id);
        }
        found.push(experiment);
    }

    if !remaining.is_empty() {
        warn!(
            "Unable to find experiments for all dates and date ranges specified: {}",
            remaining.join(",")
        );
    }
    selection.unmatched_dates = remaining;
    if found.is_empty() {
        return Err(CatalogError::NoSeasons);
    }

    let mut unmatched_sites = Vec::new();
    let mut cultivar_ids = HashSet::new();
    for experiment in found {
        let study = layouts.fetch_study_layouts(experiment.id)?;
        debug!(
            "Retrieved {} BrAPI cultivar entries for experiment {}",
            study.len(),
            experiment.name
        );

        let mut sites = Vec::new();
        for site in &experiment.sites {
            if !passes_filters(site, filters) {
                debug!("Filtering out site '{}'", site.id);
                continue;
            }

            let site_key = site.id.to_string();
            let Some(layout) = study
                .iter()
                .find(|entry| entry.observation_unit_id == site_key)
            else {
                warn!("Unable to find matching cultivar for site: '{}'", site.id);
                unmatched_sites.push(site_key);
                continue;
            };

            if cultivar_ids.insert(layout.germplasm_id) {
                selection.cultivars.push(Cultivar {
                    id: layout.germplasm_id,
                    name: layout.germplasm_name.clone(),
                });
            }

            let geometry = site.geometry.as_deref().ok_or_else(|| CatalogError::MissingKey {
                key: "geometry".to_string(),
                context: format!("site {}", site.id),
            })?;
            sites.push(Site {
                id: site.id,
                sitename: site.sitename.clone(),
                bounds: wkt_bounds(geometry)?,
                cultivar_id: layout.germplasm_id,
            });
        }

        selection.seasons.push(Season {
            id: experiment.id,
            name: experiment.name,
            start_date: experiment.start_date,
            end_date: experiment.end_date,
            sites,
        });
    }

    if !unmatched_sites.is_empty() {
        return Err(CatalogError::MissingCultivar(unmatched_sites.join(", ")));
    }
    Ok(selection)
}

fn passes_filters(site: &SiteRecord, filters: &BTreeMap<String, String>) -> bool {
    filters.iter().all(|(key, expected)| match site.attributes.get(key) {
        Some(Value::String(value)) => value == expected,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == *expected,
    })
}
