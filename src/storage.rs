use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::TransferSettings;
use crate::error::CatalogError;
use crate::http::{build_client, check_status, send_with_retries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl StorageEntry {
    pub fn file(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::File,
        }
    }

    pub fn dir(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::Dir,
        }
    }
}

/// Where the archive lives: folder listings plus a way to read files locally.
pub trait StorageBackend {
    /// Entries of a folder, sorted by name.
    fn list(&self, path: &str) -> Result<Vec<StorageEntry>, CatalogError>;

    /// Makes every path readable on local disk, returning local paths in input order.
    fn retrieve(&self, paths: &[String]) -> Result<Vec<PathBuf>, CatalogError>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

impl StorageBackend for LocalStorage {
    fn list(&self, path: &str) -> Result<Vec<StorageEntry>, CatalogError> {
        let entries = fs::read_dir(path)
            .map_err(|err| CatalogError::Filesystem(format!("list {path}: {err}")))?;
        let mut items = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CatalogError::Filesystem(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = if entry.path().is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            items.push(StorageEntry { name, kind });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn retrieve(&self, paths: &[String]) -> Result<Vec<PathBuf>, CatalogError> {
        paths
            .iter()
            .map(|path| {
                let local = PathBuf::from(path);
                if local.is_file() {
                    Ok(local)
                } else {
                    Err(CatalogError::Filesystem(format!("missing file {path}")))
                }
            })
            .collect()
    }
}

/// Archive behind a transfer service: listings over HTTP, files delivered
/// by transfer tasks into a local endpoint rooted at the cache directory.
#[derive(Clone)]
pub struct RemoteStorage {
    client: Client,
    base_url: String,
    endpoint: String,
    local_endpoint: String,
    cache_root: Utf8PathBuf,
    transfer: TransferSettings,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(rename = "DATA")]
    data: Vec<StorageEntry>,
}

#[derive(Debug, Serialize)]
struct TransferItem {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'static str,
    source_path: String,
    destination_path: String,
}

#[derive(Debug, Serialize)]
struct TransferRequest {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'static str,
    source_endpoint: String,
    destination_endpoint: String,
    label: &'static str,
    sync_level: &'static str,
    #[serde(rename = "DATA")]
    data: Vec<TransferItem>,
}

impl RemoteStorage {
    pub fn new(
        base_url: &str,
        endpoint: &str,
        local_endpoint: &str,
        token: &str,
        cache_root: Utf8PathBuf,
        transfer: TransferSettings,
    ) -> Result<Self, CatalogError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|err| CatalogError::StorageHttp(err.to_string()))?,
        );
        let client = build_client(Duration::from_secs(60), headers, CatalogError::StorageHttp)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoint: endpoint.to_string(),
            local_endpoint: local_endpoint.to_string(),
            cache_root,
            transfer,
        })
    }

    pub fn cache_path(&self, remote: &str) -> Utf8PathBuf {
        cache_path(&self.cache_root, remote)
    }

    fn submit(&self, items: Vec<TransferItem>) -> Result<String, CatalogError> {
        let request = TransferRequest {
            data_type: "transfer",
            source_endpoint: self.endpoint.clone(),
            destination_endpoint: self.local_endpoint.clone(),
            label: "Get metadata",
            sync_level: "checksum",
            data: items,
        };
        let url = format!("{}/transfer", self.base_url);
        let response = send_with_retries(
            || self.client.post(&url).json(&request),
            CatalogError::StorageHttp,
        )?;
        let response = check_status(response, "transfer submission failed")
            .map_err(|(status, message)| CatalogError::StorageStatus { status, message })?;
        let body: Value = response
            .json()
            .map_err(|err| CatalogError::StorageHttp(err.to_string()))?;
        body.get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CatalogError::MissingKey {
                key: "task_id".to_string(),
                context: "transfer submission response".to_string(),
            })
    }

    fn wait(&self, task_id: &str) -> Result<(), CatalogError> {
        let url = format!("{}/task/{task_id}", self.base_url);
        let started = Instant::now();
        loop {
            let response = send_with_retries(|| self.client.get(&url), CatalogError::StorageHttp)?;
            let response = check_status(response, "transfer status request failed")
                .map_err(|(status, message)| CatalogError::StorageStatus { status, message })?;
            let body: Value = response
                .json()
                .map_err(|err| CatalogError::StorageHttp(err.to_string()))?;
            match body.get("status").and_then(Value::as_str) {
                Some("SUCCEEDED") => return Ok(()),
                Some("FAILED") => {
                    return Err(CatalogError::Transfer(format!("task {task_id} failed")));
                }
                _ => {}
            }
            if started.elapsed() >= self.transfer.timeout {
                return Err(CatalogError::TransferTimeout {
                    task_id: task_id.to_string(),
                    seconds: self.transfer.timeout.as_secs(),
                });
            }
            thread::sleep(self.transfer.poll_interval);
        }
    }
}

impl StorageBackend for RemoteStorage {
    fn list(&self, path: &str) -> Result<Vec<StorageEntry>, CatalogError> {
        let url = format!(
            "{}/operation/endpoint/{}/ls",
            self.base_url, self.endpoint
        );
        let response = send_with_retries(
            || self.client.get(&url).query(&[("path", path)]),
            CatalogError::StorageHttp,
        )?;
        let response = check_status(response, "storage listing failed")
            .map_err(|(status, message)| CatalogError::StorageStatus { status, message })?;
        let mut listing: ListingResponse = response
            .json()
            .map_err(|err| CatalogError::StorageHttp(err.to_string()))?;
        listing.data.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing.data)
    }

    fn retrieve(&self, paths: &[String]) -> Result<Vec<PathBuf>, CatalogError> {
        let locals = paths
            .iter()
            .map(|path| self.cache_path(path))
            .collect::<Vec<_>>();

        let items = paths
            .iter()
            .zip(&locals)
            .filter(|(_, local)| !local.as_std_path().exists())
            .map(|(remote, local)| TransferItem {
                data_type: "transfer_item",
                source_path: remote.clone(),
                destination_path: local.to_string(),
            })
            .collect::<Vec<_>>();

        if !items.is_empty() {
            for item in &items {
                if let Some(parent) = Utf8Path::new(&item.destination_path).parent() {
                    fs::create_dir_all(parent.as_std_path())
                        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
                }
            }
            debug!("Transferring {} files", items.len());
            let task_id = self.submit(items)?;
            self.wait(&task_id)?;
        }

        locals
            .into_iter()
            .map(|local| {
                if local.as_std_path().is_file() {
                    Ok(local.into_std_path_buf())
                } else {
                    Err(CatalogError::Transfer(format!(
                        "transferred file missing locally: {local}"
                    )))
                }
            })
            .collect()
    }
}

/// Local mirror location of a remote path under the cache root.
pub fn cache_path(cache_root: &Utf8Path, remote: &str) -> Utf8PathBuf {
    let relative = remote
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("/");
    cache_root.join(relative)
}
