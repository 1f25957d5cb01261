use std::collections::HashMap;
use std::fs;

use tracing::debug;

use crate::domain::FileRecord;
use crate::error::CatalogError;
use crate::sidecar::SidecarMetadata;
use crate::storage::StorageBackend;

/// A discovered file together with the date folder it came from.
pub type DatedRecord = (String, FileRecord);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub batches: usize,
    pub sidecars: usize,
}

/// Holds file records until their sidecars are retrieved, one bounded batch at a time.
///
/// `batch_size` is the number of distinct sidecars gathered before a retrieval.
pub struct SidecarFetcher<'a> {
    storage: &'a dyn StorageBackend,
    batch_size: usize,
    finish_time_field: Option<String>,
    waiting: Vec<DatedRecord>,
    sidecars: Vec<String>,
    stats: FetchStats,
}

impl<'a> SidecarFetcher<'a> {
    pub fn new(
        storage: &'a dyn StorageBackend,
        batch_size: usize,
        finish_time_field: Option<String>,
    ) -> Self {
        Self {
            storage,
            batch_size: batch_size.max(1),
            finish_time_field,
            waiting: Vec::new(),
            sidecars: Vec::new(),
            stats: FetchStats::default(),
        }
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    pub fn pending_sidecars(&self) -> usize {
        self.sidecars.len()
    }

    /// Queues one folder's records and returns every record that is now complete.
    pub fn push(
        &mut self,
        date: &str,
        records: Vec<FileRecord>,
    ) -> Result<Vec<DatedRecord>, CatalogError> {
        let mut ready = Vec::new();
        for record in records {
            let Some(sidecar) = &record.sidecar else {
                ready.push((date.to_string(), record));
                continue;
            };
            if !self.sidecars.contains(sidecar) {
                if self.sidecars.len() >= self.batch_size {
                    ready.extend(self.flush()?);
                }
                self.sidecars.push(sidecar.clone());
            }
            self.waiting.push((date.to_string(), record));
        }

        if self.sidecars.len() >= self.batch_size {
            ready.extend(self.flush()?);
        }
        Ok(ready)
    }

    /// Retrieves whatever is still pending.
    pub fn finish(&mut self) -> Result<Vec<DatedRecord>, CatalogError> {
        if self.waiting.is_empty() {
            return Ok(Vec::new());
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<Vec<DatedRecord>, CatalogError> {
        let paths = std::mem::take(&mut self.sidecars);
        debug!("Retrieving batch of {} sidecars", paths.len());
        let locals = self.storage.retrieve(&paths)?;

        let mut parsed = HashMap::with_capacity(paths.len());
        for (remote, local) in paths.iter().zip(&locals) {
            let content = fs::read_to_string(local).map_err(|err| {
                CatalogError::Filesystem(format!("read {}: {err}", local.display()))
            })?;
            let metadata =
                SidecarMetadata::parse(&content, remote, self.finish_time_field.as_deref())?;
            parsed.insert(remote.clone(), metadata);
        }

        self.stats.batches += 1;
        self.stats.sidecars += paths.len();

        let mut merged = std::mem::take(&mut self.waiting);
        for (_, record) in &mut merged {
            if let Some(metadata) = record.sidecar.as_ref().and_then(|path| parsed.get(path)) {
                metadata.apply(record);
            }
        }
        Ok(merged)
    }
}
