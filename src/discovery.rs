use tracing::{debug, info, warn};

use crate::config::SensorProfile;
use crate::domain::{FileRecord, join_path};
use crate::error::CatalogError;
use crate::fetcher::{DatedRecord, SidecarFetcher};
use crate::sidecar::SidecarResolver;
use crate::storage::{EntryKind, StorageBackend, StorageEntry};

/// Walks `<sensor path>/<date>/<capture folder>/` for one sensor.
pub struct Walker<'a> {
    storage: &'a dyn StorageBackend,
    profile: &'a SensorProfile,
    resolver: &'a dyn SidecarResolver,
}

impl<'a> Walker<'a> {
    pub fn new(
        storage: &'a dyn StorageBackend,
        profile: &'a SensorProfile,
        resolver: &'a dyn SidecarResolver,
    ) -> Self {
        Self {
            storage,
            profile,
            resolver,
        }
    }

    /// Walks every date folder, handing each record to `emit` once its sidecar is merged.
    ///
    /// Returns the number of records emitted.
    pub fn walk(
        &self,
        sensor_path: &str,
        dates: &[String],
        fetcher: &mut SidecarFetcher<'_>,
        emit: &mut dyn FnMut(DatedRecord) -> Result<(), CatalogError>,
    ) -> Result<usize, CatalogError> {
        let mut emitted = 0;

        for date in dates {
            let date_path = join_path(sensor_path, date);
            debug!("Listing {date_path}");
            let entries = match self.storage.list(&date_path) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("Skipping date {date} for sensor {}: {err}", self.profile.name);
                    continue;
                }
            };

            for entry in entries.iter().filter(|entry| entry.kind == EntryKind::Dir) {
                let folder = join_path(&date_path, &entry.name);
                let listing = match self.storage.list(&folder) {
                    Ok(listing) => listing,
                    Err(err) => {
                        warn!("Skipping folder {folder}: {err}");
                        continue;
                    }
                };
                let records = self.folder_records(&folder, &listing)?;
                if records.is_empty() {
                    info!("Found 0 files for sub path: {folder}");
                    continue;
                }
                debug!("Found {} files for sub path: {folder}", records.len());
                for record in fetcher.push(date, records)? {
                    emit(record)?;
                    emitted += 1;
                }
            }
        }

        for record in fetcher.finish()? {
            emit(record)?;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Matching files of one capture folder, each tagged with its sidecar when one is known.
    fn folder_records(
        &self,
        folder: &str,
        listing: &[StorageEntry],
    ) -> Result<Vec<FileRecord>, CatalogError> {
        let mut records = Vec::new();
        for entry in listing.iter().filter(|entry| entry.kind == EntryKind::File) {
            let mut record = FileRecord::new(folder, &entry.name, &self.profile.name);
            if record.is_sidecar() {
                record.sidecar = Some(record.path());
                records.push(record);
                continue;
            }
            if !self.accepts(&record) {
                continue;
            }

            record.sidecar = self
                .resolver
                .resolve(self.storage, folder, &entry.name, listing)?;
            if record.sidecar.is_none() {
                debug!("No sidecar found for {}", record.path());
            }
            records.push(record);
        }
        Ok(records)
    }

    fn accepts(&self, record: &FileRecord) -> bool {
        if self
            .profile
            .exclude
            .iter()
            .any(|pattern| !pattern.is_empty() && record.filename.contains(pattern.as_str()))
        {
            return false;
        }
        self.profile.extensions.iter().any(|ext| {
            let ext = ext.trim_start_matches('.');
            ext == "*" || ext.eq_ignore_ascii_case(&record.format)
        })
    }
}
