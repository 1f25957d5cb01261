use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::{Builder, NamedTempFile};

use crate::error::CatalogError;

/// Local directories a build uses: the sidecar cache and the staging area next to the output.
#[derive(Debug, Clone)]
pub struct Workspace {
    cache_root: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Result<Self, CatalogError> {
        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("field-catalog"))
                    .ok()
            })
            .ok_or_else(|| {
                CatalogError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { cache_root })
    }

    pub fn with_cache_root(cache_root: Utf8PathBuf) -> Self {
        Self { cache_root }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn ensure_cache_root(&self) -> Result<(), CatalogError> {
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))
    }

    /// Reserves a temporary database file in the destination's directory.
    pub fn stage(&self, destination: &Path) -> Result<StagedCatalog, CatalogError> {
        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".field-catalog")
            .suffix(".sqlite")
            .tempfile_in(&parent)
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Ok(StagedCatalog {
            temp,
            destination: destination.to_path_buf(),
        })
    }
}

/// A catalog under construction. Dropping it without [`StagedCatalog::publish`]
/// removes the temporary file, so the destination never sees a partial build.
#[derive(Debug)]
pub struct StagedCatalog {
    temp: NamedTempFile,
    destination: PathBuf,
}

impl StagedCatalog {
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Renames the staged file over the destination in one step.
    pub fn publish(self) -> Result<PathBuf, CatalogError> {
        self.temp
            .persist(&self.destination)
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Ok(self.destination)
    }
}
