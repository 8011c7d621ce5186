use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::storage::object::Id;
use crate::storage::Store;

pub struct DiskStore {
    path: PathBuf,
}

impl DiskStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)
            .with_context(|| format!("create cache dir {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_path(&self, id: &Id) -> PathBuf {
        id.wpath(&self.path)
    }
}

impl Store for DiskStore {
    fn exists(&self, id: &Id) -> bool {
        fs::metadata(self.entry_path(id))
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    fn read(&self, id: &Id) -> Result<Bytes, StoreError> {
        let data = fs::read(self.entry_path(id))?;
        Ok(Bytes::from(data))
    }

    fn write(&self, id: &Id, data: &[u8]) -> Result<(), StoreError> {
        let path = self.entry_path(id);
        let dir = path.parent().unwrap_or(&self.path);
        fs::create_dir_all(dir).map_err(StoreError::io)?;
        // Readers never see a partial entry: the file only appears under its
        // final name once fully synced.
        let mut swap = NamedTempFile::new_in(dir).map_err(StoreError::io)?;
        swap.write_all(data).map_err(StoreError::io)?;
        swap.as_file().sync_all().map_err(StoreError::io)?;
        match swap.persist_noclobber(&path) {
            Ok(_) => {
                log::debug!("cache entry written {} ({} bytes)", path.display(), data.len());
                Ok(())
            }
            // entries never change once written
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists && path.is_file() => {
                log::debug!("cache entry already present {}", path.display());
                Ok(())
            }
            Err(err) => Err(StoreError::io(err.error)),
        }
    }
}
