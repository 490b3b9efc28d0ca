use crate::config::ReportConfig;
use crate::error::{InventoryError, Result};
use crate::models::{FileInfo, MasterInventory, UploadedFile};
use crate::store::{sort_listing, validate_name, FileStore};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Process-local store, for tests and throwaway instances
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<String, UploadedFile>>,
    master: RwLock<Option<MasterInventory>>,
    settings: RwLock<Option<ReportConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryStore {
    fn save(&self, file: &UploadedFile) -> Result<FileInfo> {
        validate_name(&file.name)?;
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file.name.clone(), file.clone());
        Ok(file.info())
    }

    fn load(&self, name: &str) -> Result<UploadedFile> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| InventoryError::NotFound(name.to_string()))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| InventoryError::NotFound(name.to_string()))
    }

    fn list(&self) -> Result<Vec<FileInfo>> {
        let mut files: Vec<FileInfo> = self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(UploadedFile::info)
            .collect();
        sort_listing(&mut files);
        Ok(files)
    }

    fn save_master(&self, master: &MasterInventory) -> Result<()> {
        *self.master.write().unwrap_or_else(PoisonError::into_inner) = Some(master.clone());
        Ok(())
    }

    fn load_master(&self) -> Result<Option<MasterInventory>> {
        Ok(self
            .master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save_settings(&self, settings: &ReportConfig) -> Result<()> {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        Ok(())
    }

    fn load_settings(&self) -> Result<Option<ReportConfig>> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
