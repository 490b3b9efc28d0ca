pub mod disk;
pub mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use crate::config::ReportConfig;
use crate::error::{InventoryError, Result};
use crate::models::{FileInfo, MasterInventory, UploadedFile};

/// Durable storage for uploaded files and the master artifact.
///
/// Writes must be atomic with respect to concurrent readers: a `load` or
/// `load_master` sees either the previous or the new content, never a mix.
pub trait FileStore: Send + Sync {
    /// Store an upload, replacing any file with the same name
    fn save(&self, file: &UploadedFile) -> Result<FileInfo>;

    fn load(&self, name: &str) -> Result<UploadedFile>;

    /// Irreversibly remove an upload
    fn delete(&self, name: &str) -> Result<()>;

    /// Stored uploads ordered by upload time, then name
    fn list(&self) -> Result<Vec<FileInfo>>;

    fn save_master(&self, master: &MasterInventory) -> Result<()>;

    /// `None` before the first consolidation
    fn load_master(&self) -> Result<Option<MasterInventory>>;

    /// Persist report settings changed at runtime. Stores without a settings
    /// slot keep them in memory only.
    fn save_settings(&self, _settings: &ReportConfig) -> Result<()> {
        Ok(())
    }

    /// `None` when settings were never changed at runtime
    fn load_settings(&self) -> Result<Option<ReportConfig>> {
        Ok(None)
    }
}

/// Reject names that could escape the upload directory or clash with metadata
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.trim().is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.contains("..");
    if bad {
        return Err(InventoryError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn sort_listing(files: &mut [FileInfo]) {
    files.sort_by(|a, b| {
        a.uploaded_at
            .cmp(&b.uploaded_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}
