use crate::config::ReportConfig;
use crate::error::{InventoryError, Result};
use crate::models::{FileInfo, MasterInventory, UploadedFile};
use crate::store::{sort_listing, validate_name, FileStore};
use chrono::Utc;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const UPLOADS_DIR: &str = "uploads";
const META_DIR: &str = ".meta";
const BACKUPS_DIR: &str = "backups";
const MASTER_FILE: &str = "maestro.json";
const SETTINGS_FILE: &str = "configuracion.json";

/// Directory-backed store.
///
/// Layout:
/// - `uploads/<name>`: raw upload bytes
/// - `uploads/.meta/<name>.json`: upload metadata
/// - `maestro.json`: master snapshot
/// - `backups/maestro_<timestamp>.json`: previous masters, when enabled
/// - `configuracion.json`: report settings changed at runtime
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    backup_master: bool,
    tmp_counter: AtomicU64,
}

impl DiskStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(UPLOADS_DIR).join(META_DIR))?;
        tracing::info!("File store opened at {}", root.display());
        Ok(Self {
            root,
            backup_master: false,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Keep a copy of the previous master before each replacement
    pub fn with_master_backups(mut self, enabled: bool) -> Self {
        self.backup_master = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn upload_path(&self, name: &str) -> PathBuf {
        self.root.join(UPLOADS_DIR).join(name)
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root
            .join(UPLOADS_DIR)
            .join(META_DIR)
            .join(format!("{}.json", name))
    }

    fn master_path(&self) -> PathBuf {
        self.root.join(MASTER_FILE)
    }

    /// Write to a sibling temp file, fsync, then rename over `path`
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = path.with_file_name(format!(".{}.{}.{}.tmp", file_name, std::process::id(), seq));

        let result = fs::File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp_path, path));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn backup_current_master(&self) -> Result<()> {
        let current = self.master_path();
        if !current.exists() {
            return Ok(());
        }
        let dir = self.root.join(BACKUPS_DIR);
        fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let backup = dir.join(format!("maestro_{}.json", stamp));
        fs::copy(&current, &backup)?;
        tracing::debug!("Master backed up to {}", backup.display());
        Ok(())
    }
}

fn not_found_as(name: &str, err: std::io::Error) -> InventoryError {
    if err.kind() == ErrorKind::NotFound {
        InventoryError::NotFound(name.to_string())
    } else {
        InventoryError::Io(err)
    }
}

impl FileStore for DiskStore {
    fn save(&self, file: &UploadedFile) -> Result<FileInfo> {
        validate_name(&file.name)?;
        let info = file.info();
        // Bytes first: a listed file always has its payload on disk
        self.write_atomic(&self.upload_path(&file.name), &file.bytes)?;
        self.write_atomic(&self.meta_path(&file.name), &serde_json::to_vec_pretty(&info)?)?;
        tracing::info!("Saved upload {} ({} bytes)", info.name, info.size);
        Ok(info)
    }

    fn load(&self, name: &str) -> Result<UploadedFile> {
        validate_name(name)?;
        let meta = fs::read(self.meta_path(name)).map_err(|e| not_found_as(name, e))?;
        let info: FileInfo = serde_json::from_slice(&meta)?;
        let bytes = fs::read(self.upload_path(name)).map_err(|e| not_found_as(name, e))?;
        Ok(UploadedFile {
            name: info.name,
            uploaded_at: info.uploaded_at,
            content_hash: info.content_hash,
            bytes,
        })
    }

    fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        // Metadata first so a half-deleted file no longer shows up in listings
        fs::remove_file(self.meta_path(name)).map_err(|e| not_found_as(name, e))?;
        match fs::remove_file(self.upload_path(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Deleted upload {}", name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<FileInfo>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.root.join(UPLOADS_DIR).join(META_DIR))? {
            let path = entry?.path();
            let is_meta = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_meta {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                // deleted between read_dir and read
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            files.push(serde_json::from_slice::<FileInfo>(&bytes)?);
        }
        sort_listing(&mut files);
        Ok(files)
    }

    fn save_master(&self, master: &MasterInventory) -> Result<()> {
        if self.backup_master {
            self.backup_current_master()?;
        }
        let bytes = serde_json::to_vec(master)?;
        self.write_atomic(&self.master_path(), &bytes)?;
        tracing::info!(
            "Master generation {} saved ({} items)",
            master.generation(),
            master.len()
        );
        Ok(())
    }

    fn load_master(&self) -> Result<Option<MasterInventory>> {
        match fs::read(self.master_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_settings(&self, settings: &ReportConfig) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(settings)?;
        self.write_atomic(&self.root.join(SETTINGS_FILE), &bytes)?;
        tracing::info!("Report settings saved");
        Ok(())
    }

    fn load_settings(&self) -> Result<Option<ReportConfig>> {
        match fs::read(self.root.join(SETTINGS_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
