use crate::config::{ReportConfig, ReportUpdate};
use crate::error::{InventoryError, Result, RowError};
use crate::models::{FileInfo, HistoryEntry, HistoryPage, MasterInventory, UploadedFile};
use crate::service::consolidator::{consolidate, CandidateSet, Consolidation};
use crate::service::exporter::Exporter;
use crate::service::ledger::HistoryLedger;
use crate::service::parser::{ParsedFile, Parser};
use crate::store::{validate_name, FileStore};
use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexSet;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

/// Row errors reported back per file
const MAX_REPORTED_ROWS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    /// Held by consolidations loading the file
    Reading(usize),
    /// Held by a delete or an overwrite
    Exclusive,
}

/// Releases its lease on drop
struct FileLease {
    leases: Arc<DashMap<String, Lease>>,
    name: String,
}

impl Drop for FileLease {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.leases.entry(self.name.clone()) {
            match entry.get_mut() {
                Lease::Reading(n) if *n > 1 => *n -= 1,
                _ => {
                    entry.remove();
                }
            }
        }
    }
}

/// Parser and exporter configured with the current report settings
#[derive(Debug, Clone)]
struct Formats {
    parser: Parser,
    exporter: Exporter,
}

impl Formats {
    fn settings(&self) -> ReportConfig {
        ReportConfig {
            company: self.exporter.company().to_string(),
            use_file_date: self.parser.uses_file_date(),
            date_format: self.exporter.date_format().to_string(),
        }
    }

    fn with_settings(&self, settings: &ReportConfig) -> Self {
        Self {
            parser: self.parser.clone().with_file_date(settings.use_file_date),
            exporter: self
                .exporter
                .clone()
                .with_company(settings.company.as_str())
                .with_date_format(settings.date_format.as_str()),
        }
    }
}

/// File left out of a consolidation
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub name: String,
    pub reason: String,
}

/// Rows of one file that were rejected
#[derive(Debug, Clone, Serialize)]
pub struct FileRejections {
    pub file: String,
    pub total: usize,
    /// First rejected rows, capped
    pub rows: Vec<RowError>,
}

/// Outcome of a committed consolidation
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub entry: HistoryEntry,
    pub skipped: Vec<SkippedFile>,
    pub rejections: Vec<FileRejections>,
}

impl ConsolidationReport {
    /// One-line human readable summary
    pub fn summary(&self) -> String {
        let c = &self.entry.counts;
        format!(
            "Integración #{} completada: {} archivo(s), {} agregados, {} actualizados, {} sin cambios, {} rechazados",
            self.entry.sequence,
            self.entry.sources.len(),
            c.added,
            c.updated,
            c.unchanged,
            c.rejected
        )
    }
}

/// Owns the master snapshot and serializes everything that changes it.
///
/// - consolidations queue on a FIFO async mutex (single writer)
/// - exports and history reads clone an `Arc` and never wait on a writer
/// - files being read by a consolidation cannot be deleted or overwritten
/// - store and ledger I/O of a consolidation runs on the blocking pool
pub struct InventoryService {
    store: Arc<dyn FileStore>,
    ledger: Arc<HistoryLedger>,
    formats: RwLock<Arc<Formats>>,
    settings_writer: StdMutex<()>,
    snapshot: Arc<RwLock<Arc<MasterInventory>>>,
    writer: Mutex<()>,
    leases: Arc<DashMap<String, Lease>>,
}

impl InventoryService {
    /// Load the committed master and reconcile the ledger with it. Report
    /// settings saved at runtime override those of `parser` and `exporter`.
    pub fn open(
        store: Arc<dyn FileStore>,
        ledger: HistoryLedger,
        parser: Parser,
        exporter: Exporter,
    ) -> Result<Self> {
        let master = store.load_master()?.unwrap_or_default();
        ledger.discard_after(master.generation())?;
        if (ledger.len() as u64) < master.generation() {
            tracing::warn!(
                "History ledger has {} entries but master is at generation {}",
                ledger.len(),
                master.generation()
            );
        }

        let mut formats = Formats { parser, exporter };
        if let Some(saved) = store.load_settings()? {
            tracing::info!("Using saved report settings: {:?}", saved);
            formats = formats.with_settings(&saved);
        }

        tracing::info!(
            "Inventory service ready: master generation {}, {} items",
            master.generation(),
            master.len()
        );

        Ok(Self {
            store,
            ledger: Arc::new(ledger),
            formats: RwLock::new(Arc::new(formats)),
            settings_writer: StdMutex::new(()),
            snapshot: Arc::new(RwLock::new(Arc::new(master))),
            writer: Mutex::new(()),
            leases: Arc::new(DashMap::new()),
        })
    }

    /// Current committed master. Never blocks on a running consolidation.
    pub fn snapshot(&self) -> Arc<MasterInventory> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn formats(&self) -> Arc<Formats> {
        Arc::clone(&self.formats.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Report settings in effect
    pub fn settings(&self) -> ReportConfig {
        self.formats().settings()
    }

    /// Validate, persist and apply a settings change. Later uploads,
    /// consolidations and exports use the new values.
    pub fn update_settings(&self, update: &ReportUpdate) -> Result<ReportConfig> {
        let _guard = self.settings_writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.formats();
        let next = current.settings().merged(update);
        next.validate()?;

        self.store.save_settings(&next)?;
        *self.formats.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(current.with_settings(&next));
        tracing::info!("Report settings updated: {:?}", next);
        Ok(next)
    }

    pub fn files(&self) -> Result<Vec<FileInfo>> {
        self.store.list()
    }

    /// Validate the schema and store the file. Malformed uploads are
    /// rejected here, before any consolidation sees them.
    pub fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<FileInfo> {
        validate_name(name)?;
        let file = UploadedFile::new(name, bytes, Utc::now());
        let parsed = self.formats().parser.parse(&file)?;

        let _lease = self.lease_exclusive(name)?;
        let info = self.store.save(&file)?;
        tracing::info!(
            "Upload {} accepted: {} rows, {} rejected",
            name,
            parsed.items.len(),
            parsed.rejected.len()
        );
        Ok(info)
    }

    /// Irreversibly delete an upload. `Busy` while a consolidation reads it.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _lease = self.lease_exclusive(name)?;
        self.store.delete(name)
    }

    /// Consolidate every stored upload, oldest first
    pub async fn consolidate_all(&self) -> Result<ConsolidationReport> {
        self.run_consolidation(None).await
    }

    /// Consolidate the named uploads; later names win timestamp ties. A name
    /// listed twice is merged once, at its last position.
    pub async fn consolidate(&self, names: &[String]) -> Result<ConsolidationReport> {
        self.run_consolidation(Some(names)).await
    }

    /// Ledger entries dated within `[from, to]`, oldest first
    pub fn history(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Vec<HistoryEntry> {
        self.ledger.query(from, to)
    }

    /// One page of [`InventoryService::history`]
    pub fn history_page(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        page: usize,
        per_page: usize,
    ) -> HistoryPage {
        HistoryPage::slice(self.ledger.query(from, to), page, per_page)
    }

    pub fn export_spreadsheet(&self) -> Result<Vec<u8>> {
        let snapshot = self.snapshot();
        self.formats().exporter.render_spreadsheet(&snapshot)
    }

    pub fn export_document(&self) -> Result<Vec<u8>> {
        let snapshot = self.snapshot();
        self.formats().exporter.render_document(&snapshot)
    }

    async fn run_consolidation(&self, requested: Option<&[String]>) -> Result<ConsolidationReport> {
        let _writer = self.writer.lock().await;
        let started = Instant::now();

        // 1. Files to merge: as requested, or every upload in upload order
        let names: Vec<String> = match requested {
            Some(names) => last_position_order(names),
            None => {
                let store = Arc::clone(&self.store);
                spawn_blocking(move || store.list())
                    .await??
                    .into_iter()
                    .map(|f| f.name)
                    .collect()
            }
        };
        tracing::info!("Consolidation started over {} file(s)", names.len());

        // 2. Lease. Leases are held until the commit is done.
        let mut leases = Vec::with_capacity(names.len());
        let mut leased = Vec::with_capacity(names.len());
        let mut skipped = Vec::new();
        for name in names {
            match self.lease_for_read(&name) {
                Some(lease) => {
                    leases.push(lease);
                    leased.push(name);
                }
                None if requested.is_some() => return Err(InventoryError::Busy(name)),
                None => {
                    tracing::info!("Skipping {}: being replaced or deleted", name);
                    skipped.push(SkippedFile {
                        name,
                        reason: "being replaced or deleted".to_string(),
                    });
                }
            }
        }

        // 3. Load and parse on the blocking pool
        let store = Arc::clone(&self.store);
        let parser = self.formats().parser.clone();
        let strict = requested.is_some();
        let loaded = spawn_blocking(move || load_and_parse(store.as_ref(), &parser, leased, strict))
            .await??;

        let mut sets = Vec::with_capacity(loaded.len());
        let mut rejections = Vec::new();
        for (name, result) in loaded {
            match result {
                None => {
                    skipped.push(SkippedFile {
                        name,
                        reason: "deleted before it could be read".to_string(),
                    });
                }
                Some(Ok(parsed)) => {
                    if !parsed.rejected.is_empty() {
                        rejections.push(FileRejections {
                            file: name.clone(),
                            total: parsed.rejected.len(),
                            rows: parsed.rejected.iter().take(MAX_REPORTED_ROWS).cloned().collect(),
                        });
                    }
                    sets.push(CandidateSet::from_parsed(name, parsed));
                }
                Some(Err(e @ InventoryError::Schema { .. })) => {
                    tracing::warn!("Skipping {}: {}", name, e);
                    skipped.push(SkippedFile {
                        name,
                        reason: e.to_string(),
                    });
                }
                Some(Err(e)) => return Err(e),
            }
        }

        // 4. Merge against the committed snapshot
        let base = self.snapshot();
        let Consolidation { master, entry } = consolidate(&base, &sets, Utc::now())?;

        // 5. Persist both or neither, then publish
        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        let snapshot = Arc::clone(&self.snapshot);
        let staged = entry.clone();
        spawn_blocking(move || commit(store.as_ref(), &ledger, &snapshot, master, staged)).await??;
        drop(leases);

        tracing::info!(
            "Consolidation #{} committed in {:?}",
            entry.sequence,
            started.elapsed()
        );
        Ok(ConsolidationReport {
            entry,
            skipped,
            rejections,
        })
    }

    fn lease_for_read(&self, name: &str) -> Option<FileLease> {
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Lease::Reading(n) => *n += 1,
                Lease::Exclusive => return None,
            },
            Entry::Vacant(entry) => {
                entry.insert(Lease::Reading(1));
            }
        }
        Some(FileLease {
            leases: Arc::clone(&self.leases),
            name: name.to_string(),
        })
    }

    fn lease_exclusive(&self, name: &str) -> Result<FileLease> {
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(InventoryError::Busy(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Lease::Exclusive);
            }
        }
        Ok(FileLease {
            leases: Arc::clone(&self.leases),
            name: name.to_string(),
        })
    }
}

/// Requested names without repeats, each at its last position
fn last_position_order(names: &[String]) -> Vec<String> {
    let mut ordered: IndexSet<String> = IndexSet::with_capacity(names.len());
    for name in names {
        ordered.shift_remove(name.as_str());
        ordered.insert(name.clone());
    }
    ordered.into_iter().collect()
}

/// Load in order, then parse in parallel. `None` marks a file that vanished
/// before it could be read, which is only tolerated when not `strict`.
fn load_and_parse(
    store: &dyn FileStore,
    parser: &Parser,
    names: Vec<String>,
    strict: bool,
) -> Result<Vec<(String, Option<Result<ParsedFile>>)>> {
    let mut files = Vec::with_capacity(names.len());
    for name in names {
        match store.load(&name) {
            Ok(file) => files.push((name, Some(file))),
            Err(InventoryError::NotFound(_)) if !strict => files.push((name, None)),
            Err(e) => return Err(e),
        }
    }

    Ok(files
        .into_par_iter()
        .map(|(name, file)| {
            let parsed = file.map(|file| parser.parse(&file));
            (name, parsed)
        })
        .collect())
}

/// Stage the ledger line, save the master, publish. A failed master save
/// rolls the ledger line back, so readers and disk keep the prior state.
fn commit(
    store: &dyn FileStore,
    ledger: &HistoryLedger,
    snapshot: &RwLock<Arc<MasterInventory>>,
    master: MasterInventory,
    entry: HistoryEntry,
) -> Result<()> {
    let staged = ledger.stage(entry)?;
    if let Err(e) = store.save_master(&master) {
        tracing::error!(
            "Saving master generation {} failed, rolling back: {}",
            master.generation(),
            e
        );
        ledger.abort(staged);
        return Err(e);
    }

    *snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(master);
    ledger.commit(staged);
    Ok(())
}
