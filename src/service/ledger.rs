//! Append-only history of consolidation events.
//!
//! Persisted as JSON lines. Appending is two-phase so the caller can tie the
//! entry to another write: [`HistoryLedger::stage`] puts the line on disk,
//! then [`HistoryLedger::commit`] publishes it to readers or
//! [`HistoryLedger::abort`] truncates it away.

use crate::error::{InventoryError, Result};
use crate::models::HistoryEntry;
use chrono::NaiveDate;
use indexmap::IndexMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

#[derive(Debug)]
pub struct HistoryLedger {
    path: Option<PathBuf>,
    entries: RwLock<Arc<Vec<HistoryEntry>>>,
    writer: Mutex<()>,
}

/// An entry written to disk but not yet visible to queries.
/// Holds the ledger's writer lock until committed or aborted.
pub struct StagedEntry<'a> {
    entry: HistoryEntry,
    rollback_len: Option<u64>,
    _writer: MutexGuard<'a, ()>,
}

impl HistoryLedger {
    /// Ledger without persistence
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(()),
        }
    }

    /// Load (or create) a ledger file. A torn trailing line left by a crash
    /// is dropped; any other malformed line is an error. When a sequence
    /// appears more than once (a rollback that could not truncate), the last
    /// line for it wins.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let mut good_len = 0usize;
            let mut torn = false;
            for line in contents.split_inclusive('\n') {
                if line.trim().is_empty() {
                    good_len += line.len();
                    continue;
                }
                match serde_json::from_str::<HistoryEntry>(line) {
                    Ok(entry) => {
                        entries.push(entry);
                        good_len += line.len();
                    }
                    Err(_) if !line.ends_with('\n') => {
                        torn = true;
                        break;
                    }
                    Err(e) => return Err(InventoryError::Serialization(e)),
                }
            }
            if torn {
                tracing::warn!(
                    "Dropping incomplete trailing line of history ledger {}",
                    path.display()
                );
                OpenOptions::new().write(true).open(&path)?.set_len(good_len as u64)?;
            }

            let loaded = entries.len();
            entries = last_per_sequence(entries);
            if entries.len() < loaded {
                tracing::warn!(
                    "Dropping {} superseded history lines in {}",
                    loaded - entries.len(),
                    path.display()
                );
                rewrite(&path, &entries)?;
            }
        }

        tracing::info!("History ledger {} loaded: {} entries", path.display(), entries.len());
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(Arc::new(entries)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write `entry` durably without publishing it
    pub fn stage(&self, entry: HistoryEntry) -> Result<StagedEntry<'_>> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let rollback_len = match &self.path {
            Some(path) => {
                let mut line = serde_json::to_vec(&entry)?;
                line.push(b'\n');
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                let len = file.metadata()?.len();
                if let Err(e) = file.write_all(&line).and_then(|_| file.sync_data()) {
                    let _ = file.set_len(len);
                    return Err(e.into());
                }
                Some(len)
            }
            None => None,
        };

        Ok(StagedEntry {
            entry,
            rollback_len,
            _writer: guard,
        })
    }

    /// Make a staged entry visible to queries
    pub fn commit(&self, staged: StagedEntry<'_>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // readers holding the previous Arc keep their copy
        Arc::make_mut(&mut *entries).push(staged.entry);
    }

    /// Remove a staged entry from disk
    pub fn abort(&self, staged: StagedEntry<'_>) {
        if let (Some(path), Some(len)) = (&self.path, staged.rollback_len) {
            let result = OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| file.set_len(len));
            if let Err(e) = result {
                tracing::error!(
                    "Failed to roll back history entry #{}: {}",
                    staged.entry.sequence,
                    e
                );
            }
        }
        tracing::warn!("History entry #{} rolled back", staged.entry.sequence);
    }

    pub fn append(&self, entry: HistoryEntry) -> Result<()> {
        let staged = self.stage(entry)?;
        self.commit(staged);
        Ok(())
    }

    /// Current entries, in append order
    pub fn entries(&self) -> Arc<Vec<HistoryEntry>> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Entries dated within `[from, to]` (either bound optional), oldest first
    pub fn query(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Vec<HistoryEntry> {
        let entries = self.entries();
        let mut selected: Vec<HistoryEntry> = entries
            .iter()
            .filter(|e| from.map_or(true, |f| e.date >= f) && to.map_or(true, |t| e.date <= t))
            .cloned()
            .collect();
        selected.sort_by_key(|e| e.timestamp);
        selected
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop entries whose sequence is beyond the committed master generation.
    /// Such entries were staged by a consolidation whose master save never
    /// completed.
    pub fn discard_after(&self, generation: u64) -> Result<usize> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let keep: Vec<HistoryEntry> = entries
            .iter()
            .filter(|e| e.sequence <= generation)
            .cloned()
            .collect();
        let dropped = entries.len() - keep.len();
        if dropped == 0 {
            return Ok(0);
        }

        if let Some(path) = &self.path {
            rewrite(path, &keep)?;
        }

        tracing::warn!(
            "Discarded {} uncommitted history entries beyond generation {}",
            dropped,
            generation
        );
        *entries = Arc::new(keep);
        Ok(dropped)
    }
}

/// Keep the last entry per sequence, at the position of that last line
fn last_per_sequence(entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let mut latest: IndexMap<u64, HistoryEntry> = IndexMap::with_capacity(entries.len());
    for entry in entries {
        latest.shift_remove(&entry.sequence);
        latest.insert(entry.sequence, entry);
    }
    latest.into_values().collect()
}

/// Replace the ledger file with `entries` via temp file + rename
fn rewrite(path: &Path, entries: &[HistoryEntry]) -> Result<()> {
    let mut body = Vec::new();
    for entry in entries {
        body.extend(serde_json::to_vec(entry)?);
        body.push(b'\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    fs::write(&tmp, &body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MergeCounts;
    use chrono::{TimeZone, Utc};

    fn entry(sequence: u64, day: u32, hour: u32) -> HistoryEntry {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap();
        HistoryEntry {
            sequence,
            timestamp,
            date: timestamp.date_naive(),
            sources: vec![format!("file{}.csv", sequence)],
            counts: MergeCounts {
                added: sequence as usize,
                ..MergeCounts::default()
            },
            total_items: 1,
        }
    }

    fn date(day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2024, 5, day)
    }

    #[test]
    fn query_filters_inclusive_and_orders_by_timestamp() {
        let ledger = HistoryLedger::in_memory();
        ledger.append(entry(1, 3, 10)).unwrap();
        ledger.append(entry(2, 1, 10)).unwrap();
        ledger.append(entry(3, 3, 8)).unwrap();
        ledger.append(entry(4, 5, 8)).unwrap();

        let seqs = |v: Vec<HistoryEntry>| v.into_iter().map(|e| e.sequence).collect::<Vec<_>>();
        assert_eq!(seqs(ledger.query(None, None)), [2, 3, 1, 4]);
        assert_eq!(seqs(ledger.query(date(3), date(3))), [3, 1]);
        assert_eq!(seqs(ledger.query(date(2), None)), [3, 1, 4]);
        assert_eq!(seqs(ledger.query(None, date(3))), [2, 3, 1]);
        assert!(ledger.query(date(10), None).is_empty());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("historial.jsonl");

        let ledger = HistoryLedger::open(&path).unwrap();
        ledger.append(entry(1, 1, 9)).unwrap();
        ledger.append(entry(2, 2, 9)).unwrap();
        drop(ledger);

        let reopened = HistoryLedger::open(&path).unwrap();
        assert_eq!(reopened.query(None, None), vec![entry(1, 1, 9), entry(2, 2, 9)]);
    }

    #[test]
    fn aborted_entry_is_neither_visible_nor_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("historial.jsonl");
        let ledger = HistoryLedger::open(&path).unwrap();
        ledger.append(entry(1, 1, 9)).unwrap();

        let staged = ledger.stage(entry(2, 2, 9)).unwrap();
        ledger.abort(staged);
        assert_eq!(ledger.len(), 1);

        let reopened = HistoryLedger::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn torn_trailing_line_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("historial.jsonl");
        let mut body = serde_json::to_string(&entry(1, 1, 9)).unwrap();
        body.push('\n');
        body.push_str("{\"sequence\":2,\"timest");
        fs::write(&path, body).unwrap();

        let ledger = HistoryLedger::open(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        ledger.append(entry(2, 2, 9)).unwrap();

        let reopened = HistoryLedger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("historial.jsonl");
        fs::write(&path, "not json\n").unwrap();
        assert!(matches!(
            HistoryLedger::open(&path),
            Err(InventoryError::Serialization(_))
        ));
    }

    #[test]
    fn discard_after_drops_uncommitted_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("historial.jsonl");
        let ledger = HistoryLedger::open(&path).unwrap();
        for seq in 1..=3 {
            ledger.append(entry(seq, seq as u32, 9)).unwrap();
        }

        assert_eq!(ledger.discard_after(2).unwrap(), 1);
        assert_eq!(ledger.discard_after(2).unwrap(), 0);
        assert_eq!(HistoryLedger::open(&path).unwrap().len(), 2);
    }

    #[test]
    fn failed_rollback_leaves_no_duplicate_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("historial.jsonl");
        let mut retried = entry(2, 3, 9);
        retried.sources = vec!["retry.csv".to_string()];

        let mut body = String::new();
        for e in [entry(1, 1, 9), entry(2, 2, 9), retried.clone()] {
            body.push_str(&serde_json::to_string(&e).unwrap());
            body.push('\n');
        }
        fs::write(&path, body).unwrap();

        let ledger = HistoryLedger::open(&path).unwrap();
        assert_eq!(ledger.query(None, None), vec![entry(1, 1, 9), retried.clone()]);
        // the file itself was rewritten
        let lines = fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 2);
        assert_eq!(ledger.discard_after(2).unwrap(), 0);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let ledger = HistoryLedger::in_memory();
        ledger.append(entry(1, 1, 9)).unwrap();
        let before = ledger.entries();
        ledger.append(entry(2, 2, 9)).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(ledger.len(), 2);
    }
}
