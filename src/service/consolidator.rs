use crate::error::{InventoryError, Result};
use crate::models::{HistoryEntry, InventoryItem, MasterInventory, MergeCounts};
use crate::service::parser::ParsedFile;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use std::collections::HashSet;

/// Candidates from one uploaded file, in the order they should be merged
#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// Uploaded file name
    pub source: String,
    pub items: Vec<InventoryItem>,
    /// Rows dropped by the parser
    pub rejected: usize,
}

impl CandidateSet {
    pub fn new(source: impl Into<String>, items: Vec<InventoryItem>) -> Self {
        Self {
            source: source.into(),
            items,
            rejected: 0,
        }
    }

    pub fn from_parsed(source: impl Into<String>, parsed: ParsedFile) -> Self {
        Self {
            source: source.into(),
            rejected: parsed.rejected.len(),
            items: parsed.items,
        }
    }
}

/// Result of a merge: the next snapshot and its audit record
#[derive(Debug, Clone)]
pub struct Consolidation {
    pub master: MasterInventory,
    pub entry: HistoryEntry,
}

/// Merge candidate sets into a copy of `master`.
///
/// Resolution per candidate, in input order:
/// 1. key not in master: insert (added)
/// 2. candidate newer than the entry: replace (updated)
/// 3. same timestamp and the entry was written earlier in this call: replace
///    (updated), so the later listed set wins ties
/// 4. otherwise keep the entry (unchanged)
///
/// The final snapshot only depends on input order through ties. `master` is
/// never modified.
pub fn consolidate(
    master: &MasterInventory,
    sets: &[CandidateSet],
    now: DateTime<Utc>,
) -> Result<Consolidation> {
    let candidates: usize = sets.iter().map(|s| s.items.len()).sum();
    if candidates == 0 {
        let rejected: usize = sets.iter().map(|s| s.rejected).sum();
        return Err(InventoryError::Consolidation(format!(
            "no valid rows in {} file(s) ({} rejected)",
            sets.len(),
            rejected
        )));
    }

    let mut items = master.as_map().clone();
    let mut written: HashSet<String> = HashSet::new();
    let mut sources: IndexSet<String> = IndexSet::new();
    let mut counts = MergeCounts::default();

    for set in sets {
        sources.insert(set.source.clone());
        counts.rejected += set.rejected;

        for candidate in &set.items {
            let replace = match items.get(&candidate.key) {
                None => {
                    counts.added += 1;
                    true
                }
                Some(current) => {
                    let wins = candidate.last_updated > current.last_updated
                        || (candidate.last_updated == current.last_updated
                            && written.contains(&candidate.key));
                    if wins {
                        counts.updated += 1;
                    } else {
                        counts.unchanged += 1;
                    }
                    wins
                }
            };

            if replace {
                written.insert(candidate.key.clone());
                items.insert(candidate.key.clone(), candidate.clone());
            }
        }
    }

    let generation = master.generation() + 1;
    let total_items = items.len();
    tracing::info!(
        "Consolidation #{}: {} files, added {}, updated {}, unchanged {}, rejected {}",
        generation,
        sources.len(),
        counts.added,
        counts.updated,
        counts.unchanged,
        counts.rejected
    );

    Ok(Consolidation {
        master: MasterInventory::from_parts(generation, now, items),
        entry: HistoryEntry {
            sequence: generation,
            timestamp: now,
            date: now.date_naive(),
            sources: sources.into_iter().collect(),
            counts,
            total_items,
        },
    })
}
