use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Per-outcome counters of one consolidation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

/// Immutable audit record of one consolidation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Generation of the master snapshot this event produced
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    /// Uploaded file names in merge order. May outlive the files themselves.
    pub sources: Vec<String>,
    pub counts: MergeCounts,
    pub total_items: usize,
}

/// One page of history, 1-based
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl HistoryPage {
    /// Page `page` of `entries`. Page and size are clamped to at least 1;
    /// a page past the end is empty. There is always at least one page.
    pub fn slice(entries: Vec<HistoryEntry>, page: usize, per_page: usize) -> Self {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = entries.len();
        let total_pages = total.div_ceil(per_page).max(1);
        let entries = entries
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        Self {
            entries,
            page,
            per_page,
            total,
            total_pages,
        }
    }
}
