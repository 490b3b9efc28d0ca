use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inventory line ("insumo") identified by its item code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub key: String,
    pub quantity: BigDecimal,
    pub unit: String,
    pub category: String,
    /// Provenance timestamp used to resolve merge conflicts
    pub last_updated: DateTime<Utc>,
    /// Uploaded file the record came from
    pub source: String,
}

/// Consolidated master inventory, ordered by item code.
///
/// A snapshot is never edited after construction: every consolidation builds
/// a new one with `generation + 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterInventory {
    generation: u64,
    updated_at: Option<DateTime<Utc>>,
    items: BTreeMap<String, InventoryItem>,
}

impl MasterInventory {
    /// Empty snapshot, before the first consolidation
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        generation: u64,
        updated_at: DateTime<Utc>,
        items: BTreeMap<String, InventoryItem>,
    ) -> Self {
        Self {
            generation,
            updated_at: Some(updated_at),
            items,
        }
    }

    /// Number of committed consolidations that produced this snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn get(&self, key: &str) -> Option<&InventoryItem> {
        self.items.get(key)
    }

    /// Items in key order
    pub fn items(&self) -> impl Iterator<Item = &InventoryItem> {
        self.items.values()
    }

    pub fn as_map(&self) -> &BTreeMap<String, InventoryItem> {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
