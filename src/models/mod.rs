pub mod history;
pub mod item;
pub mod upload;

pub use history::{HistoryEntry, HistoryPage, MergeCounts};
pub use item::{InventoryItem, MasterInventory};
pub use upload::{content_hash, FileInfo, UploadedFile};
