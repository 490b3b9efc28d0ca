pub mod consolidator;
pub mod exporter;
pub mod inventory;
pub mod ledger;
pub mod parser;

pub use consolidator::{consolidate, CandidateSet, Consolidation};
pub use exporter::Exporter;
pub use inventory::{ConsolidationReport, FileRejections, InventoryService, SkippedFile};
pub use ledger::HistoryLedger;
pub use parser::{ParsedFile, Parser, Schema};
