pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod service;
pub mod store;

pub use config::AppConfig;
pub use error::{InventoryError, Result};
pub use service::InventoryService;
pub use store::{DiskStore, FileStore, MemoryStore};

use service::{Exporter, HistoryLedger, Parser, Schema};
use std::sync::Arc;

const HISTORY_FILE: &str = "historial.jsonl";

/// Wire the disk store, ledger, parser and exporter described by `config`
pub fn open_service(config: &AppConfig) -> Result<InventoryService> {
    let data_dir = &config.storage.data_dir;
    let store = DiskStore::open(data_dir)?.with_master_backups(config.storage.backup_master);
    let ledger = HistoryLedger::open(data_dir.join(HISTORY_FILE))?;

    let schema = Schema::default();
    let exporter = Exporter::new(&schema)
        .with_company(config.report.company.as_str())
        .with_date_format(config.report.date_format.as_str());
    let parser = Parser::new(schema).with_file_date(config.report.use_file_date);

    InventoryService::open(Arc::new(store), ledger, parser, exporter)
}
