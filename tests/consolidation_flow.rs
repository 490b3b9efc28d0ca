use bigdecimal::BigDecimal;
use chrono::{NaiveDate, Utc};
use insumos_maestro::models::{FileInfo, MasterInventory, MergeCounts, UploadedFile};
use insumos_maestro::service::{Exporter, HistoryLedger, Parser};
use insumos_maestro::config::ReportUpdate;
use insumos_maestro::{open_service, AppConfig, DiskStore, FileStore, InventoryError, InventoryService, MemoryStore};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

const HEADER: &str = "codigo,cantidad,unidad,categoria,fecha\n";

fn csv(rows: &[&str]) -> Vec<u8> {
    let mut body = HEADER.to_string();
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    body.into_bytes()
}

fn memory_service() -> InventoryService {
    InventoryService::open(
        Arc::new(MemoryStore::new()),
        HistoryLedger::in_memory(),
        Parser::default(),
        Exporter::default(),
    )
    .unwrap()
}

fn config_for(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.data_dir = dir.to_path_buf();
    config
}

/// Disk store whose master writes can be made to fail
struct FlakyStore {
    inner: DiskStore,
    fail_master: AtomicBool,
}

impl FileStore for FlakyStore {
    fn save(&self, file: &UploadedFile) -> insumos_maestro::Result<FileInfo> {
        self.inner.save(file)
    }

    fn load(&self, name: &str) -> insumos_maestro::Result<UploadedFile> {
        self.inner.load(name)
    }

    fn delete(&self, name: &str) -> insumos_maestro::Result<()> {
        self.inner.delete(name)
    }

    fn list(&self) -> insumos_maestro::Result<Vec<FileInfo>> {
        self.inner.list()
    }

    fn save_master(&self, master: &MasterInventory) -> insumos_maestro::Result<()> {
        if self.fail_master.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full").into());
        }
        self.inner.save_master(master)
    }

    fn load_master(&self) -> insumos_maestro::Result<Option<MasterInventory>> {
        self.inner.load_master()
    }
}

/// Memory store whose `load` can be parked until the test releases it
struct GatedStore {
    inner: MemoryStore,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl FileStore for GatedStore {
    fn save(&self, file: &UploadedFile) -> insumos_maestro::Result<FileInfo> {
        self.inner.save(file)
    }

    fn load(&self, name: &str) -> insumos_maestro::Result<UploadedFile> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.load(name)
    }

    fn delete(&self, name: &str) -> insumos_maestro::Result<()> {
        self.inner.delete(name)
    }

    fn list(&self) -> insumos_maestro::Result<Vec<FileInfo>> {
        self.inner.list()
    }

    fn save_master(&self, master: &MasterInventory) -> insumos_maestro::Result<()> {
        self.inner.save_master(master)
    }

    fn load_master(&self) -> insumos_maestro::Result<Option<MasterInventory>> {
        self.inner.load_master()
    }
}

#[tokio::test]
async fn newer_file_wins_end_to_end() {
    let svc = memory_service();
    svc.upload("A.csv", csv(&["K1,5,kg,Aseo,2024-05-01 08:00:00"])).unwrap();
    svc.upload("B.csv", csv(&["K1,8,kg,Aseo,2024-05-02 08:00:00"])).unwrap();

    let report = svc
        .consolidate(&["A.csv".to_string(), "B.csv".to_string()])
        .await
        .unwrap();

    let master = svc.snapshot();
    let k1 = master.get("K1").unwrap();
    assert_eq!(k1.quantity, BigDecimal::from(8));
    assert_eq!(k1.source, "B.csv");
    assert_eq!(
        report.entry.counts,
        MergeCounts { added: 1, updated: 1, unchanged: 0, rejected: 0 }
    );
    assert_eq!(report.entry.sources, ["A.csv", "B.csv"]);
    assert_eq!(svc.history(None, None), vec![report.entry]);
}

#[tokio::test]
async fn reconsolidating_unchanged_files_is_idempotent() {
    let svc = memory_service();
    svc.upload(
        "insumos.csv",
        csv(&["K1,5,kg,Aseo,2024-05-01", "K2,3.5,lt,Cafeteria,2024-05-01"]),
    )
    .unwrap();

    svc.consolidate_all().await.unwrap();
    let first = svc.snapshot();
    let second = svc.consolidate_all().await.unwrap();

    assert_eq!(second.entry.counts.added, 0);
    assert_eq!(second.entry.counts.updated, 0);
    assert_eq!(second.entry.counts.unchanged, 2);
    assert_eq!(svc.snapshot().as_map(), first.as_map());
    assert_eq!(svc.history(None, None).len(), 2);
}

#[tokio::test]
async fn equal_timestamps_resolve_to_the_later_listed_file() {
    let svc = memory_service();
    svc.upload("uno.csv", csv(&["K,1,und,X,2024-05-01"])).unwrap();
    svc.upload("dos.csv", csv(&["K,2,und,X,2024-05-01"])).unwrap();

    svc.consolidate(&["dos.csv".to_string(), "uno.csv".to_string()])
        .await
        .unwrap();
    assert_eq!(svc.snapshot().get("K").unwrap().quantity, BigDecimal::from(1));
}

#[tokio::test]
async fn failed_master_save_leaves_master_and_history_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore {
        inner: DiskStore::open(dir.path()).unwrap(),
        fail_master: AtomicBool::new(false),
    });
    let ledger_path = dir.path().join("historial.jsonl");
    let svc = InventoryService::open(
        Arc::clone(&store) as Arc<dyn FileStore>,
        HistoryLedger::open(&ledger_path).unwrap(),
        Parser::default(),
        Exporter::default(),
    )
    .unwrap();

    svc.upload("a.csv", csv(&["K1,5,kg,Aseo,2024-05-01"])).unwrap();
    svc.consolidate_all().await.unwrap();
    let before = svc.snapshot();

    store.fail_master.store(true, Ordering::SeqCst);
    svc.upload("b.csv", csv(&["K1,9,kg,Aseo,2024-06-01", "K2,1,kg,Aseo,2024-06-01"]))
        .unwrap();
    let err = svc.consolidate_all().await.unwrap_err();
    assert!(matches!(err, InventoryError::Io(_)));

    assert_eq!(*svc.snapshot(), *before);
    assert_eq!(svc.history(None, None).len(), 1);
    assert_eq!(HistoryLedger::open(&ledger_path).unwrap().len(), 1);
    assert_eq!(store.load_master().unwrap().unwrap().generation(), 1);

    // next attempt succeeds and reuses the sequence number
    store.fail_master.store(false, Ordering::SeqCst);
    let report = svc.consolidate_all().await.unwrap();
    assert_eq!(report.entry.sequence, 2);
    assert_eq!(svc.snapshot().get("K1").unwrap().quantity, BigDecimal::from(9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consolidations_serialize_without_lost_updates() {
    let svc = Arc::new(memory_service());
    let names: Vec<String> = (0..8).map(|n| format!("lote{}.csv", n)).collect();
    for (n, name) in names.iter().enumerate() {
        let row = format!("K{},{},und,General,2024-05-01", n, n + 1);
        svc.upload(name, csv(&[row.as_str()])).unwrap();
    }

    let runs = names.iter().map(|name| {
        let svc = Arc::clone(&svc);
        let name = name.clone();
        async move { svc.consolidate(&[name]).await }
    });
    let reports = futures::future::join_all(runs).await;
    assert!(reports.iter().all(|r| r.is_ok()));

    let master = svc.snapshot();
    assert_eq!(master.len(), names.len());
    assert_eq!(master.generation(), names.len() as u64);

    let mut history = svc.history(None, None);
    history.sort_by_key(|e| e.sequence);
    let sequences: Vec<u64> = history.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=names.len() as u64).collect::<Vec<_>>());
    // every event saw the result of the one before it
    for (i, entry) in history.iter().enumerate() {
        assert_eq!(entry.total_items, i + 1);
        assert_eq!(entry.counts.added, 1);
    }
}

#[tokio::test]
async fn exported_spreadsheet_consolidates_back_without_changes() {
    let svc = memory_service();
    svc.upload(
        "base.csv",
        csv(&["A-1,12,kg,Aseo,2024-05-01 09:30:00", "B-2,0.75,lt,Cafeteria,2024-05-02 10:00:00"]),
    )
    .unwrap();
    svc.consolidate_all().await.unwrap();
    let before = svc.snapshot();

    let xlsx = svc.export_spreadsheet().unwrap();
    svc.upload("inventario.xlsx", xlsx).unwrap();
    let report = svc.consolidate(&["inventario.xlsx".to_string()]).await.unwrap();

    assert_eq!(report.entry.counts.unchanged, 2);
    assert_eq!(report.entry.counts.updated, 0);
    assert_eq!(svc.snapshot().as_map(), before.as_map());
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());

    let svc = open_service(&config).unwrap();
    svc.upload("a.csv", csv(&["K1,5,kg,Aseo,2024-05-01"])).unwrap();
    svc.consolidate_all().await.unwrap();
    let committed = svc.snapshot();
    drop(svc);

    let reopened = open_service(&config).unwrap();
    assert_eq!(*reopened.snapshot(), *committed);
    assert_eq!(reopened.history(None, None).len(), 1);
    assert_eq!(reopened.files().unwrap().len(), 1);
}

#[tokio::test]
async fn deleted_files_stay_named_in_history() {
    let svc = memory_service();
    svc.upload("a.csv", csv(&["K1,5,kg,Aseo,2024-05-01"])).unwrap();
    svc.consolidate_all().await.unwrap();

    svc.delete_file("a.csv").unwrap();
    assert!(matches!(svc.delete_file("a.csv"), Err(InventoryError::NotFound(_))));
    assert_eq!(svc.history(None, None)[0].sources, ["a.csv"]);
    assert!(svc.snapshot().get("K1").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_see_the_previous_generation_while_a_consolidation_is_loading() {
    let store = Arc::new(GatedStore::new());
    let svc = Arc::new(
        InventoryService::open(
            Arc::clone(&store) as Arc<dyn FileStore>,
            HistoryLedger::in_memory(),
            Parser::default(),
            Exporter::default(),
        )
        .unwrap(),
    );
    svc.upload("a.csv", csv(&["K1,5,kg,Aseo,2024-05-01"])).unwrap();
    svc.consolidate_all().await.unwrap();
    let before = svc.snapshot();
    let exported_quantity = |svc: &InventoryService| {
        let xlsx = UploadedFile::new("export.xlsx", svc.export_spreadsheet().unwrap(), Utc::now());
        let parsed = Parser::default().parse(&xlsx).unwrap();
        assert_eq!(parsed.items.len(), svc.snapshot().len());
        parsed.items[0].quantity.clone()
    };
    assert_eq!(exported_quantity(svc.as_ref()), BigDecimal::from(5));

    svc.upload("b.csv", csv(&["K1,9,kg,Aseo,2024-06-01", "K2,1,kg,Aseo,2024-06-01"]))
        .unwrap();
    store.armed.store(true, Ordering::SeqCst);
    let running = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.consolidate_all().await }
    });
    let gate = Arc::clone(&store);
    tokio::task::spawn_blocking(move || {
        gate.entered.wait();
    })
    .await
    .unwrap();

    // consolidation is parked inside the first load, holding its leases
    assert!(matches!(svc.delete_file("a.csv"), Err(InventoryError::Busy(_))));
    assert_eq!(svc.snapshot().generation(), 1);
    assert_eq!(*svc.snapshot(), *before);
    assert_eq!(svc.history(None, None).len(), 1);
    assert_eq!(exported_quantity(svc.as_ref()), BigDecimal::from(5));

    let gate = Arc::clone(&store);
    tokio::task::spawn_blocking(move || {
        gate.release.wait();
    })
    .await
    .unwrap();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.entry.sequence, 2);
    assert_eq!(svc.snapshot().generation(), 2);
    assert_eq!(svc.snapshot().get("K1").unwrap().quantity, BigDecimal::from(9));
    assert_eq!(svc.history(None, None).len(), 2);
    assert_eq!(exported_quantity(svc.as_ref()), BigDecimal::from(9));
    svc.delete_file("a.csv").unwrap();
}

#[tokio::test]
async fn report_settings_persist_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());

    let svc = open_service(&config).unwrap();
    svc.update_settings(&ReportUpdate {
        company: Some("Fiduciaria Central".to_string()),
        use_file_date: Some(true),
        date_format: Some("%d/%m/%Y".to_string()),
    })
    .unwrap();
    drop(svc);

    let reopened = open_service(&config).unwrap();
    let settings = reopened.settings();
    assert_eq!(settings.company, "Fiduciaria Central");
    assert!(settings.use_file_date);
    assert_eq!(settings.date_format, "%d/%m/%Y");

    reopened
        .upload("corte_05-04-2023.csv", b"codigo,cantidad,unidad,categoria\nK1,1,und,X\n".to_vec())
        .unwrap();
    reopened.consolidate_all().await.unwrap();
    assert_eq!(
        reopened.snapshot().get("K1").unwrap().last_updated.date_naive(),
        NaiveDate::from_ymd_opt(2023, 4, 5).unwrap()
    );
}
