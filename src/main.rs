use insumos_maestro::{api, open_service, AppConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::load()?;
    info!("Starting server with config: {:?}", config);

    let service = Arc::new(open_service(&config)?);
    info!("Data directory: {}", config.storage.data_dir.display());

    let app = api::router(service);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST   /integrar              - consolidate uploads into the master");
    info!("  GET    /exportar-excel        - master as inventario.xlsx");
    info!("  GET    /exportar-pdf          - master as inventario.pdf");
    info!("  GET    /historial?fecha=      - consolidation history (pagina, por_pagina)");
    info!("  GET    /configuracion         - report settings");
    info!("  PUT    /configuracion         - change report settings");
    info!("  GET    /archivos              - list uploads");
    info!("  PUT    /archivos/:nombre      - upload a CSV/XLSX file");
    info!("  DELETE /archivos/:nombre      - delete an upload");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
