pub mod handlers;

use crate::service::InventoryService;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;

pub use handlers::*;

/// Uploaded spreadsheets can exceed axum's 2 MB default
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// All routes, bound to one shared service
pub fn router(service: Arc<InventoryService>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/integrar", post(handlers::integrate))
        .route("/exportar-excel", get(handlers::export_spreadsheet))
        .route("/exportar-pdf", get(handlers::export_document))
        .route("/historial", get(handlers::history))
        .route(
            "/configuracion",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        .route("/archivos", get(handlers::list_files))
        .route(
            "/archivos/:nombre",
            put(handlers::upload_file).delete(handlers::delete_file),
        )
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)))
        .with_state(service)
}
