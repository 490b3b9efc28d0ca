use crate::config::{ReportConfig, ReportUpdate};
use crate::error::InventoryError;
use crate::models::{FileInfo, HistoryPage, MergeCounts};
use crate::service::{FileRejections, InventoryService, SkippedFile};
use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Optional body of `POST /integrar`: files to merge, in precedence order
#[derive(Debug, Default, Deserialize)]
pub struct IntegrateRequest {
    #[serde(default)]
    pub archivos: Option<Vec<String>>,
}

/// Plain response body
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

/// Body of a successful consolidation
#[derive(Debug, Serialize)]
pub struct IntegrateResponse {
    pub success: bool,
    pub message: String,
    pub sequence: u64,
    pub counts: MergeCounts,
    pub total_items: usize,
    pub skipped: Vec<SkippedFile>,
    pub rejections: Vec<FileRejections>,
}

/// History page size when only `pagina` is given
const DEFAULT_PER_PAGE: usize = 5;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Single day; takes precedence over the range
    pub fecha: Option<NaiveDate>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    #[serde(alias = "page")]
    pub pagina: Option<usize>,
    #[serde(alias = "per_page")]
    pub por_pagina: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    #[serde(flatten)]
    pub page: HistoryPage,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub success: bool,
    pub settings: ReportConfig,
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub success: bool,
    pub files: Vec<FileInfo>,
}

impl IntoResponse for InventoryError {
    fn into_response(self) -> Response {
        let status = match &self {
            InventoryError::Schema { .. } | InventoryError::Consolidation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            InventoryError::NotFound(_) => StatusCode::NOT_FOUND,
            InventoryError::Busy(_) => StatusCode::CONFLICT,
            InventoryError::InvalidName(_) | InventoryError::InvalidSetting(_) => {
                StatusCode::BAD_REQUEST
            }
            InventoryError::Render(_)
            | InventoryError::Io(_)
            | InventoryError::Serialization(_)
            | InventoryError::Config(_)
            | InventoryError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }

        let response = ApiResponse {
            success: false,
            message: format!("Error: {}", self),
        };
        (status, Json(response)).into_response()
    }
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// Consolidate stored uploads into the master inventory
pub async fn integrate(State(service): State<Arc<InventoryService>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        IntegrateRequest::default()
    } else {
        match serde_json::from_slice::<IntegrateRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                let response = ApiResponse {
                    success: false,
                    message: format!("Error: invalid request body: {}", e),
                };
                return (StatusCode::BAD_REQUEST, Json(response)).into_response();
            }
        }
    };

    let result = match &request.archivos {
        Some(names) => service.consolidate(names).await,
        None => service.consolidate_all().await,
    };

    match result {
        Ok(report) => {
            let response = IntegrateResponse {
                success: true,
                message: report.summary(),
                sequence: report.entry.sequence,
                counts: report.entry.counts,
                total_items: report.entry.total_items,
                skipped: report.skipped,
                rejections: report.rejections,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Download the master as `inventario.xlsx`
pub async fn export_spreadsheet(
    State(service): State<Arc<InventoryService>>,
) -> Result<Response, InventoryError> {
    let bytes = tokio::task::spawn_blocking(move || service.export_spreadsheet())
        .await??;
    Ok(attachment(bytes, XLSX_CONTENT_TYPE, "inventario.xlsx"))
}

/// Download the master as `inventario.pdf`
pub async fn export_document(
    State(service): State<Arc<InventoryService>>,
) -> Result<Response, InventoryError> {
    let bytes = tokio::task::spawn_blocking(move || service.export_document())
        .await??;
    Ok(attachment(bytes, "application/pdf", "inventario.pdf"))
}

/// Consolidation events for a day (`fecha`) or a range (`desde`/`hasta`).
/// Paged when `pagina` or `por_pagina` is given, otherwise one page of all.
pub async fn history(
    State(service): State<Arc<InventoryService>>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let (from, to) = match query.fecha {
        Some(day) => (Some(day), Some(day)),
        None => (query.desde, query.hasta),
    };
    let page = if query.pagina.is_some() || query.por_pagina.is_some() {
        service.history_page(
            from,
            to,
            query.pagina.unwrap_or(1),
            query.por_pagina.unwrap_or(DEFAULT_PER_PAGE),
        )
    } else {
        let entries = service.history(from, to);
        let per_page = entries.len().max(1);
        HistoryPage::slice(entries, 1, per_page)
    };
    Json(HistoryResponse {
        success: true,
        page,
    })
}

pub async fn get_settings(State(service): State<Arc<InventoryService>>) -> Json<SettingsResponse> {
    Json(SettingsResponse {
        success: true,
        settings: service.settings(),
    })
}

/// Change report settings; absent fields keep their value
pub async fn update_settings(
    State(service): State<Arc<InventoryService>>,
    Json(update): Json<ReportUpdate>,
) -> Result<Json<SettingsResponse>, InventoryError> {
    let settings = tokio::task::spawn_blocking(move || service.update_settings(&update)).await??;
    Ok(Json(SettingsResponse {
        success: true,
        settings,
    }))
}

pub async fn list_files(
    State(service): State<Arc<InventoryService>>,
) -> Result<Json<FilesResponse>, InventoryError> {
    let files = tokio::task::spawn_blocking(move || service.files()).await??;
    Ok(Json(FilesResponse {
        success: true,
        files,
    }))
}

/// Store (or replace) an upload after validating its columns
pub async fn upload_file(
    State(service): State<Arc<InventoryService>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, InventoryError> {
    let info = tokio::task::spawn_blocking(move || service.upload(&name, body.to_vec()))
        .await??;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

pub async fn delete_file(
    State(service): State<Arc<InventoryService>>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse>, InventoryError> {
    let target = name.clone();
    tokio::task::spawn_blocking(move || service.delete_file(&target)).await??;
    Ok(Json(ApiResponse {
        success: true,
        message: format!("Archivo {} eliminado", name),
    }))
}

fn attachment(bytes: Vec<u8>, content_type: &'static str, filename: &str) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", filename);
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}
