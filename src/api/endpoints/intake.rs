//! Document intake endpoints: upload, demo batch, queue status, results.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Multipart, Path as UrlPath, State};
use axum::Json;
use serde::Serialize;
use tracing::info;

use crate::api::error::ApiError;
use crate::core_state::CoreState;
use crate::db::{repository, Document, QueueStats, SafetyFlag};

const ALLOWED_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
];

const MAX_FILE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub document_id: String,
    pub filename: String,
    pub message: &'static str,
}

/// `POST /intake` — accept a clinical document and queue it. Returns the
/// document id immediately; processing happens on the agent thread.
pub async fn upload(
    State(state): State<Arc<CoreState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
        .ok_or_else(|| ApiError::BadRequest("no file field in request".to_string()))?;

    let content_type = field.content_type().unwrap_or("").to_string();
    if !ALLOWED_TYPES.contains(&content_type.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "Unsupported file type '{content_type}'. Accepted: JPEG, PNG, GIF, WebP, PDF"
        )));
    }

    let filename = field
        .file_name()
        .filter(|n| !n.is_empty())
        .unwrap_or("document.jpg")
        .to_string();
    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("uploaded file is empty".to_string()));
    }
    if bytes.len() > MAX_FILE_BYTES {
        return Err(ApiError::BadRequest("File too large (max 20 MB)".to_string()));
    }

    let upload_dir = &state.settings().upload_dir;
    std::fs::create_dir_all(upload_dir)
        .map_err(|e| ApiError::Internal(format!("cannot create upload dir: {e}")))?;

    let suffix = Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| ".jpg".to_string());
    let staging_name = format!("{}{suffix}", uuid::Uuid::new_v4());
    let dest = upload_dir.join(staging_name);
    std::fs::write(&dest, &bytes)
        .map_err(|e| ApiError::Internal(format!("cannot store upload: {e}")))?;

    let conn = state.open_db()?;
    let doc = repository::insert_document(&conn, &filename, &dest.to_string_lossy())?;
    info!(document_id = %doc.id, filename = %filename, size = bytes.len(), "document queued");

    Ok(Json(UploadResponse {
        status: "queued",
        document_id: doc.id,
        filename,
        message: "Document added to processing queue",
    }))
}

#[derive(Serialize)]
pub struct SimulatedDocument {
    pub document_id: String,
    pub filename: String,
    pub note: String,
}

#[derive(Serialize)]
pub struct SimulateResponse {
    pub status: &'static str,
    pub queued_count: usize,
    pub document_ids: Vec<String>,
    pub documents: Vec<SimulatedDocument>,
}

/// `GET /intake/simulate` — inject a five-document demo batch: one chart with
/// a known dose drop plus four synthetic copies, to exercise continuous queue
/// processing.
pub async fn simulate(
    State(state): State<Arc<CoreState>>,
) -> Result<Json<SimulateResponse>, ApiError> {
    let upload_dir = &state.settings().upload_dir;
    std::fs::create_dir_all(upload_dir)
        .map_err(|e| ApiError::Internal(format!("cannot create upload dir: {e}")))?;
    let demo_chart = upload_dir.join("demo_chart.jpeg");

    let conn = state.open_db()?;
    let mut documents = Vec::with_capacity(5);
    for i in 1..=5u32 {
        let (filename, note) = if i == 1 {
            (
                "delta_hospital_chemo_chart.jpeg".to_string(),
                "AML chart with expected Daunorubicin dose drop".to_string(),
            )
        } else {
            (
                format!("synthetic_chart_{i:02}.jpeg"),
                format!("Synthetic test document #{i}"),
            )
        };

        let dest = upload_dir.join(format!("{}.jpeg", uuid::Uuid::new_v4()));
        if demo_chart.exists() {
            std::fs::copy(&demo_chart, &dest)
                .map_err(|e| ApiError::Internal(format!("cannot stage demo chart: {e}")))?;
        } else {
            std::fs::write(&dest, [])
                .map_err(|e| ApiError::Internal(format!("cannot stage placeholder: {e}")))?;
        }

        let doc = repository::insert_document(&conn, &filename, &dest.to_string_lossy())?;
        documents.push(SimulatedDocument {
            document_id: doc.id,
            filename,
            note,
        });
    }

    state.wake_agent();
    info!(queued = documents.len(), "simulated batch queued");

    Ok(Json(SimulateResponse {
        status: "ok",
        queued_count: documents.len(),
        document_ids: documents.iter().map(|d| d.document_id.clone()).collect(),
        documents,
    }))
}

#[derive(Serialize)]
pub struct QueueResponse {
    pub stats: QueueStats,
    pub recent_documents: Vec<Document>,
}

/// `GET /intake/queue` — current queue summary.
pub async fn queue(
    State(state): State<Arc<CoreState>>,
) -> Result<Json<QueueResponse>, ApiError> {
    let conn = state.open_db()?;
    Ok(Json(QueueResponse {
        stats: repository::queue_stats(&conn)?,
        recent_documents: repository::recent_documents(&conn, 20)?,
    }))
}

#[derive(Serialize)]
pub struct ResultsResponse {
    pub document: Document,
    /// Latest output per stage, keyed "extraction" / "standardization" /
    /// "fhir" / "validation".
    pub stages: serde_json::Map<String, serde_json::Value>,
    pub flags: Vec<SafetyFlag>,
}

/// `GET /intake/:id/results` — stage snapshots and safety flags for one
/// document. 404 when the document does not exist.
pub async fn results(
    State(state): State<Arc<CoreState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let conn = state.open_db()?;
    let document = repository::get_document(&conn, &id)?;

    // Rows come back in insertion order, so the last write per stage wins.
    let mut stages = serde_json::Map::new();
    for row in repository::results_for_document(&conn, &id)? {
        let output = serde_json::from_str(&row.output_json)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        stages.insert(row.stage, output);
    }

    let flags = repository::flags_for_document(&conn, &id)?;
    Ok(Json(ResultsResponse {
        document,
        stages,
        flags,
    }))
}
