//! HTTP request boundary.
//!
//! | Route | Method | Body |
//! |-------|--------|------|
//! | `/parsing` | POST | multipart, one `files` part per document |
//! | `/mineru/parsing` | POST | same handler, kept for existing clients |
//! | `/health` | GET | — |
//!
//! `POST /parsing` always answers 200 once the upload was read: per-file
//! failures are reported inside the body, never as an HTTP error.
//!
//! ```json
//! {
//!   "message": "success",
//!   "data":   { "a.pdf": { "files": ["…/a.md", …], "images": ["…/images/p1_r2_image.png"] } },
//!   "fails":  ["b.docx"],
//!   "errors": { "b.docx": "Conversion of 'b.docx' failed: …" }
//! }
//! ```
//!
//! A file missing from both `data` and `fails` was skipped as an
//! unsupported type.

use crate::error::DocServeError;
use crate::orchestrator::Orchestrator;
use crate::output::{BatchOutcome, FileArtifacts};
use crate::pipeline::input::UploadedFile;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Multipart field carrying the uploaded documents.
pub const FILES_FIELD: &str = "files";

/// Upper bound on one request body.
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Body of a `POST /parsing` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingResponse {
    pub message: String,
    pub data: BTreeMap<String, FileArtifacts>,
    pub fails: Vec<String>,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

impl From<BatchOutcome> for ParsingResponse {
    fn from(outcome: BatchOutcome) -> Self {
        let fails = outcome.fails().into_iter().map(str::to_string).collect();
        let errors = outcome
            .failures
            .iter()
            .map(|f| (f.file_name.clone(), f.error.to_string()))
            .collect();
        Self {
            message: "success".to_string(),
            data: outcome.results,
            fails,
            errors,
        }
    }
}

/// Body of a `GET /health` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model: String,
    pub batch: bool,
    pub batch_ratio: usize,
}

/// Build the router with all endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/parsing", post(parsing))
        .route("/mineru/parsing", post(parsing))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.orchestrator.engine();
    let plan = engine.plan();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: engine.model().name().to_string(),
        batch: plan.eligible,
        batch_ratio: plan.ratio,
    })
}

/// Parse every uploaded document.
pub async fn parsing(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ParsingResponse>, (StatusCode, String)> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!("Malformed multipart body: {}", e);
        (StatusCode::BAD_REQUEST, format!("malformed multipart body: {e}"))
    })? {
        if field.name() != Some(FILES_FIELD) {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("upload-{}", uploads.len() + 1));
        let bytes = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                format!("reading '{file_name}': {e}"),
            )
        })?;
        uploads.push(UploadedFile::new(file_name, bytes.to_vec()));
    }

    let names: Vec<&str> = uploads.iter().map(|u| u.file_name.as_str()).collect();
    info!("files == {:?}", names);

    let outcome = state.orchestrator.process_batch(uploads).await;
    Ok(Json(outcome.into()))
}

/// Bind `addr` and serve until Ctrl-C, then reclaim model caches.
pub async fn serve(addr: &str, orchestrator: Arc<Orchestrator>) -> Result<(), DocServeError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| DocServeError::Server {
            addr: addr.to_string(),
            source,
        })?;
    serve_with_shutdown(listener, orchestrator, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    })
    .await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    shutdown: F,
) -> Result<(), DocServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!("Listening on http://{}", addr);

    let app = build_router(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|source| DocServeError::Server {
            addr: addr.clone(),
            source,
        })?;

    let engine = Arc::clone(orchestrator.engine());
    tokio::task::spawn_blocking(move || engine.reclaim())
        .await
        .map_err(|e| DocServeError::Internal(format!("reclaim at shutdown: {e}")))?;
    info!("Server on {} stopped", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileError;
    use crate::output::{FileOutcome, FileStatus};

    #[test]
    fn response_shape() {
        let outcome: BatchOutcome = vec![
            FileOutcome {
                file_name: "a.pdf".into(),
                status: FileStatus::Succeeded(FileArtifacts::default()),
            },
            FileOutcome {
                file_name: "b.docx".into(),
                status: FileStatus::Failed(FileError::Conversion {
                    file: "b.docx".into(),
                    detail: "soffice exited with 1".into(),
                }),
            },
            FileOutcome {
                file_name: "c.txt".into(),
                status: FileStatus::Skipped,
            },
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_value(ParsingResponse::from(outcome)).unwrap();
        assert_eq!(json["message"], "success");
        assert!(json["data"]["a.pdf"]["files"].is_array());
        assert_eq!(json["fails"], serde_json::json!(["b.docx"]));
        assert!(json["errors"]["b.docx"].as_str().unwrap().contains("soffice"));
        assert!(json["data"].get("c.txt").is_none());
    }
}
