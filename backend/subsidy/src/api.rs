//! Axum REST API: router and handlers.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::accounts;
use crate::db;
use crate::disbursement::DisbursementEngine;
use crate::documents::DocumentStore;
use crate::errors::SubsidyError;
use crate::lifecycle::MilestoneLifecycle;
use crate::models::{Milestone, Payment, Project};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub lifecycle: MilestoneLifecycle,
    pub engine: DisbursementEngine,
    pub default_estimated_production: Decimal,
    pub documents: DocumentStore,
}

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn router(state: Arc<ApiState>) -> Router {
    let upload_limit = state.documents.max_bytes() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health))
        .route("/producers", post(register_producer))
        .route("/producers/:id/projects", get(get_producer_projects))
        .route("/login", post(login))
        .route("/projects", post(register_project))
        .route("/projects/:id", get(get_project))
        .route(
            "/projects/:id/milestones",
            get(get_project_milestones).post(submit_milestone),
        )
        .route("/milestones/:id", get(get_milestone))
        .route("/milestones/:id/verify", post(verify_milestone))
        .route("/milestones/:id/disburse", post(disburse_milestone))
        .route("/milestones/:id/payments", get(get_milestone_payments))
        .route(
            "/upload",
            post(upload_document).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files", get(list_documents))
        .route("/download/:filename", get(download_document))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterProducerRequest {
    pub name: String,
    pub email: String,
    pub gst_number: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub producer_id: String,
}

#[derive(Deserialize)]
pub struct RegisterProjectRequest {
    pub producer_id: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct SubmitMilestoneRequest {
    pub producer_id: String,
    /// Kilograms, as a decimal string or number.
    pub volume: Decimal,
}

#[derive(Serialize)]
pub struct MilestonesResponse {
    pub project_id: String,
    pub count: usize,
    pub milestones: Vec<Milestone>,
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub producer_id: String,
    pub count: usize,
    pub projects: Vec<Project>,
}

#[derive(Serialize)]
pub struct PaymentsResponse {
    pub milestone_id: String,
    pub count: usize,
    pub payments: Vec<Payment>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub file_name: String,
}

#[derive(Serialize)]
pub struct FilesResponse {
    pub count: usize,
    pub uploaded_files: Vec<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub subsidy_rate: Decimal,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP status for each failure; storage failures never echo their cause.
pub fn status_for(err: &SubsidyError) -> StatusCode {
    match err {
        SubsidyError::NotFoundOrForbidden(_) => StatusCode::NOT_FOUND,
        SubsidyError::InvalidTransition { .. }
        | SubsidyError::AlreadyPaidOrNotVerified { .. }
        | SubsidyError::Conflict(_) => StatusCode::CONFLICT,
        SubsidyError::InvalidVolume(_) | SubsidyError::Validation(_) => StatusCode::BAD_REQUEST,
        SubsidyError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        SubsidyError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        SubsidyError::Persistence(_)
        | SubsidyError::Io(_)
        | SubsidyError::Migrate(_)
        | SubsidyError::Corrupt(_)
        | SubsidyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: SubsidyError) -> Response {
    let status = status_for(&err);
    let message = if err.is_internal() {
        error!("Request failed: {err:?}");
        "internal error".to_string()
    } else {
        err.to_string()
    };
    (status, Json(ErrorResponse { error: message })).into_response()
}

fn not_found(what: &str) -> Response {
    error_response(SubsidyError::NotFoundOrForbidden(what.to_string()))
}

fn multipart_error(err: MultipartError) -> Response {
    (
        err.status(),
        Json(ErrorResponse {
            error: err.body_text(),
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        subsidy_rate: state.engine.rate(),
    })
}

/// `POST /producers`
pub async fn register_producer(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterProducerRequest>,
) -> Response {
    match accounts::register_producer(
        &state.pool,
        &req.name,
        &req.email,
        &req.gst_number,
        &req.password,
    )
    .await
    {
        Ok(user) => (StatusCode::CREATED, Json(user)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /login`
pub async fn login(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LoginRequest>,
) -> Response {
    match accounts::login_producer(&state.pool, &req.email, &req.password).await {
        Ok(producer_id) => Json(LoginResponse { producer_id }).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /projects`
pub async fn register_project(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterProjectRequest>,
) -> Response {
    match accounts::register_project(
        &state.pool,
        &req.name,
        &req.producer_id,
        state.default_estimated_production,
    )
    .await
    {
        Ok(project) => (StatusCode::CREATED, Json(project)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> Response {
    match db::get_project(&state.pool, &project_id).await {
        Ok(Some(project)) => Json(project).into_response(),
        Ok(None) => not_found(&format!("project {project_id}")),
        Err(e) => error_response(e),
    }
}

/// `GET /producers/:id/projects`
pub async fn get_producer_projects(
    State(state): State<Arc<ApiState>>,
    Path(producer_id): Path<String>,
) -> Response {
    match db::list_projects_for_producer(&state.pool, &producer_id).await {
        Ok(projects) => Json(ProjectsResponse {
            count: projects.len(),
            producer_id,
            projects,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:id/milestones`
pub async fn get_project_milestones(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> Response {
    match db::list_milestones_for_project(&state.pool, &project_id).await {
        Ok(milestones) => Json(MilestonesResponse {
            count: milestones.len(),
            project_id,
            milestones,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /projects/:id/milestones`
pub async fn submit_milestone(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
    Json(req): Json<SubmitMilestoneRequest>,
) -> Response {
    match state
        .lifecycle
        .submit(&project_id, &req.producer_id, req.volume)
        .await
    {
        Ok(milestone) => (StatusCode::CREATED, Json(milestone)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /milestones/:id`
pub async fn get_milestone(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<String>,
) -> Response {
    match db::get_milestone(&state.pool, &milestone_id).await {
        Ok(Some(milestone)) => Json(milestone).into_response(),
        Ok(None) => not_found(&format!("milestone {milestone_id}")),
        Err(e) => error_response(e),
    }
}

/// `POST /milestones/:id/verify`
pub async fn verify_milestone(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<String>,
) -> Response {
    match state.lifecycle.verify(&milestone_id).await {
        Ok(milestone) => Json(milestone).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /milestones/:id/disburse`
///
/// Pays the subsidy for a verified milestone; a repeated call is rejected
/// with `409` and creates nothing.
pub async fn disburse_milestone(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<String>,
) -> Response {
    match state.engine.disburse(&milestone_id).await {
        Ok(payment) => (StatusCode::CREATED, Json(payment)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /milestones/:id/payments`
pub async fn get_milestone_payments(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<String>,
) -> Response {
    match db::get_payments_for_milestone(&state.pool, &milestone_id).await {
        Ok(payments) => Json(PaymentsResponse {
            count: payments.len(),
            milestone_id,
            payments,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /upload`
///
/// Expects a multipart form with the file in a part named `document`.
pub async fn upload_document(
    State(state): State<Arc<ApiState>>,
    mut multipart: Multipart,
) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return error_response(SubsidyError::Validation(
                    "no document part in request".to_string(),
                ))
            }
            Err(e) => return multipart_error(e),
        };
        if field.name() != Some("document") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return multipart_error(e),
        };
        return match state.documents.save(&file_name, &bytes).await {
            Ok(stored) => Json(UploadResponse {
                message: format!("File uploaded successfully: {stored}"),
                file_name: stored,
            })
            .into_response(),
            Err(e) => error_response(e),
        };
    }
}

/// `GET /files`
pub async fn list_documents(State(state): State<Arc<ApiState>>) -> Response {
    match state.documents.list().await {
        Ok(uploaded_files) => Json(FilesResponse {
            count: uploaded_files.len(),
            uploaded_files,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /download/:filename`
pub async fn download_document(
    State(state): State<Arc<ApiState>>,
    Path(filename): Path<String>,
) -> Response {
    match state.documents.open(&filename).await {
        Ok(Some(bytes)) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => not_found(&format!("file {filename}")),
        Err(e) => error_response(e),
    }
}
