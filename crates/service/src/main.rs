use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use doclink_core::{
    CancelToken, DoclinkConfig, DoclinkError, DomainId, DomainSummary, FileId, FileSummary,
    IngestRequest, PlanTier, Retrieval, RetrieveRequest, Usage, UserId,
};
use doclink_rag::{open_sqlite, IngestReport, SqlitePipeline};

const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(30);

struct AppState {
    pipeline: SqlitePipeline,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let config = DoclinkConfig::load()?;
    let pipeline = open_sqlite(&config)?;
    let state = Arc::new(AppState { pipeline });
    let app = router(state);
    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr, database = %config.database.display());
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/users", post(handle_create_user))
        .route("/users/:user_id/usage", get(handle_usage))
        .route(
            "/users/:user_id/domains",
            get(handle_list_domains).post(handle_create_domain),
        )
        .route(
            "/users/:user_id/domains/:domain_id",
            delete(handle_delete_domain).patch(handle_rename_domain),
        )
        .route(
            "/users/:user_id/domains/:domain_id/files",
            get(handle_list_files),
        )
        .route("/users/:user_id/files/:file_id", delete(handle_delete_file))
        .route("/files", post(handle_ingest))
        .route("/retrieve", post(handle_retrieve))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    user_id: UserId,
    #[serde(default)]
    plan_tier: PlanTier,
}

#[derive(Debug, Deserialize)]
struct DomainNameRequest {
    name: String,
    #[serde(default)]
    domain_id: Option<DomainId>,
}

#[derive(Debug, Serialize)]
struct CreatedDomain {
    domain_id: DomainId,
}

#[derive(Debug, Serialize)]
struct DeletedDomain {
    deleted_files: Vec<FileId>,
}

#[derive(Debug, Serialize)]
struct DeletedFile {
    deleted: bool,
}

#[derive(Debug, Serialize)]
struct RetrieveResponse {
    context: String,
    #[serde(flatten)]
    retrieval: Retrieval,
}

async fn handle_create_user(
    State(state): State<SharedState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<StatusCode, AppError> {
    run_blocking(&state, move |pipeline| {
        pipeline.ensure_user(&body.user_id, body.plan_tier)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_usage(
    State(state): State<SharedState>,
    AxumPath(user_id): AxumPath<UserId>,
) -> Result<Json<Usage>, AppError> {
    let usage = run_blocking(&state, move |pipeline| pipeline.usage(&user_id)).await?;
    Ok(Json(usage))
}

async fn handle_list_domains(
    State(state): State<SharedState>,
    AxumPath(user_id): AxumPath<UserId>,
) -> Result<Json<Vec<DomainSummary>>, AppError> {
    let domains = run_blocking(&state, move |pipeline| pipeline.list_domains(&user_id)).await?;
    Ok(Json(domains))
}

async fn handle_create_domain(
    State(state): State<SharedState>,
    AxumPath(user_id): AxumPath<UserId>,
    Json(body): Json<DomainNameRequest>,
) -> Result<(StatusCode, Json<CreatedDomain>), AppError> {
    let domain_id = run_blocking(&state, move |pipeline| {
        pipeline.create_domain(&user_id, &body.name, body.domain_id)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(CreatedDomain { domain_id })))
}

async fn handle_rename_domain(
    State(state): State<SharedState>,
    AxumPath((user_id, domain_id)): AxumPath<(UserId, DomainId)>,
    Json(body): Json<DomainNameRequest>,
) -> Result<StatusCode, AppError> {
    run_blocking(&state, move |pipeline| {
        pipeline.rename_domain(&user_id, &domain_id, &body.name)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_delete_domain(
    State(state): State<SharedState>,
    AxumPath((user_id, domain_id)): AxumPath<(UserId, DomainId)>,
) -> Result<Json<DeletedDomain>, AppError> {
    let deleted_files = run_blocking(&state, move |pipeline| {
        pipeline.delete_domain(&user_id, &domain_id)
    })
    .await?;
    Ok(Json(DeletedDomain { deleted_files }))
}

async fn handle_list_files(
    State(state): State<SharedState>,
    AxumPath((user_id, domain_id)): AxumPath<(UserId, DomainId)>,
) -> Result<Json<Vec<FileSummary>>, AppError> {
    let files = run_blocking(&state, move |pipeline| {
        pipeline.list_files(&user_id, &domain_id)
    })
    .await?;
    Ok(Json(files))
}

async fn handle_delete_file(
    State(state): State<SharedState>,
    AxumPath((user_id, file_id)): AxumPath<(UserId, FileId)>,
) -> Result<Json<DeletedFile>, AppError> {
    let deleted =
        run_blocking(&state, move |pipeline| pipeline.delete_file(&user_id, &file_id)).await?;
    Ok(Json(DeletedFile { deleted }))
}

async fn handle_ingest(
    State(state): State<SharedState>,
    Json(body): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestReport>), AppError> {
    let report = run_blocking(&state, move |pipeline| pipeline.ingest_file(&body)).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn handle_retrieve(
    State(state): State<SharedState>,
    Json(body): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, AppError> {
    let cancel = CancelToken::with_timeout(RETRIEVE_TIMEOUT);
    let retrieval = run_blocking(&state, move |pipeline| pipeline.retrieve(&body, &cancel)).await?;
    Ok(Json(RetrieveResponse {
        context: retrieval.render(),
        retrieval,
    }))
}

/// Store and crypto work is synchronous; keep it off the async workers.
async fn run_blocking<T, F>(state: &SharedState, work: F) -> Result<T, AppError>
where
    F: FnOnce(&SqlitePipeline) -> doclink_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    let value = task::spawn_blocking(move || work(&state.pipeline))
        .await
        .map_err(AppError::internal)??;
    Ok(value)
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<DoclinkError> for AppError {
    fn from(err: DoclinkError) -> Self {
        match err {
            DoclinkError::ScopeViolation(_) => Self::Forbidden(err.to_string()),
            DoclinkError::InvalidRequest(_)
            | DoclinkError::DimensionMismatch { .. }
            | DoclinkError::SerdeJson(_) => Self::BadRequest(err.to_string()),
            DoclinkError::NotFound(_) => Self::NotFound(err.to_string()),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doclink_core::ChunkInput;
    use doclink_rag::write_identity;
    use tempfile::{tempdir, TempDir};

    fn state() -> (TempDir, SharedState) {
        let dir = tempdir().unwrap();
        let identity = dir.path().join("identity.txt");
        write_identity(&identity).unwrap();
        let config = DoclinkConfig {
            database: dir.path().join("service.sqlite"),
            identity_path: Some(identity),
            embedding_dimensions: 2,
            ..DoclinkConfig::default()
        };
        let pipeline = open_sqlite(&config).unwrap();
        (dir, Arc::new(AppState { pipeline }))
    }

    fn status_of(err: DoclinkError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_of(DoclinkError::scope("x")), StatusCode::FORBIDDEN);
        assert_eq!(status_of(DoclinkError::invalid("x")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(DoclinkError::DimensionMismatch {
                expected: 2,
                actual: 3
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(DoclinkError::NotFound("user u1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(DoclinkError::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ingest_then_retrieve_over_handlers() {
        let (_dir, state) = state();
        let (status, Json(created)) = handle_create_domain(
            State(Arc::clone(&state)),
            AxumPath(UserId::new("u1")),
            Json(DomainNameRequest {
                name: "Finance".to_string(),
                domain_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let (_, Json(report)) = handle_ingest(
            State(Arc::clone(&state)),
            Json(IngestRequest {
                user_id: UserId::new("u1"),
                domain_id: created.domain_id.clone(),
                file_id: None,
                file_name: "report.pdf".to_string(),
                modified_at: None,
                chunks: vec![ChunkInput {
                    sentence: "Revenue grew 10%".to_string(),
                    is_header: false,
                    is_table: false,
                    page_number: 3,
                    embedding: vec![1.0, 0.0],
                }],
            }),
        )
        .await
        .unwrap();
        assert_eq!(report.chunks, 1);

        let Json(response) = handle_retrieve(
            State(Arc::clone(&state)),
            Json(RetrieveRequest {
                user_id: UserId::new("u1"),
                domain_id: created.domain_id.clone(),
                file_ids: Vec::new(),
                query_embedding: vec![1.0, 0.0],
                max_chunks: 3,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.context, "[DOC: report.pdf, page 3]\nRevenue grew 10%\n\n");

        let foreign = handle_retrieve(
            State(state),
            Json(RetrieveRequest {
                user_id: UserId::new("intruder"),
                domain_id: created.domain_id,
                file_ids: Vec::new(),
                query_embedding: vec![1.0, 0.0],
                max_chunks: 3,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(foreign, AppError::Forbidden(_)));
    }
}
