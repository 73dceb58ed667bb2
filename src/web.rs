use crate::{
    app::{
        errors::AppError,
        service::{IndexService, QueryOutcome},
        task_runner::{StartOutcome, TaskStatus},
    },
    semantic::{ClassifyError, EmbeddingError, LabelScore},
};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    service: Arc<IndexService>,
}

pub fn router(service: Arc<IndexService>, images_root: PathBuf) -> Router {
    let shared_state = Arc::new(SharedState { service });

    Router::new()
        .nest_service(
            "/db_images",
            tower_http::services::ServeDir::new(images_root),
        )
        .route("/api/search", get(search))
        .route("/api/search/img", post(search_image))
        .route("/api/search/img/:tag", get(search_tag))
        .route("/api/search/id/:id", get(search_id))
        .route("/api/classification", post(classification))
        .route("/api/progress_status", get(progress_status))
        .route("/api/session_id", get(session_id))
        .route("/api/db_refresh", post(db_refresh))
        .route("/api/db_reset", post(db_reset))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(service: Arc<IndexService>, images_root: PathBuf, listen: String) -> anyhow::Result<()> {
    let signal = shutdown_signal(service.clone());
    let app = router(service, images_root);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

async fn shutdown_signal(service: Arc<IndexService>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    if service.status().is_running() {
        log::warn!("waiting for the running task to finish");
        tokio::task::block_in_place(|| service.join());
    }
}

pub fn start_daemon(
    service: Arc<IndexService>,
    images_root: PathBuf,
    listen: String,
) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(service, images_root, listen).await })
}

// Make our own error that wraps `AppError`.
#[derive(Debug)]
struct HttpError(AppError);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match self.0 {
            AppError::NotFound(_) | AppError::TagNotFound(_) => (
                StatusCode::NOT_FOUND,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            AppError::Classify(ClassifyError::NoLabels) => (
                StatusCode::BAD_REQUEST,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            AppError::Embedding(EmbeddingError::InvalidImage(_)) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            _ => {
                log::error!("{self:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": self.0.to_string()}).to_string(),
                )
            }
        }
        .into_response()
    }
}

// This enables using `?` on anything that converts into `AppError`.
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn busy() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"busy": true}))).into_response()
}

fn respond<T: Serialize>(outcome: QueryOutcome<T>) -> Response {
    match outcome {
        QueryOutcome::Ready(value) => Json(value).into_response(),
        QueryOutcome::Busy => busy(),
    }
}

fn first_page() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "first_page")]
    pub page: usize,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<SearchParams>,
) -> Result<Response, HttpError> {
    log::debug!("params: {params:?}");
    let service = state.service.clone();

    tokio::task::block_in_place(move || {
        Ok(respond(service.query_text(&params.q, params.page)?))
    })
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub session: String,
    #[serde(default = "first_page")]
    pub page: usize,
}

async fn search_image(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<SessionParams>,
    body: Bytes,
) -> Result<Response, HttpError> {
    log::debug!("image upload of {} bytes, params: {params:?}", body.len());
    let service = state.service.clone();

    tokio::task::block_in_place(move || Ok(respond(service.query_image(&body, &params.session)?)))
}

async fn search_tag(
    State(state): State<Arc<SharedState>>,
    Path(tag): Path<String>,
    Query(params): Query<SessionParams>,
) -> Result<Response, HttpError> {
    let service = state.service.clone();

    tokio::task::block_in_place(move || {
        Ok(respond(service.query_tag(
            &tag,
            &params.session,
            params.page,
        )?))
    })
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "first_page")]
    pub page: usize,
}

async fn search_id(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
    Query(params): Query<PageParams>,
) -> Result<Response, HttpError> {
    let service = state.service.clone();

    tokio::task::block_in_place(move || Ok(respond(service.query_id(id, params.page)?)))
}

#[derive(Debug, Deserialize)]
pub struct ClassifyParams {
    /// One label per line.
    #[serde(default)]
    pub labels: String,
}

async fn classification(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<ClassifyParams>,
    body: Bytes,
) -> Result<Json<Vec<LabelScore>>, HttpError> {
    let service = state.service.clone();
    let labels: Vec<String> = params.labels.lines().map(str::to_string).collect();

    tokio::task::block_in_place(move || Ok(Json(service.classify(&body, &labels)?)))
}

async fn progress_status(State(state): State<Arc<SharedState>>) -> Json<TaskStatus> {
    Json(state.service.status())
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
}

async fn session_id(State(state): State<Arc<SharedState>>) -> Json<SessionResponse> {
    Json(SessionResponse {
        session_id: state.service.new_session().into(),
    })
}

fn started(outcome: StartOutcome) -> Response {
    match outcome {
        StartOutcome::Started => Json(json!({"started": true})).into_response(),
        StartOutcome::Busy => busy(),
    }
}

async fn db_refresh(State(state): State<Arc<SharedState>>) -> Response {
    let service = state.service.clone();
    tokio::task::block_in_place(move || started(service.start_refresh()))
}

async fn db_reset(State(state): State<Arc<SharedState>>) -> Response {
    let service = state.service.clone();
    tokio::task::block_in_place(move || started(service.start_reset()))
}
