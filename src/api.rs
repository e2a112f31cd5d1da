//! REST API for plate layout sessions.
//!
//! Exposes the editing operations of a `BatchSession` over HTTP, one session
//! per batch, plus a Server-Sent Events stream of placement events.
//! Uses Axum as the web framework and supports CORS.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, OnceLock};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Router,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use utoipa::{OpenApi, ToSchema};

use crate::client::ItemRepository;
use crate::config::{ApiConfig, PlacementDefaults};
use crate::coordinates::{CoordinateKey, FillMode, RowLabelScheme};
use crate::engine::{CommitPolicy, PlacementEvent};
use crate::error::{SaveError, SessionError, SourceError};
use crate::grid::GridSnapshot;
use crate::model::{BatchId, GridDimensions, ItemId};
use crate::session::{BatchSession, CommitOutcome, LoadReport, commit_shared};

const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
struct SessionHandle {
    session: Arc<Mutex<BatchSession>>,
    events: broadcast::Sender<PlacementEvent>,
}

impl SessionHandle {
    fn publish(&self, events: &[PlacementEvent]) {
        for event in events {
            // No subscribers is fine; events are only for live views.
            let _ = self.events.send(event.clone());
        }
    }
}

/// Shared state of the HTTP layer.
#[derive(Clone)]
pub struct ApiState {
    sessions: Arc<RwLock<HashMap<BatchId, SessionHandle>>>,
    repository: Arc<dyn ItemRepository>,
    defaults: PlacementDefaults,
}

impl ApiState {
    pub fn new(repository: Arc<dyn ItemRepository>, defaults: PlacementDefaults) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            repository,
            defaults,
        }
    }

    async fn session(&self, batch: &BatchId) -> Result<SessionHandle, Response> {
        self.sessions
            .read()
            .await
            .get(batch)
            .cloned()
            .ok_or_else(|| session_not_found(batch))
    }
}

static OPENAPI_DOC: OnceLock<utoipa::openapi::OpenApi> = OnceLock::new();

// SRI hashes verified against https://unpkg.com/swagger-ui-dist@5.17.14/ on 2025-10-29.
const SWAGGER_UI_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
    <head>
        <meta charset="utf-8" />
        <title>plate_layout API Docs</title>
        <link
            rel="stylesheet"
            href="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui.css"
            integrity="sha384-wxLW6kwyHktdDGr6Pv1zgm/VGJh99lfUbzSn6HNHBENZlCN7W602k9VkGdxuFvPn"
            crossorigin="anonymous"
        />
    </head>
    <body>
        <div id="swagger-ui"></div>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-bundle.js"
            integrity="sha384-wmyclcVGX/WhUkdkATwhaK1X1JtiNrr2EoYJ+diV3vj4v6OC5yCeSu+yW13SYJep"
            crossorigin="anonymous"
        ></script>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-standalone-preset.js"
            integrity="sha384-2YH8WDRaj7V2OqU/trsmzSagmk/E2SutiCsGkdgoQwC9pNUJV1u/141DHB6jgs8t"
            crossorigin="anonymous"
        ></script>
        <script>
            window.onload = function () {
                const ui = SwaggerUIBundle({
                    url: "/docs/openapi.json",
                    dom_id: "#swagger-ui",
                    presets: [SwaggerUIBundle.presets.apis, SwaggerUIStandalonePreset],
                    layout: "StandaloneLayout",
                });
                window.ui = ui;
            };
        </script>
    </body>
    </html>"##;

fn openapi_doc() -> &'static utoipa::openapi::OpenApi {
    OPENAPI_DOC.get_or_init(ApiDoc::openapi)
}

/// Opens (or reopens) the editing session of a batch.
///
/// Omitted fields fall back to the service defaults.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "dimensions": { "numberOfRows": 8, "numberOfColumns": 12 },
    "fillMode": "COLUMN"
}))]
pub struct OpenSessionRequest {
    #[serde(default)]
    #[schema(nullable = true)]
    pub dimensions: Option<GridDimensions>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub fill_mode: Option<FillMode>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub row_labels: Option<RowLabelScheme>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub commit_policy: Option<CommitPolicy>,
}

/// Moves items to a well, or back to the pool when `target` is null.
#[derive(Debug, Deserialize, ToSchema)]
#[schema(example = json!({ "items": ["item-1", "item-2"], "target": "B_3" }))]
pub struct MoveRequest {
    pub items: Vec<ItemId>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub target: Option<CoordinateKey>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[schema(example = json!({ "item": "item-1", "well": "A_1" }))]
pub struct GridDropRequest {
    pub item: ItemId,
    pub well: CoordinateKey,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListDropRequest {
    pub item: ItemId,
}

#[derive(Debug, Deserialize, ToSchema)]
#[schema(example = json!({ "item": "item-4", "shift": true }))]
pub struct ClickRequest {
    pub item: ItemId,
    #[serde(default)]
    pub shift: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveAllRequest {
    /// Sort by item name before laying out.
    #[serde(default)]
    #[schema(nullable = true)]
    pub natural_sort: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FillModeRequest {
    pub mode: FillMode,
}

/// Current state of a batch session.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub batch_id: BatchId,
    pub fill_mode: FillMode,
    pub row_labels: RowLabelScheme,
    pub commit_policy: CommitPolicy,
    pub submitting: bool,
    pub reload_token: u64,
    pub grid: GridSnapshot,
    pub selection: Vec<ItemId>,
    /// Number of updates a commit would send now.
    pub pending_changes: usize,
    pub load: LoadReport,
}

impl SessionView {
    fn from_session(session: &BatchSession) -> Self {
        let engine = session.engine();
        let config = engine.config();
        Self {
            batch_id: session.batch_id().clone(),
            fill_mode: config.fill_mode,
            row_labels: config.row_labels,
            commit_policy: config.commit_policy,
            submitting: session.is_submitting(),
            reload_token: session.reload_token(),
            grid: engine.grid().snapshot(&config.row_labels),
            selection: engine.selection().selected().to_vec(),
            pending_changes: session.pending_changes().len(),
            load: session.last_load().clone(),
        }
    }
}

/// Result of an editing operation.
#[derive(Debug, Serialize, ToSchema)]
pub struct OperationResponse {
    pub events: Vec<PlacementEvent>,
    pub session: SessionView,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CommitResponse {
    pub outcome: CommitOutcome,
    pub session: SessionView,
}

#[derive(Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
    details: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
        }
    }
}

fn error_response(
    status: StatusCode,
    error: impl Into<String>,
    details: impl Into<String>,
) -> Response {
    (status, Json(ErrorResponse::new(error, details))).into_response()
}

fn json_deserialize_error(err: JsonRejection) -> Response {
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Invalid JSON data",
        err.to_string(),
    )
}

fn session_not_found(batch: &BatchId) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "Session not found",
        format!("No open session for batch {batch}"),
    )
}

fn session_error(err: SessionError) -> Response {
    let details = err.to_string();
    match err {
        SessionError::Validation(_) | SessionError::MalformedWell(_) => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid input data",
            details,
        ),
        SessionError::CommitInFlight => {
            error_response(StatusCode::CONFLICT, "Commit in progress", details)
        }
        SessionError::Source(SourceError::BatchNotFound(_))
        | SessionError::Save(SaveError::BatchNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "Batch not found", details)
        }
        SessionError::Source(_) => {
            warn!(error = %details, "item store fetch failed");
            error_response(StatusCode::BAD_GATEWAY, "Item store unavailable", details)
        }
        SessionError::Save(_) => {
            warn!(error = %details, "item store save failed");
            error_response(StatusCode::BAD_GATEWAY, "Saving coordinates failed", details)
        }
        SessionError::CommitAborted(_) => {
            warn!(error = %details, "commit task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Commit aborted", details)
        }
    }
}

fn parse_payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(request)| request)
        .map_err(json_deserialize_error)
}

/// Runs an editing operation under the session lock and publishes its events.
async fn apply_operation<F>(state: &ApiState, batch: BatchId, operation: F) -> Response
where
    F: FnOnce(&mut BatchSession) -> Result<Vec<PlacementEvent>, SessionError>,
{
    let handle = match state.session(&batch).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    let mut session = handle.session.lock().await;
    match operation(&mut *session) {
        Ok(events) => {
            debug!(batch = %batch, events = events.len(), "operation applied");
            handle.publish(&events);
            let response = OperationResponse {
                events,
                session: SessionView::from_session(&session),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => session_error(err),
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handle_open_session,
        handle_close_session,
        handle_get_grid,
        handle_move,
        handle_grid_drop,
        handle_list_drop,
        handle_click,
        handle_clear,
        handle_move_all,
        handle_fill_mode,
        handle_commit,
        handle_events
    ),
    components(
        schemas(
            OpenSessionRequest,
            MoveRequest,
            GridDropRequest,
            ListDropRequest,
            ClickRequest,
            MoveAllRequest,
            FillModeRequest,
            SessionView,
            OperationResponse,
            CommitResponse,
            CommitOutcome,
            PlacementEvent,
            GridSnapshot,
            LoadReport,
            ErrorResponse
        )
    ),
    tags((name = "plates", description = "Endpoints for editing plate layouts"))
)]
struct ApiDoc;

/// Builds the application router.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/batches/{id}/session",
            post(handle_open_session).delete(handle_close_session),
        )
        .route("/batches/{id}/grid", get(handle_get_grid))
        .route("/batches/{id}/move", post(handle_move))
        .route("/batches/{id}/drop/grid", post(handle_grid_drop))
        .route("/batches/{id}/drop/list", post(handle_list_drop))
        .route("/batches/{id}/click", post(handle_click))
        .route("/batches/{id}/clear", post(handle_clear))
        .route("/batches/{id}/move_all", post(handle_move_all))
        .route("/batches/{id}/fill_mode", post(handle_fill_mode))
        .route("/batches/{id}/commit", post(handle_commit))
        .route("/batches/{id}/events", get(handle_events))
        // API documentation
        .route("/docs/openapi.json", get(serve_openapi_json))
        .route("/docs", get(serve_openapi_ui))
        .layer(cors)
        .with_state(state)
}

/// Starts the API server and blocks until it terminates.
pub async fn start_api_server(config: ApiConfig, state: ApiState) -> std::io::Result<()> {
    let app = router(state);

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        "Server running on http://{}:{}",
        config.display_host(),
        config.port()
    );
    if config.binds_to_all_interfaces() {
        info!("Local access: http://localhost:{}", config.port());
    }
    info!("API endpoints under /batches/{{id}}: session, grid, move, drop/grid, drop/list, click, clear, move_all, fill_mode, commit, events");
    info!("Documentation: GET /docs, GET /docs/openapi.json");

    axum::serve(listener, app).await
}

/// Handler for POST /batches/{id}/session.
///
/// Fetches the batch and starts a fresh session. An existing session is
/// replaced unless it is committing; live event subscribers stay attached.
#[utoipa::path(
    post,
    path = "/batches/{id}/session",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = OpenSessionRequest,
    responses(
        (status = 200, description = "Session opened", body = SessionView),
        (status = NOT_FOUND, description = "Unknown batch", body = ErrorResponse),
        (status = CONFLICT, description = "Existing session is committing", body = ErrorResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid plate configuration", body = ErrorResponse),
        (status = BAD_GATEWAY, description = "Item store unavailable", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_open_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<OpenSessionRequest>, JsonRejection>,
) -> Response {
    let request = match parse_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let batch = BatchId::new(id);

    let mut config = state.defaults.placement();
    if let Some(mode) = request.fill_mode {
        config.fill_mode = mode;
    }
    if let Some(labels) = request.row_labels {
        config.row_labels = labels;
    }
    if let Some(policy) = request.commit_policy {
        config.commit_policy = policy;
    }
    let dims = match request.dimensions.map(GridDimensions::validated).transpose() {
        Ok(dims) => dims.unwrap_or_else(|| state.defaults.dimensions()),
        Err(err) => return session_error(err.into()),
    };

    let existing = state.sessions.read().await.get(&batch).cloned();
    if let Some(handle) = &existing {
        if handle.session.lock().await.is_submitting() {
            return session_error(SessionError::CommitInFlight);
        }
    }

    info!(batch = %batch, rows = dims.number_of_rows, columns = dims.number_of_columns, "opening session");
    let session =
        match BatchSession::open(state.repository.as_ref(), batch.clone(), dims, config).await {
            Ok(session) => session,
            Err(err) => return session_error(err),
        };
    let view = SessionView::from_session(&session);

    let mut sessions = state.sessions.write().await;
    // A commit may have started while the batch was being fetched.
    let current = sessions.get(&batch).cloned();
    let _current_guard = match &current {
        Some(handle) => {
            let guard = handle.session.lock().await;
            if guard.is_submitting() {
                return session_error(SessionError::CommitInFlight);
            }
            Some(guard)
        }
        None => None,
    };
    let events = current
        .as_ref()
        .map(|handle| handle.events.clone())
        .unwrap_or_else(|| broadcast::channel(EVENT_BUFFER).0);
    sessions.insert(
        batch,
        SessionHandle {
            session: Arc::new(Mutex::new(session)),
            events,
        },
    );

    (StatusCode::OK, Json(view)).into_response()
}

/// Handler for DELETE /batches/{id}/session.
#[utoipa::path(
    delete,
    path = "/batches/{id}/session",
    params(("id" = String, Path, description = "Batch identifier")),
    responses(
        (status = NO_CONTENT, description = "Session closed"),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_close_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let batch = BatchId::new(id);
    match state.sessions.write().await.remove(&batch) {
        Some(_) => {
            info!(batch = %batch, "session closed");
            StatusCode::NO_CONTENT.into_response()
        }
        None => session_not_found(&batch),
    }
}

/// Handler for GET /batches/{id}/grid.
#[utoipa::path(
    get,
    path = "/batches/{id}/grid",
    params(("id" = String, Path, description = "Batch identifier")),
    responses(
        (status = 200, description = "Current session state", body = SessionView),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_get_grid(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let handle = match state.session(&BatchId::new(id)).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    let session = handle.session.lock().await;
    (StatusCode::OK, Json(SessionView::from_session(&session))).into_response()
}

/// Handler for POST /batches/{id}/move.
#[utoipa::path(
    post,
    path = "/batches/{id}/move",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = MoveRequest,
    responses(
        (status = 200, description = "Items moved", body = OperationResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = CONFLICT, description = "Commit in progress", body = ErrorResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Malformed request", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_move(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> Response {
    let request = match parse_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    apply_operation(&state, BatchId::new(id), |session| {
        let target = request
            .target
            .as_ref()
            .map(|key| session.resolve_key(key))
            .transpose()?;
        Ok(session.move_items(&request.items, target)?.events)
    })
    .await
}

/// Handler for POST /batches/{id}/drop/grid.
///
/// Dropping a selected item moves the whole selection.
#[utoipa::path(
    post,
    path = "/batches/{id}/drop/grid",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = GridDropRequest,
    responses(
        (status = 200, description = "Drop applied", body = OperationResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = CONFLICT, description = "Commit in progress", body = ErrorResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Malformed request", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_grid_drop(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<GridDropRequest>, JsonRejection>,
) -> Response {
    let request = match parse_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    apply_operation(&state, BatchId::new(id), |session| {
        let coord = session.resolve_key(&request.well)?;
        Ok(session.on_grid_drop(&request.item, coord)?.events)
    })
    .await
}

/// Handler for POST /batches/{id}/drop/list.
#[utoipa::path(
    post,
    path = "/batches/{id}/drop/list",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = ListDropRequest,
    responses(
        (status = 200, description = "Item returned to the pool", body = OperationResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = CONFLICT, description = "Commit in progress", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_list_drop(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<ListDropRequest>, JsonRejection>,
) -> Response {
    let request = match parse_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    apply_operation(&state, BatchId::new(id), |session| {
        Ok(session.on_list_drop(&request.item)?.events)
    })
    .await
}

/// Handler for POST /batches/{id}/click.
///
/// Clicks on items that are not in the pool are ignored and produce no events.
#[utoipa::path(
    post,
    path = "/batches/{id}/click",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = ClickRequest,
    responses(
        (status = 200, description = "Selection updated", body = OperationResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = CONFLICT, description = "Commit in progress", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_click(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<ClickRequest>, JsonRejection>,
) -> Response {
    let request = match parse_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    apply_operation(&state, BatchId::new(id), |session| {
        if !session.on_item_click(&request.item, request.shift)? {
            return Ok(Vec::new());
        }
        Ok(vec![PlacementEvent::SelectionChanged {
            selected: session.engine().selection().selected().to_vec(),
        }])
    })
    .await
}

/// Handler for POST /batches/{id}/clear.
#[utoipa::path(
    post,
    path = "/batches/{id}/clear",
    params(("id" = String, Path, description = "Batch identifier")),
    responses(
        (status = 200, description = "All wells emptied", body = OperationResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = CONFLICT, description = "Commit in progress", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_clear(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    apply_operation(&state, BatchId::new(id), |session| {
        Ok(session.clear_grid()?.events)
    })
    .await
}

/// Handler for POST /batches/{id}/move_all.
#[utoipa::path(
    post,
    path = "/batches/{id}/move_all",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = MoveAllRequest,
    responses(
        (status = 200, description = "Plate laid out from the first well", body = OperationResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = CONFLICT, description = "Commit in progress", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_move_all(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<MoveAllRequest>, JsonRejection>,
) -> Response {
    let request = match parse_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let natural = request
        .natural_sort
        .unwrap_or_else(|| state.defaults.natural_sort());
    apply_operation(&state, BatchId::new(id), |session| {
        Ok(session.move_all(natural)?.events)
    })
    .await
}

/// Handler for POST /batches/{id}/fill_mode.
#[utoipa::path(
    post,
    path = "/batches/{id}/fill_mode",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = FillModeRequest,
    responses(
        (status = 200, description = "Fill mode changed", body = OperationResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = CONFLICT, description = "Commit in progress", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_fill_mode(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<FillModeRequest>, JsonRejection>,
) -> Response {
    let request = match parse_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    apply_operation(&state, BatchId::new(id), |session| {
        Ok(vec![session.set_fill_mode(request.mode)?])
    })
    .await
}

/// Handler for POST /batches/{id}/commit.
///
/// Sends the pending coordinate changes and reloads the batch. A commit while
/// another one is running is ignored.
#[utoipa::path(
    post,
    path = "/batches/{id}/commit",
    params(("id" = String, Path, description = "Batch identifier")),
    responses(
        (status = 200, description = "Commit finished or skipped", body = CommitResponse),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse),
        (status = BAD_GATEWAY, description = "Saving failed; changes are kept for retry", body = ErrorResponse),
        (status = INTERNAL_SERVER_ERROR, description = "Commit task ended abnormally", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_commit(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let batch = BatchId::new(id);
    let handle = match state.session(&batch).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    let outcome = match commit_shared(handle.session.clone(), state.repository.clone()).await {
        Ok(outcome) => outcome,
        Err(err) => return session_error(err),
    };
    info!(batch = %batch, ?outcome, "commit handled");

    let session = handle.session.lock().await;
    let response = CommitResponse {
        outcome,
        session: SessionView::from_session(&session),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// Handler for GET /batches/{id}/events (SSE).
///
/// Streams placement events of the session as they happen.
#[utoipa::path(
    get,
    path = "/batches/{id}/events",
    params(("id" = String, Path, description = "Batch identifier")),
    responses(
        (
            status = 200,
            description = "Streams placement events in real-time",
            content_type = "text/event-stream",
            body = String
        ),
        (status = NOT_FOUND, description = "No open session", body = ErrorResponse)
    ),
    tag = "plates"
)]
async fn handle_events(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let handle = match state.session(&BatchId::new(id)).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    // Lagging subscribers skip what they missed.
    let stream = BroadcastStream::new(handle.events.subscribe()).filter_map(|event| {
        let event = event.ok()?;
        let json = serde_json::to_string(&event).ok()?;
        Some(Ok::<_, Infallible>(Event::default().data(json)))
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(10))
                .text("keep-alive"),
        )
        .into_response()
}

async fn serve_openapi_json(State(_state): State<ApiState>) -> impl IntoResponse {
    Json(openapi_doc())
}

async fn serve_openapi_ui(State(_state): State<ApiState>) -> impl IntoResponse {
    Html(SWAGGER_UI_HTML)
}
