use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ActivityEntry, ChecklistItem, ChecklistItemId, Deal, DealId, Stage},
    error::{ApiError, ErrorCode, PipelineError},
    protocol::{
        ChangeNotification, ChecklistPatch, DealPatch, NewActivity, NewChecklistItem, NewDeal,
    },
};
use storage::Storage;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    storage: Storage,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::with_change_capacity(&database_url, settings.event_buffer)
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;

    if settings.seed_default_stages {
        let stages = storage.seed_default_stages().await?;
        info!(stages = stages.len(), "pipeline stages ready");
    }

    let app = build_router(Arc::new(AppState { storage }), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stages", get(list_stages))
        .route("/deals", get(list_deals).post(create_deal))
        .route("/deals/:deal_id", get(get_deal).patch(patch_deal))
        .route(
            "/deals/:deal_id/checklist",
            get(list_checklist).post(create_checklist_item),
        )
        .route("/checklist/:item_id", patch(patch_checklist_item))
        .route(
            "/deals/:deal_id/activity",
            get(list_activity).post(create_activity),
        )
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

/// Maps a storage failure onto the JSON error envelope. Errors the core does
/// not name become `internal`.
fn api_error(
    err: anyhow::Error,
    internal: fn(String) -> PipelineError,
) -> (StatusCode, Json<ApiError>) {
    let pipeline_error = match err.downcast::<PipelineError>() {
        Ok(known) => known,
        Err(other) => {
            error!(error = %other, "request failed");
            internal(other.to_string())
        }
    };
    let body = ApiError::from(&pipeline_error);
    let status = match body.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(body))
}

fn read_error(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    api_error(err, PipelineError::Fetch)
}

fn write_error(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    api_error(err, PipelineError::Write)
}

fn mismatched_deal(path: DealId, body: DealId) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(
            ErrorCode::Validation,
            format!("body deal_id {body} does not match path deal {path}"),
        )),
    )
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn list_stages(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Stage>>> {
    let stages = state.storage.list_stages().await.map_err(read_error)?;
    Ok(Json(stages))
}

async fn list_deals(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Deal>>> {
    let deals = state.storage.list_deals().await.map_err(read_error)?;
    Ok(Json(deals))
}

async fn create_deal(
    State(state): State<Arc<AppState>>,
    Json(new_deal): Json<NewDeal>,
) -> ApiResult<(StatusCode, Json<Deal>)> {
    let deal = state
        .storage
        .insert_deal(new_deal)
        .await
        .map_err(write_error)?;
    info!(deal_id = %deal.id, stage_id = %deal.stage_id, "deal created");
    Ok((StatusCode::CREATED, Json(deal)))
}

async fn get_deal(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<DealId>,
) -> ApiResult<Json<Deal>> {
    let deal = state
        .storage
        .load_deal(deal_id)
        .await
        .map_err(read_error)?
        .ok_or_else(|| read_error(PipelineError::not_found("deal", deal_id).into()))?;
    Ok(Json(deal))
}

async fn patch_deal(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<DealId>,
    Json(patch): Json<DealPatch>,
) -> ApiResult<StatusCode> {
    state
        .storage
        .update_deal(deal_id, &patch)
        .await
        .map_err(write_error)?;
    debug!(deal_id = %deal_id, ?patch, "deal patched");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_checklist(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<DealId>,
) -> ApiResult<Json<Vec<ChecklistItem>>> {
    let items = state
        .storage
        .list_checklist(deal_id)
        .await
        .map_err(read_error)?;
    Ok(Json(items))
}

async fn create_checklist_item(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<DealId>,
    Json(item): Json<NewChecklistItem>,
) -> ApiResult<(StatusCode, Json<ChecklistItem>)> {
    if item.deal_id != deal_id {
        return Err(mismatched_deal(deal_id, item.deal_id));
    }
    let item = state
        .storage
        .insert_checklist_item(item)
        .await
        .map_err(write_error)?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn patch_checklist_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<ChecklistItemId>,
    Json(patch): Json<ChecklistPatch>,
) -> ApiResult<StatusCode> {
    state
        .storage
        .update_checklist_item(item_id, &patch)
        .await
        .map_err(write_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_activity(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<DealId>,
) -> ApiResult<Json<Vec<ActivityEntry>>> {
    let entries = state
        .storage
        .list_activity(deal_id)
        .await
        .map_err(read_error)?;
    Ok(Json(entries))
}

async fn create_activity(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<DealId>,
    Json(activity): Json<NewActivity>,
) -> ApiResult<(StatusCode, Json<ActivityEntry>)> {
    if activity.deal_id != deal_id {
        return Err(mismatched_deal(deal_id, activity.deal_id));
    }
    let entry = state
        .storage
        .insert_activity(activity)
        .await
        .map_err(write_error)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Subscribe before the handshake completes so the client never misses a
    // change committed right after it connects.
    let changes = state.storage.subscribe_changes();
    let storage = state.storage.clone();
    ws.on_upgrade(move |socket| ws_connection(socket, changes, storage))
}

/// Next notification to forward to one websocket client. A lagged receiver
/// becomes a single resync notice so the client refetches what it watches.
async fn next_change(
    changes: &mut broadcast::Receiver<ChangeNotification>,
    storage: &Storage,
) -> Option<ChangeNotification> {
    match changes.recv().await {
        Ok(notification) => Some(notification),
        Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "websocket client lagging behind change feed; sending resync");
            Some(ChangeNotification::resync(storage.last_sequence()))
        }
        Err(RecvError::Closed) => None,
    }
}

async fn ws_connection(
    socket: WebSocket,
    mut changes: broadcast::Receiver<ChangeNotification>,
    storage: Storage,
) {
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(notification) = next_change(&mut changes, &storage).await {
            let text = match serde_json::to_string(&notification) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
