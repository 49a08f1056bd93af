use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        Path,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use shared::{
    domain::{DealDetails, StageId},
    error::ErrorCode,
    protocol::ChangeKind,
};
use std::time::Duration;

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn fixed_stage() -> Stage {
    Stage {
        id: StageId::random(),
        name: "Awareness".into(),
        display_order: 1,
        is_active: true,
    }
}

#[test]
fn rejects_non_http_urls_and_derives_ws_url() {
    assert!(matches!(
        HttpGateway::new("ftp://example.com"),
        Err(PipelineError::Validation(_))
    ));

    let gateway = HttpGateway::new("https://pipeline.example.com/api").expect("gateway");
    assert_eq!(
        gateway.ws_url().expect("ws url").as_str(),
        "wss://pipeline.example.com/api/ws"
    );
    assert_eq!(
        gateway.endpoint("deals").expect("endpoint").as_str(),
        "https://pipeline.example.com/api/deals"
    );
}

#[tokio::test]
async fn fetches_stages_as_json() {
    let stage = fixed_stage();
    let body = vec![stage.clone()];
    let app = Router::new().route("/stages", get(move || async move { Json(body) }));
    let gateway = HttpGateway::new(&spawn_server(app).await).expect("gateway");

    let stages = gateway.fetch_stages().await.expect("stages");
    assert_eq!(stages, vec![stage]);
}

#[tokio::test]
async fn error_envelopes_map_back_to_pipeline_errors() {
    let app = Router::new()
        .route(
            "/deals/:id",
            patch(|Path(id): Path<String>| async move {
                (
                    StatusCode::NOT_FOUND,
                    Json(ApiError::new(ErrorCode::NotFound, id)),
                )
            }),
        )
        .route(
            "/deals",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response() }),
        );
    let gateway = HttpGateway::new(&spawn_server(app).await).expect("gateway");

    let missing = DealId::random();
    let err = gateway
        .update_card(
            missing,
            DealPatch::Rename {
                title: "Renamed".into(),
            },
        )
        .await
        .expect_err("not found");
    assert!(matches!(err, PipelineError::NotFound { id, .. } if id == missing.to_string()));

    let err = gateway
        .insert_card(NewDeal {
            stage_id: None,
            sort_order: None,
            details: DealDetails::for_office("Pine", chrono::Utc::now()),
        })
        .await
        .expect_err("server error");
    assert!(matches!(err, PipelineError::Write(message) if message.contains("500")));
}

#[tokio::test]
async fn invalid_patch_never_leaves_the_client() {
    let gateway = HttpGateway::new("http://127.0.0.1:9").expect("gateway");
    let err = gateway
        .update_card(
            DealId::random(),
            DealPatch::SetValue { deal_value: -5.0 },
        )
        .await
        .expect_err("invalid");
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[tokio::test]
async fn unreachable_server_is_a_fetch_error() {
    let gateway = HttpGateway::new("http://127.0.0.1:9").expect("gateway");
    let err = gateway.fetch_cards().await.expect_err("unreachable");
    assert!(matches!(err, PipelineError::Fetch(_)));
}

#[tokio::test]
async fn subscription_filters_streamed_notifications() {
    let deal_id = DealId::random();
    let notes = vec![
        ChangeNotification {
            scope: CollectionScope::Activity(deal_id),
            kind: ChangeKind::Insert,
            entity_id: None,
            sequence: 1,
        },
        ChangeNotification {
            scope: CollectionScope::Deals,
            kind: ChangeKind::Update,
            entity_id: Some(deal_id.0),
            sequence: 2,
        },
        ChangeNotification::resync(3),
    ];
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let notes = notes.clone();
            async move {
                ws.on_upgrade(move |mut socket| async move {
                    for note in notes {
                        let text = serde_json::to_string(&note).expect("json");
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    // Keep the socket open until the client goes away.
                    while let Some(Ok(_)) = socket.recv().await {}
                })
            }
        }),
    );
    let gateway = HttpGateway::new(&spawn_server(app).await).expect("gateway");

    let mut subscription = gateway
        .subscribe(CollectionScope::Deals)
        .await
        .expect("subscribe");
    let note = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("timely")
        .expect("notification");
    assert_eq!(note.sequence, 2);
    assert_eq!(note.entity_id, Some(deal_id.0));

    // A resync notice from a lagging server reaches every scope.
    let resync = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("timely")
        .expect("resync");
    assert_eq!(resync.scope, CollectionScope::All);
    assert_eq!(resync.kind, ChangeKind::Bulk);
    subscription.unsubscribe();
}
