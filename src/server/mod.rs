use crate::config::HttpConfig;
use crate::model::{normalize_action, Command, KNOWN_ACTIONS};
use crate::registry::Outbound;
use crate::router::Router as HubRouter;
use crate::session::{
    run_session, PeerSocket, SessionContext, SessionError, SocketMessage, SocketReader, SocketWriter,
};
use crate::state::now_unix_ms;
use crate::status::StatusFacade;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

pub struct ServerState {
    pub router: Arc<HubRouter>,
    pub status: StatusFacade,
    pub sessions: Arc<SessionContext>,
}

pub async fn start(
    addr: SocketAddr,
    state: Arc<ServerState>,
    http: &HttpConfig,
    ws_path: &str,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, ws_path, "hub listening");
    serve(listener, build_router(state, http, ws_path), shutdown_rx).await?;
    Ok(())
}

async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    })
    .await
}

pub fn build_router(state: Arc<ServerState>, http: &HttpConfig, ws_path: &str) -> Router {
    let mut app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/frame", get(latest_frame))
        .route("/command", post(command))
        .route("/robots/command", post(command))
        .route("/emergency-stop", post(emergency_stop))
        .route(ws_path, get(ws_handler));

    if let Some(dir) = http.static_dir.as_deref() {
        app = app.nest_service("/static", ServeDir::new(dir));
    }

    let mut app = app.with_state(state);
    if let Some(cors) = cors_layer(&http.cors_origins) {
        app = app.layer(cors);
    }
    app
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "skipping invalid cors origin");
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let remote = remote.map(|ConnectInfo(addr)| addr);
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| async move {
        let result = run_session(AxumPeerSocket(socket), remote, &sessions).await;
        if let Err(err @ (SessionError::Handshake(_) | SessionError::HandshakeTimeout(_))) = result {
            warn!(remote = ?remote, error = %err, "rejected websocket peer");
        }
    })
}

struct AxumPeerSocket(WebSocket);

struct AxumReader(SplitStream<WebSocket>);

struct AxumWriter(SplitSink<WebSocket, Message>);

impl PeerSocket for AxumPeerSocket {
    type Reader = AxumReader;
    type Writer = AxumWriter;

    fn split(self) -> (AxumReader, AxumWriter) {
        let (sink, stream) = self.0.split();
        (AxumReader(stream), AxumWriter(sink))
    }
}

impl SocketReader for AxumReader {
    async fn recv(&mut self) -> Option<Result<SocketMessage, SessionError>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(err) => return Some(Err(SessionError::Transport(err.to_string()))),
        };
        Some(Ok(match message {
            Message::Text(text) => SocketMessage::Text(text),
            Message::Binary(bytes) => SocketMessage::Binary(bytes),
            Message::Ping(_) | Message::Pong(_) => SocketMessage::Control,
            Message::Close(_) => SocketMessage::Close,
        }))
    }
}

impl SocketWriter for AxumWriter {
    async fn send(&mut self, message: Outbound) -> Result<(), SessionError> {
        let message = match message {
            Outbound::Text(text) => Message::Text(text.to_string()),
            Outbound::Binary(bytes) => Message::Binary(bytes.to_vec()),
        };
        self.0
            .send(message)
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

async fn root(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Rover Relay Hub",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "device_connected": state.status.device_connected(),
    }))
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

async fn status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.status.snapshot())
}

async fn latest_frame(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.status.last_frame() {
        Some(frame) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
                (header::PRAGMA, "no-cache"),
                (header::EXPIRES, "0"),
            ],
            frame.bytes.to_vec(),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    value: String,
    speed: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CommandEcho {
    value: String,
    speed: u8,
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<CommandEcho>,
    devices_reached: usize,
    timestamp: u64,
}

async fn command(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let Some(action) = normalize_action(&request.value) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(CommandResponse {
                success: false,
                message: format!(
                    "unknown action '{}'; valid actions: {}",
                    request.value,
                    KNOWN_ACTIONS.join(", ")
                ),
                command: None,
                devices_reached: 0,
                timestamp: now_unix_ms(),
            }),
        )
            .into_response();
    };

    let command = Command::new(action, request.speed);
    let echo = CommandEcho {
        value: command.action.clone(),
        speed: command.speed,
    };
    let report = state.router.handle_command(command, None).await;

    Json(CommandResponse {
        success: true,
        message: format!("command '{}' sent", echo.value),
        command: Some(echo),
        devices_reached: report.delivered,
        timestamp: now_unix_ms(),
    })
    .into_response()
}

async fn emergency_stop(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let report = state.router.emergency_stop().await;
    Json(CommandResponse {
        success: true,
        message: "emergency stop activated".to_string(),
        command: None,
        devices_reached: report.delivered,
        timestamp: now_unix_ms(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::registry::{Peer, PeerRegistry};
    use crate::session::SessionSettings;
    use crate::state::SharedState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    struct Fixture {
        state: Arc<ServerState>,
        shared: Arc<SharedState>,
        registry: Arc<PeerRegistry>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(PeerRegistry::new());
        let shared = Arc::new(SharedState::new());
        let router = Arc::new(HubRouter::new(
            registry.clone(),
            shared.clone(),
            Duration::from_millis(50),
        ));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let sessions = Arc::new(SessionContext {
            registry: registry.clone(),
            router: router.clone(),
            settings: SessionSettings {
                outbound_queue: 8,
                handshake_timeout: Duration::from_secs(1),
                max_frame_bytes: 1024,
            },
            shutdown,
        });
        Fixture {
            state: Arc::new(ServerState {
                router,
                status: StatusFacade::new(shared.clone(), registry.clone()),
                sessions,
            }),
            shared,
            registry,
            shutdown_tx,
        }
    }

    fn app(fx: &Fixture) -> Router {
        build_router(fx.state.clone(), &HttpConfig::default(), "/ws")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let fx = fixture();
        let response = app(&fx)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn root_banner_tracks_device_presence() {
        let fx = fixture();
        let json = body_json(
            app(&fx)
                .oneshot(Request::get("/").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["status"], "running");
        assert_eq!(json["device_connected"], false);

        let (device, _rx) = Peer::new(Role::Device, None, 1);
        fx.registry.register(device);
        let json = body_json(
            app(&fx)
                .oneshot(Request::get("/").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["device_connected"], true);
    }

    #[tokio::test]
    async fn frame_is_no_content_until_a_device_sends_one() {
        let fx = fixture();
        let response = app(&fx)
            .oneshot(Request::get("/frame").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        fx.shared.set_frame(Arc::from(vec![0xff, 0xd8, 0x01]));
        let response = app(&fx)
            .oneshot(Request::get("/frame").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(response.headers()[header::PRAGMA], "no-cache");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], &[0xff, 0xd8, 0x01]);
    }

    #[tokio::test]
    async fn command_normalizes_and_reaches_devices() {
        let fx = fixture();
        let (device, mut rx) = Peer::new(Role::Device, None, 4);
        fx.registry.register(device);

        let response = app(&fx)
            .oneshot(post_json(
                "/command",
                serde_json::json!({"value": "FORWARD", "speed": 400}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["command"]["value"], "forward");
        assert_eq!(json["command"]["speed"], 255);
        assert_eq!(json["devices_reached"], 1);

        match rx.recv().await.unwrap() {
            Outbound::Text(text) => {
                let sent: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(
                    sent,
                    serde_json::json!({"type": "action", "value": "forward", "speed": 255})
                );
            }
            other => panic!("expected text, got {other:?}"),
        }
        assert_eq!(fx.shared.action().action, "forward");
    }

    #[tokio::test]
    async fn legacy_command_route_toggles_flash_in_status() {
        let fx = fixture();
        let response = app(&fx)
            .oneshot(post_json(
                "/robots/command",
                serde_json::json!({"value": "FLASH_ON"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["command"]["value"], "flash_on");

        let json = body_json(
            app(&fx)
                .oneshot(Request::get("/status").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["flash_on"], true);
        assert_eq!(json["current_action"], "flash_on");
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let fx = fixture();
        let response = app(&fx)
            .oneshot(post_json("/command", serde_json::json!({"value": "jump"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(fx.shared.action().action, "stop");
    }

    #[tokio::test]
    async fn emergency_stop_zeroes_speed() {
        let fx = fixture();
        fx.shared.set_action("forward", 200);
        let response = app(&fx)
            .oneshot(
                Request::post("/emergency-stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["devices_reached"], 0);
        let action = fx.shared.action();
        assert_eq!(action.action, "stop");
        assert_eq!(action.speed, 0);
        assert!(action.emergency_stop_at.is_some());
    }

    #[tokio::test]
    async fn status_snapshot_is_served() {
        let fx = fixture();
        fx.shared.set_action("left", 30);
        let json = body_json(
            app(&fx)
                .oneshot(Request::get("/status").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["current_action"], "left");
        assert_eq!(json["current_speed"], 30);
        assert_eq!(json["has_frame"], false);
        assert!(json["frame_age_ms"].is_null());
    }

    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let fx = fixture();
        let response = app(&fx)
            .oneshot(
                Request::get("/health")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
    }

    #[test]
    fn empty_origin_list_disables_cors() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["http://localhost:3000".to_string()]).is_some());
    }

    async fn wait_for(registry: &PeerRegistry, role: Role, count: usize) {
        for _ in 0..100 {
            if registry.count(role) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} {role} peers");
    }

    #[tokio::test]
    async fn websocket_peers_relay_commands_and_frames() {
        let fx = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, app(&fx), fx.shutdown_tx.subscribe()));
        let url = format!("ws://{addr}/ws");

        let (mut device, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        device
            .send(WsMessage::Text(r#"{"role":"esp32"}"#.to_string()))
            .await
            .unwrap();
        let (mut controller, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        controller
            .send(WsMessage::Text(r#"{"role":"controller"}"#.to_string()))
            .await
            .unwrap();
        wait_for(&fx.registry, Role::Device, 1).await;
        wait_for(&fx.registry, Role::Controller, 1).await;

        controller
            .send(WsMessage::Text(
                r#"{"type":"command","value":"left","speed":90}"#.to_string(),
            ))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), device.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let sent: serde_json::Value = serde_json::from_str(received.to_text().unwrap()).unwrap();
        assert_eq!(
            sent,
            serde_json::json!({"type": "action", "value": "left", "speed": 90})
        );

        device
            .send(WsMessage::Binary(vec![0xff, 0xd8, 0xff, 0xd9]))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), controller.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, WsMessage::Binary(vec![0xff, 0xd8, 0xff, 0xd9]));

        fx.shutdown_tx.send(true).unwrap();
        wait_for(&fx.registry, Role::Device, 0).await;
        wait_for(&fx.registry, Role::Controller, 0).await;
        drop(device);
        drop(controller);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
