use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::{AppSnapshot, AppState, UiEvent, View};
use crate::chat::TranscriptEntry;
use crate::constants::DEFAULT_MARKET_QUERY;
use crate::dashboard::FarmOverview;
use crate::diagnosis::{DiagnosisSnapshot, SelectedImage};
use crate::market::MarketSnapshot;

// Shared state handed to every handler.
#[derive(Clone)]
struct WebState {
    app: AppState,
    templates: Arc<AutoReloader>,
    model: String,
}

// Handler failures become a JSON body with a matching status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn busy(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// Minijinja Environment setup
fn create_minijinja_env(dir: impl Into<PathBuf>) -> AutoReloader {
    let dir = dir.into();
    // Use AutoReloader for development convenience
    AutoReloader::new(move |notifier| {
        // Create the loader *inside* the closure
        let loader = path_loader(&dir);
        let mut env = Environment::new();
        env.set_loader(loader);
        // Watch the templates directory for changes
        notifier.watch_path(&dir, true);
        Ok(env)
    })
}

#[derive(Serialize)]
struct NavItem {
    slug: &'static str,
    label: &'static str,
}

async fn index_handler(
    State(state): State<WebState>,
) -> Result<Html<String>, (StatusCode, Html<String>)> {
    let current = state.app.view().await;
    let views: Vec<NavItem> = View::ALL
        .iter()
        .map(|view| NavItem {
            slug: view.slug(),
            label: view.label(),
        })
        .collect();

    // Acquire env, get template, and render within the same block
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                let context = minijinja::context! {
                    title => "AgriSmart AI",
                    model => state.model,
                    views => views,
                    current_view => current.slug(),
                    default_query => DEFAULT_MARKET_QUERY,
                };
                tmpl.render(context)
            })
        })
        .map(Html) // Wrap successful render in Html()
        .map_err(|e| {
            // Handle errors from acquire_env, get_template, or render
            error!("Failed to get or render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Internal Server Error: {}", e)),
            )
        })
}

async fn state_handler(State(state): State<WebState>) -> Json<AppSnapshot> {
    Json(state.app.snapshot().await)
}

async fn dashboard_handler() -> Json<FarmOverview> {
    Json(FarmOverview::sample())
}

#[derive(Deserialize)]
struct ViewRequest {
    view: View,
}

async fn view_handler(
    State(state): State<WebState>,
    Json(request): Json<ViewRequest>,
) -> Json<serde_json::Value> {
    state.app.select_view(request.view).await;
    Json(serde_json::json!({ "view": request.view }))
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Serialize)]
struct ChatAccepted {
    reply_id: Uuid,
}

async fn chat_handler(
    State(state): State<WebState>,
    Json(request): Json<ChatRequest>,
) -> Result<(StatusCode, Json<ChatAccepted>), ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Message is empty"));
    }
    let exchange = state
        .app
        .begin_chat(&request.message)
        .await
        .ok_or_else(|| ApiError::busy("The advisor is still answering"))?;
    let reply_id = exchange.reply_id;

    // The reply streams to WebSocket clients; the request returns at once.
    let app = state.app.clone();
    tokio::spawn(async move {
        app.run_chat(exchange).await;
    });

    Ok((StatusCode::ACCEPTED, Json(ChatAccepted { reply_id })))
}

async fn clear_chat_handler(
    State(state): State<WebState>,
) -> Result<Json<Vec<TranscriptEntry>>, ApiError> {
    if !state.app.clear_chat().await {
        return Err(ApiError::busy("The advisor is still answering"));
    }
    Ok(Json(state.app.snapshot().await.transcript))
}

#[derive(Deserialize)]
struct ImageRequest {
    /// Browser data URL, as produced by `FileReader.readAsDataURL`.
    image: String,
}

async fn select_image_handler(
    State(state): State<WebState>,
    Json(request): Json<ImageRequest>,
) -> Result<Json<DiagnosisSnapshot>, ApiError> {
    let image = SelectedImage::from_data_url(&request.image)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    if !state.app.select_image(image).await {
        return Err(ApiError::busy("An analysis is in progress"));
    }
    Ok(Json(state.app.snapshot().await.diagnosis))
}

async fn analyze_handler(
    State(state): State<WebState>,
) -> Result<Json<DiagnosisSnapshot>, ApiError> {
    let report = state
        .app
        .analyze_image()
        .await
        .ok_or_else(|| ApiError::busy("Select an image first, or wait for the current analysis"))?;
    if let Some(notice) = report.notice {
        return Err(ApiError::new(StatusCode::BAD_GATEWAY, notice));
    }
    Ok(Json(state.app.snapshot().await.diagnosis))
}

async fn reset_diagnosis_handler(
    State(state): State<WebState>,
) -> Result<Json<DiagnosisSnapshot>, ApiError> {
    if !state.app.reset_diagnosis().await {
        return Err(ApiError::busy("An analysis is in progress"));
    }
    Ok(Json(state.app.snapshot().await.diagnosis))
}

#[derive(Deserialize)]
struct MarketRequest {
    query: String,
}

async fn market_handler(
    State(state): State<WebState>,
    Json(request): Json<MarketRequest>,
) -> Result<Json<MarketSnapshot>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Query is empty"));
    }
    let report = state
        .app
        .query_market(&request.query)
        .await
        .ok_or_else(|| ApiError::busy("A market query is already running"))?;
    if let Some(notice) = report.notice {
        return Err(ApiError::new(StatusCode::BAD_GATEWAY, notice));
    }
    Ok(Json(state.app.snapshot().await.market))
}

// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state.app))
}

async fn send_event(socket: &mut WebSocket, event: &UiEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize UI event: {}", e);
            true
        }
    }
}

// Handle individual WebSocket connections
async fn handle_socket(mut socket: WebSocket, app: AppState) {
    info!("New WebSocket connection established");
    // Subscribe before taking the snapshot so nothing falls between the two.
    // Events already reflected in the snapshot may be replayed; fragment
    // events carry the whole reply so far, which makes that harmless.
    let mut events = app.subscribe();

    let welcome = UiEvent::Snapshot {
        state: app.snapshot().await,
    };
    if !send_event(&mut socket, &welcome).await {
        warn!("Failed to send initial state to new WebSocket client");
        return;
    }

    loop {
        tokio::select! {
            received = events.recv() => {
                let event = match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        // Too far behind to patch up; skip the backlog and resend everything.
                        warn!(skipped, "WebSocket client lagged, resending state");
                        events = events.resubscribe();
                        UiEvent::Snapshot { state: app.snapshot().await }
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send_event(&mut socket, &event).await {
                    // Client disconnected or error sending
                    warn!("WebSocket client disconnected or send error. Closing connection.");
                    break;
                }
            }

            // Message received from the client
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        // Commands arrive over HTTP; the socket is a one-way feed.
                        info!("Ignoring text message from WebSocket client: {}", text);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Received unexpected binary message from client");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Axum answers pings itself
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested WebSocket close");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    // Client disconnected without sending a Close message
                    None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                }
            }
        }
    }
    info!("WebSocket connection closed");
}

/// Builds the application router. `model` is only shown in the page footer.
pub fn router(app: AppState, model: impl Into<String>) -> Router {
    let state = WebState {
        app,
        templates: Arc::new(create_minijinja_env("templates")),
        model: model.into(),
    };

    // Serve static files from the `static` directory
    let static_files_service =
        ServeDir::new("static").not_found_service(tower::service_fn(|_| async {
            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("Not Found"))
                    .unwrap_or_default(),
            )
        }));

    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/api/state", get(state_handler))
        .route("/api/view", post(view_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/clear", post(clear_chat_handler))
        .route("/api/diagnosis/image", post(select_image_handler))
        .route("/api/diagnosis/analyze", post(analyze_handler))
        .route("/api/diagnosis/reset", post(reset_diagnosis_handler))
        .route("/api/market", post(market_handler))
        // Route for static files must be nested under a path like /static
        // or it will conflict with other routes.
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http()) // Add request logging
}

pub async fn start_web_server(port: u16, app: AppState, model: String) -> Result<()> {
    let app = router(app, model);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    // Bind using tokio::net::TcpListener
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    // Use axum::serve to run the application
    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::fake::FakeGateway;

    #[tokio::test]
    async fn test_index_template_failure_is_server_error() {
        let empty = tempfile::tempdir().unwrap();
        let state = WebState {
            app: AppState::new(Arc::new(FakeGateway::default())),
            templates: Arc::new(create_minijinja_env(empty.path())),
            model: "test-model".to_string(),
        };

        let response = index_handler(State(state)).await.into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
