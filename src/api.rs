//! REST API server for the payment agent
//!
//! Exposes the conversation loop via HTTP: classify the message, dispatch
//! the turn, render the structured payload into text. Rendering happens
//! after the turn has been applied, so a renderer failure degrades to a
//! generic reply without losing committed state.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::classifier::IntentClassifier;
use crate::error::AgentError;
use crate::fsm::TurnHandler;
use crate::renderer::ResponseRenderer;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub handler: Arc<TurnHandler>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub renderer: Arc<dyn ResponseRenderer>,
}

/// =============================
/// Helpers — Stable Session Ids
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

fn resolve_session_id(value: Option<&str>) -> uuid::Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            uuid::Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => uuid::Uuid::new_v4(),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let session_id = resolve_session_id(req.session_id.as_deref());
    info!(?session_id, "Received chat message");

    // Classification needs the machine's current state for the
    // context-sensitive intents.
    let current_state = {
        let session = state.handler.sessions().get_or_create(session_id).await;
        let guard = session.lock().await;
        guard.state()
    };

    let classification = match state.classifier.classify(&req.message, current_state) {
        Ok(classification) => classification,
        Err(e) => {
            error!("Intent classification failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Classifier failed: {}", e))),
            );
        }
    };

    let (context, next_state) = match state
        .handler
        .handle_turn(session_id, classification.intent, classification.params)
        .await
    {
        Ok(outcome) => outcome,
        Err(e @ AgentError::MalformedBill { .. }) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse::error(format!("Turn rejected: {}", e))),
            );
        }
        Err(e) => {
            error!("Turn failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Turn failed: {}", e))),
            );
        }
    };

    // State is already updated; never let rendering undo that.
    let reply = match state.renderer.render(&context).await {
        Ok(text) => text,
        Err(e) => {
            warn!("Rendering failed after commit: {}", e);
            "Sorry, I hit a snag formatting the reply — your request was \
             processed. Ask me for an overview to see where things stand."
                .to_string()
        }
    };

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session_id.to_string(),
            "reply": reply,
            "state": next_state,
            "intent": classification.intent,
            "context": context,
        }))),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(
    handler: Arc<TurnHandler>,
    classifier: Arc<dyn IntentClassifier>,
    renderer: Arc<dyn ResponseRenderer>,
) -> Router {
    let state = ApiState {
        handler,
        classifier,
        renderer,
    };

    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    handler: Arc<TurnHandler>,
    classifier: Arc<dyn IntentClassifier>,
    renderer: Arc<dyn ResponseRenderer>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(handler, classifier, renderer);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
