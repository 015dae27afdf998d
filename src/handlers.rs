use crate::bot::BotService;
use crate::chat::ChatService;
use crate::config::Config;
use crate::errors::AppError;
use crate::gateway_client::EvolutionClient;
use crate::instance::InstanceService;
use crate::models::*;
use crate::services::{CnpjLookupService, UserService};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use moka::future::Cache;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Client for the WhatsApp gateway.
    pub gateway: EvolutionClient,
    /// CNPJ registry response cache (1 hour TTL) to spare the public providers.
    pub cnpj_cache: Cache<String, CnpjData>,
}

impl AppState {
    fn instances(&self) -> InstanceService {
        InstanceService::new(self.db.clone(), self.gateway.clone())
    }

    fn chat(&self) -> ChatService {
        ChatService::new(self.db.clone(), self.gateway.clone())
    }

    fn bot(&self) -> BotService {
        let lookup = CnpjLookupService::new(&self.config, self.cnpj_cache.clone());
        BotService::new(self.db.clone(), lookup)
    }
}

/// Resolve the calling user from the X-User-Id header.
///
/// Authentication itself lives in the surrounding CRM; by the time a
/// request reaches this service the upstream layer has stamped the caller
/// id on it. Unknown or inactive users are rejected.
async fn caller(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?;

    let user_id = Uuid::parse_str(user_id)
        .map_err(|_| AppError::Unauthorized("Invalid X-User-Id header".to_string()))?;

    let user = UserService::new(state.db.clone()).require(user_id).await?;
    if !user.active {
        return Err(AppError::Unauthorized("User is inactive".to_string()));
    }

    Ok(user)
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-parceiros-api",
            "version": "0.1.0"
        })),
    )
}

/// POST /api/v1/whatsapp/connect
pub async fn connect_whatsapp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ConnectResponse>, AppError> {
    let caller = caller(&state, &headers).await?;
    tracing::info!("POST /whatsapp/connect - gerente {}", caller.id);

    let response = state.instances().connect(&caller).await?;
    Ok(Json(response))
}

/// GET /api/v1/whatsapp/status
pub async fn whatsapp_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<InstanceStatusResponse>, AppError> {
    let caller = caller(&state, &headers).await?;

    let response = state.instances().status(&caller).await?;
    Ok(Json(response))
}

/// GET /api/v1/whatsapp/qr
pub async fn whatsapp_qr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<QrResponse>, AppError> {
    let caller = caller(&state, &headers).await?;

    let response = state.instances().qr(&caller).await?;
    Ok(Json(response))
}

/// POST /api/v1/whatsapp/disconnect
pub async fn disconnect_whatsapp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let caller = caller(&state, &headers).await?;
    tracing::info!("POST /whatsapp/disconnect - gerente {}", caller.id);

    let status = state.instances().disconnect(&caller).await?;
    Ok(Json(json!({ "status": status })))
}

/// GET /api/v1/chat/conversations
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, AppError> {
    let caller = caller(&state, &headers).await?;

    let conversations = state.chat().list_conversations(&caller).await?;
    Ok(Json(conversations))
}

/// GET /api/v1/chat/:parceiro_id/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(parceiro_id): Path<Uuid>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    let caller = caller(&state, &headers).await?;

    let messages = state
        .chat()
        .list_messages(&caller, parceiro_id, params.page)
        .await?;
    Ok(Json(messages))
}

/// POST /api/v1/chat/:parceiro_id/messages
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(parceiro_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let caller = caller(&state, &headers).await?;
    tracing::info!(
        "POST /chat/{}/messages - caller {}",
        parceiro_id,
        caller.id
    );

    let message = state
        .chat()
        .send_message(&caller, parceiro_id, &request.text)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/v1/chat/:parceiro_id/cnpj/check
pub async fn check_cnpj(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(parceiro_id): Path<Uuid>,
    Json(request): Json<CnpjCheckRequest>,
) -> Result<Json<CnpjCheckResponse>, AppError> {
    let caller = caller(&state, &headers).await?;
    tracing::info!(
        "POST /chat/{}/cnpj/check - caller {} cnpj {}",
        parceiro_id,
        caller.id,
        request.cnpj
    );

    let response = state
        .bot()
        .check(&caller, parceiro_id, &request.cnpj)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/chat/:parceiro_id/cnpj/create
pub async fn create_indication(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(parceiro_id): Path<Uuid>,
    Json(request): Json<CnpjCreateRequest>,
) -> Result<(StatusCode, Json<CnpjCreateResponse>), AppError> {
    let caller = caller(&state, &headers).await?;
    tracing::info!(
        "POST /chat/{}/cnpj/create - caller {} cnpj {}",
        parceiro_id,
        caller.id,
        request.cnpj
    );

    let response = state
        .bot()
        .create_from_check(&caller, parceiro_id, &request.cnpj, request.cnpj_data)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}
