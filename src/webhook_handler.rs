use crate::errors::AppError;
use crate::handlers::AppState;
use crate::instance::QR_TTL_SECONDS;
use crate::models::InstanceStatus;
use crate::phone::{jid_to_phone, normalize_phone};
use crate::services::UserService;
use crate::webhook_models::{
    skip_reason, ConnectionUpdateData, EventMessage, MessagesUpsertData, QrCodeUpdateData,
    WebhookEnvelope, WebhookResponse,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// WhatsApp gateway webhook handler.
///
/// Receives push events (connection state, QR refreshes, inbound messages)
/// and projects them onto instance rows and the chat log. Authentication is
/// the `apikey` header against WEBHOOK_SECRET; everything past that point
/// answers 200, because any non-success response makes the gateway's retry
/// loop redeliver the event. The body is taken raw and parsed leniently for
/// the same reason: a permanently malformed event must be acknowledged, not
/// rejected with a 4xx the gateway would retry forever.
pub async fn evolution_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    validate_webhook_secret(&state, &headers)?;

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Unparseable webhook body, acknowledging anyway: {}", e);
            return Ok(ack(0, 0, 0));
        }
    };

    tracing::debug!(
        "Received gateway webhook: event={} instance={}",
        envelope.event,
        envelope.instance
    );

    // Events for instances we no longer track are acknowledged and dropped;
    // so is an event we cannot attribute because the lookup itself failed.
    let gerente_id = match find_gerente_by_instance(&state.db, &envelope.instance).await {
        Ok(Some(gerente_id)) => gerente_id,
        Ok(None) => {
            tracing::warn!(
                "Webhook for unknown instance {} (event {}), ignoring",
                envelope.instance,
                envelope.event
            );
            return Ok(ack(0, 0, 0));
        }
        Err(e) => {
            tracing::error!(
                "Instance lookup failed for webhook {} (event {}), acknowledging: {}",
                envelope.instance,
                envelope.event,
                e
            );
            return Ok(ack(0, 0, 0));
        }
    };

    let response = match envelope.event.as_str() {
        "connection.update" => {
            process_connection_update(&state.db, gerente_id, &envelope).await;
            ack(1, 1, 0)
        }
        "qrcode.updated" => {
            process_qr_update(&state.db, gerente_id, &envelope).await;
            ack(1, 1, 0)
        }
        "messages.upsert" => {
            let (received, processed, skipped) =
                process_messages_upsert(&state, gerente_id, envelope).await;
            ack(received, processed, skipped)
        }
        other => {
            tracing::debug!("Ignoring unhandled webhook event kind: {}", other);
            ack(0, 0, 0)
        }
    };

    Ok(response)
}

fn ack(received: usize, processed: usize, skipped: usize) -> (StatusCode, Json<WebhookResponse>) {
    (
        StatusCode::OK,
        Json(WebhookResponse {
            status: "received".to_string(),
            received,
            processed,
            skipped,
        }),
    )
}

/// Validate webhook secret from the apikey header.
fn validate_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // If no secret is configured, skip validation (warn was already logged at startup)
    let Some(ref expected_secret) = state.config.webhook_secret else {
        return Ok(());
    };

    let token = headers
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing apikey header".to_string()))?;

    // Constant-time comparison to prevent timing attacks
    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook secret received");
        return Err(AppError::Unauthorized("Invalid webhook secret".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison (basic implementation)
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

async fn find_gerente_by_instance(
    db: &PgPool,
    instance_name: &str,
) -> Result<Option<Uuid>, AppError> {
    let gerente_id = sqlx::query_scalar::<_, Uuid>(
        "SELECT gerente_id FROM whatsapp_instances WHERE instance_name = $1",
    )
    .bind(instance_name)
    .fetch_optional(db)
    .await?;

    Ok(gerente_id)
}

/// Project a connection-state update onto the instance row.
///
/// Last write wins on status; the gateway is the source of truth and is
/// re-polled by the status endpoint anyway. A known phone is never
/// overwritten with nothing, and any pending QR is cleared.
async fn process_connection_update(db: &PgPool, gerente_id: Uuid, envelope: &WebhookEnvelope) {
    let data: ConnectionUpdateData = match serde_json::from_value(envelope.data.clone()) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!("Unparseable connection.update payload: {}", e);
            return;
        }
    };

    let status = data
        .state
        .as_deref()
        .and_then(InstanceStatus::from_gateway_state);

    let phone = data
        .wuid
        .as_deref()
        .or(envelope.sender.as_deref())
        .map(jid_to_phone)
        .filter(|p| !p.is_empty());

    let result = sqlx::query(
        "UPDATE whatsapp_instances
         SET status = COALESCE($2, status),
             phone = COALESCE($3, phone),
             qr_code = NULL, qr_expires_at = NULL, updated_at = now()
         WHERE gerente_id = $1",
    )
    .bind(gerente_id)
    .bind(status)
    .bind(phone)
    .execute(db)
    .await;

    match result {
        Ok(_) => tracing::info!(
            "connection.update applied for gerente {}: state={:?}",
            gerente_id,
            data.state
        ),
        Err(e) => tracing::error!("Failed to apply connection.update: {}", e),
    }
}

/// Store a refreshed QR payload and restart its expiry window.
async fn process_qr_update(db: &PgPool, gerente_id: Uuid, envelope: &WebhookEnvelope) {
    let data: QrCodeUpdateData = match serde_json::from_value(envelope.data.clone()) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!("Unparseable qrcode.updated payload: {}", e);
            return;
        }
    };

    let Some(qr) = data.qrcode.and_then(|q| q.base64).filter(|q| !q.is_empty()) else {
        tracing::warn!("qrcode.updated without a QR payload, ignoring");
        return;
    };

    let expires_at = Utc::now() + Duration::seconds(QR_TTL_SECONDS);
    let result = sqlx::query(
        "UPDATE whatsapp_instances
         SET status = 'qr_pending', qr_code = $2, qr_expires_at = $3, updated_at = now()
         WHERE gerente_id = $1",
    )
    .bind(gerente_id)
    .bind(&qr)
    .bind(expires_at)
    .execute(db)
    .await;

    if let Err(e) = result {
        tracing::error!("Failed to store refreshed QR: {}", e);
    }
}

/// Project inbound messages onto the chat log.
///
/// Returns (received, processed, skipped). Every failure is logged and
/// swallowed so one bad message never blocks the rest of the batch.
async fn process_messages_upsert(
    state: &AppState,
    gerente_id: Uuid,
    envelope: WebhookEnvelope,
) -> (usize, usize, usize) {
    let messages = match serde_json::from_value::<MessagesUpsertData>(envelope.data) {
        Ok(data) => data.into_messages(),
        Err(e) => {
            tracing::warn!("Unparseable messages.upsert payload: {}", e);
            return (0, 0, 0);
        }
    };

    let received = messages.len();
    let mut processed = 0;
    let mut skipped = 0;

    // One parceiro-set fetch per event, not per message.
    let parceiros = match UserService::new(state.db.clone())
        .active_parceiros(gerente_id)
        .await
    {
        Ok(parceiros) => parceiros,
        Err(e) => {
            tracing::error!("Failed to load parceiro set for {}: {}", gerente_id, e);
            return (received, 0, received);
        }
    };

    for message in messages {
        match store_inbound_message(state, gerente_id, &parceiros, &message).await {
            Ok(true) => processed += 1,
            Ok(false) => skipped += 1,
            Err(e) => {
                tracing::error!("Failed to store inbound message: {}", e);
                skipped += 1;
            }
        }
    }

    tracing::info!(
        "messages.upsert for gerente {}: {} received, {} stored, {} skipped",
        gerente_id,
        received,
        processed,
        skipped
    );

    (received, processed, skipped)
}

/// Store one inbound message. Ok(false) means it was deliberately skipped
/// (self-authored, group, empty, unmatched sender, or duplicate delivery).
async fn store_inbound_message(
    state: &AppState,
    gerente_id: Uuid,
    parceiros: &[crate::models::AuthUser],
    message: &EventMessage,
) -> Result<bool, AppError> {
    if let Some(reason) = skip_reason(message) {
        tracing::debug!(
            "Skipping inbound message {}: {:?}",
            message.key.id,
            reason
        );
        return Ok(false);
    }

    let sender_phone = jid_to_phone(&message.key.remote_jid);
    let Some(parceiro) = parceiros.iter().find(|p| {
        p.phone
            .as_deref()
            .map(|phone| normalize_phone(phone) == sender_phone)
            .unwrap_or(false)
    }) else {
        tracing::info!(
            "Inbound message from {} matches no active parceiro of {}, dropping",
            sender_phone,
            gerente_id
        );
        return Ok(false);
    };

    // text() is Some here: skip_reason covered the empty case.
    let body = message.text().unwrap_or_default();

    // The unique index on gateway_message_id is the dedup guard; a plain
    // existence check would race with a concurrent redelivery.
    let result = sqlx::query(
        "INSERT INTO chat_messages
             (gerente_id, parceiro_id, sender_id, sender_kind, kind, body, channel, gateway_message_id)
         VALUES ($1, $2, $3, 'user', 'text', $4, 'gateway_origin', $5)
         ON CONFLICT (gateway_message_id) WHERE gateway_message_id IS NOT NULL DO NOTHING",
    )
    .bind(gerente_id)
    .bind(parceiro.id)
    .bind(parceiro.id)
    .bind(body)
    .bind(&message.key.id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        tracing::debug!(
            "Duplicate delivery of gateway message {}, ignored",
            message.key.id
        );
        return Ok(false);
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare_basic() {
        assert!(constant_time_compare("segredo", "segredo"));
        assert!(!constant_time_compare("segredo", "segredO"));
        assert!(!constant_time_compare("curto", "mais-longo"));
        assert!(constant_time_compare("", ""));
    }
}
