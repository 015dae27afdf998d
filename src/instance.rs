use crate::errors::AppError;
use crate::gateway_client::EvolutionClient;
use crate::models::{
    AuthUser, ConnectResponse, InstanceStatus, InstanceStatusResponse, QrResponse, Role,
    WhatsAppInstance,
};
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// How long a QR payload stays scannable before the UI must re-request.
pub const QR_TTL_SECONDS: i64 = 120;

/// Owns the per-gerente WhatsApp instance record and its state machine.
///
/// The row is mutated from two independent paths (these manager-initiated
/// calls and the webhook processor); every write here is a single atomic
/// row UPDATE, never a read-modify-write across statements, so no explicit
/// locking is needed. The gateway itself is the source of truth and is
/// re-polled by `status()`.
pub struct InstanceService {
    pool: PgPool,
    gateway: EvolutionClient,
}

impl InstanceService {
    pub fn new(pool: PgPool, gateway: EvolutionClient) -> Self {
        Self { pool, gateway }
    }

    fn require_gerente(caller: &AuthUser) -> Result<(), AppError> {
        if caller.role != Role::Gerente {
            return Err(AppError::Forbidden(
                "Only gerentes manage WhatsApp instances".to_string(),
            ));
        }
        Ok(())
    }

    async fn fetch(&self, gerente_id: Uuid) -> Result<Option<WhatsAppInstance>, AppError> {
        let instance = sqlx::query_as::<_, WhatsAppInstance>(
            "SELECT gerente_id, instance_name, status, qr_code, qr_expires_at, phone, updated_at
             FROM whatsapp_instances WHERE gerente_id = $1",
        )
        .bind(gerente_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(instance)
    }

    /// Connect (or reconnect) the caller's instance.
    ///
    /// Advisory by design: gateway flakiness never fails this call, it just
    /// leaves the stored state unchanged and returns it - the UI polls.
    pub async fn connect(&self, caller: &AuthUser) -> Result<ConnectResponse, AppError> {
        Self::require_gerente(caller)?;
        let gerente_id = caller.id;
        let instance_name = WhatsAppInstance::name_for(gerente_id);

        // Lazily create the row on first connect; keep it forever after so
        // the instance name stays stable across reconnects.
        sqlx::query(
            "INSERT INTO whatsapp_instances (gerente_id, instance_name, status)
             VALUES ($1, $2, 'connecting')
             ON CONFLICT (gerente_id) DO NOTHING",
        )
        .bind(gerente_id)
        .bind(&instance_name)
        .execute(&self.pool)
        .await?;

        // Registering an existing instance comes back as 403; that is not
        // a failure here.
        match self.gateway.create_instance(&instance_name).await {
            Ok(_) => {}
            Err(e) if e.status == Some(reqwest::StatusCode::FORBIDDEN) => {
                tracing::debug!("Instance {} already registered with gateway", instance_name);
            }
            Err(e) => {
                tracing::warn!("Gateway create_instance failed for {}: {}", instance_name, e);
            }
        }

        match self.gateway.connect(&instance_name).await {
            Ok(data) => {
                if let Some(qr) = extract_qr(&data) {
                    let expires_at = Utc::now() + Duration::seconds(QR_TTL_SECONDS);
                    sqlx::query(
                        "UPDATE whatsapp_instances
                         SET status = 'qr_pending', qr_code = $2, qr_expires_at = $3, updated_at = now()
                         WHERE gerente_id = $1",
                    )
                    .bind(gerente_id)
                    .bind(&qr)
                    .bind(expires_at)
                    .execute(&self.pool)
                    .await?;
                } else if session_is_open(&data) {
                    sqlx::query(
                        "UPDATE whatsapp_instances
                         SET status = 'connected', qr_code = NULL, qr_expires_at = NULL, updated_at = now()
                         WHERE gerente_id = $1",
                    )
                    .bind(gerente_id)
                    .execute(&self.pool)
                    .await?;
                } else {
                    tracing::debug!(
                        "Gateway connect for {} returned neither QR nor open session",
                        instance_name
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Gateway connect failed for {}: {}", instance_name, e);
            }
        }

        let instance = self
            .fetch(gerente_id)
            .await?
            .ok_or_else(|| AppError::InternalError("Instance row vanished".to_string()))?;

        Ok(ConnectResponse {
            status: instance.status,
            qr: instance.qr_code,
            instance_name: instance.instance_name,
        })
    }

    /// Live status, reconciled against the gateway.
    ///
    /// When the gateway disagrees with the stored status, the stored status
    /// is corrected before returning. On gateway unreachability the last
    /// known stored status is returned instead of failing.
    pub async fn status(&self, caller: &AuthUser) -> Result<InstanceStatusResponse, AppError> {
        Self::require_gerente(caller)?;

        let instance = self
            .fetch(caller.id)
            .await?
            .ok_or_else(|| AppError::NotFound("No WhatsApp instance for this user".to_string()))?;

        let status = match self.gateway.connection_state(&instance.instance_name).await {
            Ok(state) => match InstanceStatus::from_gateway_state(&state) {
                Some(live) if live != instance.status => {
                    sqlx::query(
                        "UPDATE whatsapp_instances SET status = $2, updated_at = now()
                         WHERE gerente_id = $1",
                    )
                    .bind(caller.id)
                    .bind(live)
                    .execute(&self.pool)
                    .await?;
                    tracing::info!(
                        "Instance {} status reconciled {:?} -> {:?}",
                        instance.instance_name,
                        instance.status,
                        live
                    );
                    live
                }
                Some(live) => live,
                None => instance.status,
            },
            Err(e) => {
                tracing::warn!(
                    "Gateway unreachable for {}, returning stored status: {}",
                    instance.instance_name,
                    e
                );
                instance.status
            }
        };

        Ok(InstanceStatusResponse {
            status,
            phone: instance.phone,
        })
    }

    /// Cached QR payload and whether it has expired.
    pub async fn qr(&self, caller: &AuthUser) -> Result<QrResponse, AppError> {
        Self::require_gerente(caller)?;

        let instance = self
            .fetch(caller.id)
            .await?
            .ok_or_else(|| AppError::NotFound("No WhatsApp instance for this user".to_string()))?;

        let expired = match instance.qr_expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => instance.qr_code.is_some(),
        };

        Ok(QrResponse {
            qr: instance.qr_code,
            status: instance.status,
            expired,
        })
    }

    /// Disconnect the caller's instance.
    ///
    /// The gateway logout is best-effort; the local transition to
    /// `disconnected` is unconditional so an operator can always escape a
    /// stuck instance.
    pub async fn disconnect(&self, caller: &AuthUser) -> Result<InstanceStatus, AppError> {
        Self::require_gerente(caller)?;

        let instance = self
            .fetch(caller.id)
            .await?
            .ok_or_else(|| AppError::NotFound("No WhatsApp instance for this user".to_string()))?;

        if let Err(e) = self.gateway.logout(&instance.instance_name).await {
            tracing::warn!(
                "Gateway logout failed for {} (forcing local disconnect anyway): {}",
                instance.instance_name,
                e
            );
        }

        sqlx::query(
            "UPDATE whatsapp_instances
             SET status = 'disconnected', qr_code = NULL, qr_expires_at = NULL, phone = NULL,
                 updated_at = now()
             WHERE gerente_id = $1",
        )
        .bind(caller.id)
        .execute(&self.pool)
        .await?;

        Ok(InstanceStatus::Disconnected)
    }
}

/// Pull a QR payload out of a gateway connect response. Different gateway
/// versions nest it differently.
fn extract_qr(data: &Value) -> Option<String> {
    data.get("base64")
        .or_else(|| data.get("qrcode").and_then(|q| q.get("base64")))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Whether a connect response reports an already-open session.
fn session_is_open(data: &Value) -> bool {
    data.get("instance")
        .and_then(|i| i.get("state"))
        .and_then(|s| s.as_str())
        .map(|s| s == "open")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_qr_from_flat_and_nested_payloads() {
        assert_eq!(
            extract_qr(&json!({"base64": "abc123"})),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_qr(&json!({"qrcode": {"base64": "xyz"}})),
            Some("xyz".to_string())
        );
        assert_eq!(extract_qr(&json!({"base64": ""})), None);
        assert_eq!(extract_qr(&json!({"count": 3})), None);
    }

    #[test]
    fn detects_open_session() {
        assert!(session_is_open(&json!({"instance": {"state": "open"}})));
        assert!(!session_is_open(&json!({"instance": {"state": "close"}})));
        assert!(!session_is_open(&json!({"base64": "qr"})));
    }
}
