use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ============ Enums ============

/// Connection state of a gerente's WhatsApp gateway instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
}

impl InstanceStatus {
    /// Maps a gateway-reported connection state onto our four states.
    /// Unknown strings yield `None` so the caller can leave the stored
    /// status untouched.
    pub fn from_gateway_state(state: &str) -> Option<Self> {
        match state {
            "open" | "connected" => Some(InstanceStatus::Connected),
            "close" | "closed" | "disconnected" => Some(InstanceStatus::Disconnected),
            "connecting" => Some(InstanceStatus::Connecting),
            _ => None,
        }
    }
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Bot,
}

/// Semantic kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    CnpjLookupResult,
    CnpjDuplicateAlert,
    IndicationCreated,
}

/// How a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    /// Stored in the CRM only; the WhatsApp bridge was down or unconfigured.
    CrmOnly,
    /// Stored in the CRM and relayed through the gateway.
    CrmRelayed,
    /// Originated from the gateway (inbound WhatsApp message).
    GatewayOrigin,
}

/// CRM role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Gerente,
    Parceiro,
}

// ============ Database Models ============

/// A gerente's WhatsApp gateway instance and its local connection mirror.
///
/// At most one row per gerente. The instance name is a pure function of the
/// gerente id so gateway correlation never needs a secondary index. Rows are
/// never hard-deleted: disconnect clears the ephemeral fields only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WhatsAppInstance {
    /// Owning gerente.
    pub gerente_id: Uuid,
    /// Stable gateway-side instance name.
    pub instance_name: String,
    /// Current connection state.
    pub status: InstanceStatus,
    /// Pending QR payload (base64 image data), if any.
    pub qr_code: Option<String>,
    /// When the pending QR stops being scannable.
    pub qr_expires_at: Option<DateTime<Utc>>,
    /// Phone number the instance is connected as (national format).
    pub phone: Option<String>,
    /// Timestamp of last update.
    pub updated_at: DateTime<Utc>,
}

impl WhatsAppInstance {
    /// Deterministic gateway instance name for a gerente.
    pub fn name_for(gerente_id: Uuid) -> String {
        format!("gerente_{}", gerente_id.simple())
    }
}

/// One entry in the append-only conversation log.
///
/// Created by the router (outbound), the webhook processor (inbound) or the
/// bot (synthetic); only the read flag is ever mutated afterwards.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    /// Conversation key, gerente half.
    pub gerente_id: Uuid,
    /// Conversation key, parceiro half.
    pub parceiro_id: Uuid,
    pub sender_id: Uuid,
    pub sender_kind: SenderKind,
    pub kind: MessageKind,
    pub body: String,
    /// Kind-specific structured payload (CNPJ data, duplicate summary, ...).
    pub payload: Option<Value>,
    pub channel: DeliveryChannel,
    /// External gateway message id; present only for gateway-origin
    /// messages and unique when present (the inbound dedup key).
    pub gateway_message_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Slim view of a CRM user, as the bridge needs it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    /// For parceiros, the gerente they belong to.
    pub gerente_id: Option<Uuid>,
    pub phone: Option<String>,
    pub active: bool,
}

/// A referral record, as far as the duplicate-detection bot cares.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Indication {
    pub id: Uuid,
    pub parceiro_id: Uuid,
    pub cnpj: String,
    pub company_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

// ============ Response DTOs ============

/// Result of a connect attempt.
#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub status: InstanceStatus,
    pub qr: Option<String>,
    pub instance_name: String,
}

/// Live-reconciled instance status.
#[derive(Debug, Serialize)]
pub struct InstanceStatusResponse {
    pub status: InstanceStatus,
    pub phone: Option<String>,
}

/// Cached QR payload plus staleness flag.
#[derive(Debug, Serialize)]
pub struct QrResponse {
    pub qr: Option<String>,
    pub status: InstanceStatus,
    pub expired: bool,
}

/// One conversation in the caller's inbox listing.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversationSummary {
    pub gerente_id: Uuid,
    pub parceiro_id: Uuid,
    /// Display name of the other party.
    pub name: String,
    /// Messages in the conversation not authored by the caller and unread.
    pub unread: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Company data returned by the CNPJ registry lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CnpjData {
    pub cnpj: String,
    pub company_name: String,
    pub trade_name: Option<String>,
    pub situation: Option<String>,
    pub city: Option<String>,
    pub uf: Option<String>,
    /// Which provider answered (e.g. "brasilapi", "receitaws").
    pub source: String,
}

/// Compact description of an existing indication, for duplicate alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingIndication {
    pub id: Uuid,
    pub parceiro_id: Uuid,
    pub company_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the bot's duplicate check.
#[derive(Debug, Serialize)]
pub struct CnpjCheckResponse {
    pub message: ChatMessage,
    pub cnpj_data: CnpjData,
    pub duplicate: bool,
    pub can_create: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<ExistingIndication>,
}

/// Outcome of creating an indication from the bot flow.
#[derive(Debug, Serialize)]
pub struct CnpjCreateResponse {
    pub indication: Indication,
    pub message: ChatMessage,
}

/// Body for sending a chat message.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

/// Body for the bot's check step.
#[derive(Debug, Deserialize)]
pub struct CnpjCheckRequest {
    pub cnpj: String,
}

/// Body for the bot's create step. Carries the data from the check so the
/// indication can be created without a second registry round trip.
#[derive(Debug, Deserialize)]
pub struct CnpjCreateRequest {
    pub cnpj: String,
    pub cnpj_data: CnpjData,
}

/// Pagination for message listings.
#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_is_deterministic() {
        let id = Uuid::parse_str("a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8").unwrap();
        assert_eq!(
            WhatsAppInstance::name_for(id),
            "gerente_a1a2a3a4b1b2c1c2d1d2d3d4d5d6d7d8"
        );
        assert_eq!(WhatsAppInstance::name_for(id), WhatsAppInstance::name_for(id));
    }

    #[test]
    fn gateway_state_mapping() {
        assert_eq!(
            InstanceStatus::from_gateway_state("open"),
            Some(InstanceStatus::Connected)
        );
        assert_eq!(
            InstanceStatus::from_gateway_state("close"),
            Some(InstanceStatus::Disconnected)
        );
        assert_eq!(
            InstanceStatus::from_gateway_state("connecting"),
            Some(InstanceStatus::Connecting)
        );
        assert_eq!(InstanceStatus::from_gateway_state("refused"), None);
    }
}
