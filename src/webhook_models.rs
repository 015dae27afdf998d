use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event envelope pushed by the WhatsApp gateway.
///
/// The `data` shape depends on `event`; each handler deserializes it into
/// the matching typed struct below. Unknown events are accepted and
/// ignored so the gateway's retry loop never backs up.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEnvelope {
    /// Event kind, e.g. "connection.update", "qrcode.updated",
    /// "messages.upsert".
    pub event: String,

    /// Gateway instance name the event belongs to.
    pub instance: String,

    /// Event-specific payload.
    #[serde(default)]
    pub data: Value,

    /// JID of the account the instance is connected as, when the gateway
    /// includes it.
    #[serde(default)]
    pub sender: Option<String>,
}

/// Payload of a "connection.update" event.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionUpdateData {
    /// Gateway-reported state ("open", "close", "connecting", ...).
    #[serde(default)]
    pub state: Option<String>,

    /// JID of the connected account, when present.
    #[serde(default)]
    pub wuid: Option<String>,
}

/// Payload of a "qrcode.updated" event.
#[derive(Debug, Clone, Deserialize)]
pub struct QrCodeUpdateData {
    #[serde(default)]
    pub qrcode: Option<QrCodePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QrCodePayload {
    #[serde(default)]
    pub base64: Option<String>,
}

/// Payload of a "messages.upsert" event - single message or batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessagesUpsertData {
    Single(EventMessage),
    Batch(Vec<EventMessage>),
}

impl MessagesUpsertData {
    /// Convert to a vec of messages for uniform processing.
    pub fn into_messages(self) -> Vec<EventMessage> {
        match self {
            MessagesUpsertData::Single(message) => vec![message],
            MessagesUpsertData::Batch(messages) => messages,
        }
    }
}

/// One inbound message as the gateway reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub key: MessageKey,

    #[serde(default)]
    pub message: Option<MessageContent>,

    /// Display name of the sender, as WhatsApp knows it.
    #[serde(default, rename = "pushName")]
    pub push_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageKey {
    /// Chat identifier the message arrived on.
    #[serde(rename = "remoteJid")]
    pub remote_jid: String,

    /// True when the instance's own account authored the message.
    #[serde(default, rename = "fromMe")]
    pub from_me: bool,

    /// Gateway-assigned message id; our idempotency key.
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageContent {
    /// Plain text body.
    #[serde(default)]
    pub conversation: Option<String>,

    /// Quoted/extended text body.
    #[serde(default, rename = "extendedTextMessage")]
    pub extended_text: Option<ExtendedText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
}

impl EventMessage {
    /// The message's text body, whichever field carries it.
    pub fn text(&self) -> Option<&str> {
        let content = self.message.as_ref()?;
        content
            .conversation
            .as_deref()
            .or_else(|| content.extended_text.as_ref().and_then(|e| e.text.as_deref()))
            .filter(|s| !s.trim().is_empty())
    }
}

/// Why an inbound message was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Authored by the instance's own account.
    SelfAuthored,
    /// Group or broadcast chat; only direct chats are bridged.
    GroupOrBroadcast,
    /// No usable text body.
    EmptyBody,
}

/// Pure skip decision for one inbound message. Dedup against already-stored
/// gateway message ids happens at insert time via the unique constraint,
/// not here.
pub fn skip_reason(message: &EventMessage) -> Option<SkipReason> {
    if message.key.from_me {
        return Some(SkipReason::SelfAuthored);
    }
    if message.key.remote_jid.ends_with("@g.us") || message.key.remote_jid.contains("@broadcast") {
        return Some(SkipReason::GroupOrBroadcast);
    }
    if message.text().is_none() {
        return Some(SkipReason::EmptyBody);
    }
    None
}

/// Response sent back to the gateway.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: String,
    pub received: usize,
    pub processed: usize,
    pub skipped: usize,
}
