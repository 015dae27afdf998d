use crate::errors::AppError;
use crate::gateway_client::EvolutionClient;
use crate::models::{
    AuthUser, ChatMessage, ConversationSummary, DeliveryChannel, InstanceStatus, Role,
    WhatsAppInstance,
};
use crate::phone::{normalize_phone, phone_to_jid};
use crate::services::UserService;
use sqlx::PgPool;
use uuid::Uuid;

/// Messages returned per page, oldest first.
const PAGE_SIZE: i64 = 50;

/// Resolve a conversation key from the caller's perspective and enforce
/// that the caller is one of its two parties.
///
/// A gerente reaches any of their own active parceiros; a parceiro reaches
/// only their own conversation with their gerente. Everything else is an
/// authorization failure, not a not-found.
pub async fn resolve_conversation(
    users: &UserService,
    caller: &AuthUser,
    parceiro_id: Uuid,
) -> Result<(Uuid, AuthUser), AppError> {
    match caller.role {
        Role::Gerente => {
            let parceiro = users
                .get(parceiro_id)
                .await?
                .filter(|u| u.role == Role::Parceiro)
                .ok_or_else(|| AppError::NotFound(format!("Parceiro {} not found", parceiro_id)))?;

            if parceiro.gerente_id != Some(caller.id) {
                return Err(AppError::Forbidden(
                    "Parceiro belongs to another gerente".to_string(),
                ));
            }

            Ok((caller.id, parceiro))
        }
        Role::Parceiro => {
            if caller.id != parceiro_id {
                return Err(AppError::Forbidden(
                    "Parceiros only access their own conversation".to_string(),
                ));
            }

            let gerente_id = caller.gerente_id.ok_or_else(|| {
                AppError::Forbidden("Parceiro has no gerente assigned".to_string())
            })?;

            Ok((gerente_id, caller.clone()))
        }
    }
}

/// Owns the conversation log between gerentes and parceiros.
pub struct ChatService {
    pool: PgPool,
    gateway: EvolutionClient,
}

impl ChatService {
    pub fn new(pool: PgPool, gateway: EvolutionClient) -> Self {
        Self { pool, gateway }
    }

    /// Conversation summaries for the caller's inbox.
    pub async fn list_conversations(
        &self,
        caller: &AuthUser,
    ) -> Result<Vec<ConversationSummary>, AppError> {
        match caller.role {
            Role::Gerente => {
                let summaries = sqlx::query_as::<_, ConversationSummary>(
                    "SELECT $1::uuid AS gerente_id, u.id AS parceiro_id, u.name,
                            COALESCE(m.unread, 0) AS unread, m.last_message_at
                     FROM users u
                     LEFT JOIN (
                         SELECT parceiro_id,
                                COUNT(*) FILTER (WHERE read = FALSE AND sender_id <> $1) AS unread,
                                MAX(created_at) AS last_message_at
                         FROM chat_messages
                         WHERE gerente_id = $1
                         GROUP BY parceiro_id
                     ) m ON m.parceiro_id = u.id
                     WHERE u.gerente_id = $1 AND u.role = 'parceiro' AND u.active = TRUE
                     ORDER BY m.last_message_at DESC NULLS LAST, u.name ASC",
                )
                .bind(caller.id)
                .fetch_all(&self.pool)
                .await?;

                Ok(summaries)
            }
            Role::Parceiro => {
                let Some(gerente_id) = caller.gerente_id else {
                    return Ok(Vec::new());
                };

                let summary = sqlx::query_as::<_, ConversationSummary>(
                    "SELECT $1::uuid AS gerente_id, $2::uuid AS parceiro_id, g.name,
                            COALESCE(m.unread, 0) AS unread, m.last_message_at
                     FROM users g
                     LEFT JOIN (
                         SELECT COUNT(*) FILTER (WHERE read = FALSE AND sender_id <> $2) AS unread,
                                MAX(created_at) AS last_message_at
                         FROM chat_messages
                         WHERE gerente_id = $1 AND parceiro_id = $2
                     ) m ON TRUE
                     WHERE g.id = $1",
                )
                .bind(gerente_id)
                .bind(caller.id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(summary.into_iter().collect())
            }
        }
    }

    /// Messages of one conversation, oldest first, 50 per page.
    ///
    /// Side effect: when the gerente opens the chat, everything not
    /// authored by them is marked read. There is no separate ack call.
    pub async fn list_messages(
        &self,
        caller: &AuthUser,
        parceiro_id: Uuid,
        page: Option<i64>,
    ) -> Result<Vec<ChatMessage>, AppError> {
        let users = UserService::new(self.pool.clone());
        let (gerente_id, parceiro) = resolve_conversation(&users, caller, parceiro_id).await?;

        if caller.role == Role::Gerente {
            sqlx::query(
                "UPDATE chat_messages SET read = TRUE
                 WHERE gerente_id = $1 AND parceiro_id = $2 AND sender_id <> $3 AND read = FALSE",
            )
            .bind(gerente_id)
            .bind(parceiro.id)
            .bind(caller.id)
            .execute(&self.pool)
            .await?;
        }

        let page = page.unwrap_or(1).max(1);
        let messages = sqlx::query_as::<_, ChatMessage>(
            "SELECT id, gerente_id, parceiro_id, sender_id, sender_kind, kind, body, payload,
                    channel, gateway_message_id, read, created_at
             FROM chat_messages
             WHERE gerente_id = $1 AND parceiro_id = $2
             ORDER BY created_at ASC
             LIMIT $3 OFFSET $4",
        )
        .bind(gerente_id)
        .bind(parceiro.id)
        .bind(PAGE_SIZE)
        .bind((page - 1) * PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    /// Send a text message into a conversation.
    ///
    /// Only the gerente half sends through this service. When their
    /// instance is connected and the parceiro has a phone, the text is
    /// relayed through the gateway; on any gateway failure, or when either
    /// precondition is missing, the message is stored CRM-only instead.
    /// The user-visible send never fails because WhatsApp is down - the
    /// channel field is the only signal of degraded delivery.
    pub async fn send_message(
        &self,
        caller: &AuthUser,
        parceiro_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage, AppError> {
        if caller.role != Role::Gerente {
            return Err(AppError::Forbidden(
                "Only the gerente sends messages through this endpoint".to_string(),
            ));
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::BadRequest("Message text cannot be empty".to_string()));
        }

        let users = UserService::new(self.pool.clone());
        let (gerente_id, parceiro) = resolve_conversation(&users, caller, parceiro_id).await?;

        let channel = self.try_relay(gerente_id, &parceiro, text).await;

        let message = sqlx::query_as::<_, ChatMessage>(
            "INSERT INTO chat_messages
                 (gerente_id, parceiro_id, sender_id, sender_kind, kind, body, channel)
             VALUES ($1, $2, $3, 'user', 'text', $4, $5)
             RETURNING id, gerente_id, parceiro_id, sender_id, sender_kind, kind, body, payload,
                       channel, gateway_message_id, read, created_at",
        )
        .bind(gerente_id)
        .bind(parceiro.id)
        .bind(caller.id)
        .bind(text)
        .bind(channel)
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }

    /// Attempt the gateway relay; decide the delivery channel.
    async fn try_relay(
        &self,
        gerente_id: Uuid,
        parceiro: &AuthUser,
        text: &str,
    ) -> DeliveryChannel {
        let Some(phone) = parceiro
            .phone
            .as_deref()
            .map(normalize_phone)
            .filter(|p| !p.is_empty())
        else {
            tracing::debug!("Parceiro {} has no phone, storing CRM-only", parceiro.id);
            return DeliveryChannel::CrmOnly;
        };

        let instance = match self.fetch_connected_instance(gerente_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                tracing::debug!(
                    "No connected instance for gerente {}, storing CRM-only",
                    gerente_id
                );
                return DeliveryChannel::CrmOnly;
            }
            Err(e) => {
                tracing::error!("Instance lookup failed, storing CRM-only: {}", e);
                return DeliveryChannel::CrmOnly;
            }
        };

        match self
            .gateway
            .send_text(&instance.instance_name, &phone_to_jid(&phone), text)
            .await
        {
            Ok(_) => DeliveryChannel::CrmRelayed,
            Err(e) => {
                tracing::warn!(
                    "Gateway send failed for {}, falling back to CRM-only: {}",
                    instance.instance_name,
                    e
                );
                DeliveryChannel::CrmOnly
            }
        }
    }

    async fn fetch_connected_instance(
        &self,
        gerente_id: Uuid,
    ) -> Result<Option<WhatsAppInstance>, AppError> {
        let instance = sqlx::query_as::<_, WhatsAppInstance>(
            "SELECT gerente_id, instance_name, status, qr_code, qr_expires_at, phone, updated_at
             FROM whatsapp_instances WHERE gerente_id = $1",
        )
        .bind(gerente_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(instance.filter(|i| i.status == InstanceStatus::Connected))
    }
}
