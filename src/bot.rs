//! Chat-embedded CNPJ bot.
//!
//! Looks a company up in the public registry, warns when an open
//! indication already carries that CNPJ, and can create the indication
//! straight from the chat. Bot output lands in the same message log as
//! regular chat so the transcript stays unified.

use crate::chat::resolve_conversation;
use crate::errors::AppError;
use crate::models::{
    AuthUser, ChatMessage, CnpjCheckResponse, CnpjCreateResponse, CnpjData, ExistingIndication,
    MessageKind,
};
use crate::services::{CnpjLookupService, IndicationService, NotificationService, UserService};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

const CNPJ_DIGITS: usize = 14;

/// Reduce a formatted CNPJ to bare digits; `None` when the shape is wrong.
pub fn clean_cnpj(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() == CNPJ_DIGITS).then_some(digits)
}

pub struct BotService {
    pool: PgPool,
    cnpj_lookup: CnpjLookupService,
}

impl BotService {
    pub fn new(pool: PgPool, cnpj_lookup: CnpjLookupService) -> Self {
        Self { pool, cnpj_lookup }
    }

    /// Step 1: look the CNPJ up and check for an open duplicate.
    ///
    /// A malformed CNPJ is a caller error with no side effects. A failed
    /// registry lookup still leaves a bot message in the chat before the
    /// failure is surfaced. A duplicate produces an alert message plus a
    /// notification to the gerente and reports `can_create = false`.
    pub async fn check(
        &self,
        caller: &AuthUser,
        parceiro_id: Uuid,
        cnpj_raw: &str,
    ) -> Result<CnpjCheckResponse, AppError> {
        let cnpj = clean_cnpj(cnpj_raw)
            .ok_or_else(|| AppError::BadRequest("CNPJ must have exactly 14 digits".to_string()))?;

        let users = UserService::new(self.pool.clone());
        let (gerente_id, parceiro) = resolve_conversation(&users, caller, parceiro_id).await?;

        let data = match self.cnpj_lookup.lookup(&cnpj).await {
            Ok(data) => data,
            Err(e) => {
                self.append_bot_message(
                    gerente_id,
                    parceiro.id,
                    MessageKind::Text,
                    &format!("Não foi possível consultar o CNPJ {}. Tente novamente.", cnpj),
                    None,
                )
                .await?;
                return Err(e);
            }
        };

        let indications = IndicationService::new(self.pool.clone());
        if let Some(existing) = indications.find_open_by_cnpj(&cnpj).await? {
            let existing = ExistingIndication {
                id: existing.id,
                parceiro_id: existing.parceiro_id,
                company_name: existing.company_name,
                status: existing.status,
                created_at: existing.created_at,
            };

            let body = format!(
                "CNPJ {} já possui uma indicação em andamento ({}, status: {}).",
                cnpj, existing.company_name, existing.status
            );
            let payload = json!({ "cnpj_data": data, "existing": existing });
            let message = self
                .append_bot_message(
                    gerente_id,
                    parceiro.id,
                    MessageKind::CnpjDuplicateAlert,
                    &body,
                    Some(payload),
                )
                .await?;

            NotificationService::new(self.pool.clone())
                .notify(
                    gerente_id,
                    "Indicação duplicada detectada",
                    &format!(
                        "O parceiro {} consultou o CNPJ {} que já possui indicação aberta.",
                        parceiro.name, cnpj
                    ),
                )
                .await?;

            return Ok(CnpjCheckResponse {
                message,
                cnpj_data: data,
                duplicate: true,
                can_create: false,
                existing: Some(existing),
            });
        }

        let body = format!(
            "{} ({}) consultado com sucesso. Nenhuma indicação aberta para este CNPJ.",
            data.company_name, cnpj
        );
        let message = self
            .append_bot_message(
                gerente_id,
                parceiro.id,
                MessageKind::CnpjLookupResult,
                &body,
                Some(json!({ "cnpj_data": data })),
            )
            .await?;

        Ok(CnpjCheckResponse {
            message,
            cnpj_data: data,
            duplicate: false,
            can_create: true,
            existing: None,
        })
    }

    /// Step 2: create the indication the check cleared.
    ///
    /// Re-runs the duplicate query first so a late duplicate fails before
    /// any bot message is written. Steps 1 and 2 are separate client calls
    /// and even this second query can race a concurrent create, so the
    /// real guard is the unique index on open CNPJs: either path yields a
    /// conflict carrying the existing id, never a silent second indication.
    pub async fn create_from_check(
        &self,
        caller: &AuthUser,
        parceiro_id: Uuid,
        cnpj_raw: &str,
        data: CnpjData,
    ) -> Result<CnpjCreateResponse, AppError> {
        let cnpj = clean_cnpj(cnpj_raw)
            .ok_or_else(|| AppError::BadRequest("CNPJ must have exactly 14 digits".to_string()))?;

        let users = UserService::new(self.pool.clone());
        let (gerente_id, parceiro) = resolve_conversation(&users, caller, parceiro_id).await?;

        let indications = IndicationService::new(self.pool.clone());
        if let Some(existing) = indications.find_open_by_cnpj(&cnpj).await? {
            tracing::warn!(
                "Indication for CNPJ {} appeared between check and create (existing {})",
                cnpj,
                existing.id
            );
            return Err(AppError::Conflict {
                message: format!("An indication for CNPJ {} already exists", cnpj),
                existing_id: existing.id,
            });
        }

        let indication = indications
            .create(parceiro.id, &cnpj, &data.company_name)
            .await?;

        let body = format!(
            "Indicação criada para {} (CNPJ {}).",
            indication.company_name, cnpj
        );
        let message = self
            .append_bot_message(
                gerente_id,
                parceiro.id,
                MessageKind::IndicationCreated,
                &body,
                Some(json!({ "indication": indication })),
            )
            .await?;

        NotificationService::new(self.pool.clone())
            .notify(
                gerente_id,
                "Nova indicação criada",
                &format!(
                    "Indicação para {} (CNPJ {}) criada na conversa com {}.",
                    indication.company_name, cnpj, parceiro.name
                ),
            )
            .await?;

        Ok(CnpjCreateResponse {
            indication,
            message,
        })
    }

    /// Append a synthetic bot message to the conversation. Bot messages are
    /// CRM-only and attributed to the gerente half of the conversation.
    async fn append_bot_message(
        &self,
        gerente_id: Uuid,
        parceiro_id: Uuid,
        kind: MessageKind,
        body: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<ChatMessage, AppError> {
        let message = sqlx::query_as::<_, ChatMessage>(
            "INSERT INTO chat_messages
                 (gerente_id, parceiro_id, sender_id, sender_kind, kind, body, payload, channel)
             VALUES ($1, $2, $3, 'bot', $4, $5, $6, 'crm_only')
             RETURNING id, gerente_id, parceiro_id, sender_id, sender_kind, kind, body, payload,
                       channel, gateway_message_id, read, created_at",
        )
        .bind(gerente_id)
        .bind(parceiro_id)
        .bind(gerente_id)
        .bind(kind)
        .bind(body)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_formatted_cnpj() {
        assert_eq!(
            clean_cnpj("11.222.333/0001-81"),
            Some("11222333000181".to_string())
        );
        assert_eq!(clean_cnpj("11222333000181"), Some("11222333000181".to_string()));
    }

    #[test]
    fn rejects_wrong_digit_counts() {
        assert_eq!(clean_cnpj(""), None);
        assert_eq!(clean_cnpj("1122233300018"), None);
        assert_eq!(clean_cnpj("112223330001811"), None);
        assert_eq!(clean_cnpj("12345678901"), None); // CPF, not CNPJ
    }
}
