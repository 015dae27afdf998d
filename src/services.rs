use crate::config::Config;
use crate::errors::AppError;
use crate::models::{AuthUser, CnpjData, Indication};
use moka::future::Cache;
use reqwest::Client;
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// CNPJ registry lookup with a plain two-provider fallback.
///
/// Tries the primary provider (BrasilAPI layout), then the secondary
/// (ReceitaWS layout), then fails. No circuit breaker and no backoff;
/// responses are cached for an hour to spare the public providers.
pub struct CnpjLookupService {
    client: Client,
    primary_url: String,
    secondary_url: String,
    cache: Cache<String, CnpjData>,
}

impl CnpjLookupService {
    pub fn new(config: &Config, cache: Cache<String, CnpjData>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            primary_url: config.cnpj_primary_url.clone(),
            secondary_url: config.cnpj_secondary_url.clone(),
            cache,
        }
    }

    /// Look up registry data for a bare-digit CNPJ.
    pub async fn lookup(&self, cnpj: &str) -> Result<CnpjData, AppError> {
        if let Some(cached) = self.cache.get(cnpj).await {
            tracing::debug!("CNPJ cache hit for {}", cnpj);
            return Ok(cached);
        }

        let data = match self.lookup_primary(cnpj).await {
            Ok(data) => data,
            Err(primary_err) => {
                tracing::warn!(
                    "Primary CNPJ provider failed for {}: {}, trying secondary",
                    cnpj,
                    primary_err
                );
                self.lookup_secondary(cnpj).await.map_err(|secondary_err| {
                    AppError::ExternalApiError(format!(
                        "CNPJ lookup failed on both providers: {} / {}",
                        primary_err, secondary_err
                    ))
                })?
            }
        };

        self.cache.insert(cnpj.to_string(), data.clone()).await;
        Ok(data)
    }

    async fn lookup_primary(&self, cnpj: &str) -> Result<CnpjData, AppError> {
        let url = format!("{}/{}", self.primary_url, cnpj);
        tracing::info!("Fetching CNPJ {} from primary provider", cnpj);

        let response = self.client.get(&url).send().await.map_err(|e| {
            AppError::ExternalApiError(format!("Primary CNPJ request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Primary CNPJ provider returned {}: {}",
                status, error_text
            )));
        }

        let data: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse primary CNPJ response: {}", e))
        })?;

        let company_name = data
            .get("razao_social")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::ExternalApiError("Primary CNPJ response missing razao_social".to_string())
            })?
            .to_string();

        Ok(CnpjData {
            cnpj: cnpj.to_string(),
            company_name,
            trade_name: json_str(&data, "nome_fantasia"),
            situation: json_str(&data, "descricao_situacao_cadastral"),
            city: json_str(&data, "municipio"),
            uf: json_str(&data, "uf"),
            source: "brasilapi".to_string(),
        })
    }

    async fn lookup_secondary(&self, cnpj: &str) -> Result<CnpjData, AppError> {
        let url = format!("{}/{}", self.secondary_url, cnpj);
        tracing::info!("Fetching CNPJ {} from secondary provider", cnpj);

        let response = self.client.get(&url).send().await.map_err(|e| {
            AppError::ExternalApiError(format!("Secondary CNPJ request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::ExternalApiError(format!(
                "Secondary CNPJ provider returned {}",
                status
            )));
        }

        let data: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse secondary CNPJ response: {}", e))
        })?;

        // ReceitaWS reports errors inside a 200 body
        if data.get("status").and_then(|v| v.as_str()) == Some("ERROR") {
            let message = json_str(&data, "message").unwrap_or_else(|| "unknown".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Secondary CNPJ provider error: {}",
                message
            )));
        }

        let company_name = data
            .get("nome")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::ExternalApiError("Secondary CNPJ response missing nome".to_string())
            })?
            .to_string();

        Ok(CnpjData {
            cnpj: cnpj.to_string(),
            company_name,
            trade_name: json_str(&data, "fantasia"),
            situation: json_str(&data, "situacao"),
            city: json_str(&data, "municipio"),
            uf: json_str(&data, "uf"),
            source: "receitaws".to_string(),
        })
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn json_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// User and role lookups against the CRM's users table.
pub struct UserService {
    pool: PgPool,
}

impl UserService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch a user by id. `None` when the id is unknown.
    pub async fn get(&self, user_id: Uuid) -> Result<Option<AuthUser>, AppError> {
        let user = sqlx::query_as::<_, AuthUser>(
            "SELECT id, name, role, gerente_id, phone, active FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Fetch a user by id, failing with Unauthorized when unknown.
    pub async fn require(&self, user_id: Uuid) -> Result<AuthUser, AppError> {
        self.get(user_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized(format!("Unknown user {}", user_id)))
    }

    /// Active parceiros managed by a gerente.
    pub async fn active_parceiros(&self, gerente_id: Uuid) -> Result<Vec<AuthUser>, AppError> {
        let parceiros = sqlx::query_as::<_, AuthUser>(
            "SELECT id, name, role, gerente_id, phone, active FROM users
             WHERE gerente_id = $1 AND role = 'parceiro' AND active = TRUE",
        )
        .bind(gerente_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(parceiros)
    }
}

/// Indication (referral) lookups and creation for the bot workflow.
pub struct IndicationService {
    pool: PgPool,
}

impl IndicationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find an existing non-lost indication with the given CNPJ digits.
    pub async fn find_open_by_cnpj(&self, cnpj: &str) -> Result<Option<Indication>, AppError> {
        let indication = sqlx::query_as::<_, Indication>(
            "SELECT id, parceiro_id, cnpj, company_name, status, created_at
             FROM indications
             WHERE regexp_replace(cnpj, '\\D', '', 'g') = $1 AND status <> 'perdida'
             ORDER BY created_at ASC
             LIMIT 1",
        )
        .bind(cnpj)
        .fetch_optional(&self.pool)
        .await?;

        Ok(indication)
    }

    /// Create a new indication owned by a parceiro.
    ///
    /// The partial unique index on open CNPJs is the duplicate guard: two
    /// concurrent creates both pass any prior duplicate query, and only the
    /// database can break that tie. The loser's unique violation becomes a
    /// `Conflict` carrying the winner's id.
    pub async fn create(
        &self,
        parceiro_id: Uuid,
        cnpj: &str,
        company_name: &str,
    ) -> Result<Indication, AppError> {
        let result = sqlx::query_as::<_, Indication>(
            "INSERT INTO indications (parceiro_id, cnpj, company_name, status)
             VALUES ($1, $2, $3, 'nova')
             RETURNING id, parceiro_id, cnpj, company_name, status, created_at",
        )
        .bind(parceiro_id)
        .bind(cnpj)
        .bind(company_name)
        .fetch_one(&self.pool)
        .await;

        let indication = match result {
            Ok(indication) => indication,
            Err(e) if is_unique_violation(&e) => {
                tracing::warn!("Concurrent indication creation for cnpj {}", cnpj);
                return match self.find_open_by_cnpj(cnpj).await? {
                    Some(existing) => Err(AppError::Conflict {
                        message: format!("An indication for CNPJ {} already exists", cnpj),
                        existing_id: existing.id,
                    }),
                    // The winner was closed before we could read it back.
                    None => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Indication {} created for parceiro {} (cnpj {})",
            indication.id,
            parceiro_id,
            cnpj
        );
        Ok(indication)
    }
}

/// Side-channel alerts into the CRM's notification feed.
pub struct NotificationService {
    pool: PgPool,
}

impl NotificationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Dispatch a notification to a user. Failures are the caller's call;
    /// the bot treats them as fatal since the alert is part of its contract.
    pub async fn notify(&self, user_id: Uuid, title: &str, body: &str) -> Result<(), AppError> {
        sqlx::query("INSERT INTO notifications (user_id, title, body) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(title)
            .bind(body)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Notification dispatched to {}: {}", user_id, title);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_str_filters_empty() {
        let data = json!({"a": "value", "b": "", "c": 42});
        assert_eq!(json_str(&data, "a"), Some("value".to_string()));
        assert_eq!(json_str(&data, "b"), None);
        assert_eq!(json_str(&data, "c"), None);
        assert_eq!(json_str(&data, "missing"), None);
    }
}
