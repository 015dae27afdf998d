use crate::errors::AppError;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

/// Failure talking to the WhatsApp gateway.
///
/// Carries the HTTP status (when a response arrived at all) and the raw
/// response body. Callers decide what is fatal: re-creating an existing
/// instance, for example, comes back as a 403 and is tolerated by the
/// lifecycle manager.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub status: Option<reqwest::StatusCode>,
    pub body: String,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "gateway returned {}: {}", status, self.body),
            None => write!(f, "gateway unreachable: {}", self.body),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError {
            status: err.status(),
            body: err.to_string(),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

/// Client for the Evolution-style WhatsApp gateway.
///
/// One method per gateway capability; each call is a single synchronous
/// round trip with no retries and no caching. Idempotency is the caller's
/// problem - gateway operations are not guaranteed idempotent.
#[derive(Clone)]
pub struct EvolutionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EvolutionClient {
    /// Creates a new `EvolutionClient`.
    ///
    /// The 10-second timeout bounds every gateway round trip so a hung
    /// gateway cannot hang a manager-facing request indefinitely.
    pub fn new(base_url: String, api_key: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create gateway client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(GatewayError {
                status: Some(status),
                body: text,
            });
        }

        if text.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| GatewayError {
            status: Some(status),
            body: format!("unparseable body ({}): {}", e, text),
        })
    }

    /// Registers an instance with the gateway.
    ///
    /// Re-creating an existing instance fails with 403; callers treat that
    /// as success.
    pub async fn create_instance(&self, instance_name: &str) -> Result<Value, GatewayError> {
        let url = format!("{}/instance/create", self.base_url);
        tracing::info!("Creating gateway instance {}", instance_name);

        let body = json!({
            "instanceName": instance_name,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Requests a connection, which typically yields a fresh QR payload or
    /// reports an already-open session.
    pub async fn connect(&self, instance_name: &str) -> Result<Value, GatewayError> {
        let url = format!("{}/instance/connect/{}", self.base_url, instance_name);
        tracing::info!("Requesting gateway connect for {}", instance_name);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Queries the live connection state. Returns the raw gateway state
    /// string (e.g. "open", "close", "connecting").
    pub async fn connection_state(&self, instance_name: &str) -> Result<String, GatewayError> {
        let url = format!(
            "{}/instance/connectionState/{}",
            self.base_url, instance_name
        );

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .send()
            .await?;

        let data = Self::parse_response(response).await?;
        let state = data
            .get("instance")
            .and_then(|i| i.get("state"))
            .and_then(|s| s.as_str())
            .or_else(|| data.get("state").and_then(|s| s.as_str()))
            .unwrap_or("")
            .to_string();

        Ok(state)
    }

    /// Sends a text message to a chat identifier. Returns the gateway
    /// message id when the response carries one.
    pub async fn send_text(
        &self,
        instance_name: &str,
        jid: &str,
        text: &str,
    ) -> Result<Option<String>, GatewayError> {
        let url = format!("{}/message/sendText/{}", self.base_url, instance_name);
        tracing::info!("Sending text via gateway instance {}", instance_name);

        let body = json!({
            "number": jid,
            "text": text,
        });

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let data = Self::parse_response(response).await?;
        let message_id = data
            .get("key")
            .and_then(|k| k.get("id"))
            .and_then(|i| i.as_str())
            .map(|s| s.to_string());

        Ok(message_id)
    }

    /// Logs the instance's WhatsApp session out.
    pub async fn logout(&self, instance_name: &str) -> Result<(), GatewayError> {
        let url = format!("{}/instance/logout/{}", self.base_url, instance_name);
        tracing::info!("Logging out gateway instance {}", instance_name);

        let response = self
            .client
            .delete(&url)
            .header("apikey", &self.api_key)
            .send()
            .await?;

        Self::parse_response(response).await?;
        Ok(())
    }

    /// Removes the instance from the gateway entirely.
    #[allow(dead_code)]
    pub async fn delete_instance(&self, instance_name: &str) -> Result<(), GatewayError> {
        let url = format!("{}/instance/delete/{}", self.base_url, instance_name);
        tracing::info!("Deleting gateway instance {}", instance_name);

        let response = self
            .client
            .delete(&url)
            .header("apikey", &self.api_key)
            .send()
            .await?;

        Self::parse_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        let client = EvolutionClient::new("https://example.com".to_string(), "key".to_string());
        assert!(client.is_ok());
    }

    #[test]
    fn gateway_error_display() {
        let err = GatewayError {
            status: Some(reqwest::StatusCode::FORBIDDEN),
            body: "instance already in use".to_string(),
        };
        assert!(err.to_string().contains("403"));

        let err = GatewayError {
            status: None,
            body: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("unreachable"));
    }
}
