use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub evolution_base_url: String,
    pub evolution_api_key: String,
    pub webhook_secret: Option<String>,
    pub cnpj_primary_url: String,
    pub cnpj_secondary_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            evolution_base_url: std::env::var("EVOLUTION_BASE_URL")
                .map_err(|_| anyhow::anyhow!("EVOLUTION_BASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("EVOLUTION_BASE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("EVOLUTION_BASE_URL must start with http:// or https://");
                    }
                    Ok(url.trim_end_matches('/').to_string())
                })?,
            evolution_api_key: std::env::var("EVOLUTION_API_KEY")
                .map_err(|_| anyhow::anyhow!("EVOLUTION_API_KEY environment variable required"))
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("EVOLUTION_API_KEY cannot be empty");
                    }
                    Ok(key)
                })?,
            webhook_secret: std::env::var("WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            cnpj_primary_url: std::env::var("CNPJ_PRIMARY_URL")
                .unwrap_or_else(|_| "https://brasilapi.com.br/api/cnpj/v1".to_string()),
            cnpj_secondary_url: std::env::var("CNPJ_SECONDARY_URL")
                .unwrap_or_else(|_| "https://receitaws.com.br/v1/cnpj".to_string()),
        };

        if config.webhook_secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET not set - webhook authentication is DISABLED");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Evolution Base URL: {}", config.evolution_base_url);
        tracing::debug!("CNPJ primary provider: {}", config.cnpj_primary_url);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}
