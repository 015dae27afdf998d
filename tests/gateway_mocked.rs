/// Integration tests with mocked external APIs
/// Tests the gateway client and CNPJ lookup fallback without hitting real services
use moka::future::Cache;
use rust_parceiros_api::config::Config;
use rust_parceiros_api::gateway_client::EvolutionClient;
use rust_parceiros_api::services::CnpjLookupService;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper function to create test config
fn create_test_config(primary_url: String, secondary_url: String) -> Config {
    Config {
        database_url: "postgresql://test".to_string(),
        port: 8080,
        evolution_base_url: "https://gateway.test".to_string(),
        evolution_api_key: "test_key".to_string(),
        webhook_secret: None,
        cnpj_primary_url: primary_url,
        cnpj_secondary_url: secondary_url,
    }
}

fn cnpj_cache() -> Cache<String, rust_parceiros_api::models::CnpjData> {
    Cache::builder()
        .time_to_live(Duration::from_secs(60))
        .max_capacity(100)
        .build()
}

#[tokio::test]
async fn test_send_text_returns_gateway_message_id() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/gerente_abc"))
        .and(header("apikey", "test_key"))
        .and(body_json(serde_json::json!({
            "number": "5511999990000@s.whatsapp.net",
            "text": "olá"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "key": {"remoteJid": "5511999990000@s.whatsapp.net", "fromMe": true, "id": "BAE5F5A632"},
            "status": "PENDING"
        })))
        .mount(&mock_server)
        .await;

    let client = EvolutionClient::new(mock_server.uri(), "test_key".to_string()).unwrap();
    let result = client
        .send_text("gerente_abc", "5511999990000@s.whatsapp.net", "olá")
        .await;

    assert_eq!(result.unwrap(), Some("BAE5F5A632".to_string()));
}

#[tokio::test]
async fn test_send_text_failure_carries_status_and_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/gerente_abc"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal gateway error"))
        .mount(&mock_server)
        .await;

    let client = EvolutionClient::new(mock_server.uri(), "test_key".to_string()).unwrap();
    let err = client
        .send_text("gerente_abc", "5511999990000@s.whatsapp.net", "olá")
        .await
        .unwrap_err();

    assert_eq!(err.status, Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
    assert!(err.body.contains("internal gateway error"));
}

#[tokio::test]
async fn test_send_text_unreachable_gateway_has_no_status() {
    // Port 9 is discard; nothing is listening there.
    let client =
        EvolutionClient::new("http://127.0.0.1:9".to_string(), "test_key".to_string()).unwrap();
    let err = client
        .send_text("gerente_abc", "5511999990000@s.whatsapp.net", "olá")
        .await
        .unwrap_err();

    assert_eq!(err.status, None);
}

#[tokio::test]
async fn test_create_instance_conflict_surfaces_403() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/instance/create"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "message": "This name is already in use."
        })))
        .mount(&mock_server)
        .await;

    let client = EvolutionClient::new(mock_server.uri(), "test_key".to_string()).unwrap();
    let err = client.create_instance("gerente_abc").await.unwrap_err();

    // The lifecycle manager treats this exact status as "already exists"
    assert_eq!(err.status, Some(reqwest::StatusCode::FORBIDDEN));
}

#[tokio::test]
async fn test_connection_state_parsing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/instance/connectionState/gerente_abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "instance": {"instanceName": "gerente_abc", "state": "open"}
        })))
        .mount(&mock_server)
        .await;

    let client = EvolutionClient::new(mock_server.uri(), "test_key".to_string()).unwrap();
    let state = client.connection_state("gerente_abc").await.unwrap();

    assert_eq!(state, "open");
}

#[tokio::test]
async fn test_connect_returns_qr_payload() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/instance/connect/gerente_abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "base64": "data:image/png;base64,abc123",
            "code": "2@abc"
        })))
        .mount(&mock_server)
        .await;

    let client = EvolutionClient::new(mock_server.uri(), "test_key".to_string()).unwrap();
    let data = client.connect("gerente_abc").await.unwrap();

    assert_eq!(
        data.get("base64").and_then(|v| v.as_str()),
        Some("data:image/png;base64,abc123")
    );
}

#[tokio::test]
async fn test_cnpj_lookup_primary_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/11222333000181"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "cnpj": "11222333000181",
            "razao_social": "ACME COMERCIO LTDA",
            "nome_fantasia": "ACME",
            "descricao_situacao_cadastral": "ATIVA",
            "municipio": "SAO PAULO",
            "uf": "SP"
        })))
        .mount(&mock_server)
        .await;

    let config = create_test_config(mock_server.uri(), "http://127.0.0.1:9".to_string());
    let service = CnpjLookupService::new(&config, cnpj_cache());

    let data = service.lookup("11222333000181").await.unwrap();
    assert_eq!(data.company_name, "ACME COMERCIO LTDA");
    assert_eq!(data.source, "brasilapi");
    assert_eq!(data.uf.as_deref(), Some("SP"));
}

#[tokio::test]
async fn test_cnpj_lookup_falls_back_to_secondary() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/11222333000181"))
        .respond_with(ResponseTemplate::new(500).set_body_string("unavailable"))
        .mount(&primary)
        .await;

    Mock::given(method("GET"))
        .and(path("/11222333000181"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "nome": "ACME COMERCIO LTDA",
            "fantasia": "ACME",
            "situacao": "ATIVA",
            "municipio": "SAO PAULO",
            "uf": "SP"
        })))
        .mount(&secondary)
        .await;

    let config = create_test_config(primary.uri(), secondary.uri());
    let service = CnpjLookupService::new(&config, cnpj_cache());

    let data = service.lookup("11222333000181").await.unwrap();
    assert_eq!(data.company_name, "ACME COMERCIO LTDA");
    assert_eq!(data.source, "receitaws");
}

#[tokio::test]
async fn test_cnpj_lookup_secondary_inline_error_is_failure() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&primary)
        .await;

    // ReceitaWS reports errors inside a 200 body
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ERROR",
            "message": "CNPJ inválido"
        })))
        .mount(&secondary)
        .await;

    let config = create_test_config(primary.uri(), secondary.uri());
    let service = CnpjLookupService::new(&config, cnpj_cache());

    let result = service.lookup("11222333000181").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cnpj_lookup_caches_responses() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/11222333000181"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "razao_social": "ACME COMERCIO LTDA"
        })))
        .expect(1) // second lookup must come from the cache
        .mount(&mock_server)
        .await;

    let config = create_test_config(mock_server.uri(), "http://127.0.0.1:9".to_string());
    let service = CnpjLookupService::new(&config, cnpj_cache());

    let first = service.lookup("11222333000181").await.unwrap();
    let second = service.lookup("11222333000181").await.unwrap();
    assert_eq!(first.company_name, second.company_name);
}
