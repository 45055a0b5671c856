//! Integration tests for the Identity Center flows against a mock OIDC
//! service.

use std::time::Duration;
use wharf_federation::prelude::*;
use wharf_federation::FederationPlugin;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ACCOUNT: &str = "123456789012";
const ROLE_NAME: &str = "db-role";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn device_config(server: &MockServer) -> PluginConfig {
    init_tracing();
    let mut config = PluginConfig::new();
    config.set(keys::PLUGIN, "device-idc");
    config.set(keys::IDC_HOST, &server.uri());
    config.set(keys::IDC_REGION, "us-east-1");
    config.set(keys::START_URL, "https://portal.example.com/start");
    config.set(keys::ACCOUNT_ID, ACCOUNT);
    config.set(keys::ROLE_NAME, ROLE_NAME);
    config
}

async fn mount_registration(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/client/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "clientId": "client-1",
            "clientSecret": "client-secret",
            "clientSecretExpiresAt": 4102444800i64,
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_device_authorization(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/device_authorization"))
        .and(body_partial_json(serde_json::json!({
            "clientId": "client-1",
            "startUrl": "https://portal.example.com/start",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "deviceCode": "device-1",
            "userCode": "WDJB-MJHT",
            "verificationUri": "https://portal.example.com/verify",
            "verificationUriComplete": "https://portal.example.com/verify?code=WDJB-MJHT",
            "expiresIn": 600,
            "interval": 1,
        })))
        .mount(server)
        .await;
}

async fn mount_role_credentials(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/federation/credentials"))
        .and(query_param("account_id", ACCOUNT))
        .and(query_param("role_name", ROLE_NAME))
        .and(wiremock::matchers::header("authorization", "Bearer access-token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "roleCredentials": {
                "accessKeyId": "AKIDIDC",
                "secretAccessKey": "secret",
                "sessionToken": "session",
                "expiration": 4102444800000i64,
            }
        })))
        .mount(server)
        .await;
}

fn token_ready_body() -> serde_json::Value {
    serde_json::json!({
        "accessToken": "access-token-1",
        "expiresIn": 3600,
    })
}

#[tokio::test]
async fn device_flow_polls_until_the_user_confirms() {
    let server = MockServer::start().await;
    mount_registration(&server, 1).await;
    mount_device_authorization(&server).await;
    // First poll is pending, second succeeds.
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({"error": "authorization_pending"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_partial_json(serde_json::json!({
            "grantType": "urn:ietf:params:oauth:grant-type:device_code",
            "deviceCode": "device-1",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_ready_body()))
        .mount(&server)
        .await;
    mount_role_credentials(&server).await;

    let caches = FederationCaches::new();
    let plugin =
        FederationPlugin::from_config(device_config(&server), &caches, None).unwrap();

    let holder = plugin.credentials().await.unwrap();
    match holder.credential {
        Credential::Session { access_key_id, .. } => assert_eq!(access_key_id, "AKIDIDC"),
        Credential::Database { .. } => panic!("expected a session credential"),
    }
}

#[tokio::test]
async fn device_flow_times_out_when_authorization_never_completes() {
    let server = MockServer::start().await;
    mount_registration(&server, 1).await;
    mount_device_authorization(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({"error": "authorization_pending"})),
        )
        .mount(&server)
        .await;

    let caches = FederationCaches::new();
    let mut config = device_config(&server);
    config.set(keys::IDP_RESPONSE_TIMEOUT, "2");
    let plugin = FederationPlugin::from_config(config, &caches, None).unwrap();

    let err = plugin.credentials().await.unwrap_err();
    assert!(matches!(err, FederationError::Timeout(_)));
}

#[tokio::test]
async fn declined_authorization_is_fatal() {
    let server = MockServer::start().await;
    mount_registration(&server, 1).await;
    mount_device_authorization(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({"error": "access_denied"})),
        )
        .mount(&server)
        .await;

    let caches = FederationCaches::new();
    let plugin =
        FederationPlugin::from_config(device_config(&server), &caches, None).unwrap();

    let err = plugin.credentials().await.unwrap_err();
    assert!(matches!(err, FederationError::AccessDenied(_)));
}

#[tokio::test]
async fn client_registration_is_reused_across_instances() {
    let server = MockServer::start().await;
    mount_registration(&server, 1).await;
    mount_device_authorization(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_ready_body()))
        .mount(&server)
        .await;
    mount_role_credentials(&server).await;

    let caches = FederationCaches::new();
    let first =
        FederationPlugin::from_config(device_config(&server), &caches, None).unwrap();
    first.credentials().await.unwrap();

    // Same registration key, so the cached client is used without a second
    // registration call (enforced by expect(1) on the mock).
    let mut config = device_config(&server);
    config.set(keys::DISABLE_CACHE, "true");
    let second = FederationPlugin::from_config(config, &caches, None).unwrap();
    second.credentials().await.unwrap();
}

#[tokio::test]
async fn auth_token_is_served_from_the_instance_slot() {
    let server = MockServer::start().await;
    mount_registration(&server, 1).await;
    mount_device_authorization(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_ready_body()))
        .expect(1)
        .mount(&server)
        .await;

    let caches = FederationCaches::new();
    let plugin =
        FederationPlugin::from_config(device_config(&server), &caches, None).unwrap();

    let first = plugin.auth_token().await.unwrap();
    assert!(!first.from_cache);
    let second = plugin.auth_token().await.unwrap();
    assert!(second.from_cache);
}

#[tokio::test]
async fn browser_flow_rejects_a_state_mismatch() {
    let server = MockServer::start().await;
    mount_registration(&server, 1).await;

    let listen_port = 43219;
    let mut config = PluginConfig::new();
    config.set(keys::PLUGIN, "browser-idc");
    config.set(keys::IDC_HOST, &server.uri());
    config.set(keys::IDC_REGION, "us-east-1");
    config.set(keys::ISSUER_URL, "https://idp.example.com");
    config.set(keys::ACCOUNT_ID, ACCOUNT);
    config.set(keys::ROLE_NAME, ROLE_NAME);
    config.set(keys::LISTEN_PORT, &listen_port.to_string());
    config.set(keys::IDP_RESPONSE_TIMEOUT, "10");

    let caches = FederationCaches::new();
    let plugin = FederationPlugin::from_config(config, &caches, None).unwrap();

    // Deliver a callback carrying the wrong CSRF state once the listener is
    // up; retry until the port answers.
    let forged = tokio::spawn(async move {
        let url = format!(
            "http://127.0.0.1:{listen_port}/wharf/callback?code=auth-code&state=forged"
        );
        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client.get(&url).send().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("listener never accepted the forged callback");
    });

    let err = plugin.auth_token().await.unwrap_err();
    assert!(matches!(err, FederationError::CsrfMismatch));
    forged.await.unwrap();
}
