//! HTTP API tests against a live server on an ephemeral port.

use async_trait::async_trait;
use base64::Engine;
use kbchat::identity::SessionKeys;
use kbchat::server::{router, AppState};
use kbchat::service::{ChatService, Components};
use kbchat_core::embedding::HashEmbedder;
use kbchat_core::history::memory::InMemoryChatLog;
use kbchat_core::llm::{ChatModel, CompletionRequest};
use kbchat_core::prompt::CONTEXTUALIZE_SYSTEM_PROMPT;
use kbchat_core::store::memory::InMemoryBackend;
use kbchat_core::{Result, UserId};
use serde_json::{json, Value};
use std::sync::Arc;

const SECRET: &str = "server-test-secret-0123456789";

/// Echoes the question when reformulating; answers by quoting the context.
struct QuotingModel;

#[async_trait]
impl ChatModel for QuotingModel {
    fn model_name(&self) -> &str {
        "quoting"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        if request.system == CONTEXTUALIZE_SYSTEM_PROMPT {
            return Ok(request.input.clone());
        }
        let context = request
            .system
            .split_once("Context:\n")
            .map(|(_, c)| c.trim())
            .unwrap_or_default();
        if context.is_empty() {
            Ok("I don't know.".to_string())
        } else {
            Ok(format!("From your documents: {}", context))
        }
    }
}

/// Serve the router on 127.0.0.1:0 and return its base URL.
async fn start_server() -> (String, SessionKeys) {
    let mut components = Components::new(
        Arc::new(InMemoryChatLog::new()),
        Arc::new(InMemoryBackend::new()),
        Arc::new(HashEmbedder::new(4096)),
        Arc::new(QuotingModel),
    );
    components.top_k = 1;
    let keys = SessionKeys::new(SECRET).unwrap();
    let state = AppState {
        service: Arc::new(ChatService::new(components)),
        keys: keys.clone(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    (format!("http://{}", addr), keys)
}

fn bearer(keys: &SessionKeys, user: &str) -> String {
    format!("Bearer {}", keys.issue(&UserId::parse(user).unwrap()))
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let (base, _) = start_server().await;
    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_requests_without_valid_token_are_rejected() {
    let (base, _) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/chat", base))
        .json(&json!({ "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    let forged = SessionKeys::new("some-other-secret-0123456789").unwrap();
    let resp = client
        .get(format!("{}/history", base))
        .header("Authorization", bearer(&forged, "42"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_ingest_chat_and_history_flow() {
    let (base, keys) = start_server().await;
    let client = reqwest::Client::new();
    let auth = bearer(&keys, "42");

    let content = base64::engine::general_purpose::STANDARD
        .encode("# Alpha\n\nAlpha particles are helium nuclei.");
    let resp = client
        .post(format!("{}/ingest/document", base))
        .header("Authorization", &auth)
        .json(&json!({ "name": "alpha.md", "content_base64": content }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["chunks"], 1);

    let resp = client
        .post(format!("{}/chat", base))
        .header("Authorization", &auth)
        .json(&json!({ "message": "What is Alpha?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["standalone_question"], "What is Alpha?");
    assert_eq!(body["grounded"], true);
    assert_eq!(body["sources"], json!(["alpha.md"]));
    assert!(body["response"]
        .as_str()
        .unwrap()
        .contains("Alpha particles are helium nuclei."));

    let resp = client
        .get(format!("{}/history", base))
        .header("Authorization", &auth)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["sender"], "user");
    assert_eq!(messages[0]["text"], "What is Alpha?");
    assert_eq!(messages[1]["sender"], "bot");

    // Another user shares neither history nor documents.
    let other = bearer(&keys, "43");
    let resp = client
        .post(format!("{}/chat", base))
        .header("Authorization", &other)
        .json(&json!({ "message": "What is Alpha?" }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["grounded"], false);
    assert_eq!(body["response"], "I don't know.");

    let resp = client
        .delete(format!("{}/history", base))
        .header("Authorization", &auth)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["sender"], "bot");
    assert_eq!(messages[0]["order"], 1);
}

#[tokio::test]
async fn test_bad_input_maps_to_400() {
    let (base, keys) = start_server().await;
    let client = reqwest::Client::new();
    let auth = bearer(&keys, "42");

    let resp = client
        .post(format!("{}/chat", base))
        .header("Authorization", &auth)
        .json(&json!({ "message": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(body["error"]["retryable"], false);

    let resp = client
        .post(format!("{}/ingest/url", base))
        .header("Authorization", &auth)
        .json(&json!({ "url": "ftp://example.com" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/ingest/document", base))
        .header("Authorization", &auth)
        .json(&json!({ "name": "notes.docx", "content_base64": "aGVsbG8=" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/ingest/document", base))
        .header("Authorization", &auth)
        .json(&json!({ "name": "notes.md", "content_base64": "!!not base64!!" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_disabled_extraction_maps_to_503() {
    let (base, keys) = start_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/ingest/url", base))
        .header("Authorization", bearer(&keys, "42"))
        .json(&json!({ "url": "https://example.com/page" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "provider_unavailable");
    assert_eq!(body["error"]["retryable"], true);
}
