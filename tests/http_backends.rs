//! Integration tests for the HTTP provider backends.
//!
//! Each test points a backend at a `wiremock` server and checks how the
//! response is parsed or classified:
//! - 200 bodies for both wire formats
//! - 429 / 401 / 5xx / 400 content-policy classification
//! - client-side timeouts
//! - credential rotation through the gateway on a real HTTP failure

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use critique_orchestrator::credentials::{ApiKey, BackoffPolicy, CredentialPool, CredentialPools};
use critique_orchestrator::gateway::{
    AnthropicBackend, BackendRequest, FailureKind, OpenAiCompatibleBackend, ProviderBackend,
    ProviderGateway,
};
use critique_orchestrator::OrchestratorError;

// ============================================================================
// Helpers
// ============================================================================

fn request(provider: &str, model_id: &str, key: &str) -> BackendRequest {
    BackendRequest {
        provider: provider.to_string(),
        model_id: model_id.to_string(),
        prompt: "Explain borrow checking".to_string(),
        api_key: ApiKey::new(key),
        timeout: Duration::from_secs(5),
    }
}

fn chat_body(text: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42 }
    })
}

fn messages_body(parts: &[&str]) -> serde_json::Value {
    let content: Vec<_> = parts
        .iter()
        .map(|t| json!({ "type": "text", "text": t }))
        .collect();
    json!({
        "id": "msg_1",
        "content": content,
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 10, "output_tokens": 15 }
    })
}

async fn openai_at(server: &MockServer) -> OpenAiCompatibleBackend {
    OpenAiCompatibleBackend::new().with_base_url(format!("{}/", server.uri()))
}

// ============================================================================
// OpenAI-compatible
// ============================================================================

#[tokio::test]
async fn test_openai_success_parses_text_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({ "model": "gpt-4o" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("Ownership rules.")))
        .expect(1)
        .mount(&server)
        .await;

    let backend = openai_at(&server).await;
    let generation = backend
        .generate(&request("openai", "gpt-4o", "sk-test"))
        .await
        .expect("test: 200 succeeds");
    assert_eq!(generation.text, "Ownership rules.");
    assert_eq!(generation.tokens, 42);
}

#[tokio::test]
async fn test_openai_429_is_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({ "error": { "message": "Rate limit reached" } })),
        )
        .mount(&server)
        .await;

    let err = openai_at(&server)
        .await
        .generate(&request("openai", "gpt-4o", "sk-test"))
        .await
        .expect_err("test: 429 fails");
    assert_eq!(err.kind, FailureKind::RateLimited);
    assert!(err.kind.is_retryable());
}

#[tokio::test]
async fn test_openai_401_is_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = openai_at(&server)
        .await
        .generate(&request("openai", "gpt-4o", "sk-bad"))
        .await
        .expect_err("test: 401 fails");
    assert_eq!(err.kind, FailureKind::Authentication);
}

#[tokio::test]
async fn test_openai_500_is_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = openai_at(&server)
        .await
        .generate(&request("openai", "gpt-4o", "sk-test"))
        .await
        .expect_err("test: 503 fails");
    assert_eq!(err.kind, FailureKind::ServerError);
    assert!(err.message.contains("503"));
}

#[tokio::test]
async fn test_openai_400_content_policy_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": "content_policy_violation", "message": "flagged" }
        })))
        .mount(&server)
        .await;

    let err = openai_at(&server)
        .await
        .generate(&request("openai", "gpt-4o", "sk-test"))
        .await
        .expect_err("test: 400 fails");
    assert_eq!(err.kind, FailureKind::ContentPolicy);
    assert!(!err.kind.is_retryable());
}

#[tokio::test]
async fn test_openai_content_filter_finish_reason_is_content_policy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "role": "assistant", "content": null },
                "finish_reason": "content_filter"
            }]
        })))
        .mount(&server)
        .await;

    let err = openai_at(&server)
        .await
        .generate(&request("openai", "gpt-4o", "sk-test"))
        .await
        .expect_err("test: filtered");
    assert_eq!(err.kind, FailureKind::ContentPolicy);
}

#[tokio::test]
async fn test_openai_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_body("late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let mut req = request("openai", "gpt-4o", "sk-test");
    req.timeout = Duration::from_millis(100);
    let err = openai_at(&server)
        .await
        .generate(&req)
        .await
        .expect_err("test: timeout");
    assert_eq!(err.kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_openai_missing_usage_estimates_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "short answer" } }]
        })))
        .mount(&server)
        .await;

    let generation = openai_at(&server)
        .await
        .generate(&request("openai", "gpt-4o", "sk-test"))
        .await
        .expect("test: 200 succeeds");
    assert!(generation.tokens > 0);
}

// ============================================================================
// Anthropic
// ============================================================================

#[tokio::test]
async fn test_anthropic_success_joins_text_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(messages_body(&["Borrowing ", "is scoped."])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = AnthropicBackend::new().with_base_url(server.uri());
    let generation = backend
        .generate(&request("anthropic", "claude-3-5-sonnet-latest", "sk-ant"))
        .await
        .expect("test: 200 succeeds");
    assert_eq!(generation.text, "Borrowing is scoped.");
    assert_eq!(generation.tokens, 25);
}

#[tokio::test]
async fn test_anthropic_404_is_unsupported_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "type": "error",
            "error": { "type": "not_found_error", "message": "model: claude-0" }
        })))
        .mount(&server)
        .await;

    let err = AnthropicBackend::new()
        .with_base_url(server.uri())
        .generate(&request("anthropic", "claude-0", "sk-ant"))
        .await
        .expect_err("test: 404 fails");
    assert_eq!(err.kind, FailureKind::UnsupportedModel);
}

// ============================================================================
// Gateway over HTTP
// ============================================================================

fn http_gateway(server: &MockServer, keys: &[&str]) -> (ProviderGateway, Arc<CredentialPool>) {
    let pool = CredentialPool::new("openai", BackoffPolicy::default());
    for k in keys {
        pool.add_key(*k, None);
    }
    let pools = CredentialPools::new().with_pool(pool);
    let shared = pools.get("openai").expect("test: pool registered");
    let backend = OpenAiCompatibleBackend::new().with_base_url(server.uri());
    let gateway = ProviderGateway::new(pools).with_backend("openai", Arc::new(backend));
    (gateway, shared)
}

#[tokio::test]
async fn test_gateway_swaps_key_after_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-first"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-second"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("recovered")))
        .mount(&server)
        .await;

    let (gateway, pool) = http_gateway(&server, &["sk-first", "sk-second"]);
    let traced = gateway
        .generate_traced("openai", "gpt-4o", "hello", Duration::from_secs(5))
        .await;

    let generation = traced.result.expect("test: second key succeeds");
    assert_eq!(generation.text, "recovered");
    assert_eq!(traced.attempts.len(), 2);
    assert!(!traced.attempts[0].is_success());
    assert!(traced.attempts[1].is_success());

    let status = pool.status();
    assert_eq!(status[0].consecutive_failures, 1);
    assert_eq!(status[1].consecutive_failures, 0);
}

#[tokio::test]
async fn test_gateway_reports_unavailable_when_both_keys_fail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let (gateway, _) = http_gateway(&server, &["sk-a", "sk-b", "sk-c"]);
    let err = gateway
        .generate("openai", "gpt-4o", "hello", Duration::from_secs(5))
        .await
        .expect_err("test: both attempts fail");
    assert!(matches!(err, OrchestratorError::ProviderUnavailable { .. }));
}

#[tokio::test]
async fn test_gateway_does_not_retry_content_policy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string("request flagged by safety system"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, pool) = http_gateway(&server, &["sk-a", "sk-b"]);
    let err = gateway
        .generate("openai", "gpt-4o", "hello", Duration::from_secs(5))
        .await
        .expect_err("test: rejected");
    assert!(matches!(
        err,
        OrchestratorError::ProviderRejected {
            kind: FailureKind::ContentPolicy,
            ..
        }
    ));
    assert!(pool.status().iter().all(|s| s.consecutive_failures == 0));
}
