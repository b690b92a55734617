//! Integration tests for the OpenAI-compatible vision backend and the
//! extraction client against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use attrix_core::{ErrorKind, SchemaItem, SchemaValue};
use attrix_inference::{
    ExtractionClient, OpenAiVisionBackend, RetryPolicy, VisionBackend, VisionConfig,
};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn schema() -> Vec<SchemaItem> {
    vec![
        SchemaItem::select("color", "Color", ["RED", "BLUE"]),
        SchemaItem::text("material", "Material"),
    ]
}

fn completion(content: &str, total_tokens: u64) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "model": "vision-test",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": total_tokens - 10,
            "completion_tokens": 10,
            "total_tokens": total_tokens
        }
    })
}

fn good_content() -> String {
    json!({
        "color": {
            "schemaValue": "red",
            "rawValue": "crimson",
            "visualConfidence": 92,
            "mappingConfidence": 70
        },
        "material": null
    })
    .to_string()
}

fn client_for(server: &MockServer) -> (Arc<OpenAiVisionBackend>, ExtractionClient) {
    let backend = Arc::new(
        OpenAiVisionBackend::new(
            VisionConfig::default()
                .with_base_url(server.uri())
                .with_api_key("test-key")
                .with_model("vision-test"),
        )
        .expect("Failed to create backend"),
    );
    let policy = RetryPolicy::default()
        .with_base_delay(Duration::from_millis(5))
        .with_rate_limit_pause(Some(Duration::from_millis(5)));
    let client = ExtractionClient::new(backend.clone()).with_policy(policy);
    (backend, client)
}

#[tokio::test]
async fn test_extract_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&good_content(), 321)))
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client_for(&server);
    let output = client
        .extract(b"\x89PNG", "image/png", &schema())
        .await
        .expect("extraction should succeed");

    assert_eq!(output.tokens_used, 321);
    assert_eq!(output.model_used, "vision-test");
    let color = output.attributes["color"].as_ref().unwrap();
    assert_eq!(color.schema_value, Some(SchemaValue::from("RED")));
    assert_eq!(color.raw_value.as_deref(), Some("crimson"));
    assert!(output.attributes["material"].is_none());
}

#[tokio::test]
async fn test_rate_limited_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "Rate limit reached", "type": "rate_limit_exceeded"}
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&good_content(), 55)))
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client_for(&server);
    let output = client
        .extract(b"img", "image/jpeg", &schema())
        .await
        .expect("retry should succeed");

    assert_eq!(output.tokens_used, 55);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_image_quality_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": {"message": "Image is too blurry", "type": "invalid_request_error", "code": "image_quality"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client_for(&server);
    let err = client
        .extract(b"img", "image/jpeg", &schema())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ImageQualityRejected);
}

#[tokio::test]
async fn test_server_errors_exhaust_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .expect(3)
        .mount(&server)
        .await;

    let (_, client) = client_for(&server);
    let err = client
        .extract(b"img", "image/jpeg", &schema())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransientNetwork);
}

#[tokio::test]
async fn test_unauthorized_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Invalid API key", "type": "invalid_api_key"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client_for(&server);
    let err = client
        .extract(b"img", "image/jpeg", &schema())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UpstreamRejected);
}

#[tokio::test]
async fn test_non_json_content_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("Sorry, I can't describe this image.", 20)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client_for(&server);
    let err = client
        .extract(b"img", "image/jpeg", &schema())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
}

#[tokio::test]
async fn test_shape_mismatch_is_validation_failure() {
    let server = MockServer::start().await;
    let content = json!({"color": {"value": "RED"}, "material": null}).to_string();
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&content, 20)))
        .expect(1)
        .mount(&server)
        .await;

    let (_, client) = client_for(&server);
    let err = client
        .extract(b"img", "image/jpeg", &schema())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
}

#[tokio::test]
async fn test_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let (backend, _) = client_for(&server);
    assert!(backend.health_check().await.unwrap());
}
