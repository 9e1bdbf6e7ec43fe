//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use tower::ServiceExt;

use vocalis_gateway::Config;
use vocalis_gateway::api::ApiServer;

mod common;
use common::{ScriptedGenerator, ScriptedRecognizer, ScriptedSynthesizer, services};

/// Build a test API router over scripted providers
fn build_test_router(config: &Config, synthesizer: ScriptedSynthesizer) -> axum::Router {
    let (recognizer, _handles) = ScriptedRecognizer::create();
    let services = services(
        recognizer,
        ScriptedGenerator::new(Vec::new()),
        Arc::new(synthesizer),
    );
    ApiServer::new(config, services).router()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn synthesize_request(text: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/voice/synthesize")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "text": text }).to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_router(&Config::default(), ScriptedSynthesizer::new());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_capabilities_reflect_config() {
    let config = Config::default();
    let app = build_test_router(&config, ScriptedSynthesizer::new());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/voice/capabilities")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["stt_model"], config.stt.model);
    assert_eq!(json["llm_model"], config.llm.model);
    assert_eq!(json["tts_provider"], config.tts.provider.as_str());
    assert_eq!(json["content_type"], "audio/mpeg");
    assert_eq!(json["emotion"], false);
}

#[tokio::test]
async fn test_synthesize_returns_audio() {
    let app = build_test_router(&Config::default(), ScriptedSynthesizer::new());

    let response = app.oneshot(synthesize_request("Hello.")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, common::audio_for("Hello."));
}

#[tokio::test]
async fn test_synthesize_rejects_empty_text() {
    let app = build_test_router(&Config::default(), ScriptedSynthesizer::new());

    let response = app.oneshot(synthesize_request("   ")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_synthesize_reports_provider_failure() {
    let app = build_test_router(&Config::default(), ScriptedSynthesizer::new().fail_on("Hello"));

    let response = app.oneshot(synthesize_request("Hello.")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "synthesis_failed");
}

#[tokio::test]
async fn test_ws_requires_upgrade() {
    let app = build_test_router(&Config::default(), ScriptedSynthesizer::new());

    let response = app
        .oneshot(Request::builder().uri("/ws/audio").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.status().is_client_error());
    assert_ne!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ws_connections_are_rate_limited() {
    let mut config = Config::default();
    config.server.connections_per_minute = 1;
    let app = build_test_router(&config, ScriptedSynthesizer::new());

    let first = app
        .clone()
        .oneshot(Request::builder().uri("/ws/audio").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let second = app
        .oneshot(Request::builder().uri("/ws/audio").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_ne!(first.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let app = build_test_router(&Config::default(), ScriptedSynthesizer::new());

    let response = app
        .oneshot(Request::builder().uri("/api/unknown").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
