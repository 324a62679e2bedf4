use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use occam_elicit::{
    db::{MemoryStore, StateStore},
    error::{AppError, AppResult},
    models::DomainRegistry,
    routes::{create_router, AppState},
    services::{
        catalog::{QuestionCatalog, StaticCatalog},
        circuit_breaker::{BreakerSettings, CircuitBreaker},
        entropy::EntropySettings,
        orchestrator::RecommendationOrchestrator,
        providers::{GenerationRequest, GenerationService},
        question_selector::QuestionSelector,
        rate_limiter::{RateLimitSettings, RateLimiter},
        recommendation_cache::RecommendationCache,
        session_service::SessionService,
        telemetry::{TelemetrySink, TracingTelemetry},
    },
};

/// Generation stub that answers from a fixed script and counts calls
struct ScriptedGenerator {
    response: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn succeeding() -> Self {
        Self {
            response: Some(
                json!({
                    "items": [
                        {"title": "Arrival", "year": 2016, "reason": "Cerebral first contact"},
                        {"title": "Annihilation", "year": 2018, "reason": "Strange and unsettling"},
                        {"title": "Enemy", "year": 2013, "reason": "A puzzle about identity"}
                    ],
                    "confidence": 0.9
                })
                .to_string(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            response: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response
            .clone()
            .ok_or_else(|| AppError::UpstreamService("scripted outage".to_string()))
    }

    fn name(&self) -> &'static str {
        "generation"
    }
}

fn create_test_server(
    generator: Arc<ScriptedGenerator>,
    rate_limit: RateLimitSettings,
) -> TestServer {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let catalog: Arc<dyn QuestionCatalog> = Arc::new(StaticCatalog::builtin().unwrap());
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingTelemetry);
    let entropy = EntropySettings::default();

    let orchestrator = RecommendationOrchestrator::new(
        RecommendationCache::new(store.clone(), Duration::from_secs(3600)),
        CircuitBreaker::new(store.clone(), "generation", BreakerSettings::default()),
        generator,
        telemetry.clone(),
        entropy,
    );

    let sessions = SessionService::new(
        store.clone(),
        Arc::new(DomainRegistry::builtin().unwrap()),
        catalog.clone(),
        QuestionSelector::new(catalog, telemetry),
        orchestrator,
        entropy,
        Duration::from_secs(3600),
    );

    let state = Arc::new(AppState {
        sessions,
        rate_limiter: RateLimiter::new(store, rate_limit),
    });

    TestServer::new(create_router(state)).unwrap()
}

fn default_server() -> TestServer {
    create_test_server(
        Arc::new(ScriptedGenerator::succeeding()),
        RateLimitSettings::default(),
    )
}

async fn start_movies(server: &TestServer) -> (String, Value) {
    let response = server
        .post("/api/v1/sessions")
        .json(&json!({ "domain": "movies", "context": { "device_class": "desktop" } }))
        .await;
    response.assert_status(StatusCode::CREATED);

    let body: Value = response.json();
    let session_id = body["session_id"].as_str().unwrap().to_string();
    (session_id, body["question"].clone())
}

async fn answer(server: &TestServer, session_id: &str, question_id: &str, choice: &str) -> Value {
    let response = server
        .post(&format!("/api/v1/sessions/{}/answers", session_id))
        .json(&json!({
            "question_id": question_id,
            "choice": choice,
            "response_time_ms": 2400
        }))
        .await;
    response.assert_status_ok();
    response.json()
}

/// Answers with the first option until the session completes
async fn run_to_completion(
    server: &TestServer,
    session_id: &str,
    first: &Value,
    pivot: &str,
) -> (usize, Value) {
    let mut outcome = answer(server, session_id, first["id"].as_str().unwrap(), pivot).await;
    let mut answered = 1;

    while outcome["status"] == "question" {
        let question = &outcome["question"];
        let choice = question["options"][0]["value"].as_str().unwrap().to_string();
        outcome = answer(server, session_id, question["id"].as_str().unwrap(), &choice).await;
        answered += 1;
    }

    (answered, outcome)
}

#[tokio::test]
async fn test_health_check() {
    let server = default_server();
    let response = server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "healthy");
}

#[tokio::test]
async fn test_start_session_returns_pivot_question() {
    let server = default_server();
    let response = server
        .post("/api/v1/sessions")
        .json(&json!({ "domain": "movies" }))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["question"]["id"], "mv_pivot");
    assert_eq!(body["question"]["options"].as_array().unwrap().len(), 2);
    assert!(body["session_id"].as_str().is_some());
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let server = default_server();
    let request_id = "7f2c1a52-31a5-4f36-9a35-0c3f4c9de2a1";

    let response = server
        .get("/health")
        .add_header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static(request_id),
        )
        .await;

    assert_eq!(response.header("x-request-id"), request_id);
}

#[tokio::test]
async fn test_unknown_domain_is_validation_error() {
    let server = default_server();
    let response = server
        .post("/api/v1/sessions")
        .json(&json!({ "domain": "podcasts" }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_malformed_body_is_validation_error() {
    let server = default_server();
    let response = server
        .post("/api/v1/sessions")
        .text("{not json")
        .content_type("application/json")
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_movies_session_completes_on_fifth_answer() {
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let server = create_test_server(generator.clone(), RateLimitSettings::default());

    let (session_id, pivot) = start_movies(&server).await;
    let (answered, outcome) = run_to_completion(&server, &session_id, &pivot, "challenge").await;

    assert_eq!(answered, 5);
    assert_eq!(outcome["status"], "complete");
    assert_eq!(outcome["recommendations"]["provenance"], "generated");
    assert_eq!(outcome["recommendations"]["items"].as_array().unwrap().len(), 3);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let summary: Value = server
        .get(&format!("/api/v1/sessions/{}", session_id))
        .await
        .json();
    assert_eq!(summary["phase"], "finalized");
    assert_eq!(summary["answered"], 5);
}

#[tokio::test]
async fn test_question_turns_report_remaining_entropy() {
    let server = default_server();
    let (session_id, pivot) = start_movies(&server).await;

    let outcome = answer(&server, &session_id, pivot["id"].as_str().unwrap(), "comfort").await;

    assert_eq!(outcome["status"], "question");
    assert_eq!(outcome["question"]["id"], "mv_b_feeling");
    let remaining = outcome["remaining_entropy"].as_f64().unwrap();
    assert!((remaining - 2.45).abs() < 1e-9);
}

#[tokio::test]
async fn test_generation_outage_returns_fallback() {
    let server = create_test_server(
        Arc::new(ScriptedGenerator::failing()),
        RateLimitSettings::default(),
    );

    let (session_id, pivot) = start_movies(&server).await;
    let (_, outcome) = run_to_completion(&server, &session_id, &pivot, "comfort").await;

    assert_eq!(outcome["status"], "complete");
    assert_eq!(outcome["recommendations"]["provenance"], "fallback");
    assert_eq!(outcome["recommendations"]["confidence"], 0.6);
    assert_eq!(outcome["recommendations"]["items"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_identical_answers_hit_cache() {
    let generator = Arc::new(ScriptedGenerator::succeeding());
    let server = create_test_server(generator.clone(), RateLimitSettings::default());

    let (first_id, pivot) = start_movies(&server).await;
    let (_, first) = run_to_completion(&server, &first_id, &pivot, "challenge").await;
    assert_eq!(first["recommendations"]["provenance"], "generated");

    let (second_id, pivot) = start_movies(&server).await;
    let (_, second) = run_to_completion(&server, &second_id, &pivot, "challenge").await;
    assert_eq!(second["recommendations"]["provenance"], "cache");
    assert_eq!(
        second["recommendations"]["items"],
        first["recommendations"]["items"]
    );
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wrong_question_is_rejected() {
    let server = default_server();
    let (session_id, _) = start_movies(&server).await;

    let response = server
        .post(&format!("/api/v1/sessions/{}/answers", session_id))
        .json(&json!({
            "question_id": "mv_a_tone",
            "choice": "bleak",
            "response_time_ms": 100
        }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let server = default_server();
    let response = server
        .post("/api/v1/sessions/6c0e4c9a-7f55-4e47-8c1d-2b8b1f0e9d11/answers")
        .json(&json!({
            "question_id": "mv_pivot",
            "choice": "challenge",
            "response_time_ms": 100
        }))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["error"]["code"], "session_not_found");
}

#[tokio::test]
async fn test_invalid_session_id_is_bad_request() {
    let server = default_server();
    let response = server.get("/api/v1/sessions/not-a-uuid").await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limit_rejects_with_retry_after() {
    let server = create_test_server(
        Arc::new(ScriptedGenerator::succeeding()),
        RateLimitSettings {
            limit: 2,
            window: Duration::from_secs(60),
        },
    );

    let start = |client: &'static str| {
        server
            .post("/api/v1/sessions")
            .add_header(
                HeaderName::from_static("x-client-id"),
                HeaderValue::from_static(client),
            )
            .json(&json!({ "domain": "movies" }))
    };

    start("abuser").await.assert_status(StatusCode::CREATED);
    start("abuser").await.assert_status(StatusCode::CREATED);

    let rejected = start("abuser").await;
    rejected.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let body: Value = rejected.json();
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    assert!(body["error"]["retry_after_ms"].as_u64().unwrap() > 0);
    let retry_after: u64 = rejected
        .header("retry-after")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    // Another client is unaffected
    start("neighbor").await.assert_status(StatusCode::CREATED);
}

#[tokio::test]
async fn test_feedback_accepted_once_after_completion() {
    let server = default_server();
    let (session_id, pivot) = start_movies(&server).await;
    let feedback_url = format!("/api/v1/sessions/{}/feedback", session_id);

    server
        .post(&feedback_url)
        .json(&json!({ "satisfaction": 0.9 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    run_to_completion(&server, &session_id, &pivot, "challenge").await;

    server
        .post(&feedback_url)
        .json(&json!({ "satisfaction": 0.9 }))
        .await
        .assert_status(StatusCode::NO_CONTENT);

    server
        .post(&feedback_url)
        .json(&json!({ "satisfaction": 0.9 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}
