use std::sync::Arc;

use occam_elicit::{
    config::Config,
    db::{create_pool, create_redis_client, RedisStore, StateStore},
    models::DomainRegistry,
    routes::{create_router, AppState},
    services::{
        catalog::{builtin_questions, PgQuestionCatalog, QuestionCatalog},
        circuit_breaker::CircuitBreaker,
        orchestrator::RecommendationOrchestrator,
        providers::{GenerationService, HttpGenerationClient},
        question_selector::QuestionSelector,
        rate_limiter::RateLimiter,
        recommendation_cache::RecommendationCache,
        session_service::SessionService,
        telemetry::{PgTelemetry, TelemetrySink},
    },
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "occam_elicit=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let domains = match &config.domains_path {
        Some(path) => DomainRegistry::from_path(path)?,
        None => DomainRegistry::builtin()?,
    };
    tracing::info!(domains = ?domains.names().collect::<Vec<_>>(), "Domain profiles loaded");

    let pool = create_pool(&config.database_url).await?;
    let redis_client = create_redis_client(&config.redis_url)?;
    let store: Arc<dyn StateStore> = Arc::new(RedisStore::new(redis_client).await?);

    let pg_catalog = PgQuestionCatalog::new(pool.clone());
    if config.seed_catalog {
        let questions = builtin_questions()?;
        pg_catalog.seed(&questions).await?;
    }
    let catalog: Arc<dyn QuestionCatalog> = Arc::new(pg_catalog);
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(PgTelemetry::new(pool));

    let generator: Arc<dyn GenerationService> = Arc::new(HttpGenerationClient::new(
        config.generation_api_url.clone(),
        config.generation_api_key.clone(),
        config.generation_timeout(),
    )?);

    let orchestrator = RecommendationOrchestrator::new(
        RecommendationCache::new(store.clone(), config.cache_ttl()),
        CircuitBreaker::new(store.clone(), generator.name(), config.breaker()),
        generator,
        telemetry.clone(),
        config.entropy(),
    );

    let sessions = SessionService::new(
        store.clone(),
        Arc::new(domains),
        catalog.clone(),
        QuestionSelector::new(catalog, telemetry),
        orchestrator,
        config.entropy(),
        config.session_ttl(),
    );

    let state = Arc::new(AppState {
        sessions,
        rate_limiter: RateLimiter::new(store, config.rate_limit()),
    });

    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
