pub mod catalog;
pub mod circuit_breaker;
pub mod entropy;
pub mod fallback;
pub mod orchestrator;
pub mod providers;
pub mod question_selector;
pub mod rate_limiter;
pub mod recommendation_cache;
pub mod session_service;
pub mod telemetry;
