use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{error::AppResult, models::Provenance};

/// Emitted each time the selector picks a question
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SelectionEvent {
    pub session_id: Uuid,
    pub question_id: String,
    pub score: f64,
}

/// Emitted once per finalized session
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionEvent {
    pub session_id: Uuid,
    pub domain: String,
    pub provenance: Provenance,
    pub duration_ms: i64,
    pub final_entropy: f64,
    pub question_count: usize,
}

/// Best-effort sink for events consumed by the offline performance updater.
/// Callers log failures and carry on.
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record_selection(&self, event: &SelectionEvent) -> AppResult<()>;

    async fn record_completion(&self, event: &CompletionEvent) -> AppResult<()>;
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

#[async_trait::async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn record_selection(&self, event: &SelectionEvent) -> AppResult<()> {
        tracing::info!(
            target: "telemetry",
            session_id = %event.session_id,
            question_id = %event.question_id,
            score = event.score,
            "question_selected"
        );
        Ok(())
    }

    async fn record_completion(&self, event: &CompletionEvent) -> AppResult<()> {
        tracing::info!(
            target: "telemetry",
            session_id = %event.session_id,
            domain = %event.domain,
            provenance = %event.provenance,
            duration_ms = event.duration_ms,
            final_entropy = event.final_entropy,
            question_count = event.question_count,
            "session_completed"
        );
        Ok(())
    }
}

/// Persists events to Postgres and mirrors them to the log
#[derive(Clone)]
pub struct PgTelemetry {
    pool: PgPool,
}

impl PgTelemetry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TelemetrySink for PgTelemetry {
    async fn record_selection(&self, event: &SelectionEvent) -> AppResult<()> {
        TracingTelemetry.record_selection(event).await?;

        sqlx::query(
            "INSERT INTO selection_events (session_id, question_id, score) VALUES ($1, $2, $3)",
        )
        .bind(event.session_id)
        .bind(&event.question_id)
        .bind(event.score)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_completion(&self, event: &CompletionEvent) -> AppResult<()> {
        TracingTelemetry.record_completion(event).await?;

        sqlx::query(
            r#"
            INSERT INTO session_completions
                (session_id, domain, provenance, duration_ms, final_entropy, question_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.session_id)
        .bind(&event.domain)
        .bind(event.provenance.to_string())
        .bind(event.duration_ms)
        .bind(event.final_entropy)
        .bind(event.question_count as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
