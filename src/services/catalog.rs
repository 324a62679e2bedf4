use serde::Deserialize;
use sqlx::{types::Json, FromRow, PgPool};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use crate::{
    error::{AppError, AppResult},
    models::{Candidate, Question, QuestionOption, QuestionPerformance, QuestionType},
};

const BUILTIN_QUESTIONS: &str = include_str!("../../config/questions.json");

/// Filter for eligible follow-up candidates
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub domain: String,
    /// Follow-up type of the active branch; contextual questions are always included
    pub branch_type: QuestionType,
    pub categories: Vec<String>,
    pub exclude_ids: Vec<String>,
    pub limit: usize,
}

/// Read-mostly store of candidate questions and their performance stats
#[async_trait::async_trait]
pub trait QuestionCatalog: Send + Sync {
    /// The single active pivot question of a domain
    async fn pivot(&self, domain: &str) -> AppResult<Candidate>;

    /// Active candidates matching the query, best expected gain first
    async fn candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Candidate>>;

    /// Folds one feedback observation into the stats of each question
    async fn record_feedback(
        &self,
        question_ids: &[String],
        info_gain: f64,
        satisfaction: f64,
    ) -> AppResult<()>;
}

#[derive(Debug, Deserialize)]
struct QuestionFile {
    questions: Vec<Question>,
}

/// Parses and validates a declarative question table
pub fn parse_question_table(json: &str) -> AppResult<Vec<Question>> {
    let file: QuestionFile = serde_json::from_str(json)
        .map_err(|e| AppError::Internal(format!("Invalid question table: {}", e)))?;

    let mut seen = HashSet::new();
    let mut pivots: HashMap<&str, usize> = HashMap::new();
    for question in &file.questions {
        question.validate().map_err(AppError::Internal)?;
        if !seen.insert(question.id.as_str()) {
            return Err(AppError::Internal(format!(
                "Invalid question table: duplicate id '{}'",
                question.id
            )));
        }
        if question.is_active && question.question_type == QuestionType::Pivot {
            *pivots.entry(question.domain.as_str()).or_default() += 1;
        }
    }

    let domains: BTreeSet<&str> =
        file.questions.iter().map(|q| q.domain.as_str()).collect();
    for domain in domains {
        let count = pivots.get(domain).copied().unwrap_or(0);
        if count != 1 {
            return Err(AppError::Internal(format!(
                "Invalid question table: domain '{}' has {} active pivots, expected 1",
                domain, count
            )));
        }
    }

    Ok(file.questions)
}

/// The question table compiled into the binary
pub fn builtin_questions() -> AppResult<Vec<Question>> {
    parse_question_table(BUILTIN_QUESTIONS)
}

fn matches_query(question: &Question, query: &CandidateQuery) -> bool {
    let in_branch = question.question_type == query.branch_type
        && query.categories.iter().any(|c| c == &question.category);
    question.is_active
        && question.domain == query.domain
        && (in_branch || question.question_type == QuestionType::Contextual)
        && !query.exclude_ids.contains(&question.id)
}

fn by_expected_gain(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.question
        .expected_info_gain
        .total_cmp(&a.question.expected_info_gain)
        .then_with(|| a.question.id.cmp(&b.question.id))
}

/// In-memory catalog over the declarative question table
pub struct StaticCatalog {
    questions: Vec<Question>,
    performance: RwLock<HashMap<String, QuestionPerformance>>,
}

impl StaticCatalog {
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            questions,
            performance: RwLock::new(HashMap::new()),
        }
    }

    pub fn builtin() -> AppResult<Self> {
        Ok(Self::new(builtin_questions()?))
    }

    /// Overrides the stats of one question
    pub fn set_performance(&self, performance: QuestionPerformance) -> AppResult<()> {
        let mut stats = self
            .performance
            .write()
            .map_err(|_| AppError::Internal("catalog stats lock poisoned".to_string()))?;
        stats.insert(performance.question_id.clone(), performance);
        Ok(())
    }

    pub fn performance_of(&self, question_id: &str) -> AppResult<QuestionPerformance> {
        let stats = self
            .performance
            .read()
            .map_err(|_| AppError::Internal("catalog stats lock poisoned".to_string()))?;
        Ok(stats
            .get(question_id)
            .cloned()
            .unwrap_or_else(|| QuestionPerformance::unseen(question_id)))
    }

    fn candidate(&self, question: &Question) -> AppResult<Candidate> {
        Ok(Candidate {
            question: question.clone(),
            performance: self.performance_of(&question.id)?,
        })
    }
}

#[async_trait::async_trait]
impl QuestionCatalog for StaticCatalog {
    async fn pivot(&self, domain: &str) -> AppResult<Candidate> {
        let question = self
            .questions
            .iter()
            .find(|q| q.is_active && q.domain == domain && q.question_type == QuestionType::Pivot)
            .ok_or_else(|| {
                AppError::Internal(format!("No active pivot question for domain '{}'", domain))
            })?;
        self.candidate(question)
    }

    async fn candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Candidate>> {
        let mut candidates = self
            .questions
            .iter()
            .filter(|q| matches_query(q, query))
            .map(|q| self.candidate(q))
            .collect::<AppResult<Vec<_>>>()?;

        candidates.sort_by(by_expected_gain);
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    async fn record_feedback(
        &self,
        question_ids: &[String],
        info_gain: f64,
        satisfaction: f64,
    ) -> AppResult<()> {
        for question_id in question_ids {
            let mut performance = self.performance_of(question_id)?;
            performance.record(info_gain, satisfaction);
            self.set_performance(performance)?;
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct CandidateRow {
    id: String,
    domain: String,
    question_type: String,
    category: String,
    text: String,
    options: Json<Vec<QuestionOption>>,
    expected_info_gain: f64,
    is_active: bool,
    avg_info_gain: f64,
    usage_count: i64,
    avg_satisfaction: f64,
}

impl TryFrom<CandidateRow> for Candidate {
    type Error = AppError;

    fn try_from(row: CandidateRow) -> Result<Self, Self::Error> {
        let question_type = row
            .question_type
            .parse::<QuestionType>()
            .map_err(AppError::Internal)?;

        Ok(Candidate {
            performance: QuestionPerformance {
                question_id: row.id.clone(),
                avg_info_gain: row.avg_info_gain,
                usage_count: row.usage_count.max(0) as u64,
                avg_satisfaction: row.avg_satisfaction,
            },
            question: Question {
                id: row.id,
                text: row.text,
                category: row.category,
                domain: row.domain,
                question_type,
                options: row.options.0,
                expected_info_gain: row.expected_info_gain,
                is_active: row.is_active,
            },
        })
    }
}

const CANDIDATE_COLUMNS: &str = r#"
    q.id, q.domain, q.question_type, q.category, q.text, q.options,
    q.expected_info_gain, q.is_active,
    COALESCE(p.avg_info_gain, 0) AS avg_info_gain,
    COALESCE(p.usage_count, 0) AS usage_count,
    COALESCE(p.avg_satisfaction, 0.5) AS avg_satisfaction
"#;

fn unavailable(e: sqlx::Error) -> AppError {
    tracing::warn!(error = %e, "Question catalog query failed");
    AppError::CatalogUnavailable(e.to_string())
}

/// Postgres-backed catalog
#[derive(Clone)]
pub struct PgQuestionCatalog {
    pool: PgPool,
}

impl PgQuestionCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upserts the declarative question table so the database never drifts
    /// from the definitions shipped with the service
    pub async fn seed(&self, questions: &[Question]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        for question in questions {
            sqlx::query(
                r#"
                INSERT INTO questions
                    (id, domain, question_type, category, text, options,
                     expected_info_gain, is_active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    domain = EXCLUDED.domain,
                    question_type = EXCLUDED.question_type,
                    category = EXCLUDED.category,
                    text = EXCLUDED.text,
                    options = EXCLUDED.options,
                    is_active = EXCLUDED.is_active,
                    updated_at = NOW()
                "#,
            )
            .bind(&question.id)
            .bind(&question.domain)
            .bind(question.question_type.as_str())
            .bind(&question.category)
            .bind(&question.text)
            .bind(Json(&question.options))
            .bind(question.expected_info_gain)
            .bind(question.is_active)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::info!(count = questions.len(), "Question catalog seeded");
        Ok(())
    }
}

#[async_trait::async_trait]
impl QuestionCatalog for PgQuestionCatalog {
    async fn pivot(&self, domain: &str) -> AppResult<Candidate> {
        let sql = format!(
            r#"
            SELECT {CANDIDATE_COLUMNS}
            FROM questions q
            LEFT JOIN question_performance p ON p.question_id = q.id
            WHERE q.domain = $1 AND q.question_type = 'pivot' AND q.is_active
            "#
        );

        let mut rows = sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(domain)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        if rows.len() != 1 {
            return Err(AppError::Internal(format!(
                "Domain '{}' has {} active pivot questions, expected 1",
                domain,
                rows.len()
            )));
        }

        rows.remove(0).try_into()
    }

    async fn candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Candidate>> {
        let sql = format!(
            r#"
            SELECT {CANDIDATE_COLUMNS}
            FROM questions q
            LEFT JOIN question_performance p ON p.question_id = q.id
            WHERE q.domain = $1
              AND q.is_active
              AND ((q.question_type = $2 AND q.category = ANY($3))
                   OR q.question_type = 'contextual')
              AND NOT (q.id = ANY($4))
            ORDER BY q.expected_info_gain DESC, q.id
            LIMIT $5
            "#
        );

        let rows = sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(&query.domain)
            .bind(query.branch_type.as_str())
            .bind(&query.categories)
            .bind(&query.exclude_ids)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        rows.into_iter().map(Candidate::try_from).collect()
    }

    async fn record_feedback(
        &self,
        question_ids: &[String],
        info_gain: f64,
        satisfaction: f64,
    ) -> AppResult<()> {
        // Weighted running average, computed in one statement per row so
        // concurrent feedback never loses an observation
        sqlx::query(
            r#"
            INSERT INTO question_performance
                (question_id, avg_info_gain, usage_count, avg_satisfaction)
            SELECT id, $2, 1, $3 FROM questions WHERE id = ANY($1)
            ON CONFLICT (question_id) DO UPDATE SET
                avg_info_gain =
                    (question_performance.avg_info_gain * question_performance.usage_count + $2)
                    / (question_performance.usage_count + 1),
                avg_satisfaction =
                    (question_performance.avg_satisfaction * question_performance.usage_count + $3)
                    / (question_performance.usage_count + 1),
                usage_count = question_performance.usage_count + 1,
                updated_at = NOW()
            "#,
        )
        .bind(question_ids)
        .bind(info_gain)
        .bind(satisfaction)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }
}
