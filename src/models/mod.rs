pub mod domain;
pub mod question;
pub mod recommendation;
pub mod session;

pub use domain::{AffinityRule, Branch, DomainProfile, DomainRegistry};
pub use question::{Candidate, Question, QuestionOption, QuestionPerformance, QuestionType};
pub use recommendation::{CacheEntry, Provenance, RecommendationItem, RecommendationResult};
pub use session::{Choice, PendingQuestion, SessionContext, SessionPhase, SessionState};
