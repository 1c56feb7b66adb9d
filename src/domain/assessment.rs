use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Queued,
    Processing,
    Summarising,
    PendingReview,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    PerQuestion,
    PerSection,
    TotalScore,
}

/// One gradeable question within an assessment config: its own rubric,
/// max score and optional answer key entry, independently of any quiz
/// question (spec.md §4.5 Phase 1/2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentQuestion {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub rubric: Option<String>,
    pub max_score: f64,
    #[serde(default)]
    pub answer: Option<String>,
}

/// Mirrors the grading-job config payload a caller posts when an
/// assessment is created. Field names follow the wire shape from
/// spec.md §6 (`assessmentName`, `classId`, `scoringMethod`, ...), so this
/// type also serves as the deserialisation target for that request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentConfig {
    pub assessment_name: String,
    pub class_id: String,
    pub scoring_method: ScoringMethod,
    pub questions: Vec<AssessmentQuestion>,
    #[serde(default)]
    pub include_improvement_tips: bool,
    #[serde(default)]
    pub is_manual_upload: bool,
}

impl AssessmentConfig {
    pub fn question(&self, question_id: &str) -> Option<&AssessmentQuestion> {
        self.questions.iter().find(|q| q.id == question_id)
    }

    pub fn max_score_total(&self) -> f64 {
        self.questions.iter().map(|q| q.max_score).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub id: String,
    pub tenant_id: String,
    pub config: AssessmentConfig,
    pub status: AssessmentStatus,
    pub total_submissions: u32,
    pub processed_submissions: u32,
    pub error_message: Option<String>,
    pub narrative: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A submission that didn't match any roster student by name. Kept as its
/// own entity (rather than a nullable `student_id` on `Result`) so the
/// manual merge-by-name workflow has somewhere to point (spec.md §9.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutsiderStudent {
    pub id: String,
    pub assessment_id: String,
    pub submitted_name: String,
    pub merged_into_student_id: Option<String>,
}

/// A graded result belongs either to a roster student or to an
/// unmatched outsider submission — never both, and never neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultIdentity {
    Student { student_id: String },
    Outsider { outsider_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    PendingGrade,
    AiGraded,
    PendingReview,
    TeacherGraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalisedBy {
    Ai,
    Teacher,
}

/// One of the N independent grading attempts made against the LLM for a
/// single submission, before clustering picks the consensus value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiModelRun {
    pub run_index: u32,
    pub extracted_answer: Option<String>,
    pub score: Option<f64>,
    pub feedback: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingResult {
    pub id: String,
    pub assessment_id: String,
    pub question_id: String,
    pub file_ref: String,
    pub identity: ResultIdentity,
    pub status: ResultStatus,
    pub extracted_answer: Option<String>,
    pub score: Option<f64>,
    pub feedback: Option<String>,
    pub runs: Vec<AiModelRun>,
    pub finalised_by: Option<FinalisedBy>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
