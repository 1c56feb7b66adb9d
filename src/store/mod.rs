pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::assessment::{
    Assessment, AssessmentConfig, AssessmentStatus, AiModelRun, GradingResult, OutsiderStudent,
    ResultIdentity, ResultStatus,
};
use crate::domain::quiz::{Question, Quiz, QuizStatus};
use crate::domain::session::{Participant, ParticipantIdentity, QuizSnapshot, Response, ResponseAnswer, Session, SessionStatus};
use crate::domain::tenant::{Class, Student};
use crate::error::CoreError;
use crate::identity::IdentityContext;

pub type StoreResult<T> = Result<T, CoreError>;

/// Timing metadata captured alongside a submitted answer; kept separate
/// from `ResponseAnswer` so the pure grading function never has to look
/// at clock/latency fields.
#[derive(Debug, Clone, Copy)]
pub struct ResponseTiming {
    pub response_time_ms: u64,
    pub submitted_at: DateTime<Utc>,
}

/// Transactional persistence for every owned entity in the system (C2).
/// Every method that reads or writes a tenant-owned row takes an
/// `IdentityContext` and must filter on it; the two methods explicitly
/// documented as cross-tenant (`get_session_by_room_code`,
/// `get_timed_out_sessions`, `anonymise_old_guests`) are the only
/// exceptions, and are called only by the room-join path and the
/// scheduler respectively.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Classes & roster -------------------------------------------------

    async fn create_class(&self, tenant: &IdentityContext, name: &str, description: Option<&str>) -> StoreResult<Class>;
    async fn get_class(&self, tenant: &IdentityContext, class_id: &str) -> StoreResult<Class>;
    async fn list_roster(&self, tenant: &IdentityContext, class_id: &str) -> StoreResult<Vec<Student>>;

    /// Resolves a teacher-assigned `external_id` to a roster student
    /// scoped to the caller's tenant, used by the quiz-join flow when a
    /// joiner identifies as a registered student (spec.md §4.4 point 2).
    async fn find_student_by_external_id(
        &self,
        tenant: &IdentityContext,
        external_id: &str,
    ) -> StoreResult<Option<Student>>;

    // -- Quizzes ------------------------------------------------------------

    async fn create_quiz(
        &self,
        tenant: &IdentityContext,
        class_id: Option<&str>,
        title: &str,
        description: Option<&str>,
    ) -> StoreResult<Quiz>;
    async fn get_quiz(&self, tenant: &IdentityContext, quiz_id: &str) -> StoreResult<Quiz>;
    async fn list_quizzes(&self, tenant: &IdentityContext, class_id: Option<&str>) -> StoreResult<Vec<Quiz>>;
    async fn set_quiz_status(&self, tenant: &IdentityContext, quiz_id: &str, status: QuizStatus) -> StoreResult<Quiz>;
    async fn soft_delete_quiz(&self, tenant: &IdentityContext, quiz_id: &str, now: DateTime<Utc>) -> StoreResult<()>;
    async fn add_question(&self, tenant: &IdentityContext, quiz_id: &str, question: Question) -> StoreResult<Question>;
    async fn list_questions(&self, tenant: &IdentityContext, quiz_id: &str) -> StoreResult<Vec<Question>>;
    async fn set_last_room_code(&self, tenant: &IdentityContext, quiz_id: &str, room_code: &str) -> StoreResult<()>;

    // -- Sessions -------------------------------------------------------------

    async fn create_quiz_session(
        &self,
        tenant: &IdentityContext,
        quiz_id: &str,
        room_code: &str,
        snapshot: QuizSnapshot,
        timeout_hours: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Session>;

    async fn get_session(&self, tenant: &IdentityContext, session_id: &str) -> StoreResult<Session>;

    /// The only cross-tenant lookup: room codes are themselves the
    /// capability, so this must resolve regardless of which tenant asks,
    /// but must never resolve a session whose quiz was soft-deleted.
    async fn get_session_by_room_code(&self, room_code: &str) -> StoreResult<Option<Session>>;

    /// Cross-tenant like `get_session_by_room_code`: the WebSocket-facing
    /// participant flows (`submit_answer`, heartbeats) only ever learn a
    /// session id, never a tenant, so the engine resolves the owning
    /// tenant through this before calling any tenant-scoped method.
    async fn get_session_unscoped(&self, session_id: &str) -> StoreResult<Option<Session>>;

    async fn set_session_status(
        &self,
        tenant: &IdentityContext,
        session_id: &str,
        status: SessionStatus,
        current_question_index: Option<u32>,
        now: DateTime<Utc>,
        auto_ended: bool,
    ) -> StoreResult<Session>;

    async fn get_timed_out_sessions(&self, now: DateTime<Utc>, threshold_hours: i64) -> StoreResult<Vec<Session>>;

    // -- Participants & responses --------------------------------------------

    async fn add_participant(
        &self,
        tenant: &IdentityContext,
        session_id: &str,
        identity: ParticipantIdentity,
        now: DateTime<Utc>,
    ) -> StoreResult<Participant>;

    async fn get_participant(&self, tenant: &IdentityContext, participant_id: &str) -> StoreResult<Participant>;

    async fn get_participant_by_guest_token_hash(&self, session_id: &str, token_hash: &str) -> StoreResult<Option<Participant>>;

    async fn list_participants(&self, tenant: &IdentityContext, session_id: &str) -> StoreResult<Vec<Participant>>;

    async fn submit_response(
        &self,
        tenant: &IdentityContext,
        session_id: &str,
        participant_id: &str,
        question_id: &str,
        answer: ResponseAnswer,
        is_correct: Option<bool>,
        points_earned: i64,
        timing: ResponseTiming,
    ) -> StoreResult<Response>;

    /// Atomic increment; concurrent submissions for distinct questions by
    /// the same participant must produce the sum of their effects.
    async fn update_participant_score(
        &self,
        tenant: &IdentityContext,
        participant_id: &str,
        add_points: i64,
        add_time_ms: i64,
        is_correct: Option<bool>,
    ) -> StoreResult<Participant>;

    async fn count_responses_for_question(&self, tenant: &IdentityContext, session_id: &str, question_id: &str) -> StoreResult<u32>;

    /// Ordered by `(score DESC, total_time_ms ASC, joined_at ASC)`.
    async fn get_leaderboard(&self, tenant: &IdentityContext, session_id: &str, limit: usize) -> StoreResult<Vec<Participant>>;

    async fn anonymise_old_guests(&self, now: DateTime<Utc>, retention_days: i64) -> StoreResult<u64>;

    // -- Assessments & grading ------------------------------------------------

    async fn create_assessment(&self, tenant: &IdentityContext, config: AssessmentConfig, now: DateTime<Utc>) -> StoreResult<Assessment>;
    async fn get_assessment(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Assessment>;
    async fn set_assessment_status(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        status: AssessmentStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Assessment>;
    async fn set_assessment_narrative(&self, tenant: &IdentityContext, assessment_id: &str, narrative: &str) -> StoreResult<()>;

    /// Updates the job's progress counters (spec.md §3 `total_submissions`,
    /// `processed_submissions`), used by the pipeline after matching and
    /// after each entity's consensus write-back.
    async fn set_assessment_progress(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        total_submissions: u32,
        processed_submissions: u32,
    ) -> StoreResult<()>;

    async fn create_outsider(&self, tenant: &IdentityContext, assessment_id: &str, submitted_name: &str) -> StoreResult<OutsiderStudent>;
    async fn merge_outsider(&self, tenant: &IdentityContext, outsider_id: &str, student_id: &str) -> StoreResult<()>;

    /// Used by Phase 1 matching to reuse an existing outsider rather than
    /// creating a duplicate when a second manual-upload file names the
    /// same unmatched student within the same job (spec.md §9 Open
    /// Question 3, decided: merge).
    async fn list_outsiders(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Vec<OutsiderStudent>>;

    async fn create_result(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        question_id: &str,
        file_ref: &str,
        identity: ResultIdentity,
        now: DateTime<Utc>,
    ) -> StoreResult<GradingResult>;

    async fn list_results(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Vec<GradingResult>>;
    async fn get_result(&self, tenant: &IdentityContext, result_id: &str) -> StoreResult<GradingResult>;

    async fn record_ai_run(&self, tenant: &IdentityContext, result_id: &str, run: AiModelRun) -> StoreResult<()>;

    async fn finalise_result(
        &self,
        tenant: &IdentityContext,
        result_id: &str,
        status: ResultStatus,
        score: Option<f64>,
        feedback: Option<&str>,
        finalised_by: Option<crate::domain::assessment::FinalisedBy>,
        now: DateTime<Utc>,
    ) -> StoreResult<GradingResult>;
}
