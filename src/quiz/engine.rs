use std::collections::HashSet;
use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::config::Config;
use crate::domain::hash_guest_token;
use crate::domain::quiz::{Question, QuestionType, QuizStatus};
use crate::domain::session::{
    LeaderboardEntry, Participant, ParticipantIdentity, QuizSnapshot, Response, ResponseAnswer, Session, SessionStatus,
};
use crate::domain::tenant::Student;
use crate::error::CoreError;
use crate::identity::IdentityContext;
use crate::quiz::grading::grade;
use crate::quiz::messages::{ServerMessage, WireLeaderboardEntry, WireParticipantSummary, WireQuestion};
use crate::random::Random;
use crate::room_registry::RoomRegistry;
use crate::store::{ResponseTiming, Store};

/// The identity a joiner presents at the room code, before any participant
/// record exists (spec.md §4.4 point 2).
#[derive(Debug, Clone)]
pub enum Joiner {
    Guest { name: String },
    Student { external_id: String },
    IdentifiedGuest { name: String, external_id: String },
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub session: Session,
    pub participant: Participant,
    /// The raw, unhashed token — only ever handed back here. Absent for
    /// rostered `Student` joiners, who carry no bearer secret of their own.
    pub guest_token: Option<String>,
}

/// Caller-chosen terminal state for `end`; `auto_end` always lands on
/// `Completed` with `auto_ended_at` set (spec.md §4.4's state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    Cancelled,
}

impl EndReason {
    fn wire_str(self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::Cancelled => "cancelled",
        }
    }

    fn target_status(self) -> SessionStatus {
        match self {
            EndReason::Completed => SessionStatus::Completed,
            EndReason::Cancelled => SessionStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub response: Response,
    /// The direct reply owed to the submitting connection; the transport
    /// layer routes this back to the one socket that sent the answer.
    pub reply: ServerMessage,
}

/// C6: the session-lifecycle engine. Holds no state of its own beyond its
/// collaborators — every fact about a session lives in the `Store`, every
/// open socket lives in the `RoomRegistry`. Constructed once at startup and
/// shared via `Arc`, matching the other injected capabilities (spec.md §9
/// singleton redesign flag: no module-level globals here).
pub struct QuizEngine {
    store: Arc<dyn Store>,
    registry: Arc<RoomRegistry>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
    config: Config,
}

impl QuizEngine {
    pub fn new(store: Arc<dyn Store>, registry: Arc<RoomRegistry>, clock: Arc<dyn Clock>, random: Arc<dyn Random>, config: Config) -> Self {
        Self { store, registry, clock, random, config }
    }

    /// Point 1: publish-gated, snapshot-isolated session creation with
    /// bounded room-code retry.
    pub async fn create_session(&self, tenant: &IdentityContext, quiz_id: &str) -> Result<Session, CoreError> {
        let quiz = self.store.get_quiz(tenant, quiz_id).await?;
        if quiz.status != QuizStatus::Published {
            return Err(CoreError::precondition("quiz_not_published"));
        }
        let questions = self.store.list_questions(tenant, quiz_id).await?;
        if questions.is_empty() {
            return Err(CoreError::precondition("quiz_has_no_questions"));
        }

        let now = self.clock.now();
        let snapshot = QuizSnapshot {
            quiz_id: quiz.id.clone(),
            title: quiz.title.clone(),
            questions,
        };

        for attempt in 1..=self.config.room_code_retries {
            let room_code = self.random.room_code(self.config.room_code_length);
            if self.store.get_session_by_room_code(&room_code).await?.is_some() {
                if attempt == self.config.room_code_retries {
                    return Err(CoreError::exhausted("room_code_generation"));
                }
                continue;
            }
            let session = self
                .store
                .create_quiz_session(tenant, quiz_id, &room_code, snapshot, self.config.session_timeout_hours, now)
                .await?;
            self.store.set_last_room_code(tenant, quiz_id, &room_code).await?;
            return Ok(session);
        }
        Err(CoreError::exhausted("room_code_generation"))
    }

    /// Authoring-side guard in front of `Store::add_question`: the store
    /// itself has no `Config` to enforce `max_questions_per_quiz` against,
    /// so the cap is checked here before the insert (spec.md §6).
    pub async fn add_question(&self, tenant: &IdentityContext, quiz_id: &str, question: Question) -> Result<Question, CoreError> {
        let existing = self.store.list_questions(tenant, quiz_id).await?;
        if existing.len() >= self.config.max_questions_per_quiz {
            return Err(CoreError::precondition("max_questions_per_quiz_exceeded"));
        }
        self.store.add_question(tenant, quiz_id, question).await
    }

    /// Point 2.
    pub async fn join(&self, room_code: &str, joiner: Joiner) -> Result<JoinOutcome, CoreError> {
        let session = self
            .store
            .get_session_by_room_code(room_code)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("room {room_code} not found")))?;
        if !matches!(session.status, SessionStatus::Waiting | SessionStatus::InProgress) {
            return Err(CoreError::precondition("session_not_joinable"));
        }

        let tenant = IdentityContext::new(session.tenant_id.clone());
        let now = self.clock.now();

        let current_participants = self.store.list_participants(&tenant, &session.id).await?.len();
        if current_participants >= self.config.max_participants_per_session {
            return Err(CoreError::precondition("session_full"));
        }

        let (identity, guest_token) = match joiner {
            Joiner::Student { external_id } => {
                let student = self.resolve_student(&tenant, &external_id).await?;
                (ParticipantIdentity::Student { student_id: student.id, display_name: student.name }, None)
            }
            Joiner::Guest { name } => {
                let display_name = self.unique_display_name(&tenant, &session.id, &name).await?;
                let (raw, hash) = self.issue_guest_token();
                (ParticipantIdentity::Guest { display_name, guest_token_hash: hash }, Some(raw))
            }
            Joiner::IdentifiedGuest { name, external_id } => {
                let student = self.resolve_student(&tenant, &external_id).await?;
                let display_name = self.unique_display_name(&tenant, &session.id, &name).await?;
                let (raw, hash) = self.issue_guest_token();
                (
                    ParticipantIdentity::IdentifiedGuest {
                        display_name,
                        student_id: student.id,
                        guest_token_hash: hash,
                    },
                    Some(raw),
                )
            }
        };

        let participant = self.store.add_participant(&tenant, &session.id, identity, now).await?;
        let total_participants = self.store.list_participants(&tenant, &session.id).await?.len();

        self.registry
            .broadcast(
                &session.id,
                ServerMessage::ParticipantJoined {
                    timestamp: now,
                    participant: WireParticipantSummary {
                        id: participant.id.clone(),
                        display_name: participant.display_name().to_string(),
                    },
                    total_participants,
                },
                None,
            )
            .await;

        Ok(JoinOutcome { session, participant, guest_token })
    }

    async fn resolve_student(&self, tenant: &IdentityContext, external_id: &str) -> Result<Student, CoreError> {
        self.store
            .find_student_by_external_id(tenant, external_id)
            .await?
            .ok_or_else(|| CoreError::validation(format!("unknown student external_id {external_id}")))
    }

    fn issue_guest_token(&self) -> (String, String) {
        let raw = self.random.guest_token(self.config.guest_token_length_bytes);
        let hash = hash_guest_token(&raw);
        (raw, hash)
    }

    async fn unique_display_name(&self, tenant: &IdentityContext, session_id: &str, requested: &str) -> Result<String, CoreError> {
        let existing = self.store.list_participants(tenant, session_id).await?;
        let taken: HashSet<&str> = existing.iter().map(|p| p.display_name()).collect();
        if !taken.contains(requested) {
            return Ok(requested.to_string());
        }
        let mut suffix = 2;
        loop {
            let candidate = format!("{requested} ({suffix})");
            if !taken.contains(candidate.as_str()) {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }

    /// Point 3.
    pub async fn start(&self, tenant: &IdentityContext, session_id: &str) -> Result<Session, CoreError> {
        let session = self.store.get_session(tenant, session_id).await?;
        if session.status != SessionStatus::Waiting {
            return Err(CoreError::precondition("session_not_waiting"));
        }
        let now = self.clock.now();
        let session = self
            .store
            .set_session_status(tenant, session_id, SessionStatus::InProgress, Some(0), now, false)
            .await?;

        self.registry
            .broadcast(
                session_id,
                ServerMessage::SessionStarted { timestamp: now, session_id: session_id.to_string() },
                None,
            )
            .await;
        if let Some(question) = session.snapshot.questions.first() {
            self.registry
                .broadcast(
                    session_id,
                    ServerMessage::QuestionStarted { timestamp: now, question: WireQuestion::from(question) },
                    None,
                )
                .await;
        }
        Ok(session)
    }

    /// Point 4, host-initiated.
    pub async fn end(&self, tenant: &IdentityContext, session_id: &str, reason: EndReason) -> Result<Session, CoreError> {
        self.end_internal(tenant, session_id, reason, false).await
    }

    /// Point 4's `auto_timeout` edge, driven by the scheduler (C8) rather
    /// than a host action — the caller only knows a session id, never its
    /// tenant, so this resolves it cross-tenant first.
    pub async fn auto_end(&self, session_id: &str) -> Result<Session, CoreError> {
        let session = self
            .store
            .get_session_unscoped(session_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("session {session_id} not found")))?;
        let tenant = IdentityContext::new(session.tenant_id.clone());
        self.end_internal(&tenant, session_id, EndReason::Completed, true).await
    }

    async fn end_internal(&self, tenant: &IdentityContext, session_id: &str, reason: EndReason, auto_ended: bool) -> Result<Session, CoreError> {
        let session = self.store.get_session(tenant, session_id).await?;
        if matches!(session.status, SessionStatus::Completed | SessionStatus::Cancelled) {
            return Err(CoreError::precondition("session_already_ended"));
        }
        let now = self.clock.now();

        let final_leaderboard = self.store.get_leaderboard(tenant, session_id, 100).await?;
        self.registry
            .broadcast(
                session_id,
                ServerMessage::LeaderboardUpdate {
                    timestamp: now,
                    leaderboard: wire_leaderboard(&final_leaderboard),
                },
                None,
            )
            .await;

        let session = self
            .store
            .set_session_status(tenant, session_id, reason.target_status(), None, now, auto_ended)
            .await?;

        let wire_reason = if auto_ended { "timeout" } else { reason.wire_str() };
        self.registry
            .broadcast(
                session_id,
                ServerMessage::SessionEnded { timestamp: now, session_id: session_id.to_string(), reason: wire_reason.to_string() },
                None,
            )
            .await;

        Ok(session)
    }

    /// Point 5.
    pub async fn advance(&self, tenant: &IdentityContext, session_id: &str) -> Result<Session, CoreError> {
        let session = self.store.get_session(tenant, session_id).await?;
        if session.status != SessionStatus::InProgress {
            return Err(CoreError::precondition("session_not_in_progress"));
        }
        let next_index = session.current_question_index.unwrap_or(0) + 1;
        if next_index as usize >= session.snapshot.questions.len() {
            return Err(CoreError::precondition("no_more_questions"));
        }

        let now = self.clock.now();
        let session = self
            .store
            .set_session_status(tenant, session_id, SessionStatus::InProgress, Some(next_index), now, false)
            .await?;

        if let Some(question) = session.snapshot.questions.get(next_index as usize) {
            self.registry
                .broadcast(
                    session_id,
                    ServerMessage::QuestionStarted { timestamp: now, question: WireQuestion::from(question) },
                    None,
                )
                .await;
        }
        Ok(session)
    }

    /// Point 6. Authenticates the submitter by guest token rather than a
    /// tenant bearer — the caller never presents tenant credentials, so the
    /// owning tenant is resolved from the session itself.
    pub async fn submit_answer(
        &self,
        session_id: &str,
        participant_id: &str,
        guest_token: &str,
        question_id: &str,
        answer: serde_json::Value,
        time_taken_ms: u64,
    ) -> Result<SubmitOutcome, CoreError> {
        let session = self
            .store
            .get_session_unscoped(session_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("session {session_id} not found")))?;
        let tenant = IdentityContext::new(session.tenant_id.clone());

        let participant = self.store.get_participant(&tenant, participant_id).await?;
        if participant.session_id != session_id {
            return Err(CoreError::authz("participant does not belong to this session"));
        }
        self.authenticate_guest_token(&participant, guest_token)?;

        let question = session
            .snapshot
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .ok_or_else(|| CoreError::not_found(format!("question {question_id} not found")))?;

        let response_answer = parse_response_answer(question.question_type, &answer)?;
        let outcome = grade(&question.correct_answer, &response_answer, question.points);
        let now = self.clock.now();

        let response = self
            .store
            .submit_response(
                &tenant,
                session_id,
                participant_id,
                question_id,
                response_answer,
                outcome.is_correct,
                outcome.points_earned,
                ResponseTiming { response_time_ms: time_taken_ms, submitted_at: now },
            )
            .await?;

        self.store
            .update_participant_score(&tenant, participant_id, outcome.points_earned, time_taken_ms as i64, outcome.is_correct)
            .await?;

        self.registry
            .broadcast_hosts(
                session_id,
                ServerMessage::ParticipantAnswered {
                    timestamp: now,
                    participant_id: participant_id.to_string(),
                    question_id: question_id.to_string(),
                    is_correct: outcome.is_correct,
                },
            )
            .await;

        let total_participants = self.store.list_participants(&tenant, session_id).await?.len();
        let answers_received = self.store.count_responses_for_question(&tenant, session_id, question_id).await? as usize;
        let completion_percentage = if total_participants == 0 {
            0.0
        } else {
            answers_received as f64 / total_participants as f64 * 100.0
        };
        self.registry
            .broadcast_hosts(
                session_id,
                ServerMessage::StatsUpdate { timestamp: now, total_participants, answers_received, completion_percentage },
            )
            .await;

        let top_ten = self.store.get_leaderboard(&tenant, session_id, 10).await?;
        self.registry
            .broadcast(
                session_id,
                ServerMessage::LeaderboardUpdate { timestamp: now, leaderboard: wire_leaderboard(&top_ten) },
                None,
            )
            .await;

        let correct_answer = if outcome.is_correct == Some(false) && question.question_type != QuestionType::Poll {
            Some(serde_json::to_value(&question.correct_answer).unwrap_or(serde_json::Value::Null))
        } else {
            None
        };
        let reply = ServerMessage::AnswerSubmitted {
            timestamp: now,
            question_id: question_id.to_string(),
            is_correct: outcome.is_correct,
            points_earned: outcome.points_earned,
            correct_answer,
        };

        Ok(SubmitOutcome { response, reply })
    }

    fn authenticate_guest_token(&self, participant: &Participant, presented: &str) -> Result<(), CoreError> {
        let expected_hash = participant
            .identity
            .guest_token_hash()
            .ok_or_else(|| CoreError::authz("participant has no guest token"))?;
        let presented_hash = hash_guest_token(presented);
        if expected_hash.as_bytes().ct_eq(presented_hash.as_bytes()).unwrap_u8() == 1 {
            Ok(())
        } else {
            Err(CoreError::authz("invalid guest token"))
        }
    }

    /// Point 7.
    pub async fn get_leaderboard(&self, tenant: &IdentityContext, session_id: &str, limit: usize) -> Result<Vec<LeaderboardEntry>, CoreError> {
        let participants = self.store.get_leaderboard(tenant, session_id, limit).await?;
        Ok(participants
            .iter()
            .enumerate()
            .map(|(i, p)| LeaderboardEntry {
                participant_id: p.id.clone(),
                display_name: p.display_name().to_string(),
                score: p.score,
                rank: (i + 1) as u32,
            })
            .collect())
    }
}

fn wire_leaderboard(participants: &[Participant]) -> Vec<WireLeaderboardEntry> {
    participants
        .iter()
        .enumerate()
        .map(|(i, p)| WireLeaderboardEntry {
            rank: (i + 1) as u32,
            participant_id: p.id.clone(),
            display_name: p.display_name().to_string(),
            score: p.score,
            correct_answers: p.correct_answers,
            total_time_ms: p.total_time_ms,
            is_active: p.disconnected_at.is_none(),
        })
        .collect()
}

/// The wire boundary carries only the answer value, not the
/// `ResponseAnswer` tag — this stitches the tag back on from the question
/// being answered before deserialising, so a shape mismatch surfaces as a
/// `Validation` error rather than a panic (see `quiz::messages` doc note).
fn parse_response_answer(question_type: QuestionType, raw: &serde_json::Value) -> Result<ResponseAnswer, CoreError> {
    let mut obj = match raw {
        serde_json::Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("answer".to_string(), other.clone());
            map
        }
    };
    let tag = match question_type {
        QuestionType::MultipleChoice => "multiple_choice",
        QuestionType::TrueFalse => "true_false",
        QuestionType::ShortAnswer => "short_answer",
        QuestionType::Poll => "poll",
    };
    obj.insert("question_type".to_string(), serde_json::Value::String(tag.to_string()));
    serde_json::from_value(serde_json::Value::Object(obj)).map_err(|e| CoreError::validation(format!("invalid answer payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::domain::quiz::{Choice, CorrectAnswer, Question, QuestionOptions};
    use crate::random::test_support::ScriptedRandom;
    use crate::store::memory::MemoryStore;
    use std::time::Duration;

    fn engine(store: Arc<MemoryStore>, random: Arc<dyn Random>, clock: Arc<FixedClock>) -> QuizEngine {
        engine_with_config(store, random, clock, Config::default())
    }

    fn engine_with_config(store: Arc<MemoryStore>, random: Arc<dyn Random>, clock: Arc<FixedClock>, config: Config) -> QuizEngine {
        let registry = RoomRegistry::new(clock.clone(), Duration::from_secs(25), Duration::from_secs(60));
        QuizEngine::new(store, registry, clock, random, config)
    }

    async fn seed_published_quiz(store: &MemoryStore, tenant: &IdentityContext) -> String {
        let quiz = store.create_quiz(tenant, None, "Cell Biology", None).await.unwrap();
        store
            .add_question(
                tenant,
                &quiz.id,
                Question {
                    id: "q1".into(),
                    quiz_id: quiz.id.clone(),
                    question_type: QuestionType::MultipleChoice,
                    text: "2+2?".into(),
                    order_index: 0,
                    points: 10,
                    time_limit_seconds: Some(20),
                    options: QuestionOptions::MultipleChoice {
                        choices: vec![Choice { id: "a".into(), text: "3".into() }, Choice { id: "b".into(), text: "4".into() }],
                        shuffle_options: None,
                    },
                    correct_answer: CorrectAnswer::MultipleChoice { answer: "b".into() },
                    explanation: None,
                    media_url: None,
                },
            )
            .await
            .unwrap();
        store.set_quiz_status(tenant, &quiz.id, QuizStatus::Published).await.unwrap();
        quiz.id
    }

    #[tokio::test]
    async fn create_session_requires_published_quiz_with_questions() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz = store.create_quiz(&tenant, None, "Empty", None).await.unwrap();
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = engine(store.clone(), Arc::new(ScriptedRandom::new([0u8; 6])), clock);

        let err = engine.create_session(&tenant, &quiz.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }

    #[tokio::test]
    async fn create_session_snapshots_and_issues_room_code() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz_id = seed_published_quiz(&store, &tenant).await;
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = engine(store.clone(), Arc::new(ScriptedRandom::new([0u8; 6])), clock);

        let session = engine.create_session(&tenant, &quiz_id).await.unwrap();
        assert_eq!(session.room_code.len(), 6);
        assert_eq!(session.snapshot.questions.len(), 1);
    }

    #[tokio::test]
    async fn join_dedupes_guest_names() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz_id = seed_published_quiz(&store, &tenant).await;
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = engine(store.clone(), Arc::new(ScriptedRandom::new((0u8..64).collect::<Vec<_>>())), clock);
        let session = engine.create_session(&tenant, &quiz_id).await.unwrap();

        let first = engine.join(&session.room_code, Joiner::Guest { name: "Alice".into() }).await.unwrap();
        let second = engine.join(&session.room_code, Joiner::Guest { name: "Alice".into() }).await.unwrap();

        assert_eq!(first.participant.display_name(), "Alice");
        assert_eq!(second.participant.display_name(), "Alice (2)");
        assert!(first.guest_token.is_some());
        assert!(second.guest_token.is_some());
        assert_ne!(first.guest_token, second.guest_token);
    }

    #[tokio::test]
    async fn submit_answer_rejects_wrong_guest_token() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz_id = seed_published_quiz(&store, &tenant).await;
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = engine(store.clone(), Arc::new(ScriptedRandom::new((0u8..64).collect::<Vec<_>>())), clock);
        let session = engine.create_session(&tenant, &quiz_id).await.unwrap();
        engine.start(&tenant, &session.id).await.unwrap();
        let joined = engine.join(&session.room_code, Joiner::Guest { name: "Bob".into() }).await.unwrap();

        let err = engine
            .submit_answer(&session.id, &joined.participant.id, "wrong-token", "q1", serde_json::json!({"selected": "b"}), 1500)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Authz(_)));
    }

    #[tokio::test]
    async fn submit_answer_grades_and_prevents_double_submission() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz_id = seed_published_quiz(&store, &tenant).await;
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = engine(store.clone(), Arc::new(ScriptedRandom::new((0u8..64).collect::<Vec<_>>())), clock);
        let session = engine.create_session(&tenant, &quiz_id).await.unwrap();
        engine.start(&tenant, &session.id).await.unwrap();
        let joined = engine.join(&session.room_code, Joiner::Guest { name: "Carol".into() }).await.unwrap();
        let token = joined.guest_token.clone().unwrap();

        let outcome = engine
            .submit_answer(&session.id, &joined.participant.id, &token, "q1", serde_json::json!({"selected": "b"}), 1200)
            .await
            .unwrap();
        assert_eq!(outcome.response.is_correct, Some(true));
        assert_eq!(outcome.response.points_earned, 10);
        assert!(matches!(outcome.reply, ServerMessage::AnswerSubmitted { correct_answer: None, .. }));

        let err = engine
            .submit_answer(&session.id, &joined.participant.id, &token, "q1", serde_json::json!({"selected": "a"}), 900)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn end_transitions_to_completed_and_rejects_double_end() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz_id = seed_published_quiz(&store, &tenant).await;
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = engine(store.clone(), Arc::new(ScriptedRandom::new((0u8..64).collect::<Vec<_>>())), clock);
        let session = engine.create_session(&tenant, &quiz_id).await.unwrap();
        engine.start(&tenant, &session.id).await.unwrap();

        let ended = engine.end(&tenant, &session.id, EndReason::Completed).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);

        let err = engine.end(&tenant, &session.id, EndReason::Cancelled).await.unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }

    #[tokio::test]
    async fn join_rejects_past_session_capacity() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz_id = seed_published_quiz(&store, &tenant).await;
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let config = Config { max_participants_per_session: 2, ..Config::default() };
        let engine = engine_with_config(
            store.clone(),
            Arc::new(ScriptedRandom::new((0u8..128).collect::<Vec<_>>())),
            clock,
            config,
        );
        let session = engine.create_session(&tenant, &quiz_id).await.unwrap();

        engine.join(&session.room_code, Joiner::Guest { name: "Guest1".into() }).await.unwrap();
        engine.join(&session.room_code, Joiner::Guest { name: "Guest2".into() }).await.unwrap();

        let err = engine
            .join(&session.room_code, Joiner::Guest { name: "Guest3".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }

    #[tokio::test]
    async fn add_question_rejects_past_quiz_question_cap() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let config = Config { max_questions_per_quiz: 1, ..Config::default() };
        let engine = engine_with_config(store.clone(), Arc::new(ScriptedRandom::new([0u8; 6])), clock, config);
        let quiz = store.create_quiz(&tenant, None, "Capped", None).await.unwrap();

        let make_question = |id: &str, order_index: u32| Question {
            id: id.into(),
            quiz_id: quiz.id.clone(),
            question_type: QuestionType::TrueFalse,
            text: "True or false?".into(),
            order_index,
            points: 10,
            time_limit_seconds: Some(10),
            options: QuestionOptions::TrueFalse {},
            correct_answer: CorrectAnswer::TrueFalse { answer: true },
            explanation: None,
            media_url: None,
        };

        engine.add_question(&tenant, &quiz.id, make_question("q1", 0)).await.unwrap();

        let err = engine.add_question(&tenant, &quiz.id, make_question("q2", 1)).await.unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }

    #[tokio::test]
    async fn advance_rejects_past_last_question() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("tenant-a");
        let quiz_id = seed_published_quiz(&store, &tenant).await;
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = engine(store.clone(), Arc::new(ScriptedRandom::new((0u8..64).collect::<Vec<_>>())), clock);
        let session = engine.create_session(&tenant, &quiz_id).await.unwrap();
        engine.start(&tenant, &session.id).await.unwrap();

        let err = engine.advance(&tenant, &session.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }
}
