//! In-memory reference implementation of [`Store`], used by tests and as a
//! living specification of the tenant-isolation invariant: every lookup by
//! id is first checked against the caller's `tenant_id` before it is
//! returned, except the handful of methods the trait documents as
//! cross-tenant.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::assessment::{
    AiModelRun, Assessment, AssessmentConfig, AssessmentStatus, FinalisedBy, GradingResult,
    OutsiderStudent, ResultIdentity, ResultStatus,
};
use crate::domain::quiz::{Question, Quiz, QuizStatus};
use crate::domain::session::{
    Participant, ParticipantIdentity, QuizSnapshot, Response, ResponseAnswer, Session, SessionStatus,
};
use crate::domain::tenant::{Class, Student};
use crate::error::CoreError;
use crate::identity::IdentityContext;

use super::{ResponseTiming, Store, StoreResult};

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[derive(Default)]
struct Inner {
    classes: HashMap<String, Class>,
    students: HashMap<String, Student>,
    quizzes: HashMap<String, Quiz>,
    questions: HashMap<String, Vec<Question>>,
    sessions: HashMap<String, Session>,
    participants: HashMap<String, Participant>,
    responses: HashMap<String, Response>,
    assessments: HashMap<String, Assessment>,
    outsiders: HashMap<String, OutsiderStudent>,
    results: HashMap<String, GradingResult>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    /// Test helper: seeds a roster student directly, bypassing any
    /// enrollment workflow (not part of the public contract).
    pub fn seed_student(&self, tenant_id: &str, name: &str, external_id: &str) -> Student {
        let student = Student {
            id: new_id("student"),
            tenant_id: Some(tenant_id.to_string()),
            name: name.to_string(),
            external_id: external_id.to_string(),
            overall_grade_cache: None,
        };
        self.inner.lock().unwrap().students.insert(student.id.clone(), student.clone());
        student
    }

    pub fn seed_class(&self, tenant_id: &str, name: &str) -> Class {
        let class = Class {
            id: new_id("class"),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            description: None,
        };
        self.inner.lock().unwrap().classes.insert(class.id.clone(), class.clone());
        class
    }
}

fn owned<T: Clone>(map: &HashMap<String, T>, id: &str, owner_tenant: impl Fn(&T) -> &str, tenant: &IdentityContext) -> StoreResult<T> {
    match map.get(id) {
        Some(v) if owner_tenant(v) == tenant.tenant_id() => Ok(v.clone()),
        _ => Err(CoreError::not_found(format!("{id} not found for tenant"))),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_class(&self, tenant: &IdentityContext, name: &str, description: Option<&str>) -> StoreResult<Class> {
        let class = Class {
            id: new_id("class"),
            tenant_id: tenant.tenant_id().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        self.inner.lock().unwrap().classes.insert(class.id.clone(), class.clone());
        Ok(class)
    }

    async fn get_class(&self, tenant: &IdentityContext, class_id: &str) -> StoreResult<Class> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.classes, class_id, |c| &c.tenant_id, tenant)
    }

    async fn list_roster(&self, tenant: &IdentityContext, class_id: &str) -> StoreResult<Vec<Student>> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.classes, class_id, |c| &c.tenant_id, tenant)?;
        Ok(inner
            .students
            .values()
            .filter(|s| s.tenant_id.as_deref() == Some(tenant.tenant_id()))
            .cloned()
            .collect())
    }

    async fn find_student_by_external_id(&self, tenant: &IdentityContext, external_id: &str) -> StoreResult<Option<Student>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .students
            .values()
            .find(|s| s.tenant_id.as_deref() == Some(tenant.tenant_id()) && s.external_id == external_id)
            .cloned())
    }

    async fn create_quiz(&self, tenant: &IdentityContext, class_id: Option<&str>, title: &str, description: Option<&str>) -> StoreResult<Quiz> {
        let now = Utc::now();
        let quiz = Quiz {
            id: new_id("quiz"),
            tenant_id: tenant.tenant_id().to_string(),
            class_id: class_id.map(str::to_string),
            title: title.to_string(),
            description: description.map(str::to_string),
            status: QuizStatus::Draft,
            settings: serde_json::json!({}),
            last_room_code: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().quizzes.insert(quiz.id.clone(), quiz.clone());
        Ok(quiz)
    }

    async fn get_quiz(&self, tenant: &IdentityContext, quiz_id: &str) -> StoreResult<Quiz> {
        let inner = self.inner.lock().unwrap();
        let quiz = owned(&inner.quizzes, quiz_id, |q| &q.tenant_id, tenant)?;
        if quiz.is_deleted() {
            return Err(CoreError::not_found(format!("quiz {quiz_id} not found")));
        }
        Ok(quiz)
    }

    async fn list_quizzes(&self, tenant: &IdentityContext, class_id: Option<&str>) -> StoreResult<Vec<Quiz>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .quizzes
            .values()
            .filter(|q| q.tenant_id == tenant.tenant_id() && !q.is_deleted())
            .filter(|q| class_id.map(|c| q.class_id.as_deref() == Some(c)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn set_quiz_status(&self, tenant: &IdentityContext, quiz_id: &str, status: QuizStatus) -> StoreResult<Quiz> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.quizzes, quiz_id, |q| &q.tenant_id, tenant)?;
        let quiz = inner.quizzes.get_mut(quiz_id).unwrap();
        quiz.status = status;
        quiz.updated_at = Utc::now();
        Ok(quiz.clone())
    }

    async fn soft_delete_quiz(&self, tenant: &IdentityContext, quiz_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.quizzes, quiz_id, |q| &q.tenant_id, tenant)?;
        let quiz = inner.quizzes.get_mut(quiz_id).unwrap();
        quiz.deleted_at = Some(now);
        Ok(())
    }

    async fn add_question(&self, tenant: &IdentityContext, quiz_id: &str, question: Question) -> StoreResult<Question> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.quizzes, quiz_id, |q| &q.tenant_id, tenant)?;
        inner.questions.entry(quiz_id.to_string()).or_default().push(question.clone());
        Ok(question)
    }

    async fn list_questions(&self, tenant: &IdentityContext, quiz_id: &str) -> StoreResult<Vec<Question>> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.quizzes, quiz_id, |q| &q.tenant_id, tenant)?;
        let mut qs = inner.questions.get(quiz_id).cloned().unwrap_or_default();
        qs.sort_by_key(|q| q.order_index);
        Ok(qs)
    }

    async fn set_last_room_code(&self, tenant: &IdentityContext, quiz_id: &str, room_code: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.quizzes, quiz_id, |q| &q.tenant_id, tenant)?;
        inner.quizzes.get_mut(quiz_id).unwrap().last_room_code = Some(room_code.to_string());
        Ok(())
    }

    async fn create_quiz_session(
        &self,
        tenant: &IdentityContext,
        quiz_id: &str,
        room_code: &str,
        snapshot: QuizSnapshot,
        timeout_hours: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Session> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.quizzes, quiz_id, |q| &q.tenant_id, tenant)?;
        if inner.sessions.values().any(|s| s.room_code == room_code) {
            return Err(CoreError::conflict("room_code_taken"));
        }
        let session = Session {
            id: new_id("session"),
            tenant_id: tenant.tenant_id().to_string(),
            quiz_id: quiz_id.to_string(),
            room_code: room_code.to_string(),
            status: SessionStatus::Waiting,
            snapshot,
            current_question_index: None,
            timeout_hours,
            started_at: None,
            ended_at: None,
            auto_ended_at: None,
            created_at: now,
        };
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, tenant: &IdentityContext, session_id: &str) -> StoreResult<Session> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.sessions, session_id, |s| &s.tenant_id, tenant)
    }

    async fn get_session_by_room_code(&self, room_code: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.lock().unwrap();
        for session in inner.sessions.values() {
            if session.room_code == room_code {
                if let Some(quiz) = inner.quizzes.get(&session.quiz_id) {
                    if quiz.is_deleted() {
                        return Ok(None);
                    }
                }
                return Ok(Some(session.clone()));
            }
        }
        Ok(None)
    }

    async fn get_session_unscoped(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.get(session_id).cloned())
    }

    async fn set_session_status(
        &self,
        tenant: &IdentityContext,
        session_id: &str,
        status: SessionStatus,
        current_question_index: Option<u32>,
        now: DateTime<Utc>,
        auto_ended: bool,
    ) -> StoreResult<Session> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.sessions, session_id, |s| &s.tenant_id, tenant)?;
        let session = inner.sessions.get_mut(session_id).unwrap();
        session.status = status;
        if current_question_index.is_some() {
            session.current_question_index = current_question_index;
        }
        match status {
            SessionStatus::InProgress if session.started_at.is_none() => session.started_at = Some(now),
            SessionStatus::Completed | SessionStatus::Cancelled => {
                session.ended_at = Some(now);
                if auto_ended {
                    session.auto_ended_at = Some(now);
                }
            }
            _ => {}
        }
        Ok(session.clone())
    }

    async fn get_timed_out_sessions(&self, now: DateTime<Utc>, threshold_hours: i64) -> StoreResult<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Waiting | SessionStatus::InProgress))
            .filter(|s| {
                let timeout = s.timeout_hours.max(threshold_hours);
                s.created_at + chrono::Duration::hours(timeout) < now
            })
            .cloned()
            .collect())
    }

    async fn add_participant(
        &self,
        tenant: &IdentityContext,
        session_id: &str,
        identity: ParticipantIdentity,
        now: DateTime<Utc>,
    ) -> StoreResult<Participant> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.sessions, session_id, |s| &s.tenant_id, tenant)?;

        if let ParticipantIdentity::Student { student_id, .. } = &identity {
            let duplicate = inner.participants.values().any(|p| {
                p.session_id == session_id
                    && matches!(&p.identity, ParticipantIdentity::Student { student_id: existing, .. } if existing == student_id)
            });
            if duplicate {
                return Err(CoreError::conflict("duplicate_student"));
            }
        }

        let participant = Participant {
            id: new_id("participant"),
            session_id: session_id.to_string(),
            identity,
            score: 0,
            correct_answers: 0,
            total_time_ms: 0,
            joined_at: now,
            last_heartbeat_at: now,
            disconnected_at: None,
            anonymised_at: None,
        };
        inner.participants.insert(participant.id.clone(), participant.clone());
        Ok(participant)
    }

    async fn get_participant(&self, tenant: &IdentityContext, participant_id: &str) -> StoreResult<Participant> {
        let inner = self.inner.lock().unwrap();
        let participant = inner
            .participants
            .get(participant_id)
            .ok_or_else(|| CoreError::not_found(format!("participant {participant_id} not found")))?;
        let session = inner
            .sessions
            .get(&participant.session_id)
            .ok_or_else(|| CoreError::not_found("session not found"))?;
        if session.tenant_id != tenant.tenant_id() {
            return Err(CoreError::not_found(format!("participant {participant_id} not found")));
        }
        Ok(participant.clone())
    }

    async fn get_participant_by_guest_token_hash(&self, session_id: &str, token_hash: &str) -> StoreResult<Option<Participant>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .participants
            .values()
            .find(|p| p.session_id == session_id && p.identity.guest_token_hash() == Some(token_hash))
            .cloned())
    }

    async fn list_participants(&self, tenant: &IdentityContext, session_id: &str) -> StoreResult<Vec<Participant>> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.sessions, session_id, |s| &s.tenant_id, tenant)?;
        Ok(inner.participants.values().filter(|p| p.session_id == session_id).cloned().collect())
    }

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
    ) -> StoreResult<Response> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.sessions, session_id, |s| &s.tenant_id, tenant)?;

        let already = inner
            .responses
            .values()
            .any(|r| r.session_id == session_id && r.participant_id == participant_id && r.question_id == question_id);
        if already {
            return Err(CoreError::conflict("already_answered"));
        }

        let response = Response {
            id: new_id("response"),
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            question_id: question_id.to_string(),
            answer,
            is_correct,
            points_earned,
            response_time_ms: timing.response_time_ms,
            submitted_at: timing.submitted_at,
        };
        inner.responses.insert(response.id.clone(), response.clone());
        Ok(response)
    }

    async fn update_participant_score(
        &self,
        tenant: &IdentityContext,
        participant_id: &str,
        add_points: i64,
        add_time_ms: i64,
        is_correct: Option<bool>,
    ) -> StoreResult<Participant> {
        let mut inner = self.inner.lock().unwrap();
        let participant = inner
            .participants
            .get(participant_id)
            .ok_or_else(|| CoreError::not_found(format!("participant {participant_id} not found")))?;
        let session_tenant = inner
            .sessions
            .get(&participant.session_id)
            .map(|s| s.tenant_id.clone())
            .ok_or_else(|| CoreError::not_found("session not found"))?;
        if session_tenant != tenant.tenant_id() {
            return Err(CoreError::not_found(format!("participant {participant_id} not found")));
        }
        let participant = inner.participants.get_mut(participant_id).unwrap();
        participant.score += add_points;
        participant.total_time_ms += add_time_ms;
        if is_correct == Some(true) {
            participant.correct_answers += 1;
        }
        Ok(participant.clone())
    }

    async fn count_responses_for_question(&self, tenant: &IdentityContext, session_id: &str, question_id: &str) -> StoreResult<u32> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.sessions, session_id, |s| &s.tenant_id, tenant)?;
        Ok(inner
            .responses
            .values()
            .filter(|r| r.session_id == session_id && r.question_id == question_id)
            .count() as u32)
    }

    async fn get_leaderboard(&self, tenant: &IdentityContext, session_id: &str, limit: usize) -> StoreResult<Vec<Participant>> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.sessions, session_id, |s| &s.tenant_id, tenant)?;
        let mut participants: Vec<Participant> = inner.participants.values().filter(|p| p.session_id == session_id).cloned().collect();
        participants.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.total_time_ms.cmp(&b.total_time_ms))
                .then(a.joined_at.cmp(&b.joined_at))
        });
        participants.truncate(limit);
        Ok(participants)
    }

    async fn anonymise_old_guests(&self, now: DateTime<Utc>, retention_days: i64) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0u64;
        for participant in inner.participants.values_mut() {
            if participant.anonymised_at.is_some() {
                continue;
            }
            if !participant.identity.is_guest_like() {
                continue;
            }
            if now - participant.joined_at > chrono::Duration::days(retention_days) {
                let suffix: String = participant.id.chars().rev().take(6).collect::<String>().chars().rev().collect();
                if let Some(display_name) = participant.identity.display_name_mut() {
                    *display_name = format!("Anonymous User #{suffix}");
                }
                participant.anonymised_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn create_assessment(&self, tenant: &IdentityContext, config: AssessmentConfig, now: DateTime<Utc>) -> StoreResult<Assessment> {
        let assessment = Assessment {
            id: new_id("assessment"),
            tenant_id: tenant.tenant_id().to_string(),
            config,
            status: AssessmentStatus::Queued,
            total_submissions: 0,
            processed_submissions: 0,
            error_message: None,
            narrative: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.inner.lock().unwrap().assessments.insert(assessment.id.clone(), assessment.clone());
        Ok(assessment)
    }

    async fn get_assessment(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Assessment> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)
    }

    async fn set_assessment_status(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        status: AssessmentStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Assessment> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)?;
        let assessment = inner.assessments.get_mut(assessment_id).unwrap();
        assessment.status = status;
        assessment.error_message = error_message.map(str::to_string);
        assessment.updated_at = now;
        if matches!(status, AssessmentStatus::Completed | AssessmentStatus::Failed) {
            assessment.completed_at = Some(now);
        }
        Ok(assessment.clone())
    }

    async fn set_assessment_narrative(&self, tenant: &IdentityContext, assessment_id: &str, narrative: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)?;
        inner.assessments.get_mut(assessment_id).unwrap().narrative = Some(narrative.to_string());
        Ok(())
    }

    async fn set_assessment_progress(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        total_submissions: u32,
        processed_submissions: u32,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)?;
        let assessment = inner.assessments.get_mut(assessment_id).unwrap();
        assessment.total_submissions = total_submissions;
        assessment.processed_submissions = processed_submissions;
        Ok(())
    }

    async fn create_outsider(&self, tenant: &IdentityContext, assessment_id: &str, submitted_name: &str) -> StoreResult<OutsiderStudent> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)?;
        let outsider = OutsiderStudent {
            id: new_id("outsider"),
            assessment_id: assessment_id.to_string(),
            submitted_name: submitted_name.to_string(),
            merged_into_student_id: None,
        };
        inner.outsiders.insert(outsider.id.clone(), outsider.clone());
        Ok(outsider)
    }

    async fn list_outsiders(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Vec<OutsiderStudent>> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)?;
        Ok(inner
            .outsiders
            .values()
            .filter(|o| o.assessment_id == assessment_id)
            .cloned()
            .collect())
    }

    async fn merge_outsider(&self, tenant: &IdentityContext, outsider_id: &str, student_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let assessment_id = inner
            .outsiders
            .get(outsider_id)
            .ok_or_else(|| CoreError::not_found(format!("outsider {outsider_id} not found")))?
            .assessment_id
            .clone();
        owned(&inner.assessments, &assessment_id, |a| &a.tenant_id, tenant)?;
        inner.outsiders.get_mut(outsider_id).unwrap().merged_into_student_id = Some(student_id.to_string());
        for result in inner.results.values_mut() {
            if let ResultIdentity::Outsider { outsider_id: existing } = &result.identity {
                if existing == outsider_id {
                    result.identity = ResultIdentity::Student { student_id: student_id.to_string() };
                }
            }
        }
        Ok(())
    }

    async fn create_result(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        question_id: &str,
        file_ref: &str,
        identity: ResultIdentity,
        now: DateTime<Utc>,
    ) -> StoreResult<GradingResult> {
        let mut inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)?;
        let result = GradingResult {
            id: new_id("result"),
            assessment_id: assessment_id.to_string(),
            question_id: question_id.to_string(),
            file_ref: file_ref.to_string(),
            identity,
            status: ResultStatus::PendingGrade,
            extracted_answer: None,
            score: None,
            feedback: None,
            runs: Vec::new(),
            finalised_by: None,
            reviewed_at: None,
            created_at: now,
        };
        inner.results.insert(result.id.clone(), result.clone());
        Ok(result)
    }

    async fn list_results(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Vec<GradingResult>> {
        let inner = self.inner.lock().unwrap();
        owned(&inner.assessments, assessment_id, |a| &a.tenant_id, tenant)?;
        Ok(inner.results.values().filter(|r| r.assessment_id == assessment_id).cloned().collect())
    }

    async fn get_result(&self, tenant: &IdentityContext, result_id: &str) -> StoreResult<GradingResult> {
        let inner = self.inner.lock().unwrap();
        let result = inner
            .results
            .get(result_id)
            .ok_or_else(|| CoreError::not_found(format!("result {result_id} not found")))?;
        owned(&inner.assessments, &result.assessment_id, |a| &a.tenant_id, tenant)?;
        Ok(result.clone())
    }

    async fn record_ai_run(&self, tenant: &IdentityContext, result_id: &str, run: AiModelRun) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let assessment_id = inner
            .results
            .get(result_id)
            .ok_or_else(|| CoreError::not_found(format!("result {result_id} not found")))?
            .assessment_id
            .clone();
        owned(&inner.assessments, &assessment_id, |a| &a.tenant_id, tenant)?;
        let result = inner.results.get_mut(result_id).unwrap();
        if run.run_index == 0 {
            result.extracted_answer = run.extracted_answer.clone();
        }
        result.runs.push(run);
        Ok(())
    }

    async fn finalise_result(
        &self,
        tenant: &IdentityContext,
        result_id: &str,
        status: ResultStatus,
        score: Option<f64>,
        feedback: Option<&str>,
        finalised_by: Option<FinalisedBy>,
        now: DateTime<Utc>,
    ) -> StoreResult<GradingResult> {
        let mut inner = self.inner.lock().unwrap();
        let assessment_id = inner
            .results
            .get(result_id)
            .ok_or_else(|| CoreError::not_found(format!("result {result_id} not found")))?
            .assessment_id
            .clone();
        owned(&inner.assessments, &assessment_id, |a| &a.tenant_id, tenant)?;
        let result = inner.results.get_mut(result_id).unwrap();
        result.status = status;
        result.score = score;
        result.feedback = feedback.map(str::to_string);
        result.finalised_by = finalised_by;
        if matches!(status, ResultStatus::TeacherGraded) {
            result.reviewed_at = Some(now);
        }
        Ok(result.clone())
    }
}
