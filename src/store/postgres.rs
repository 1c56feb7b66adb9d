//! Postgres-backed [`Store`]. Queries are runtime-bound (`sqlx::query`/
//! `query_as` against a live pool) rather than the `query!` compile-time
//! macro, since there is no reachable database at build time to check
//! against — the same tradeoff the teacher accepts in code paths that
//! can't assume a migrated dev database is always present.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

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

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Hand-rolled, idempotent migration runner matching the teacher's
    /// `db::migrate::run_migrations` pattern: each named SQL file is
    /// applied at most once, tracked in a `_migrations` table, rather than
    /// relying on `sqlx migrate`'s build-time directory scan.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS "_migrations" (
                "id" SERIAL PRIMARY KEY,
                "name" TEXT NOT NULL UNIQUE,
                "applied_at" TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let applied: Vec<String> = sqlx::query_scalar(r#"SELECT "name" FROM "_migrations" ORDER BY "id""#)
            .fetch_all(&self.pool)
            .await?;

        let migrations = [("001_init_schema", include_str!("../../sql/001_init_schema.sql"))];

        for (name, sql) in migrations {
            if applied.iter().any(|a| a == name) {
                continue;
            }
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            sqlx::query(r#"INSERT INTO "_migrations" ("name") VALUES ($1)"#)
                .bind(name)
                .execute(&self.pool)
                .await?;
            tracing::info!(migration = name, "migration applied");
        }

        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn quiz_status_str(status: QuizStatus) -> &'static str {
    match status {
        QuizStatus::Draft => "draft",
        QuizStatus::Published => "published",
        QuizStatus::Archived => "archived",
    }
}

fn parse_quiz_status(value: &str) -> StoreResult<QuizStatus> {
    match value {
        "draft" => Ok(QuizStatus::Draft),
        "published" => Ok(QuizStatus::Published),
        "archived" => Ok(QuizStatus::Archived),
        other => Err(CoreError::transient(format!("unknown quiz status {other}"))),
    }
}

fn session_status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Waiting => "waiting",
        SessionStatus::InProgress => "in_progress",
        SessionStatus::Completed => "completed",
        SessionStatus::Cancelled => "cancelled",
    }
}

fn parse_session_status(value: &str) -> StoreResult<SessionStatus> {
    match value {
        "waiting" => Ok(SessionStatus::Waiting),
        "in_progress" => Ok(SessionStatus::InProgress),
        "completed" => Ok(SessionStatus::Completed),
        "cancelled" => Ok(SessionStatus::Cancelled),
        other => Err(CoreError::transient(format!("unknown session status {other}"))),
    }
}

fn assessment_status_str(status: AssessmentStatus) -> &'static str {
    match status {
        AssessmentStatus::Queued => "queued",
        AssessmentStatus::Processing => "processing",
        AssessmentStatus::Summarising => "summarising",
        AssessmentStatus::PendingReview => "pending_review",
        AssessmentStatus::Completed => "completed",
        AssessmentStatus::Failed => "failed",
    }
}

fn parse_assessment_status(value: &str) -> StoreResult<AssessmentStatus> {
    match value {
        "queued" => Ok(AssessmentStatus::Queued),
        "processing" => Ok(AssessmentStatus::Processing),
        "summarising" => Ok(AssessmentStatus::Summarising),
        "pending_review" => Ok(AssessmentStatus::PendingReview),
        "completed" => Ok(AssessmentStatus::Completed),
        "failed" => Ok(AssessmentStatus::Failed),
        other => Err(CoreError::transient(format!("unknown assessment status {other}"))),
    }
}

fn result_status_str(status: ResultStatus) -> &'static str {
    match status {
        ResultStatus::PendingGrade => "pending_grade",
        ResultStatus::AiGraded => "ai_graded",
        ResultStatus::PendingReview => "pending_review",
        ResultStatus::TeacherGraded => "teacher_graded",
    }
}

fn parse_result_status(value: &str) -> StoreResult<ResultStatus> {
    match value {
        "pending_grade" => Ok(ResultStatus::PendingGrade),
        "ai_graded" => Ok(ResultStatus::AiGraded),
        "pending_review" => Ok(ResultStatus::PendingReview),
        "teacher_graded" => Ok(ResultStatus::TeacherGraded),
        other => Err(CoreError::transient(format!("unknown result status {other}"))),
    }
}

fn finalised_by_str(value: FinalisedBy) -> &'static str {
    match value {
        FinalisedBy::Ai => "ai",
        FinalisedBy::Teacher => "teacher",
    }
}

fn parse_finalised_by(value: &str) -> StoreResult<FinalisedBy> {
    match value {
        "ai" => Ok(FinalisedBy::Ai),
        "teacher" => Ok(FinalisedBy::Teacher),
        other => Err(CoreError::transient(format!("unknown finalised_by {other}"))),
    }
}

fn row_to_quiz(row: &sqlx::postgres::PgRow) -> StoreResult<Quiz> {
    let status: String = row.try_get("status")?;
    let settings: serde_json::Value = row.try_get("settings")?;
    Ok(Quiz {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        class_id: row.try_get("class_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: parse_quiz_status(&status)?,
        settings,
        last_room_code: row.try_get("last_room_code")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_question(row: &sqlx::postgres::PgRow) -> StoreResult<Question> {
    let options: serde_json::Value = row.try_get("options")?;
    let correct_answer: serde_json::Value = row.try_get("correct_answer")?;
    let question_type: String = row.try_get("question_type")?;
    Ok(Question {
        id: row.try_get("id")?,
        quiz_id: row.try_get("quiz_id")?,
        question_type: serde_json::from_value(serde_json::Value::String(question_type))
            .map_err(|e| CoreError::transient(e.to_string()))?,
        text: row.try_get("text")?,
        order_index: row.try_get::<i32, _>("order_index")? as u32,
        points: row.try_get::<i32, _>("points")? as u32,
        time_limit_seconds: row.try_get::<Option<i32>, _>("time_limit_seconds")?.map(|v| v as u32),
        options: serde_json::from_value(options).map_err(|e| CoreError::transient(e.to_string()))?,
        correct_answer: serde_json::from_value(correct_answer).map_err(|e| CoreError::transient(e.to_string()))?,
        explanation: row.try_get("explanation")?,
        media_url: row.try_get("media_url")?,
    })
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> StoreResult<Session> {
    let status: String = row.try_get("status")?;
    let snapshot: serde_json::Value = row.try_get("snapshot")?;
    Ok(Session {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        quiz_id: row.try_get("quiz_id")?,
        room_code: row.try_get("room_code")?,
        status: parse_session_status(&status)?,
        snapshot: serde_json::from_value(snapshot).map_err(|e| CoreError::transient(e.to_string()))?,
        current_question_index: row.try_get::<Option<i32>, _>("current_question_index")?.map(|v| v as u32),
        timeout_hours: row.try_get("timeout_hours")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        auto_ended_at: row.try_get("auto_ended_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_participant(row: &sqlx::postgres::PgRow) -> StoreResult<Participant> {
    let identity: serde_json::Value = row.try_get("identity")?;
    Ok(Participant {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        identity: serde_json::from_value(identity).map_err(|e| CoreError::transient(e.to_string()))?,
        score: row.try_get("score")?,
        correct_answers: row.try_get::<i32, _>("correct_answers")? as u32,
        total_time_ms: row.try_get("total_time_ms")?,
        joined_at: row.try_get("joined_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        disconnected_at: row.try_get("disconnected_at")?,
        anonymised_at: row.try_get("anonymised_at")?,
    })
}

fn row_to_assessment(row: &sqlx::postgres::PgRow) -> StoreResult<Assessment> {
    let status: String = row.try_get("status")?;
    let config: serde_json::Value = row.try_get("config")?;
    Ok(Assessment {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        config: serde_json::from_value(config).map_err(|e| CoreError::transient(e.to_string()))?,
        status: parse_assessment_status(&status)?,
        total_submissions: row.try_get::<i32, _>("total_submissions")? as u32,
        processed_submissions: row.try_get::<i32, _>("processed_submissions")? as u32,
        error_message: row.try_get("error_message")?,
        narrative: row.try_get("narrative")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_result(row: &sqlx::postgres::PgRow) -> StoreResult<GradingResult> {
    let status: String = row.try_get("status")?;
    let identity: serde_json::Value = row.try_get("identity")?;
    let runs: serde_json::Value = row.try_get("runs")?;
    let finalised_by: Option<String> = row.try_get("finalised_by")?;
    Ok(GradingResult {
        id: row.try_get("id")?,
        assessment_id: row.try_get("assessment_id")?,
        question_id: row.try_get("question_id")?,
        file_ref: row.try_get("file_ref")?,
        identity: serde_json::from_value(identity).map_err(|e| CoreError::transient(e.to_string()))?,
        status: parse_result_status(&status)?,
        extracted_answer: row.try_get("extracted_answer")?,
        score: row.try_get("score")?,
        feedback: row.try_get("feedback")?,
        runs: serde_json::from_value(runs).map_err(|e| CoreError::transient(e.to_string()))?,
        finalised_by: finalised_by.map(|v| parse_finalised_by(&v)).transpose()?,
        reviewed_at: row.try_get("reviewed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_class(&self, tenant: &IdentityContext, name: &str, description: Option<&str>) -> StoreResult<Class> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(r#"INSERT INTO classes (id, tenant_id, name, description) VALUES ($1, $2, $3, $4)"#)
            .bind(&id)
            .bind(tenant.tenant_id())
            .bind(name)
            .bind(description)
            .execute(&self.pool)
            .await?;
        Ok(Class { id, tenant_id: tenant.tenant_id().to_string(), name: name.to_string(), description: description.map(str::to_string) })
    }

    async fn get_class(&self, tenant: &IdentityContext, class_id: &str) -> StoreResult<Class> {
        let row = sqlx::query(r#"SELECT id, tenant_id, name, description FROM classes WHERE id = $1 AND tenant_id = $2"#)
            .bind(class_id)
            .bind(tenant.tenant_id())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("class {class_id} not found")))?;
        Ok(Class {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
        })
    }

    async fn list_roster(&self, tenant: &IdentityContext, class_id: &str) -> StoreResult<Vec<Student>> {
        self.get_class(tenant, class_id).await?;
        let rows = sqlx::query(
            r#"SELECT s.id, s.tenant_id, s.name, s.external_id, s.overall_grade_cache
               FROM students s
               JOIN student_class_memberships m ON m.student_id = s.id
               WHERE m.class_id = $1 AND s.tenant_id = $2"#,
        )
        .bind(class_id)
        .bind(tenant.tenant_id())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Student {
                    id: row.try_get("id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    name: row.try_get("name")?,
                    external_id: row.try_get("external_id")?,
                    overall_grade_cache: row.try_get("overall_grade_cache")?,
                })
            })
            .collect()
    }

    async fn find_student_by_external_id(&self, tenant: &IdentityContext, external_id: &str) -> StoreResult<Option<Student>> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, name, external_id, overall_grade_cache
               FROM students WHERE tenant_id = $1 AND external_id = $2"#,
        )
        .bind(tenant.tenant_id())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Student {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                name: row.try_get("name")?,
                external_id: row.try_get("external_id")?,
                overall_grade_cache: row.try_get("overall_grade_cache")?,
            })
        })
        .transpose()
    }

    async fn create_quiz(&self, tenant: &IdentityContext, class_id: Option<&str>, title: &str, description: Option<&str>) -> StoreResult<Quiz> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO quizzes (id, tenant_id, class_id, title, description, status, settings, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, 'draft', '{}'::jsonb, $6, $6)"#,
        )
        .bind(&id)
        .bind(tenant.tenant_id())
        .bind(class_id)
        .bind(title)
        .bind(description)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Quiz {
            id,
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
        })
    }

    async fn get_quiz(&self, tenant: &IdentityContext, quiz_id: &str) -> StoreResult<Quiz> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, class_id, title, description, status, settings, last_room_code, deleted_at, created_at, updated_at
               FROM quizzes WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL"#,
        )
        .bind(quiz_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("quiz {quiz_id} not found")))?;
        row_to_quiz(&row)
    }

    async fn list_quizzes(&self, tenant: &IdentityContext, class_id: Option<&str>) -> StoreResult<Vec<Quiz>> {
        let rows = sqlx::query(
            r#"SELECT id, tenant_id, class_id, title, description, status, settings, last_room_code, deleted_at, created_at, updated_at
               FROM quizzes
               WHERE tenant_id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR class_id = $2)"#,
        )
        .bind(tenant.tenant_id())
        .bind(class_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_quiz).collect()
    }

    async fn set_quiz_status(&self, tenant: &IdentityContext, quiz_id: &str, status: QuizStatus) -> StoreResult<Quiz> {
        let row = sqlx::query(
            r#"UPDATE quizzes SET status = $1, updated_at = now()
               WHERE id = $2 AND tenant_id = $3 AND deleted_at IS NULL
               RETURNING id, tenant_id, class_id, title, description, status, settings, last_room_code, deleted_at, created_at, updated_at"#,
        )
        .bind(quiz_status_str(status))
        .bind(quiz_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("quiz {quiz_id} not found")))?;
        row_to_quiz(&row)
    }

    async fn soft_delete_quiz(&self, tenant: &IdentityContext, quiz_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(r#"UPDATE quizzes SET deleted_at = $1 WHERE id = $2 AND tenant_id = $3 AND deleted_at IS NULL"#)
            .bind(now)
            .bind(quiz_id)
            .bind(tenant.tenant_id())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("quiz {quiz_id} not found")));
        }
        Ok(())
    }

    async fn add_question(&self, tenant: &IdentityContext, quiz_id: &str, question: Question) -> StoreResult<Question> {
        self.get_quiz(tenant, quiz_id).await?;
        let options = serde_json::to_value(&question.options).map_err(|e| CoreError::validation(e.to_string()))?;
        let correct_answer = serde_json::to_value(&question.correct_answer).map_err(|e| CoreError::validation(e.to_string()))?;
        let question_type_str = serde_json::to_value(question.question_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        sqlx::query(
            r#"INSERT INTO questions (id, quiz_id, question_type, text, order_index, points, time_limit_seconds, options, correct_answer, explanation, media_url)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(&question.id)
        .bind(quiz_id)
        .bind(question_type_str)
        .bind(&question.text)
        .bind(question.order_index as i32)
        .bind(question.points as i32)
        .bind(question.time_limit_seconds.map(|v| v as i32))
        .bind(options)
        .bind(correct_answer)
        .bind(&question.explanation)
        .bind(&question.media_url)
        .execute(&self.pool)
        .await?;
        Ok(question)
    }

    async fn list_questions(&self, tenant: &IdentityContext, quiz_id: &str) -> StoreResult<Vec<Question>> {
        self.get_quiz(tenant, quiz_id).await?;
        let rows = sqlx::query(
            r#"SELECT id, quiz_id, question_type, text, order_index, points, time_limit_seconds, options, correct_answer, explanation, media_url
               FROM questions WHERE quiz_id = $1 ORDER BY order_index ASC"#,
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_question).collect()
    }

    async fn set_last_room_code(&self, tenant: &IdentityContext, quiz_id: &str, room_code: &str) -> StoreResult<()> {
        let result = sqlx::query(r#"UPDATE quizzes SET last_room_code = $1 WHERE id = $2 AND tenant_id = $3 AND deleted_at IS NULL"#)
            .bind(room_code)
            .bind(quiz_id)
            .bind(tenant.tenant_id())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("quiz {quiz_id} not found")));
        }
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
        self.get_quiz(tenant, quiz_id).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let snapshot_json = serde_json::to_value(&snapshot).map_err(|e| CoreError::validation(e.to_string()))?;
        let inserted = sqlx::query(
            r#"INSERT INTO quiz_sessions (id, tenant_id, quiz_id, room_code, status, snapshot, timeout_hours, created_at)
               VALUES ($1, $2, $3, $4, 'waiting', $5, $6, $7)
               ON CONFLICT (room_code) WHERE status IN ('waiting', 'in_progress') DO NOTHING"#,
        )
        .bind(&id)
        .bind(tenant.tenant_id())
        .bind(quiz_id)
        .bind(room_code)
        .bind(&snapshot_json)
        .bind(timeout_hours)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(CoreError::conflict("room_code_taken"));
        }
        Ok(Session {
            id,
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
        })
    }

    async fn get_session(&self, tenant: &IdentityContext, session_id: &str) -> StoreResult<Session> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, quiz_id, room_code, status, snapshot, current_question_index, timeout_hours, started_at, ended_at, auto_ended_at, created_at
               FROM quiz_sessions WHERE id = $1 AND tenant_id = $2"#,
        )
        .bind(session_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("session {session_id} not found")))?;
        row_to_session(&row)
    }

    async fn get_session_by_room_code(&self, room_code: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query(
            r#"SELECT s.id, s.tenant_id, s.quiz_id, s.room_code, s.status, s.snapshot, s.current_question_index,
                      s.timeout_hours, s.started_at, s.ended_at, s.auto_ended_at, s.created_at
               FROM quiz_sessions s
               JOIN quizzes q ON q.id = s.quiz_id
               WHERE s.room_code = $1 AND q.deleted_at IS NULL"#,
        )
        .bind(room_code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn get_session_unscoped(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, quiz_id, room_code, status, snapshot, current_question_index, timeout_hours, started_at, ended_at, auto_ended_at, created_at
               FROM quiz_sessions WHERE id = $1"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
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
        let row = sqlx::query(
            r#"UPDATE quiz_sessions SET
                 status = $1,
                 current_question_index = COALESCE($2, current_question_index),
                 started_at = CASE WHEN $1 = 'in_progress' AND started_at IS NULL THEN $3 ELSE started_at END,
                 ended_at = CASE WHEN $1 IN ('completed', 'cancelled') THEN $3 ELSE ended_at END,
                 auto_ended_at = CASE WHEN $1 IN ('completed', 'cancelled') AND $4 THEN $3 ELSE auto_ended_at END
               WHERE id = $5 AND tenant_id = $6
               RETURNING id, tenant_id, quiz_id, room_code, status, snapshot, current_question_index, timeout_hours, started_at, ended_at, auto_ended_at, created_at"#,
        )
        .bind(session_status_str(status))
        .bind(current_question_index.map(|v| v as i32))
        .bind(now)
        .bind(auto_ended)
        .bind(session_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("session {session_id} not found")))?;
        row_to_session(&row)
    }

    async fn get_timed_out_sessions(&self, now: DateTime<Utc>, threshold_hours: i64) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query(
            r#"SELECT id, tenant_id, quiz_id, room_code, status, snapshot, current_question_index, timeout_hours, started_at, ended_at, auto_ended_at, created_at
               FROM quiz_sessions
               WHERE status IN ('waiting', 'in_progress')
                 AND created_at + (GREATEST(timeout_hours, $1) || ' hours')::interval < $2"#,
        )
        .bind(threshold_hours)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn add_participant(
        &self,
        tenant: &IdentityContext,
        session_id: &str,
        identity: ParticipantIdentity,
        now: DateTime<Utc>,
    ) -> StoreResult<Participant> {
        self.get_session(tenant, session_id).await?;
        if let ParticipantIdentity::Student { student_id, .. } = &identity {
            let existing = sqlx::query(
                r#"SELECT 1 FROM participants WHERE session_id = $1 AND identity->>'kind' = 'student' AND identity->>'student_id' = $2"#,
            )
            .bind(session_id)
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
            if existing.is_some() {
                return Err(CoreError::conflict("duplicate_student"));
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        let identity_json = serde_json::to_value(&identity).map_err(|e| CoreError::validation(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO participants (id, session_id, identity, score, correct_answers, total_time_ms, joined_at, last_heartbeat_at)
               VALUES ($1, $2, $3, 0, 0, 0, $4, $4)"#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(&identity_json)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Participant {
            id,
            session_id: session_id.to_string(),
            identity,
            score: 0,
            correct_answers: 0,
            total_time_ms: 0,
            joined_at: now,
            last_heartbeat_at: now,
            disconnected_at: None,
            anonymised_at: None,
        })
    }

    async fn get_participant(&self, tenant: &IdentityContext, participant_id: &str) -> StoreResult<Participant> {
        let row = sqlx::query(
            r#"SELECT p.id, p.session_id, p.identity, p.score, p.correct_answers, p.total_time_ms, p.joined_at, p.last_heartbeat_at, p.disconnected_at, p.anonymised_at
               FROM participants p
               JOIN quiz_sessions s ON s.id = p.session_id
               WHERE p.id = $1 AND s.tenant_id = $2"#,
        )
        .bind(participant_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("participant {participant_id} not found")))?;
        row_to_participant(&row)
    }

    async fn get_participant_by_guest_token_hash(&self, session_id: &str, token_hash: &str) -> StoreResult<Option<Participant>> {
        let row = sqlx::query(
            r#"SELECT id, session_id, identity, score, correct_answers, total_time_ms, joined_at, last_heartbeat_at, disconnected_at, anonymised_at
               FROM participants
               WHERE session_id = $1 AND identity->>'kind' IN ('guest', 'identified_guest') AND identity->>'guest_token_hash' = $2"#,
        )
        .bind(session_id)
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_participant).transpose()
    }

    async fn list_participants(&self, tenant: &IdentityContext, session_id: &str) -> StoreResult<Vec<Participant>> {
        self.get_session(tenant, session_id).await?;
        let rows = sqlx::query(
            r#"SELECT id, session_id, identity, score, correct_answers, total_time_ms, joined_at, last_heartbeat_at, disconnected_at, anonymised_at
               FROM participants WHERE session_id = $1"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_participant).collect()
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
        self.get_session(tenant, session_id).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let answer_json = serde_json::to_value(&answer).map_err(|e| CoreError::validation(e.to_string()))?;
        let inserted = sqlx::query(
            r#"INSERT INTO responses (id, session_id, participant_id, question_id, answer, is_correct, points_earned, response_time_ms, submitted_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (session_id, participant_id, question_id) DO NOTHING"#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(participant_id)
        .bind(question_id)
        .bind(&answer_json)
        .bind(is_correct)
        .bind(points_earned)
        .bind(timing.response_time_ms as i64)
        .bind(timing.submitted_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(CoreError::conflict("already_answered"));
        }
        Ok(Response {
            id,
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            question_id: question_id.to_string(),
            answer,
            is_correct,
            points_earned,
            response_time_ms: timing.response_time_ms,
            submitted_at: timing.submitted_at,
        })
    }

    async fn update_participant_score(
        &self,
        tenant: &IdentityContext,
        participant_id: &str,
        add_points: i64,
        add_time_ms: i64,
        is_correct: Option<bool>,
    ) -> StoreResult<Participant> {
        let row = sqlx::query(
            r#"UPDATE participants p SET
                 score = p.score + $1,
                 total_time_ms = p.total_time_ms + $2,
                 correct_answers = p.correct_answers + CASE WHEN $3 THEN 1 ELSE 0 END
               FROM quiz_sessions s
               WHERE p.session_id = s.id AND p.id = $4 AND s.tenant_id = $5
               RETURNING p.id, p.session_id, p.identity, p.score, p.correct_answers, p.total_time_ms, p.joined_at, p.last_heartbeat_at, p.disconnected_at, p.anonymised_at"#,
        )
        .bind(add_points)
        .bind(add_time_ms)
        .bind(is_correct.unwrap_or(false))
        .bind(participant_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("participant {participant_id} not found")))?;
        row_to_participant(&row)
    }

    async fn count_responses_for_question(&self, tenant: &IdentityContext, session_id: &str, question_id: &str) -> StoreResult<u32> {
        self.get_session(tenant, session_id).await?;
        let row = sqlx::query(r#"SELECT COUNT(DISTINCT participant_id) AS n FROM responses WHERE session_id = $1 AND question_id = $2"#)
            .bind(session_id)
            .bind(question_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }

    async fn get_leaderboard(&self, tenant: &IdentityContext, session_id: &str, limit: usize) -> StoreResult<Vec<Participant>> {
        self.get_session(tenant, session_id).await?;
        let rows = sqlx::query(
            r#"SELECT id, session_id, identity, score, correct_answers, total_time_ms, joined_at, last_heartbeat_at, disconnected_at, anonymised_at
               FROM participants
               WHERE session_id = $1
               ORDER BY score DESC, total_time_ms ASC, joined_at ASC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_participant).collect()
    }

    async fn anonymise_old_guests(&self, now: DateTime<Utc>, retention_days: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"UPDATE participants SET
                 identity = jsonb_set(identity, '{display_name}', to_jsonb('Anonymous User #' || right(id::text, 6))),
                 anonymised_at = $1
               WHERE identity->>'kind' IN ('guest', 'identified_guest')
                 AND anonymised_at IS NULL
                 AND joined_at < $1 - ($2 || ' days')::interval"#,
        )
        .bind(now)
        .bind(retention_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_assessment(&self, tenant: &IdentityContext, config: AssessmentConfig, now: DateTime<Utc>) -> StoreResult<Assessment> {
        let id = uuid::Uuid::new_v4().to_string();
        let config_json = serde_json::to_value(&config).map_err(|e| CoreError::validation(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO assessments (id, tenant_id, config, status, total_submissions, processed_submissions, created_at, updated_at)
               VALUES ($1, $2, $3, 'queued', 0, 0, $4, $4)"#,
        )
        .bind(&id)
        .bind(tenant.tenant_id())
        .bind(&config_json)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Assessment {
            id,
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
        })
    }

    async fn get_assessment(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Assessment> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, config, status, total_submissions, processed_submissions, error_message, narrative, created_at, updated_at, completed_at
               FROM assessments WHERE id = $1 AND tenant_id = $2"#,
        )
        .bind(assessment_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("assessment {assessment_id} not found")))?;
        row_to_assessment(&row)
    }

    async fn set_assessment_status(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        status: AssessmentStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Assessment> {
        let row = sqlx::query(
            r#"UPDATE assessments SET
                 status = $1,
                 error_message = $2,
                 updated_at = $3,
                 completed_at = CASE WHEN $1 IN ('completed', 'failed') THEN $3 ELSE completed_at END
               WHERE id = $4 AND tenant_id = $5
               RETURNING id, tenant_id, config, status, total_submissions, processed_submissions, error_message, narrative, created_at, updated_at, completed_at"#,
        )
        .bind(assessment_status_str(status))
        .bind(error_message)
        .bind(now)
        .bind(assessment_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("assessment {assessment_id} not found")))?;
        row_to_assessment(&row)
    }

    async fn set_assessment_narrative(&self, tenant: &IdentityContext, assessment_id: &str, narrative: &str) -> StoreResult<()> {
        let result = sqlx::query(r#"UPDATE assessments SET narrative = $1 WHERE id = $2 AND tenant_id = $3"#)
            .bind(narrative)
            .bind(assessment_id)
            .bind(tenant.tenant_id())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("assessment {assessment_id} not found")));
        }
        Ok(())
    }

    async fn set_assessment_progress(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        total_submissions: u32,
        processed_submissions: u32,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"UPDATE assessments SET total_submissions = $1, processed_submissions = $2 WHERE id = $3 AND tenant_id = $4"#,
        )
        .bind(total_submissions as i32)
        .bind(processed_submissions as i32)
        .bind(assessment_id)
        .bind(tenant.tenant_id())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("assessment {assessment_id} not found")));
        }
        Ok(())
    }

    async fn create_outsider(&self, tenant: &IdentityContext, assessment_id: &str, submitted_name: &str) -> StoreResult<OutsiderStudent> {
        self.get_assessment(tenant, assessment_id).await?;
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(r#"INSERT INTO outsider_students (id, assessment_id, submitted_name) VALUES ($1, $2, $3)"#)
            .bind(&id)
            .bind(assessment_id)
            .bind(submitted_name)
            .execute(&self.pool)
            .await?;
        Ok(OutsiderStudent { id, assessment_id: assessment_id.to_string(), submitted_name: submitted_name.to_string(), merged_into_student_id: None })
    }

    async fn list_outsiders(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Vec<OutsiderStudent>> {
        self.get_assessment(tenant, assessment_id).await?;
        let rows = sqlx::query(
            r#"SELECT id, assessment_id, submitted_name, merged_into_student_id FROM outsider_students WHERE assessment_id = $1"#,
        )
        .bind(assessment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(OutsiderStudent {
                    id: row.try_get("id")?,
                    assessment_id: row.try_get("assessment_id")?,
                    submitted_name: row.try_get("submitted_name")?,
                    merged_into_student_id: row.try_get("merged_into_student_id")?,
                })
            })
            .collect()
    }

    async fn merge_outsider(&self, tenant: &IdentityContext, outsider_id: &str, student_id: &str) -> StoreResult<()> {
        let row = sqlx::query(
            r#"SELECT o.assessment_id FROM outsider_students o
               JOIN assessments a ON a.id = o.assessment_id
               WHERE o.id = $1 AND a.tenant_id = $2"#,
        )
        .bind(outsider_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("outsider {outsider_id} not found")))?;
        let _assessment_id: String = row.try_get("assessment_id")?;

        sqlx::query(r#"UPDATE outsider_students SET merged_into_student_id = $1 WHERE id = $2"#)
            .bind(student_id)
            .bind(outsider_id)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"UPDATE results SET identity = jsonb_build_object('kind', 'student', 'student_id', $1)
               WHERE identity->>'kind' = 'outsider' AND identity->>'outsider_id' = $2"#,
        )
        .bind(student_id)
        .bind(outsider_id)
        .execute(&self.pool)
        .await?;
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
        self.get_assessment(tenant, assessment_id).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let identity_json = serde_json::to_value(&identity).map_err(|e| CoreError::validation(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO results (id, assessment_id, question_id, file_ref, identity, status, runs, created_at)
               VALUES ($1, $2, $3, $4, $5, 'pending_grade', '[]'::jsonb, $6)"#,
        )
        .bind(&id)
        .bind(assessment_id)
        .bind(question_id)
        .bind(file_ref)
        .bind(&identity_json)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(GradingResult {
            id,
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
        })
    }

    async fn list_results(&self, tenant: &IdentityContext, assessment_id: &str) -> StoreResult<Vec<GradingResult>> {
        self.get_assessment(tenant, assessment_id).await?;
        let rows = sqlx::query(
            r#"SELECT id, assessment_id, question_id, file_ref, identity, status, extracted_answer, score, feedback, runs, finalised_by, reviewed_at, created_at
               FROM results WHERE assessment_id = $1"#,
        )
        .bind(assessment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_result).collect()
    }

    async fn get_result(&self, tenant: &IdentityContext, result_id: &str) -> StoreResult<GradingResult> {
        let row = sqlx::query(
            r#"SELECT r.id, r.assessment_id, r.question_id, r.file_ref, r.identity, r.status, r.extracted_answer, r.score, r.feedback, r.runs, r.finalised_by, r.reviewed_at, r.created_at
               FROM results r
               JOIN assessments a ON a.id = r.assessment_id
               WHERE r.id = $1 AND a.tenant_id = $2"#,
        )
        .bind(result_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("result {result_id} not found")))?;
        row_to_result(&row)
    }

    async fn record_ai_run(&self, tenant: &IdentityContext, result_id: &str, run: AiModelRun) -> StoreResult<()> {
        self.get_result(tenant, result_id).await?;
        let run_json = serde_json::to_value(&run).map_err(|e| CoreError::validation(e.to_string()))?;
        if run.run_index == 0 {
            sqlx::query(
                r#"UPDATE results SET runs = runs || $1::jsonb, extracted_answer = $2 WHERE id = $3"#,
            )
            .bind(serde_json::Value::Array(vec![run_json]))
            .bind(&run.extracted_answer)
            .bind(result_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(r#"UPDATE results SET runs = runs || $1::jsonb WHERE id = $2"#)
                .bind(serde_json::Value::Array(vec![run_json]))
                .bind(result_id)
                .execute(&self.pool)
                .await?;
        }
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
        let row = sqlx::query(
            r#"UPDATE results r SET
                 status = $1,
                 score = $2,
                 feedback = $3,
                 finalised_by = $4,
                 reviewed_at = CASE WHEN $1 = 'teacher_graded' THEN $5 ELSE reviewed_at END
               FROM assessments a
               WHERE r.assessment_id = a.id AND r.id = $6 AND a.tenant_id = $7
               RETURNING r.id, r.assessment_id, r.question_id, r.file_ref, r.identity, r.status, r.extracted_answer, r.score, r.feedback, r.runs, r.finalised_by, r.reviewed_at, r.created_at"#,
        )
        .bind(result_status_str(status))
        .bind(score)
        .bind(feedback)
        .bind(finalised_by.map(finalised_by_str))
        .bind(now)
        .bind(result_id)
        .bind(tenant.tenant_id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("result {result_id} not found")))?;
        row_to_result(&row)
    }
}
