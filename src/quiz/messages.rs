use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::quiz::{Question, QuestionOptions, QuestionType};

/// Server→client frame, tagged by `type` exactly as spec.md §6 describes
/// and serialised with the teacher's DTO convention
/// (`#[serde(rename_all = "camelCase")]`, see `routes/realtime.rs`'s
/// `RealtimeEventDto`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        timestamp: DateTime<Utc>,
        connection_id: String,
    },
    CurrentState {
        timestamp: DateTime<Utc>,
        session_id: String,
        status: String,
        current_question: Option<WireQuestion>,
    },
    SessionStarted {
        timestamp: DateTime<Utc>,
        session_id: String,
    },
    SessionEnded {
        timestamp: DateTime<Utc>,
        session_id: String,
        reason: String,
    },
    QuestionStarted {
        timestamp: DateTime<Utc>,
        question: WireQuestion,
    },
    LeaderboardUpdate {
        timestamp: DateTime<Utc>,
        leaderboard: Vec<WireLeaderboardEntry>,
    },
    ParticipantJoined {
        timestamp: DateTime<Utc>,
        participant: WireParticipantSummary,
        total_participants: usize,
    },
    ParticipantLeft {
        timestamp: DateTime<Utc>,
        participant_id: String,
        total_participants: usize,
    },
    ParticipantAnswered {
        timestamp: DateTime<Utc>,
        participant_id: String,
        question_id: String,
        is_correct: Option<bool>,
    },
    StatsUpdate {
        timestamp: DateTime<Utc>,
        total_participants: usize,
        answers_received: usize,
        completion_percentage: f64,
    },
    AnswerSubmitted {
        timestamp: DateTime<Utc>,
        question_id: String,
        is_correct: Option<bool>,
        points_earned: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        correct_answer: Option<serde_json::Value>,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Error {
        timestamp: DateTime<Utc>,
        error: WireError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireQuestion {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub options: QuestionOptions,
    pub points: u32,
    pub order_index: u32,
    pub time_limit_seconds: Option<u32>,
}

impl From<&Question> for WireQuestion {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id.clone(),
            text: q.text.clone(),
            question_type: q.question_type,
            options: q.options.clone(),
            points: q.points,
            order_index: q.order_index,
            time_limit_seconds: q.time_limit_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLeaderboardEntry {
    pub rank: u32,
    pub participant_id: String,
    pub display_name: String,
    pub score: i64,
    pub correct_answers: u32,
    pub total_time_ms: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireParticipantSummary {
    pub id: String,
    pub display_name: String,
}

/// Client→server frames. `submit_answer`'s `answer` stays untyped JSON at
/// the wire boundary; `QuizEngine::submit_answer` deserialises it against
/// the target question's type, so an unrecognised shape surfaces as a
/// `Validation` error rather than a panic.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pong,
    SubmitAnswer {
        question_id: String,
        answer: serde_json::Value,
        time_taken_ms: u64,
    },
    RequestLeaderboard,
}
