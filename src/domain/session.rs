use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    InProgress,
    Completed,
    Cancelled,
}

/// Frozen copy of the quiz taken at session start, so edits to the source
/// quiz afterwards never change an in-flight or historical session
/// (spec.md §4.3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizSnapshot {
    pub quiz_id: String,
    pub title: String,
    pub questions: Vec<super::quiz::Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub quiz_id: String,
    pub room_code: String,
    pub status: SessionStatus,
    pub snapshot: QuizSnapshot,
    pub current_question_index: Option<u32>,
    pub timeout_hours: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub auto_ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A session participant is either a signed-in student of the tenant or an
/// anonymous guest identified only by a hashed token — an explicit sum type
/// in place of two nullable foreign keys (spec.md REDESIGN FLAGS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParticipantIdentity {
    /// `display_name` is copied from the roster at join time (spec.md §3
    /// data model names no separate column for it, but every wire leaderboard
    /// and roster entry needs a human name rather than the opaque id).
    Student { student_id: String, display_name: String },
    Guest { display_name: String, guest_token_hash: String },
    /// A guest who self-identified with a roster student id without going
    /// through student auth (spec.md §3 `IdentifiedGuest{name, student_id}`)
    /// — still authenticates like a guest (token) but links to a student
    /// record for analytics.
    IdentifiedGuest {
        display_name: String,
        student_id: String,
        guest_token_hash: String,
    },
}

impl ParticipantIdentity {
    pub fn is_guest_like(&self) -> bool {
        matches!(self, ParticipantIdentity::Guest { .. } | ParticipantIdentity::IdentifiedGuest { .. })
    }

    pub fn guest_token_hash(&self) -> Option<&str> {
        match self {
            ParticipantIdentity::Guest { guest_token_hash, .. } => Some(guest_token_hash),
            ParticipantIdentity::IdentifiedGuest { guest_token_hash, .. } => Some(guest_token_hash),
            ParticipantIdentity::Student { .. } => None,
        }
    }

    pub fn display_name_mut(&mut self) -> Option<&mut String> {
        match self {
            ParticipantIdentity::Guest { display_name, .. } => Some(display_name),
            ParticipantIdentity::IdentifiedGuest { display_name, .. } => Some(display_name),
            ParticipantIdentity::Student { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub session_id: String,
    pub identity: ParticipantIdentity,
    pub score: i64,
    pub correct_answers: u32,
    pub total_time_ms: i64,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub anonymised_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn display_name(&self) -> &str {
        match &self.identity {
            ParticipantIdentity::Student { display_name, .. } => display_name.as_str(),
            ParticipantIdentity::Guest { display_name, .. } => display_name.as_str(),
            ParticipantIdentity::IdentifiedGuest { display_name, .. } => display_name.as_str(),
        }
    }
}

/// Tagged by the question type it answers. Field names mirror spec.md §6's
/// `response.answer` wire shapes exactly (`selected`/`text`, not
/// `CorrectAnswer`'s `answer`) so a submitted payload deserialises without
/// any renaming at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "question_type", rename_all = "snake_case")]
pub enum ResponseAnswer {
    MultipleChoice { selected: String },
    TrueFalse { selected: bool },
    ShortAnswer { text: String },
    Poll { selected: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub session_id: String,
    pub participant_id: String,
    pub question_id: String,
    pub answer: ResponseAnswer,
    pub is_correct: Option<bool>,
    pub points_earned: i64,
    pub response_time_ms: u64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub participant_id: String,
    pub display_name: String,
    pub score: i64,
    pub rank: u32,
}
