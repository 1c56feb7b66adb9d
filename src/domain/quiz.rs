use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub id: String,
    pub tenant_id: String,
    pub class_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: QuizStatus,
    pub settings: serde_json::Value,
    pub last_room_code: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quiz {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub text: String,
}

/// Tagged by `question_type` so the grading evaluator can match
/// exhaustively instead of reading an untyped JSON blob (spec.md §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "question_type", rename_all = "snake_case")]
pub enum QuestionOptions {
    MultipleChoice {
        choices: Vec<Choice>,
        #[serde(default)]
        shuffle_options: Option<bool>,
    },
    TrueFalse {},
    ShortAnswer {
        #[serde(default)]
        max_length: Option<u32>,
        #[serde(default)]
        placeholder: Option<String>,
    },
    Poll {
        choices: Vec<Choice>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "question_type", rename_all = "snake_case")]
pub enum CorrectAnswer {
    MultipleChoice {
        answer: String,
    },
    TrueFalse {
        answer: bool,
    },
    ShortAnswer {
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        keywords: Option<Vec<String>>,
        #[serde(default)]
        min_keywords: Option<usize>,
        #[serde(default)]
        case_sensitive: Option<bool>,
    },
    Poll {
        participation_points: i64,
    },
}

impl CorrectAnswer {
    pub fn question_type(&self) -> QuestionType {
        match self {
            CorrectAnswer::MultipleChoice { .. } => QuestionType::MultipleChoice,
            CorrectAnswer::TrueFalse { .. } => QuestionType::TrueFalse,
            CorrectAnswer::ShortAnswer { .. } => QuestionType::ShortAnswer,
            CorrectAnswer::Poll { .. } => QuestionType::Poll,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub quiz_id: String,
    pub question_type: QuestionType,
    pub text: String,
    pub order_index: u32,
    pub points: u32,
    pub time_limit_seconds: Option<u32>,
    pub options: QuestionOptions,
    pub correct_answer: CorrectAnswer,
    pub explanation: Option<String>,
    pub media_url: Option<String>,
}
