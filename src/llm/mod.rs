pub mod http_client;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CoreError;

/// One inline binary attachment sent alongside a vision prompt: raw bytes
/// plus its MIME type. The client base64-encodes it for the wire; callers
/// never see the encoded form.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl Attachment {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }
}

/// Token-usage record surfaced per call so the grading pipeline can
/// aggregate cost per-student and per-assessment (spec.md §4.2).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A caller-supplied post-condition on a decoded JSON response. Failure
/// counts as a retryable parse error exactly like a JSON-decode failure
/// (spec.md §4.2 "Validation hook").
pub type ValidateJson = dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync;

/// Uniform LLM capability (C3): text completion, strict-JSON completion,
/// and vision (bytes+mime) strict-JSON completion with retry. The core
/// never names a vendor (spec.md §1 Non-goals) — implementations talk to
/// whatever HTTP-compatible backend `Config` points at.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete_text(&self, prompt: &str, temperature: f32) -> Result<(String, Usage), CoreError>;

    async fn complete_json(
        &self,
        prompt: &str,
        temperature: f32,
    ) -> Result<(serde_json::Value, Usage), CoreError>;

    async fn complete_vision_json(
        &self,
        prompt: &str,
        attachments: &[Attachment],
        temperature: f32,
        max_retries: u32,
        log_tag: &str,
        validate: Option<&ValidateJson>,
    ) -> Result<(serde_json::Value, Usage), CoreError>;
}

/// Strips ```json ... ``` / ``` ... ``` code-fence wrappers before parse,
/// matching the original's markdown-block handling
/// (`gemini_service.process_file_with_vision_json`).
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let after_open = after_open
        .strip_prefix("json")
        .or_else(|| after_open.strip_prefix("JSON"))
        .unwrap_or(after_open);
    let after_open = after_open.strip_prefix('\n').unwrap_or(after_open);
    after_open.strip_suffix("```").unwrap_or(after_open).trim()
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Deterministic `LlmClient` for tests: replays a queue of canned JSON
    /// responses (or a transient failure) for `complete_vision_json`, and a
    /// fixed string for `complete_text`. Calls past the end of the queue
    /// fail with `CoreError::exhausted`, matching what running out of
    /// scripted responses should look like rather than panicking.
    pub struct ScriptedLlmClient {
        vision_responses: Mutex<VecDeque<Result<serde_json::Value, String>>>,
        text_response: String,
    }

    impl ScriptedLlmClient {
        pub fn new(vision_responses: impl IntoIterator<Item = Result<serde_json::Value, String>>) -> Self {
            Self {
                vision_responses: Mutex::new(vision_responses.into_iter().collect()),
                text_response: "Narrative summary.".to_string(),
            }
        }

        pub fn with_text_response(mut self, text: impl Into<String>) -> Self {
            self.text_response = text.into();
            self
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlmClient {
        async fn complete_text(&self, _prompt: &str, _temperature: f32) -> Result<(String, Usage), CoreError> {
            Ok((self.text_response.clone(), Usage::default()))
        }

        async fn complete_json(&self, _prompt: &str, _temperature: f32) -> Result<(serde_json::Value, Usage), CoreError> {
            self.next_vision_response()
        }

        async fn complete_vision_json(
            &self,
            _prompt: &str,
            _attachments: &[Attachment],
            _temperature: f32,
            _max_retries: u32,
            _log_tag: &str,
            _validate: Option<&ValidateJson>,
        ) -> Result<(serde_json::Value, Usage), CoreError> {
            self.next_vision_response()
        }
    }

    impl ScriptedLlmClient {
        fn next_vision_response(&self) -> Result<(serde_json::Value, Usage), CoreError> {
            let mut queue = self.vision_responses.lock().unwrap();
            match queue.pop_front() {
                Some(Ok(value)) => Ok((value, Usage::default())),
                Some(Err(message)) => Err(CoreError::transient(message)),
                None => Err(CoreError::exhausted("scripted responses exhausted")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fences(raw), "{\"a\":1}");
    }

    #[test]
    fn strips_bare_fence() {
        let raw = "```\n{\"a\":1}\n```";
        assert_eq!(strip_code_fences(raw), "{\"a\":1}");
    }

    #[test]
    fn leaves_unfenced_text_alone() {
        let raw = "{\"a\":1}";
        assert_eq!(strip_code_fences(raw), "{\"a\":1}");
    }
}
