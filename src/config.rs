use std::time::Duration;

/// Environment-driven configuration for the core. Follows the teacher's
/// `Config::from_env` shape: every tunable has a sane default so the crate
/// can run against an empty environment (as the test suite does).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub log_level: String,

    pub max_participants_per_session: usize,
    pub max_questions_per_quiz: usize,
    pub session_timeout_hours: i64,
    pub leaderboard_batch_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub guest_data_retention_days: i64,
    pub room_code_length: usize,
    pub room_code_retries: u32,
    pub short_answer_min_keyword_match: f64,
    pub short_answer_case_sensitive_default: bool,
    pub guest_token_length_bytes: usize,
    pub participation_points_default: i64,

    pub grading_concurrency: usize,
    pub grading_runs_per_entity: usize,
    pub grading_run_stagger: Duration,
    pub llm_max_retries: u32,
    pub llm_temperature_step: f64,
    pub llm_temperature_cap: f64,

    pub session_auto_end_schedule: String,
    pub guest_anonymise_schedule: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            log_level: "info".to_string(),

            max_participants_per_session: 500,
            max_questions_per_quiz: 100,
            session_timeout_hours: 2,
            leaderboard_batch_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            guest_data_retention_days: 30,
            room_code_length: 6,
            room_code_retries: 5,
            short_answer_min_keyword_match: 0.5,
            short_answer_case_sensitive_default: false,
            guest_token_length_bytes: 32,
            participation_points_default: 5,

            grading_concurrency: 2,
            grading_runs_per_entity: 3,
            grading_run_stagger: Duration::from_secs(1),
            llm_max_retries: 3,
            llm_temperature_step: 0.05,
            llm_temperature_cap: 0.30,

            session_auto_end_schedule: "0 */5 * * * *".to_string(),
            guest_anonymise_schedule: "0 0 2 * * *".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),

            max_participants_per_session: env_usize(
                "MAX_PARTICIPANTS_PER_SESSION",
                defaults.max_participants_per_session,
            ),
            max_questions_per_quiz: env_usize(
                "MAX_QUESTIONS_PER_QUIZ",
                defaults.max_questions_per_quiz,
            ),
            session_timeout_hours: env_i64("SESSION_TIMEOUT_HOURS", defaults.session_timeout_hours),
            leaderboard_batch_interval: env_secs(
                "LEADERBOARD_BATCH_INTERVAL",
                defaults.leaderboard_batch_interval,
            ),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL", defaults.heartbeat_interval),
            heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT", defaults.heartbeat_timeout),
            guest_data_retention_days: env_i64(
                "GUEST_DATA_RETENTION_DAYS",
                defaults.guest_data_retention_days,
            ),
            room_code_length: env_usize("ROOM_CODE_LENGTH", defaults.room_code_length),
            room_code_retries: env_usize("ROOM_CODE_RETRIES", defaults.room_code_retries as usize)
                as u32,
            short_answer_min_keyword_match: env_f64(
                "SHORT_ANSWER_MIN_KEYWORD_MATCH",
                defaults.short_answer_min_keyword_match,
            ),
            short_answer_case_sensitive_default: env_bool(
                "SHORT_ANSWER_CASE_SENSITIVE_DEFAULT",
                defaults.short_answer_case_sensitive_default,
            ),
            guest_token_length_bytes: env_usize(
                "GUEST_TOKEN_LENGTH",
                defaults.guest_token_length_bytes,
            ),
            participation_points_default: defaults.participation_points_default,

            grading_concurrency: env_usize("GRADING_CONCURRENCY", defaults.grading_concurrency),
            grading_runs_per_entity: defaults.grading_runs_per_entity,
            grading_run_stagger: defaults.grading_run_stagger,
            llm_max_retries: env_usize("LLM_MAX_RETRIES", defaults.llm_max_retries as usize) as u32,
            llm_temperature_step: defaults.llm_temperature_step,
            llm_temperature_cap: defaults.llm_temperature_cap,

            session_auto_end_schedule: std::env::var("SESSION_AUTO_END_SCHEDULE")
                .unwrap_or(defaults.session_auto_end_schedule),
            guest_anonymise_schedule: std::env::var("GUEST_ANONYMISE_SCHEDULE")
                .unwrap_or(defaults.guest_anonymise_schedule),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
