#![allow(dead_code)]

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod grading_pipeline;
pub mod identity;
pub mod llm;
pub mod logging;
pub mod quiz;
pub mod random;
pub mod room_registry;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use error::CoreError;
pub use grading_pipeline::GradingPipeline;
pub use quiz::QuizEngine;
pub use scheduler::Scheduler;
