pub mod api;
pub mod completion_service;
pub mod config;
pub mod continuation_policy;
pub mod database;
pub mod errors;
pub mod logging;
pub mod models;
pub mod progress;
pub mod quiz_session;

pub use completion_service::CompletionService;
pub use continuation_policy::{ContinuationPolicy, PolicyDecision};
pub use database::Database;
pub use errors::*;
pub use models::*;
pub use quiz_session::{QuizSession, SessionScore};
