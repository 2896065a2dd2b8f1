// Library interface for testing

pub mod analysis;
pub mod capture;
pub mod client;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod poll;
pub mod prompts;
pub mod provider;
pub mod queries;
pub mod recorder;
pub mod schema;
pub mod server;
pub mod stream_protocol;
pub mod video_path;

// Re-export the expected database version for convenience
pub use constants::EXPECTED_DB_VERSION;
