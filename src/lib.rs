//! Content ingestion pipeline: discover videos on monitored channels, fetch
//! their audio, pick transcripts up from a watched folder, and enrich them
//! with AI-generated notes into a queryable store.

pub mod config;
pub mod database;
pub mod error;
pub mod feeds;
pub mod fetcher;
pub mod llm;
pub mod pipeline;

pub use config::Config;
pub use database::Database;
pub use error::PipelineError;
pub use pipeline::Pipeline;
