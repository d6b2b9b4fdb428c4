//! cloudflow: declarative Cloud Run deployment pipelines, plus an
//! OpenAI-compatible chat relay with API keys and rate limiting.

pub mod cli;
pub mod config;
pub mod deploy;
pub mod pipeline;
pub mod relay;
pub mod server;
pub mod store;
