//! HTTP surface: chat relay, model list and key management

pub mod error;
pub mod handlers;
pub mod state;

pub use error::ApiError;
pub use handlers::create_router;
pub use state::AppState;
