//! HTTP surface for the Rasid ingestion pipeline.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use auth::{AuthUser, JwtVerifier};
pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use state::AppState;
