//! Token-based authentication and session renewal.
//!
//! Dual-token system: short-lived access tokens (15 min, stateless) and
//! long-lived refresh tokens (7 days) whose current value per user is held
//! in the session registry. Tokens travel in HTTP-only cookies.

use crate::state::AppState;
use axum::Router;

pub mod claims;
pub mod cookie;
pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod sessions;
pub mod tokens;

pub fn router() -> Router<AppState> {
    handlers::auth_routes()
}
