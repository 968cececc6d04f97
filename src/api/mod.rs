//! HTTP API for the marketplace.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `PUT /api/users/:id` - Register a user or change their level (moderator)
//! - `POST /api/accounts/:id/deposit` - Top up an account (moderator)
//! - `GET /api/accounts/:id` - Balance and transactions (owner or moderator)
//! - `POST /api/tasks` - Create a task as the caller
//! - `GET /api/tasks/eligible` - Tasks the caller may execute, paginated
//! - `GET /api/tasks/:id` - Get a task
//! - `POST /api/tasks/:id/submit` - Submit a completion
//! - `POST /api/tasks/:id/pause` / `resume` - Creator pauses or resumes
//! - `POST /api/tasks/:id/cancel` - Cancel and refund remaining escrow
//! - `GET /api/tasks/:id/pending` - Moderation queue
//! - `GET /api/executions/:id` - Get an execution
//! - `POST /api/executions/:id/approve` / `reject` / `appeal`
//! - `GET /api/events` - Domain events via SSE
//!
//! Every route except health requires `x-user-id`. `x-user-role: moderator`
//! grants moderator authority. Both headers are set by the upstream gateway.

mod auth;
mod error;
mod routes;
pub mod types;

pub use auth::Caller;
pub use error::ApiError;
pub use routes::{router, serve, AppState};
pub use types::*;
