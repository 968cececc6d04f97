//! Caller identity from gateway headers.
//!
//! - `x-user-id` names the caller; requests without it are refused with 401
//! - `x-user-role: moderator` grants moderator authority
//!
//! The headers are trusted as-is. Authentication happens upstream.

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::ApiError;
use crate::ledger::UserId;
use crate::task::Actor;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub moderator: bool,
}

impl Caller {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())?;
        let moderator = headers
            .get(USER_ROLE_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(|role| role.trim().eq_ignore_ascii_case("moderator"))
            .unwrap_or(false);
        Some(Self {
            user_id: UserId::new(user_id),
            moderator,
        })
    }

    /// Authority the caller acts with on executions and tasks.
    pub fn actor(&self) -> Actor {
        if self.moderator {
            Actor::Moderator(self.user_id.clone())
        } else {
            Actor::User(self.user_id.clone())
        }
    }

    pub fn require_moderator(&self) -> Result<(), ApiError> {
        if self.moderator {
            Ok(())
        } else {
            Err(ApiError::forbidden("moderator role required"))
        }
    }

    /// The caller is `account` or a moderator.
    pub fn require_self_or_moderator(&self, account: &UserId) -> Result<(), ApiError> {
        if self.moderator || &self.user_id == account {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("{} may not access {}", self.user_id, account)))
        }
    }
}

/// Resolve the caller and attach it to the request as an extension.
pub async fn require_identity(mut req: Request<Body>, next: Next) -> Response {
    match Caller::from_headers(req.headers()) {
        Some(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        None => ApiError::unauthenticated().into_response(),
    }
}
