use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::routes::error::ApiError;

/// Header the upstream auth gateway sets to the authenticated user's id.
pub const OWNER_HEADER: &str = "x-user-id";

/// Owner of the request, as asserted by the auth gateway.
#[derive(Debug, Clone, Copy)]
pub struct Owner(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized(format!("Missing {OWNER_HEADER} header")))?;

        Uuid::parse_str(value.trim())
            .map(Owner)
            .map_err(|_| ApiError::Unauthorized(format!("Invalid {OWNER_HEADER} header")))
    }
}
