use axum::{extract::{Request, State}, middleware::Next, response::Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};

use crate::{error::ApiError, state::AppState};

/// Bearer-token gate for `/api/v1/*`. A no-op when `IMX_API_KEY` is unset,
/// matching typical local-first tooling.
pub async fn require_api_key(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    match auth {
        Some(TypedHeader(Authorization(bearer))) if bearer.token() == expected => Ok(next.run(req).await),
        _ => Err(ApiError::unauthorized()),
    }
}
