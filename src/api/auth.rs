use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use headers::{authorization::Bearer, Authorization, HeaderMapExt};
use tracing::debug;

use crate::api::ApiState;

/// Requires `Authorization: Bearer <token>` when a token is configured.
pub async fn auth_middleware(State(state): State<ApiState>, req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    if let Some(expected) = &state.token {
        let presented = req.headers().typed_get::<Authorization<Bearer>>();
        if presented.as_ref().map(|auth| auth.token()) != Some(expected.as_str()) {
            debug!("Rejected {} {} without a valid token", req.method(), req.uri().path());
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    Ok(next.run(req).await)
}
