use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Paths reachable without the bearer secret. Everything else, including
/// the streaming socket handshake, authenticates here.
const AUTH_EXEMPT_PATHS: &[&str] = &["/health"];

#[derive(Clone)]
pub struct AuthState {
    pub secret: String,
}

pub fn create_auth_state(secret: String) -> Arc<AuthState> {
    Arc::new(AuthState { secret })
}

/// Bearer-secret middleware. All requests pass through here; the compare
/// is constant-time so the secret cannot be recovered via timing.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // CORS preflight must succeed without credentials.
    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    if AUTH_EXEMPT_PATHS.contains(&path.as_str()) {
        return Ok(next.run(request).await);
    }

    let provided = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        warn!(%path, "Missing or malformed Authorization header");
        return Err(unauthorized());
    };

    use subtle::ConstantTimeEq;
    if provided
        .as_bytes()
        .ct_eq(auth_state.secret.as_bytes())
        .into()
    {
        Ok(next.run(request).await)
    } else {
        warn!(%path, "Rejected request with invalid bearer secret");
        Err(unauthorized())
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}
