use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use tracing::warn;
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

/// Reads a cookie value from the `Cookie` header(s).
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
}

/// Authenticated caller, taken from the access-token cookie or a Bearer header.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = cookie_value(&parts.headers, ACCESS_COOKIE)
            .or_else(|| bearer(&parts.headers))
            .ok_or_else(|| AppError::auth("Unauthorized request"))?;

        let claims = state.keys.verify_access(&token).map_err(|e| {
            warn!(reason = %e, "access token rejected");
            AppError::auth("Invalid access token")
        })?;

        // tokens outlive deleted accounts
        if state.users.find_by_id(claims.sub).await?.is_none() {
            warn!(user_id = %claims.sub, "access token for unknown user");
            return Err(AppError::auth("Invalid access token"));
        }

        Ok(AuthUser(claims.sub))
    }
}
