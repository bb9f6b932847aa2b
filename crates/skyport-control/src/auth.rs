use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use skyport_model::User;

use crate::{
    error::{ControlError, ControlResult},
    state::AppState,
};

pub const ACCESS_COOKIE_NAME: &str = "access";

const ISSUER: &str = "skyport";
const AUDIENCE: &str = "skyport-web";

/// Identity carried by a validated access token. Login and session handling live
/// outside the control plane; this side only verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    is_admin: bool,
    exp: usize,
    iat: usize,
    iss: String,
    aud: String,
}

pub fn validate_access_jwt(secret: &[u8], token: &str) -> anyhow::Result<AuthUser> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.set_issuer(&[ISSUER]);

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret),
        &validation,
    )?;

    Ok(AuthUser {
        user_id: data.claims.sub,
        username: data.claims.username,
        is_admin: data.claims.is_admin,
    })
}

/// Mint an access token for the external login layer.
pub fn issue_access_jwt(secret: &[u8], user: &AuthUser, ttl: time::Duration) -> anyhow::Result<String> {
    let now = time::OffsetDateTime::now_utc();
    let claims = Claims {
        sub: user.user_id.clone(),
        username: user.username.clone(),
        is_admin: user.is_admin,
        exp: (now + ttl).unix_timestamp() as usize,
        iat: now.unix_timestamp() as usize,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };

    Ok(jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret),
    )?)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ControlError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(ACCESS_COOKIE_NAME)
            .map(|c| c.value().to_string())
            .or_else(|| bearer_token(&parts.headers))
            .ok_or(ControlError::Unauthorized)?;

        validate_access_jwt(&state.config.jwt_secret, &token).map_err(|err| {
            tracing::debug!(error = %err, "rejected access token");
            ControlError::Unauthorized
        })
    }
}

impl AppState {
    /// The stored user record, with the token's admin claim honoured.
    pub async fn current_user(&self, auth: &AuthUser) -> ControlResult<User> {
        let mut user = self
            .registry
            .get_user(&auth.user_id)
            .await?
            .unwrap_or_else(|| User {
                id: auth.user_id.clone(),
                username: auth.username.clone(),
                admin: false,
                access_to: Vec::new(),
            });
        user.admin = user.admin || auth.is_admin;
        Ok(user)
    }
}

pub fn require_admin(user: &User) -> ControlResult<()> {
    if user.admin {
        Ok(())
    } else {
        Err(ControlError::Forbidden)
    }
}
