//! Authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use log::{debug, warn};
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims};

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(mut config: AuthConfig) -> Self {
        match config.resolve_jwt_secret() {
            Ok(resolved) => config.jwt_secret = resolved,
            Err(e) => {
                warn!("JWT secret unavailable: {}", e);
                config.jwt_secret = None;
            }
        }

        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
        }
    }

    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a JWT, or a `dev:<user>` token in dev mode.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if self.config.dev_mode
            && let Some(user_id) = token.strip_prefix("dev:")
        {
            return self.dev_user_claims(user_id);
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    fn dev_user_claims(&self, user_id: &str) -> Result<Claims, AuthError> {
        let user = self
            .config
            .dev_users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or(AuthError::UserNotFound)?;

        Ok(Claims {
            sub: user.id.clone(),
            iss: Some("dev".to_string()),
            exp: Utc::now().timestamp() + 3600 * 24,
            iat: Some(Utc::now().timestamp()),
            email: user.email.clone(),
            name: Some(user.name.clone()),
            preferred_username: Some(user.id.clone()),
        })
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub claims: Claims,
}

impl CurrentUser {
    /// The actor checked against project membership.
    pub fn id(&self) -> &str {
        &self.claims.sub
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates tokens and injects `CurrentUser` into request extensions.
/// Sources in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
/// 3. token query parameter (browsers cannot set headers on WebSockets)
/// 4. X-Dev-User header (dev mode only)
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let cookie_token = req
        .headers()
        .get(axum::http::header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, "auth_token"));

    let query_token = req.uri().query().and_then(token_from_query);

    let claims = if let Some(header) = auth_header {
        auth.validate_token(bearer_token_from_header(header)?)?
    } else if let Some(token) = cookie_token {
        auth.validate_token(token)?
    } else if let Some(ref token) = query_token {
        auth.validate_token(token)?
    } else if auth.is_dev_mode()
        && let Some(user_id) = req
            .headers()
            .get("X-Dev-User")
            .and_then(|h| h.to_str().ok())
    {
        debug!("Using dev user: {}", user_id);
        auth.validate_token(&format!("dev:{}", user_id))?
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    req.extensions_mut().insert(CurrentUser { claims });

    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;
    use crate::auth::DevUser;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret-for-unit-tests-minimum-32-chars-long";

    fn sign(secret: &str, user_id: &str, ttl_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: Some("classbox".to_string()),
            exp: now + ttl_secs,
            iat: Some(now),
            email: None,
            name: None,
            preferred_username: None,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn dev_state() -> AuthState {
        let mut config = AuthConfig::default();
        config.dev_mode = true;
        config.dev_users = vec![DevUser {
            id: "alice".to_string(),
            name: "Alice".to_string(),
            email: None,
        }];
        AuthState::new(config)
    }

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        for case in ["", "Bearer", "Token something", "Bearer token extra"] {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn test_token_sources() {
        assert_eq!(
            token_from_cookie_header("theme=dark; auth_token=abc", "auth_token"),
            Some("abc")
        );
        assert_eq!(token_from_cookie_header("theme=dark", "auth_token"), None);
        assert_eq!(
            token_from_query("a=1&token=dev%3Aalice").as_deref(),
            Some("dev:alice")
        );
        assert_eq!(token_from_query("a=1"), None);
    }

    #[test]
    fn test_dev_token_validation() {
        let state = dev_state();
        let claims = state.validate_token("dev:alice").unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(matches!(
            state.validate_token("dev:unknown"),
            Err(AuthError::UserNotFound)
        ));
    }

    #[test]
    fn test_dev_tokens_rejected_outside_dev_mode() {
        let mut config = AuthConfig::default();
        config.jwt_secret = Some(SECRET.to_string());
        let state = AuthState::new(config);
        assert!(matches!(
            state.validate_token("dev:alice"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_signed_token_validation() {
        let mut config = AuthConfig::default();
        config.jwt_secret = Some(SECRET.to_string());
        let state = AuthState::new(config);

        let claims = state.validate_token(&sign(SECRET, "bob", 3600)).unwrap();
        assert_eq!(claims.sub, "bob");

        let expired = sign(SECRET, "bob", -3600);
        assert!(matches!(
            state.validate_token(&expired),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let token = sign("another-secret-that-is-at-least-32-chars", "bob", 3600);

        let mut config = AuthConfig::default();
        config.jwt_secret = Some(SECRET.to_string());
        assert!(AuthState::new(config).validate_token(&token).is_err());
    }
}
