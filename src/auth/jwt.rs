use std::time::Duration;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use super::Principal;
use crate::{config::JwtConfig, error::ServiceError, state::AppState, users::model::Role};

/// Access token payload issued by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub role: Role,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
    pub aud: String,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

impl JwtKeys {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
        }
    }

    /// Issues an HS256 token for `principal`. Tokens normally come from the identity
    /// service; this exists for tooling and tests sharing the secret.
    pub fn sign(&self, principal: &Principal, ttl: Duration) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        let claims = Claims {
            sub: principal.id,
            role: principal.role,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %principal.id, role = %principal.role, "jwt signed");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        debug!(user_id = %data.claims.sub, role = %data.claims.role, "jwt verified");
        Ok(data.claims)
    }
}

/// Bearer-token extractor yielding the caller's `Principal`.
pub struct AuthUser(pub Principal);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::Unauthorized("Missing Authorization header".into()))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .or_else(|| auth_header.strip_prefix("bearer "))
            .ok_or_else(|| ServiceError::Unauthorized("Invalid Authorization header".into()))?;

        let claims = keys.verify(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            ServiceError::Unauthorized("Invalid or expired token".into())
        })?;

        Ok(AuthUser(Principal {
            id: claims.sub,
            role: claims.role,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header::AUTHORIZATION, Request};

    fn keys(secret: &str, issuer: &str, audience: &str) -> JwtKeys {
        JwtKeys::new(&JwtConfig {
            secret: secret.into(),
            issuer: issuer.into(),
            audience: audience.into(),
        })
    }

    fn principal(role: Role) -> Principal {
        Principal {
            id: Uuid::new_v4(),
            role,
        }
    }

    #[test]
    fn sign_and_verify() {
        let keys = keys("dev-secret", "test-issuer", "test-aud");
        let p = principal(Role::Moderator);
        let token = keys.sign(&p, Duration::from_secs(300)).expect("sign");
        let claims = keys.verify(&token).expect("verify");
        assert_eq!(claims.sub, p.id);
        assert_eq!(claims.role, Role::Moderator);
        assert_eq!(claims.iss, "test-issuer");
    }

    #[test]
    fn verify_rejects_wrong_issuer_or_secret() {
        let good = keys("same-secret", "good-iss", "good-aud");
        let token = good.sign(&principal(Role::User), Duration::from_secs(60)).unwrap();
        assert!(keys("same-secret", "bad-iss", "good-aud").verify(&token).is_err());
        assert!(keys("other-secret", "good-iss", "good-aud").verify(&token).is_err());
    }

    #[test]
    fn role_defaults_and_account_state_is_not_read_from_token() {
        let keys = keys("s", "i", "a");
        let now = OffsetDateTime::now_utc().unix_timestamp() as usize;
        let token = encode(
            &Header::default(),
            &serde_json::json!({
                "sub": Uuid::nil(), "exp": now + 60, "iat": now, "iss": "i", "aud": "a",
                "active": false
            }),
            &EncodingKey::from_secret(b"s"),
        )
        .unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.role, Role::User);
        assert!(!serde_json::to_value(&claims).unwrap().as_object().unwrap().contains_key("active"));
    }

    struct KeysOnly(JwtKeys);

    impl FromRef<KeysOnly> for JwtKeys {
        fn from_ref(state: &KeysOnly) -> Self {
            state.0.clone()
        }
    }

    async fn extract(state: &KeysOnly, header: Option<&str>) -> Result<AuthUser, ServiceError> {
        let mut req = Request::builder().uri("/");
        if let Some(h) = header {
            req = req.header(AUTHORIZATION, h);
        }
        let (mut parts, _) = req.body(()).unwrap().into_parts();
        AuthUser::from_request_parts(&mut parts, state).await
    }

    #[tokio::test]
    async fn extractor_accepts_bearer_tokens() {
        let state = KeysOnly(keys("s", "i", "a"));
        let p = principal(Role::Admin);
        let token = state.0.sign(&p, Duration::from_secs(60)).unwrap();

        let AuthUser(got) = extract(&state, Some(&format!("Bearer {token}"))).await.unwrap();
        assert_eq!(got, p);

        assert!(matches!(
            extract(&state, None).await,
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            extract(&state, Some(&format!("Basic {token}"))).await,
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            extract(&state, Some("Bearer garbage")).await,
            Err(ServiceError::Unauthorized(_))
        ));
    }
}
