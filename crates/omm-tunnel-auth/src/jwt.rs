//! JWT (JSON Web Token) login tokens

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use omm_tunnel_proto::LoginRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::{AuthError, AuthResult, LoginValidator};

/// JWT claims carried in a tunnel login request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (login user name)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Custom: domains the user may open tunnels on (empty = any)
    #[serde(default)]
    pub domains: Vec<u8>,
}

impl JwtClaims {
    pub fn new(user_name: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: user_name,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            domains: Vec::new(),
        }
    }

    pub fn with_domains(mut self, domains: Vec<u8>) -> Self {
        self.domains = domains;
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates the signature and the expiration only.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate_token(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

impl LoginValidator for JwtValidator {
    fn validate(&self, request: &LoginRequest) -> Result<AuthResult, AuthError> {
        let token = request.token.as_deref().ok_or(AuthError::MissingToken)?;

        let claims = self.validate_token(token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::EncodingError(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            },
        })?;

        if claims.sub != request.user_name {
            return Err(AuthError::UserMismatch {
                token_user: claims.sub,
                login_user: request.user_name.clone(),
            });
        }

        tracing::debug!(user = %claims.sub, issuer = %claims.iss, "Login token accepted");

        Ok(AuthResult::new(claims.sub).with_allowed_domains(claims.domains))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"tunnel-login-secret";

    fn request(user: &str, token: Option<String>) -> LoginRequest {
        LoginRequest {
            stream_id: omm_tunnel_proto::LOGIN_STREAM_ID,
            user_name: user.to_string(),
            token,
            application_id: Some("256".to_string()),
        }
    }

    fn token_for(user: &str, validity: Duration) -> String {
        let claims = JwtClaims::new(
            user.to_string(),
            "test-issuer".to_string(),
            "tunnel".to_string(),
            validity,
        )
        .with_domains(vec![199]);
        JwtValidator::encode(SECRET, &claims).unwrap()
    }

    #[test]
    fn test_valid_token() {
        let validator = JwtValidator::new(SECRET);
        let token = token_for("alice", Duration::hours(1));

        let result = validator.validate(&request("alice", Some(token))).unwrap();
        assert_eq!(result.user_name, "alice");
        assert!(result.permits_domain(199));
        assert!(!result.permits_domain(6));
    }

    #[test]
    fn test_missing_token() {
        let validator = JwtValidator::new(SECRET);
        assert_eq!(
            validator.validate(&request("alice", None)),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn test_wrong_secret() {
        let validator = JwtValidator::new(b"another-secret");
        let token = token_for("alice", Duration::hours(1));

        assert!(matches!(
            validator.validate(&request("alice", Some(token))),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token() {
        let validator = JwtValidator::new(SECRET);
        let token = token_for("alice", Duration::hours(-2));

        assert_eq!(
            validator.validate(&request("alice", Some(token))),
            Err(AuthError::TokenExpired)
        );
    }

    #[test]
    fn test_subject_must_match_user() {
        let validator = JwtValidator::new(SECRET);
        let token = token_for("alice", Duration::hours(1));

        assert!(matches!(
            validator.validate(&request("bob", Some(token))),
            Err(AuthError::UserMismatch { .. })
        ));
    }
}
