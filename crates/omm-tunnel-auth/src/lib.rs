//! Login authentication for tunnel streams
//!
//! A provider that requires authentication holds each accepted tunnel in
//! an unauthenticated state until the consumer's login request passes a
//! [`LoginValidator`].

pub mod jwt;
pub mod validator;

pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use validator::{AllowAll, AuthError, AuthResult, LoginValidator, UserAllowList};

pub use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
