//! Login validation

use omm_tunnel_proto::LoginRequest;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Login request carries no token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token subject '{token_user}' does not match login user '{login_user}'")]
    UserMismatch {
        token_user: String,
        login_user: String,
    },

    #[error("User '{0}' is not permitted")]
    UnknownUser(String),

    #[error("Domain {0} is not permitted for this user")]
    DomainNotPermitted(u8),
}

/// Result of a successful login validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub user_name: String,
    /// Domains the user may open tunnels on; empty means any
    pub allowed_domains: Vec<u8>,
}

impl AuthResult {
    pub fn new(user_name: String) -> Self {
        Self {
            user_name,
            allowed_domains: Vec::new(),
        }
    }

    pub fn with_allowed_domains(mut self, domains: Vec<u8>) -> Self {
        self.allowed_domains = domains;
        self
    }

    pub fn permits_domain(&self, domain_type: u8) -> bool {
        self.allowed_domains.is_empty() || self.allowed_domains.contains(&domain_type)
    }
}

/// Validates the login sub-message of an authenticated tunnel
pub trait LoginValidator: Send + Sync {
    fn validate(&self, request: &LoginRequest) -> Result<AuthResult, AuthError>;
}

/// Accepts every login
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl LoginValidator for AllowAll {
    fn validate(&self, request: &LoginRequest) -> Result<AuthResult, AuthError> {
        Ok(AuthResult::new(request.user_name.clone()))
    }
}

/// Accepts logins whose user name is on a fixed list
#[derive(Debug, Clone, Default)]
pub struct UserAllowList {
    users: Vec<String>,
}

impl UserAllowList {
    pub fn new(users: Vec<String>) -> Self {
        Self { users }
    }
}

impl LoginValidator for UserAllowList {
    fn validate(&self, request: &LoginRequest) -> Result<AuthResult, AuthError> {
        if self.users.iter().any(|user| user == &request.user_name) {
            Ok(AuthResult::new(request.user_name.clone()))
        } else {
            tracing::warn!(user = %request.user_name, "Login rejected: user not on allow list");
            Err(AuthError::UnknownUser(request.user_name.clone()))
        }
    }
}
