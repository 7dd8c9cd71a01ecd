//! Error types for the session layer.

/// Errors raised while issuing, validating, or revoking sessions.
///
/// The first four variants are what `validate_token` can return. The REST
/// surface and the realtime gate both turn any of them into a 401; the
/// distinction exists for logs and audit.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token's `exp` claim, or its session row, is in the past.
    #[error("token expired")]
    Expired,

    /// The token could not be decoded or its signature did not verify.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The signature is valid but the session row is gone (logout,
    /// password change, account disabled, explicit revoke).
    #[error("session revoked")]
    Revoked,

    /// No credential was presented at all.
    #[error("no credential presented")]
    NotFound,

    /// Username/password did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The account exists but has been deactivated.
    #[error("account disabled")]
    AccountDisabled,

    /// Token signing failed (bad key material).
    #[error("token signing failed: {0}")]
    Signing(String),

    /// The session store could not complete an operation.
    #[error("session store error: {0}")]
    Store(String),
}

impl AuthError {
    /// Stable machine-readable code, used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Expired => "TOKEN_EXPIRED",
            Self::Malformed(_) => "TOKEN_MALFORMED",
            Self::Revoked => "SESSION_REVOKED",
            Self::NotFound => "UNAUTHENTICATED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AccountDisabled => "ACCOUNT_DISABLED",
            Self::Signing(_) | Self::Store(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller (rather than the server) is at fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Signing(_) | Self::Store(_))
    }
}
