//! Signed session tokens.
//!
//! Tokens are HS256 JWTs. The signature gives tamper-evidence and lets any
//! holder of the secret verify a token offline; revocation is handled one
//! layer up, by the session row lookup.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::AuthError;

/// JWT claims embedded in every session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user ID (UUID string).
    pub sub: String,
    /// Session ID (UUID string).
    pub sid: String,
    pub username: String,
    pub iss: String,
    /// Issued-at (Unix timestamp).
    pub iat: i64,
    /// Expiration (Unix timestamp).
    pub exp: i64,
    /// Unique token ID.
    pub jti: String,
}

/// Signs and verifies session tokens with a shared secret.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &[u8], issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the authority's Clock instead.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["sub", "exp", "iat", "iss"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verifies signature and issuer and returns the claims.
    ///
    /// Does not look at `exp`.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed(e.to_string()),
            })
    }
}

/// SHA-256 hash of a raw token, hex-encoded.
///
/// This is the value stored on the session row.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: i64) -> Claims {
        Claims {
            sub: "5f0c3b0e-8a3c-4b8e-9d5e-0a1b2c3d4e5f".into(),
            sid: "0e9d8c7b-6a5f-4e3d-2c1b-0a9f8e7d6c5b".into(),
            username: "alice".into(),
            iss: "vigil".into(),
            iat: 1_700_000_000,
            exp,
            jti: "jti-1".into(),
        }
    }

    #[test]
    fn test_sign_and_verify_returns_claims() {
        let signer = TokenSigner::new(b"secret", "vigil");
        let token = signer.sign(&claims(1_700_003_600)).unwrap();

        let decoded = signer.verify(&token).unwrap();
        assert_eq!(decoded, claims(1_700_003_600));
    }

    #[test]
    fn test_verify_ignores_exp_in_the_past() {
        let signer = TokenSigner::new(b"secret", "vigil");
        let token = signer.sign(&claims(1)).unwrap();
        assert!(signer.verify(&token).is_ok());
    }

    #[test]
    fn test_verify_wrong_secret_is_malformed() {
        let token = TokenSigner::new(b"secret", "vigil")
            .sign(&claims(1_700_003_600))
            .unwrap();
        let other = TokenSigner::new(b"different", "vigil");
        assert!(matches!(other.verify(&token), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_verify_wrong_issuer_is_malformed() {
        let token = TokenSigner::new(b"secret", "vigil")
            .sign(&claims(1_700_003_600))
            .unwrap();
        let other = TokenSigner::new(b"secret", "someone-else");
        assert!(matches!(other.verify(&token), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn test_verify_garbage_is_malformed() {
        let signer = TokenSigner::new(b"secret", "vigil");
        assert!(matches!(
            signer.verify("not.a.jwt"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_hash_token_is_stable_hex() {
        let a = hash_token("abc");
        assert_eq!(a, hash_token("abc"));
        assert_ne!(a, hash_token("abd"));
        assert_eq!(a.len(), 64);
        assert_eq!(
            a,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
