//! Identity handling for the auth handshake. Real token validation is the
//! identity provider's job; the server only consumes the verified identity
//! behind the [`TokenVerifier`] seam.

use thiserror::Error;

/// The verified identity extracted from an auth token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed identity token")]
    Malformed,
    #[error("token subject is empty")]
    EmptySubject,
}

/// Maps an opaque bearer token to an identity. Implementations wrap the
/// deployment's identity provider; the handshake calls this exactly once per
/// connection, before any session routing.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Development verifier for local play and tests: accepts tokens of the form
/// `user_id:display name`. Deployments substitute their IdP-backed verifier.
pub struct DevTokenVerifier;

impl TokenVerifier for DevTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (user_id, display_name) = match token.split_once(':') {
            Some((id, name)) => (id.trim(), name.trim()),
            None => (token.trim(), token.trim()),
        };
        if user_id.is_empty() {
            return Err(AuthError::EmptySubject);
        }
        if !user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AuthError::Malformed);
        }
        let display_name = if display_name.is_empty() {
            user_id
        } else {
            display_name
        };
        Ok(Identity {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        })
    }
}
