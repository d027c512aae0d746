//! Shared bearer token and `exp` claim extraction.

use std::sync::RwLock;

/// The bearer token shared between the session manager and every request
/// loop.
///
/// The session manager replaces the value wholesale; loops take a snapshot
/// at the top of each iteration, so rotation becomes visible at the next
/// request without any cross-task coordination.
#[derive(Debug, Default)]
pub struct TokenHolder {
    token: RwLock<String>,
}

impl TokenHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current token (possibly empty).
    pub fn snapshot(&self) -> String {
        self.token.read().expect("token lock poisoned").clone()
    }

    /// Replace the token wholesale.
    pub fn replace(&self, token: String) {
        *self.token.write().expect("token lock poisoned") = token;
    }

    /// Clear the token (after an authentication failure).
    pub fn clear(&self) {
        self.token.write().expect("token lock poisoned").clear();
    }

    pub fn is_empty(&self) -> bool {
        self.token.read().expect("token lock poisoned").is_empty()
    }
}

/// Extract the `exp` claim (epoch seconds) from a JWT without verifying
/// the signature. The agent only schedules its refresh from this value;
/// trust in the token is the manager's problem.
pub fn token_expiry_epoch(token: &str) -> Option<i64> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}

#[cfg(test)]
pub(crate) fn make_test_jwt(claims: &serde_json::Value) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.unverified-signature")
}
