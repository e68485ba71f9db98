//! Playback decision tokens.
//!
//! Every decision leaving the server is stamped with a signed token; the
//! client echoes it on `stream.start`. Verification checks signature,
//! freshness, and that the token was minted for the same target, which stops
//! clients from replaying a decision against a different source or guessing
//! policy client-side.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::resolver::decision::{Decision, PlayStrategy};
use crate::session::entity::PlaybackMode;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Decision target (service reference or recording reference).
    sub: String,
    mode: PlaybackMode,
    strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    codec: Option<String>,
    iat: i64,
    exp: i64,
    jti: String,
}

/// A verified decision extracted from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDecision {
    pub mode: PlaybackMode,
    pub strategy: PlayStrategy,
    pub target_codec: Option<String>,
}

/// Signs and verifies decision tokens (HS256).
pub struct DecisionTokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    freshness: Duration,
}

impl DecisionTokenSigner {
    /// Create a signer. An empty secret gets a random per-process key, which
    /// is fine for single-instance deployments: tokens only need to survive
    /// the stream-info → stream.start round trip.
    pub fn new(secret: &str, freshness: Duration) -> Self {
        let key_bytes: Vec<u8> = if secret.is_empty() {
            rand::random::<[u8; 32]>().to_vec()
        } else {
            secret.as_bytes().to_vec()
        };
        Self {
            encoding: EncodingKey::from_secret(&key_bytes),
            decoding: DecodingKey::from_secret(&key_bytes),
            freshness,
        }
    }

    /// Issue a token binding `decision` to `target`.
    pub fn issue(&self, target: &str, decision: &Decision) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: target.to_string(),
            mode: decision.mode,
            strategy: decision.strategy.as_str().to_string(),
            codec: decision.target_codec.clone(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::from_std(self.freshness).unwrap_or_default())
                .timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::engine(ErrorKind::InternalError, e.to_string()))
    }

    /// Verify a token and check it was minted for `expected_target`.
    pub fn verify(&self, token: &str, expected_target: &str) -> Result<VerifiedDecision> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::engine(
                    ErrorKind::PreconditionFailed,
                    "decision token expired; fetch fresh stream-info",
                ),
                _ => Error::engine(ErrorKind::PreconditionFailed, "decision token invalid"),
            })?;

        if data.claims.sub != expected_target {
            return Err(Error::engine(
                ErrorKind::PreconditionFailed,
                "decision token was issued for a different target",
            ));
        }
        let strategy = PlayStrategy::parse(&data.claims.strategy).ok_or_else(|| {
            Error::engine(ErrorKind::PreconditionFailed, "decision token malformed")
        })?;
        Ok(VerifiedDecision {
            mode: data.claims.mode,
            strategy,
            target_codec: data.claims.codec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> Decision {
        Decision {
            strategy: PlayStrategy::DirectPlay,
            mode: PlaybackMode::NativeHls,
            reason: "test".into(),
            target_codec: None,
        }
    }

    #[test]
    fn issue_verify_roundtrip() {
        let signer = DecisionTokenSigner::new("secret", Duration::from_secs(60));
        let token = signer.issue("1:0:1:ABCD", &decision()).unwrap();
        let verified = signer.verify(&token, "1:0:1:ABCD").unwrap();
        assert_eq!(verified.mode, PlaybackMode::NativeHls);
        assert_eq!(verified.strategy, PlayStrategy::DirectPlay);
    }

    #[test]
    fn rejects_target_mismatch() {
        let signer = DecisionTokenSigner::new("secret", Duration::from_secs(60));
        let token = signer.issue("1:0:1:ABCD", &decision()).unwrap();
        let err = signer.verify(&token, "1:0:1:OTHER").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[test]
    fn rejects_foreign_signature() {
        let signer_a = DecisionTokenSigner::new("secret-a", Duration::from_secs(60));
        let signer_b = DecisionTokenSigner::new("secret-b", Duration::from_secs(60));
        let token = signer_a.issue("t", &decision()).unwrap();
        assert!(signer_b.verify(&token, "t").is_err());
    }

    #[test]
    fn rejects_garbage() {
        let signer = DecisionTokenSigner::new("secret", Duration::from_secs(60));
        assert!(signer.verify("not-a-token", "t").is_err());
    }

    #[test]
    fn random_key_still_roundtrips_in_process() {
        let signer = DecisionTokenSigner::new("", Duration::from_secs(60));
        let token = signer.issue("t", &decision()).unwrap();
        assert!(signer.verify(&token, "t").is_ok());
    }
}
