//! Opaque bearer token codec.
//!
//! A token is `b64url(payload) "." b64url(hmac_sha256(payload, secret))` where
//! `payload` is the literal `"<user_uuid>:<session_uuid>"`. There is no claim
//! envelope and no clock inside the token; expiry is authoritative in the
//! session store.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid token")]
pub struct InvalidToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_uuid: Uuid,
    pub session_id: Uuid,
}

#[derive(Clone)]
pub struct TokenCodec {
    // Prototype MAC keyed once at startup; signing clones it per message.
    mac: HmacSha256,
}

impl TokenCodec {
    /// # Errors
    /// Returns an error if the secret cannot key HMAC-SHA-256.
    pub fn new(secret: &SecretString) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|err| anyhow!("token secret rejected by hmac: {err}"))?;
        Ok(Self { mac })
    }

    #[must_use]
    pub fn make(&self, user_uuid: Uuid, session_id: Uuid) -> String {
        let payload = format!("{user_uuid}:{session_id}");
        let sig = self.sign(payload.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(sig)
        )
    }

    /// Verify a token and recover its claims.
    ///
    /// Rejects anything that does not split into exactly two UUID-shaped
    /// payload fields under a valid signature. All rejections collapse into
    /// one opaque error so callers cannot distinguish tamper modes.
    ///
    /// # Errors
    /// Returns [`InvalidToken`] on any structural or signature failure.
    pub fn parse(&self, token: &str) -> Result<TokenClaims, InvalidToken> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(InvalidToken)?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| InvalidToken)?;
        let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| InvalidToken)?;

        let expected = self.sign(&payload);
        if expected.ct_eq(&sig).unwrap_u8() != 1 {
            return Err(InvalidToken);
        }

        let payload = std::str::from_utf8(&payload).map_err(|_| InvalidToken)?;
        let (user, session) = payload.split_once(':').ok_or(InvalidToken)?;
        Ok(TokenClaims {
            user_uuid: Uuid::parse_str(user).map_err(|_| InvalidToken)?,
            session_id: Uuid::parse_str(session).map_err(|_| InvalidToken)?,
        })
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(&SecretString::from("unit-test-secret".to_string())).expect("codec")
    }

    #[test]
    fn round_trip_recovers_claims() {
        let codec = codec();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let token = codec.make(user, session);
        let claims = codec.parse(&token).expect("parse");
        assert_eq!(claims.user_uuid, user);
        assert_eq!(claims.session_id, session);
    }

    #[test]
    fn any_single_character_mutation_fails() {
        let codec = codec();
        let token = codec.make(Uuid::new_v4(), Uuid::new_v4());
        for pos in 0..token.len() {
            let mut bytes = token.clone().into_bytes();
            if bytes[pos] == b'.' {
                continue;
            }
            bytes[pos] = if bytes[pos] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(bytes).expect("ascii");
            assert_eq!(codec.parse(&tampered), Err(InvalidToken), "position {pos}");
        }
    }

    #[test]
    fn rejects_missing_separator_and_bad_base64() {
        let codec = codec();
        assert_eq!(codec.parse("no-separator"), Err(InvalidToken));
        assert_eq!(codec.parse("!!!.$$$"), Err(InvalidToken));
    }

    #[test]
    fn rejects_non_uuid_payload_even_when_signed() {
        let codec = codec();
        let payload = b"not-a-uuid:also-not-a-uuid";
        let sig = codec.sign(payload);
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(sig)
        );
        assert_eq!(codec.parse(&token), Err(InvalidToken));
    }

    #[test]
    fn rejects_one_field_payload() {
        let codec = codec();
        let payload = Uuid::new_v4().to_string();
        let sig = codec.sign(payload.as_bytes());
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(sig)
        );
        assert_eq!(codec.parse(&token), Err(InvalidToken));
    }

    #[test]
    fn different_secrets_do_not_cross_verify() {
        let codec_a = codec();
        let codec_b =
            TokenCodec::new(&SecretString::from("another-secret".to_string())).expect("codec");
        let token = codec_a.make(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(codec_b.parse(&token), Err(InvalidToken));
    }
}
