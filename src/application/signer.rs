//! Short-lived signed URLs for source documents.
//!
//! The rendering capability never sees storage credentials. It receives a URL
//! pointing back at this service's `/source/{key}` route, carrying an expiry and
//! an HMAC-SHA256 signature over `"{key}\n{expires}"`.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

const BLOCK_SIZE: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("storage key `{0}` cannot be signed")]
    InvalidKey(String),
    #[error("public base url cannot carry path segments")]
    BaseUrl,
    #[error("signed url has expired")]
    Expired,
    #[error("signature does not match")]
    Invalid,
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: Url,
    ttl: Duration,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url.as_str())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: Url, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            base_url,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sign(&self, key: &str) -> Result<Url, SignatureError> {
        self.sign_at(key, OffsetDateTime::now_utc())
    }

    pub fn sign_at(&self, key: &str, now: OffsetDateTime) -> Result<Url, SignatureError> {
        validate_key(key)?;
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = now.unix_timestamp().saturating_add(ttl);
        let signature = self.signature(key, expires);

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SignatureError::BaseUrl)?
            .pop_if_empty()
            .push("source")
            .extend(key.split('/'));
        url.query_pairs_mut()
            .clear()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url)
    }

    pub fn verify(&self, key: &str, expires: i64, signature: &str) -> Result<(), SignatureError> {
        self.verify_at(key, expires, signature, OffsetDateTime::now_utc())
    }

    pub fn verify_at(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: OffsetDateTime,
    ) -> Result<(), SignatureError> {
        if now.unix_timestamp() > expires {
            return Err(SignatureError::Expired);
        }

        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Invalid)?;
        let expected = hmac_sha256(&self.secret, payload(key, expires).as_bytes());

        if bool::from(presented.as_slice().ct_eq(expected.as_slice())) {
            Ok(())
        } else {
            Err(SignatureError::Invalid)
        }
    }

    fn signature(&self, key: &str, expires: i64) -> String {
        URL_SAFE_NO_PAD.encode(hmac_sha256(&self.secret, payload(key, expires).as_bytes()))
    }
}

fn payload(key: &str, expires: i64) -> String {
    format!("{key}\n{expires}")
}

fn validate_key(key: &str) -> Result<(), SignatureError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        Err(SignatureError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

fn hmac_sha256(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut key = [0u8; BLOCK_SIZE];
    if secret.len() > BLOCK_SIZE {
        let digest = Sha256::digest(secret);
        key[..digest.len()].copy_from_slice(&digest);
    } else {
        key[..secret.len()].copy_from_slice(secret);
    }

    let mut inner = Sha256::new();
    inner.update(key.map(|byte| byte ^ 0x36));
    inner.update(message);
    let inner = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(key.map(|byte| byte ^ 0x5c));
    outer.update(inner.as_slice());
    outer.finalize().to_vec()
}
