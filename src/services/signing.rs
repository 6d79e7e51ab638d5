//! HMAC-signed, time-limited URLs for the local object store.
//!
//! A signature covers a canonical resource string plus the expiry instant, so
//! a URL cannot be retargeted or extended. Verification is constant time.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("presigned url has expired")]
    Expired,
    #[error("presigned url signature does not match")]
    Mismatch,
}

/// Query parameters appended to a presigned URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedQuery {
    /// Unix seconds after which the URL is rejected.
    pub expires: i64,
    pub signature: String,
}

impl SignedQuery {
    pub fn to_query(&self) -> String {
        format!("expires={}&signature={}", self.expires, self.signature)
    }
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Arc<[u8]>,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
            ttl,
        }
    }

    /// Sign `resource` for the configured lifetime starting now.
    ///
    /// A lifetime too large to represent saturates at the far future.
    pub fn sign(&self, resource: &str) -> SignedQuery {
        self.sign_at(resource, Utc::now().timestamp())
    }

    fn sign_at(&self, resource: &str, now: i64) -> SignedQuery {
        let expires = i64::try_from(self.ttl.as_secs())
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .unwrap_or(i64::MAX);
        SignedQuery {
            expires,
            signature: self.signature(resource, expires),
        }
    }

    pub fn verify(&self, resource: &str, expires: i64, signature: &str) -> Result<(), SignatureError> {
        if Utc::now().timestamp() > expires {
            return Err(SignatureError::Expired);
        }
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Mismatch)?;
        self.mac(resource, expires)
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)
    }

    fn signature(&self, resource: &str, expires: i64) -> String {
        URL_SAFE_NO_PAD.encode(self.mac(resource, expires).finalize().into_bytes())
    }

    fn mac(&self, resource: &str, expires: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(resource.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }
}

/// Canonical resource for a part upload.
pub fn part_resource(upload_id: &str, part_number: u32) -> String {
    format!("PUT /uploads/{upload_id}/parts/{part_number}")
}

/// Canonical resource for a single-shot object upload.
pub fn object_resource(key: &str, content_type: &str) -> String {
    format!("PUT /objects/{key}\n{content_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new("test-secret", Duration::from_secs(60))
    }

    #[test]
    fn signed_resource_verifies() {
        let signer = signer();
        let resource = part_resource("abc", 3);
        let signed = signer.sign(&resource);
        assert_eq!(
            signer.verify(&resource, signed.expires, &signed.signature),
            Ok(())
        );
    }

    #[test]
    fn retargeted_or_tampered_signature_is_rejected() {
        let signer = signer();
        let signed = signer.sign(&part_resource("abc", 3));

        assert_eq!(
            signer.verify(&part_resource("abc", 4), signed.expires, &signed.signature),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            signer.verify(
                &part_resource("abc", 3),
                signed.expires + 60,
                &signed.signature
            ),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            signer.verify(&part_resource("abc", 3), signed.expires, "not base64!"),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn expired_signature_is_rejected() {
        let signer = signer();
        let resource = object_resource("images/x.png", "image/png");
        let expires = Utc::now().timestamp() - 1;
        let signature = signer.signature(&resource, expires);
        assert_eq!(
            signer.verify(&resource, expires, &signature),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn different_secrets_disagree() {
        let resource = part_resource("abc", 1);
        let signed = signer().sign(&resource);
        let other = UrlSigner::new("other-secret", Duration::from_secs(60));
        assert_eq!(
            other.verify(&resource, signed.expires, &signed.signature),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn huge_ttl_saturates_instead_of_wrapping() {
        let signer = UrlSigner::new("test-secret", Duration::from_secs(u64::MAX));
        let resource = part_resource("abc", 1);

        let signed = signer.sign(&resource);
        assert_eq!(signed.expires, i64::MAX);
        assert_eq!(signer.verify(&resource, signed.expires, &signed.signature), Ok(()));

        let near_limit = UrlSigner::new("test-secret", Duration::from_secs(10));
        assert_eq!(near_limit.sign_at(&resource, i64::MAX - 5).expires, i64::MAX);
    }
}
