//! GitHub webhook signature verification.
//!
//! GitHub signs the raw request body with the webhook secret and sends the
//! digest as `X-Hub-Signature: sha1=<hex>` and, on newer deliveries,
//! `X-Hub-Signature-256: sha256=<hex>`.
//! Reference: https://docs.github.com/en/webhooks/using-webhooks/validating-webhook-deliveries

use axum::http::HeaderMap;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::warn;

use crate::error::SignatureError;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
pub const SIGNATURE_256_HEADER: &str = "X-Hub-Signature-256";

/// MAC algorithm named by a signature header's prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
}

impl Algorithm {
    pub fn header(self) -> &'static str {
        match self {
            Algorithm::Sha1 => SIGNATURE_HEADER,
            Algorithm::Sha256 => SIGNATURE_256_HEADER,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1=",
            Algorithm::Sha256 => "sha256=",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
        }
    }
}

/// A signature header value with its prefix removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature<'a> {
    pub algorithm: Algorithm,
    pub hex_digest: &'a str,
}

/// Find the signature to check. `X-Hub-Signature-256` wins when present.
pub fn signature_from_headers(headers: &HeaderMap) -> Result<Signature<'_>, SignatureError> {
    for algorithm in [Algorithm::Sha256, Algorithm::Sha1] {
        let Some(value) = headers.get(algorithm.header()) else {
            continue;
        };

        let hex_digest = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix(algorithm.prefix()));

        return match hex_digest {
            Some(hex_digest) => Ok(Signature {
                algorithm,
                hex_digest,
            }),
            None => {
                warn!(header = algorithm.header(), "webhook_signature_prefix_invalid");
                Err(SignatureError::Missing)
            }
        };
    }

    warn!("webhook_signature_missing");
    Err(SignatureError::Missing)
}

fn verify_with<M: Mac + KeyInit>(secret: &[u8], body: &[u8], expected: &[u8]) -> bool {
    match <M as Mac>::new_from_slice(secret) {
        Ok(mac) => mac.chain_update(body).verify_slice(expected).is_ok(),
        Err(_) => {
            warn!("webhook_signature_invalid_key");
            false
        }
    }
}

fn hex_digest_with<M: Mac + KeyInit>(secret: &[u8], body: &[u8]) -> String {
    <M as Mac>::new_from_slice(secret)
        .map(|mac| hex::encode(mac.chain_update(body).finalize().into_bytes()))
        .unwrap_or_default()
}

/// Verify `signature` against the raw request body.
///
/// The comparison runs in constant time (`Mac::verify_slice`), so how much
/// of a forged digest matches is not observable. The computed digest is
/// never logged.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    signature: &Signature<'_>,
) -> Result<(), SignatureError> {
    // GitHub sends lowercase hex; any other spelling is not its digest.
    let lowercase = !signature.hex_digest.bytes().any(|b| b.is_ascii_uppercase());
    let decoded = hex::decode(signature.hex_digest).ok().filter(|_| lowercase);
    let expected = match decoded {
        Some(bytes) => bytes,
        None => {
            warn!(
                algorithm = signature.algorithm.as_str(),
                actual_length = signature.hex_digest.len(),
                "webhook_signature_not_hex"
            );
            return Err(SignatureError::Invalid);
        }
    };

    let valid = match signature.algorithm {
        Algorithm::Sha1 => verify_with::<HmacSha1>(secret, body, &expected),
        Algorithm::Sha256 => verify_with::<HmacSha256>(secret, body, &expected),
    };

    if valid {
        Ok(())
    } else {
        warn!(
            algorithm = signature.algorithm.as_str(),
            body_length = body.len(),
            "webhook_signature_mismatch"
        );
        Err(SignatureError::Invalid)
    }
}

/// Header value GitHub would send for `body`, e.g. `sha1=5d61...`.
pub fn sign(secret: &[u8], body: &[u8], algorithm: Algorithm) -> String {
    let digest = match algorithm {
        Algorithm::Sha1 => hex_digest_with::<HmacSha1>(secret, body),
        Algorithm::Sha256 => hex_digest_with::<HmacSha256>(secret, body),
    };
    format!("{}{}", algorithm.prefix(), digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    const SECRET: &[u8] = b"It's a Secret to Everybody";
    const BODY: &[u8] = b"Hello, World!";

    fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, name, value);
        headers
    }

    #[test]
    fn test_sign_matches_github_sha256_vector() {
        // Example from GitHub's webhook validation docs.
        assert_eq!(
            sign(SECRET, BODY, Algorithm::Sha256),
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
    }

    #[test]
    fn test_verify_valid_signatures() {
        for algorithm in [Algorithm::Sha1, Algorithm::Sha256] {
            let header = sign(SECRET, BODY, algorithm);
            let headers = headers_with(algorithm.header(), &header);
            let signature = signature_from_headers(&headers).unwrap();

            assert_eq!(signature.algorithm, algorithm);
            assert_eq!(verify_signature(SECRET, BODY, &signature), Ok(()));
        }
    }

    #[test]
    fn test_verify_missing_header() {
        assert_eq!(
            signature_from_headers(&HeaderMap::new()),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn test_verify_wrong_prefix() {
        let digest = sign(SECRET, BODY, Algorithm::Sha1);
        let headers = headers_with(SIGNATURE_HEADER, digest.trim_start_matches("sha1="));
        assert_eq!(signature_from_headers(&headers), Err(SignatureError::Missing));

        let headers = headers_with(SIGNATURE_HEADER, "md5=abcdef");
        assert_eq!(signature_from_headers(&headers), Err(SignatureError::Missing));
    }

    #[test]
    fn test_sha256_header_preferred() {
        let mut headers = headers_with(SIGNATURE_HEADER, "sha1=00");
        insert(
            &mut headers,
            SIGNATURE_256_HEADER,
            &sign(SECRET, BODY, Algorithm::Sha256),
        );

        let signature = signature_from_headers(&headers).unwrap();
        assert_eq!(signature.algorithm, Algorithm::Sha256);
        assert_eq!(verify_signature(SECRET, BODY, &signature), Ok(()));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let header = sign(b"other-secret", BODY, Algorithm::Sha1);
        let headers = headers_with(SIGNATURE_HEADER, &header);
        let signature = signature_from_headers(&headers).unwrap();

        assert_eq!(
            verify_signature(SECRET, BODY, &signature),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_verify_rejects_non_hex_and_truncated() {
        for digest in ["zz", "abc", ""] {
            let signature = Signature {
                algorithm: Algorithm::Sha1,
                hex_digest: digest,
            };
            assert_eq!(
                verify_signature(SECRET, BODY, &signature),
                Err(SignatureError::Invalid)
            );
        }
    }

    #[test]
    fn test_verify_rejects_uppercase_digest() {
        let header = sign(SECRET, BODY, Algorithm::Sha1);
        let upper = header.trim_start_matches("sha1=").to_ascii_uppercase();
        let signature = Signature {
            algorithm: Algorithm::Sha1,
            hex_digest: &upper,
        };

        assert_eq!(
            verify_signature(SECRET, BODY, &signature),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_any_single_bit_flip_is_rejected() {
        let header = sign(SECRET, BODY, Algorithm::Sha1);
        let digest = hex::decode(header.trim_start_matches("sha1=")).unwrap();

        // Flipped bits in the body.
        for byte in 0..BODY.len() {
            for bit in 0..8 {
                let mut body = BODY.to_vec();
                body[byte] ^= 1 << bit;
                let signature = Signature {
                    algorithm: Algorithm::Sha1,
                    hex_digest: header.trim_start_matches("sha1="),
                };
                assert!(verify_signature(SECRET, &body, &signature).is_err());
            }
        }

        // Flipped bits in the digest, first byte through last.
        for byte in 0..digest.len() {
            for bit in 0..8 {
                let mut forged = digest.clone();
                forged[byte] ^= 1 << bit;
                let forged_hex = hex::encode(&forged);
                let signature = Signature {
                    algorithm: Algorithm::Sha1,
                    hex_digest: &forged_hex,
                };
                assert!(verify_signature(SECRET, BODY, &signature).is_err());
            }
        }
    }
}
