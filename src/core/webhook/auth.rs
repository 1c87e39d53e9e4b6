//! Webhook authentication (bearer + HMAC) and per-source rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use hmac::{Hmac, Mac};
use regex::Regex;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use tracing::{debug, warn};

use super::store::WebhookEntry;

/// Constant-time equality over the raw bytes. Length mismatch returns
/// early; the padded compare below is for equal-length candidates.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check an `Authorization: Bearer <token>` header value.
pub fn validate_bearer_token(authorization: &str, expected_token: &str) -> bool {
    let Some(provided) = authorization.strip_prefix("Bearer ") else {
        warn!("Auth failed: invalid token");
        return false;
    };
    let valid = constant_time_eq(provided.as_bytes(), expected_token.as_bytes());
    if !valid {
        warn!("Auth failed: invalid token");
    }
    valid
}

fn compute_hmac(algorithm: &str, secret: &[u8], payload: &[u8]) -> Vec<u8> {
    match algorithm {
        "sha1" => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key size");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        "sha512" => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(secret).expect("hmac accepts any key size");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        _ => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key size");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Validate an HMAC signature with per-hook parameters.
///
/// The signed payload is `prefix + "." + body` when a payload-prefix regex
/// is configured (group 1 captured from the header value), else the raw
/// body. The expected signature is extracted from the header value via the
/// configured regex (group 1) or by stripping the configured prefix.
#[allow(clippy::too_many_arguments)]
pub fn validate_hmac_signature(
    body: &[u8],
    signature_value: &str,
    secret: &str,
    algorithm: &str,
    encoding: &str,
    sig_prefix: &str,
    sig_regex: &str,
    payload_prefix_regex: &str,
) -> bool {
    if signature_value.is_empty() || secret.is_empty() {
        warn!("HMAC auth failed: missing signature or secret");
        return false;
    }

    let sig = if !sig_regex.is_empty() {
        match Regex::new(sig_regex).ok().and_then(|re| {
            re.captures(signature_value)
                .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        }) {
            Some(extracted) if !extracted.is_empty() => extracted,
            _ => {
                warn!("HMAC auth failed: sig_regex did not match");
                return false;
            }
        }
    } else if !sig_prefix.is_empty() {
        signature_value
            .strip_prefix(sig_prefix)
            .unwrap_or(signature_value)
            .to_string()
    } else {
        signature_value.to_string()
    };

    let mut signed_payload: Vec<u8> = body.to_vec();
    if !payload_prefix_regex.is_empty() {
        if let Some(prefix) = Regex::new(payload_prefix_regex).ok().and_then(|re| {
            re.captures(signature_value)
                .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        }) {
            let mut combined = prefix.into_bytes();
            combined.push(b'.');
            combined.extend_from_slice(body);
            signed_payload = combined;
        }
    }

    let computed = compute_hmac(algorithm, secret.as_bytes(), &signed_payload);
    let expected = if encoding == "base64" {
        base64::engine::general_purpose::STANDARD.encode(&computed)
    } else {
        hex::encode(&computed)
    };

    let valid = constant_time_eq(sig.as_bytes(), expected.as_bytes());
    if !valid {
        warn!("HMAC auth failed: signature mismatch (algo={algorithm}, enc={encoding})");
    }
    valid
}

/// Per-hook authentication dispatcher. Bearer falls back to the global
/// token when the hook carries none.
pub fn validate_hook_auth(
    hook: &WebhookEntry,
    authorization: &str,
    signature_header_value: &str,
    body: &[u8],
    global_token: &str,
) -> bool {
    if hook.auth_mode == "hmac" {
        return validate_hmac_signature(
            body,
            signature_header_value,
            &hook.hmac_secret,
            &hook.hmac_algorithm,
            &hook.hmac_encoding,
            &hook.hmac_sig_prefix,
            &hook.hmac_sig_regex,
            &hook.hmac_payload_prefix_regex,
        );
    }

    let expected = if hook.token.is_empty() {
        global_token
    } else {
        &hook.token
    };
    if expected.is_empty() {
        warn!("Auth failed: no token configured for hook={}", hook.id);
        return false;
    }
    validate_bearer_token(authorization, expected)
}

/// Sliding-window rate limiter keyed by source address.
pub struct RateLimiter {
    max_per_minute: u32,
    window: Duration,
    buckets: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            window: Duration::from_secs(60),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request from `source`; returns false when over the limit.
    pub fn check(&self, source: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let bucket = buckets.entry(source).or_default();
        bucket.retain(|t| now.duration_since(*t) <= self.window);
        let remaining = self.max_per_minute as i64 - bucket.len() as i64;
        debug!("Rate limit check source={source} remaining={remaining}");
        if remaining <= 0 {
            warn!("Rate limit exceeded for {source}");
            return false;
        }
        bucket.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_hook() -> WebhookEntry {
        WebhookEntry {
            id: "sig".into(),
            auth_mode: "hmac".into(),
            hmac_secret: "k".into(),
            hmac_header: "X-Sig".into(),
            hmac_algorithm: "sha256".into(),
            hmac_encoding: "hex".into(),
            hmac_sig_prefix: "sha256=".into(),
            ..Default::default()
        }
    }

    #[test]
    fn bearer_requires_exact_token() {
        assert!(validate_bearer_token("Bearer secret-token", "secret-token"));
        assert!(!validate_bearer_token("Bearer wrong", "secret-token"));
        assert!(!validate_bearer_token("secret-token", "secret-token"));
    }

    #[test]
    fn hmac_hex_prefixed_round_trip() {
        // HMAC-SHA256("k", "{\"a\":1}") known-good vector.
        let body = br#"{"a":1}"#;
        let computed = compute_hmac("sha256", b"k", body);
        let header = format!("sha256={}", hex::encode(&computed));

        let hook = hmac_hook();
        assert!(validate_hook_auth(&hook, "", &header, body, ""));

        // Any single hex digit change must fail.
        let mut tampered = header.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(!validate_hook_auth(&hook, "", &tampered, body, ""));
    }

    #[test]
    fn hmac_payload_prefix_signs_timestamp_dot_body() {
        let body = b"payload";
        let timestamp = "1700000000";
        let mut signed = timestamp.as_bytes().to_vec();
        signed.push(b'.');
        signed.extend_from_slice(body);
        let sig = hex::encode(compute_hmac("sha256", b"whsec", &signed));
        let header = format!("t={timestamp},v1={sig}");

        assert!(validate_hmac_signature(
            body,
            &header,
            "whsec",
            "sha256",
            "hex",
            "",
            r"v1=([0-9a-f]+)",
            r"t=(\d+)",
        ));
    }

    #[test]
    fn hmac_base64_encoding_supported() {
        let body = b"data";
        let computed = compute_hmac("sha1", b"s", body);
        let header = base64::engine::general_purpose::STANDARD.encode(&computed);
        assert!(validate_hmac_signature(
            body, &header, "s", "sha1", "base64", "", "", "",
        ));
    }

    #[test]
    fn bearer_falls_back_to_global_token() {
        let hook = WebhookEntry {
            id: "b".into(),
            ..Default::default()
        };
        assert!(validate_hook_auth(
            &hook,
            "Bearer global-tok",
            "",
            b"{}",
            "global-tok"
        ));
        assert!(!validate_hook_auth(&hook, "Bearer other", "", b"{}", "global-tok"));
    }

    #[test]
    fn rate_limiter_is_per_source() {
        let limiter = RateLimiter::new(2);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(a));
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        // Separate bucket for a different source.
        assert!(limiter.check(b));
    }
}
