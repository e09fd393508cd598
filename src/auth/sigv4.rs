/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/auth/sigv4.rs
 *
 * AWS Signature Version 4 request signing. Only what the CloudWatch Logs
 * and EKS REST calls need: a canonical request over host/x-amz-date (plus
 * whatever headers the caller set), an HMAC-SHA256 signing-key chain, and
 * the Authorization header.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};

use super::AwsCredentials;

type HmacSha256 = Hmac<Sha256>;

const UNRESERVED: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~";

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Strict RFC 3986 percent-encoding as SigV4 requires.
pub(crate) fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Signs `headers` in place for a request to `url`, adding `x-amz-date`,
/// `x-amz-security-token` (when a session token is present), `host`, and
/// the `Authorization` header.
pub fn sign_request(
    credentials: &AwsCredentials,
    service: &str,
    method: &str,
    url: &reqwest::Url,
    headers: &mut HeaderMap,
    body: &[u8],
    now: DateTime<Utc>,
) {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let host = url.host_str().unwrap_or_default().to_string();

    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert("host", value);
    }
    if let Ok(value) = HeaderValue::from_str(&amz_date) {
        headers.insert("x-amz-date", value);
    }
    if let Some(token) = credentials.session_token.as_deref().filter(|t| !t.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(token) {
            headers.insert("x-amz-security-token", value);
        }
    }

    // Canonical headers: lowercase names, sorted, trimmed values.
    let mut header_pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().trim().to_string(),
            )
        })
        .collect();
    header_pairs.sort();
    let canonical_headers: String = header_pairs
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers: String = header_pairs
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    // Canonical query string: sorted, strictly encoded pairs.
    let mut query_pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    query_pairs.sort();
    let canonical_query = query_pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    // Canonical URI: every (already percent-encoded) path segment is
    // encoded once more, as SigV4 mandates for non-S3 services.
    let canonical_path = url
        .path()
        .split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/");

    let payload_hash = sha256_hex(body);
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_path,
        canonical_query,
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, credentials.region, service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = hmac(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let key = hmac(&key, credentials.region.as_bytes());
    let key = hmac(&key, service.as_bytes());
    let key = hmac(&key, b"aws4_request");
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, scope, signed_headers, signature
    );
    headers.insert(
        "authorization",
        HeaderValue::from_str(&authorization).unwrap(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn suite_credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
            region: "us-east-1".into(),
        }
    }

    #[test]
    fn matches_the_sigv4_test_suite_get_vanilla_vector() {
        let credentials = suite_credentials();
        let url: reqwest::Url = "https://example.amazonaws.com/".parse().unwrap();
        let mut headers = HeaderMap::new();
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();

        sign_request(&credentials, "service", "GET", &url, &mut headers, b"", now);

        let authorization = headers["authorization"].to_str().unwrap();
        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request"
        ));
        assert!(authorization.contains("SignedHeaders=host;x-amz-date"));
        assert!(authorization.ends_with(
            "Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        ));
    }

    #[test]
    fn session_tokens_are_added_and_signed() {
        let mut credentials = suite_credentials();
        credentials.session_token = Some("FQoGZXIvYXdzEXAMPLE".into());
        let url: reqwest::Url = "https://logs.us-east-1.amazonaws.com/".parse().unwrap();
        let mut headers = HeaderMap::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        sign_request(&credentials, "logs", "POST", &url, &mut headers, b"{}", now);

        assert_eq!(
            headers["x-amz-security-token"].to_str().unwrap(),
            "FQoGZXIvYXdzEXAMPLE"
        );
        let authorization = headers["authorization"].to_str().unwrap();
        assert!(authorization.contains("x-amz-security-token"));
    }

    #[test]
    fn strict_uri_encoding() {
        assert_eq!(uri_encode("abc-_.~"), "abc-_.~");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(
            uri_encode("arn:aws:iam::123:role/ops"),
            "arn%3Aaws%3Aiam%3A%3A123%3Arole%2Fops"
        );
    }
}
