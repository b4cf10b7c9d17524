//! Twilio webhook signature verification.
//!
//! The carrier signs `url + key1 + value1 + key2 + value2 ...` (parameters
//! sorted by key) with HMAC-SHA1 keyed by the account auth token and sends the
//! base64 digest in `X-Twilio-Signature`.

use axum::http::{HeaderMap, Uri};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::errors::HubError;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Compute the expected signature for `url` and form `params`.
pub fn compute_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
) -> Result<String, HubError> {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).map_err(|_| HubError::InvalidSignature)?;
    mac.update(url.as_bytes());
    for (key, value) in sorted {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// The URL as signed, plus the same URL with its default port added or removed.
pub fn url_variants(url: &str) -> Vec<String> {
    let mut variants = vec![url.to_string()];
    let Some((scheme, rest)) = url.split_once("://") else {
        return variants;
    };
    let default_port = match scheme.to_ascii_lowercase().as_str() {
        "https" => "443",
        "http" => "80",
        _ => return variants,
    };
    let (authority, tail) = match rest.find(['/', '?']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let alternate = match authority.rsplit_once(':') {
        Some((host, port)) if port == default_port => format!("{}://{}{}", scheme, host, tail),
        Some(_) => return variants,
        None => format!("{}://{}:{}{}", scheme, authority, default_port, tail),
    };
    variants.push(alternate);
    variants
}

/// Check `signature` against every URL variant in constant time.
///
/// Always false when no auth token is configured.
pub fn validate(
    auth_token: Option<&str>,
    url: &str,
    params: &[(String, String)],
    signature: Option<&str>,
) -> bool {
    let (Some(token), Some(signature)) = (auth_token.filter(|t| !t.is_empty()), signature) else {
        return false;
    };
    let provided = signature.trim().as_bytes();
    let mut matched = false;
    for candidate in url_variants(url) {
        if let Ok(expected) = compute_signature(token, &candidate, params) {
            matched |= bool::from(expected.as_bytes().ct_eq(provided));
        }
    }
    matched
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
}

/// Rebuild the public URL the carrier posted to.
///
/// `public_url` wins when configured; otherwise the scheme and host come from
/// the proxy headers, then `Host`.
pub fn request_url(public_url: Option<&str>, headers: &HeaderMap, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    if let Some(base) = public_url.map(str::trim).filter(|b| !b.is_empty()) {
        return format!("{}{}", base.trim_end_matches('/'), path_and_query);
    }
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, "host"))
        .unwrap_or("localhost");
    format!("{}://{}{}", scheme, host, path_and_query)
}

pub fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
}
