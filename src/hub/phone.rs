//! Phone-number normalization and OTP helpers.
//!
//! Carriers deliver the `To`/`From` fields in several shapes (`+15551234567`,
//! `15551234567`, `0015551234567`, `whatsapp:+1 555 123 4567`). Everything that
//! compares a carrier value against the inventory goes through
//! [`normalize_phone_number`] and [`number_variants`].

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

static OTP_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{4,8})\b").unwrap());

const WHATSAPP_PREFIX: &str = "whatsapp:";

/// Reduce a phone number to an optional leading `+` followed by digits only.
///
/// Returns an empty string when the input holds no digits.
pub fn normalize_phone_number(raw: &str) -> String {
    let mut s = raw.trim();
    if s.is_empty() {
        return String::new();
    }

    if s.len() >= WHATSAPP_PREFIX.len()
        && s.is_char_boundary(WHATSAPP_PREFIX.len())
        && s[..WHATSAPP_PREFIX.len()].eq_ignore_ascii_case(WHATSAPP_PREFIX)
    {
        s = s[WHATSAPP_PREFIX.len()..].trim();
    }

    let mut had_plus = s.starts_with('+');
    if let Some(rest) = s.strip_prefix("00") {
        s = rest;
        had_plus = true;
    }

    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return String::new();
    }
    if had_plus {
        format!("+{}", digits)
    } else {
        digits
    }
}

/// The stored forms a normalized number may match: with and without the `+`.
pub fn number_variants(normalized: &str) -> Vec<String> {
    if normalized.is_empty() {
        return Vec::new();
    }
    let other = match normalized.strip_prefix('+') {
        Some(bare) => bare.to_string(),
        None => format!("+{}", normalized),
    };
    let mut variants = vec![normalized.to_string(), other];
    variants.retain(|v| !v.is_empty() && v != "+");
    variants.sort();
    variants.dedup();
    variants
}

/// First standalone run of 4-8 digits in a message body.
pub fn extract_otp_code(body: Option<&str>) -> Option<String> {
    let body = body?;
    OTP_REGEX
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether an OTP received at `received_at` may still be shown at `now`.
pub fn otp_is_visible(received_at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(received_at) <= window
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_plain_e164() {
        assert_eq!(normalize_phone_number("+15551234567"), "+15551234567");
    }

    #[test]
    fn test_normalize_strips_formatting() {
        assert_eq!(normalize_phone_number(" +1 (555) 123-4567 "), "+15551234567");
        assert_eq!(normalize_phone_number("555.123.4567"), "5551234567");
    }

    #[test]
    fn test_normalize_double_zero_prefix() {
        assert_eq!(normalize_phone_number("0044 20 7946 0000"), "+442079460000");
    }

    #[test]
    fn test_normalize_whatsapp_prefix() {
        assert_eq!(normalize_phone_number("whatsapp:+15551234567"), "+15551234567");
        assert_eq!(normalize_phone_number("WhatsApp: +1 555 123 4567"), "+15551234567");
    }

    #[test]
    fn test_normalize_empty_and_garbage() {
        assert_eq!(normalize_phone_number(""), "");
        assert_eq!(normalize_phone_number("   "), "");
        assert_eq!(normalize_phone_number("no digits"), "");
        assert_eq!(normalize_phone_number("+"), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["+1 555 123 4567", "0015551234567", "whatsapp:5551234567", "abc"] {
            let once = normalize_phone_number(raw);
            assert_eq!(normalize_phone_number(&once), once, "input: {}", raw);
        }
    }

    #[test]
    fn test_number_variants() {
        assert_eq!(
            number_variants("+15551234567"),
            vec!["+15551234567".to_string(), "15551234567".to_string()]
        );
        assert_eq!(
            number_variants("15551234567"),
            vec!["+15551234567".to_string(), "15551234567".to_string()]
        );
        assert!(number_variants("").is_empty());
    }

    #[test]
    fn test_extract_otp_code() {
        assert_eq!(
            extract_otp_code(Some("Your verification code is 482913.")),
            Some("482913".to_string())
        );
        assert_eq!(extract_otp_code(Some("Code: 1234 expires in 10 min")), Some("1234".to_string()));
    }

    #[test]
    fn test_extract_otp_code_rejects_out_of_range_runs() {
        assert_eq!(extract_otp_code(Some("Call 123 now")), None);
        assert_eq!(extract_otp_code(Some("Order 1234567890 shipped")), None);
        assert_eq!(extract_otp_code(Some("ref A12345B")), None);
        assert_eq!(extract_otp_code(Some("")), None);
        assert_eq!(extract_otp_code(None), None);
    }

    #[test]
    fn test_extract_otp_code_takes_first_match() {
        assert_eq!(
            extract_otp_code(Some("Order 99 code 5521 backup 778899")),
            Some("5521".to_string())
        );
    }

    #[test]
    fn test_otp_visibility_window() {
        let received = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let window = Duration::minutes(10);

        assert!(otp_is_visible(received, received + Duration::minutes(5), window));
        assert!(otp_is_visible(received, received + Duration::minutes(10), window));
        assert!(!otp_is_visible(received, received + Duration::minutes(10) + Duration::seconds(1), window));
        // Clock skew: a timestamp slightly in the future is still visible.
        assert!(otp_is_visible(received, received - Duration::seconds(30), window));
    }

    #[test]
    fn test_otp_zero_window_hides_everything_past() {
        let received = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert!(!otp_is_visible(received, received + Duration::seconds(1), Duration::zero()));
    }
}
