//! Freshness and body-decoding helpers for fragment responses.
//!
//! Expiration is derived from response headers with a fixed precedence:
//! `Cache-Control: s-maxage`, then `Cache-Control: max-age` (corrected by
//! `Age`), then `Expires` (relative to `Date` when both parse). A response
//! matching none of these is treated as already expired.

use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use encoding_rs::{Encoding, UTF_8};
use flate2::read::GzDecoder;
use http::header::{
    HeaderMap, AGE, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, DATE,
    EXPIRES,
};
use log::debug;

/// Response status codes eligible for fragment caching
const CACHEABLE_STATUS_CODES: &[u16] =
    &[200, 203, 204, 206, 300, 404, 405, 410, 414, 501];

/// Response status codes treated as a successful fragment resolution
const SUCCESS_STATUS_CODES: &[u16] = &[200, 203, 204, 206];

pub(crate) fn is_status_cacheable(status: u16) -> bool {
    CACHEABLE_STATUS_CODES.contains(&status)
}

pub(crate) fn is_status_success(status: u16) -> bool {
    SUCCESS_STATUS_CODES.contains(&status)
}

/// Derives the absolute expiration time of a fragment response from its
/// headers. Returns `UNIX_EPOCH` for responses that must not be cached.
pub(crate) fn compute_expiration(headers: &HeaderMap) -> SystemTime {
    let now = SystemTime::now();

    if let Some(seconds) = cache_control_directive(headers, "s-maxage") {
        return seconds_from(now, seconds);
    }

    if let Some(seconds) = cache_control_directive(headers, "max-age") {
        let age = header_value(headers.get(AGE))
            .and_then(|v| v.trim().parse::<i64>().ok());
        return match age {
            Some(age) => {
                let age = age.unsigned_abs();
                if age <= seconds {
                    seconds_from(now, seconds - age)
                } else {
                    now.checked_sub(Duration::from_secs(age - seconds))
                        .unwrap_or(UNIX_EPOCH)
                }
            }
            None => seconds_from(now, seconds),
        };
    }

    if let Some(expires) = header_value(headers.get(EXPIRES)) {
        if expires.trim() == "0" {
            return UNIX_EPOCH;
        }
        if let Ok(expires) = httpdate::parse_http_date(expires.trim()) {
            let date = header_value(headers.get(DATE))
                .and_then(|v| httpdate::parse_http_date(v.trim()).ok());
            return match date {
                // Interpret Expires relative to the origin's own clock
                Some(date) => match expires.duration_since(date) {
                    Ok(lifetime) => {
                        now.checked_add(lifetime).unwrap_or(UNIX_EPOCH)
                    }
                    Err(past) => now
                        .checked_sub(past.duration())
                        .unwrap_or(UNIX_EPOCH),
                },
                None => expires,
            };
        }
    }

    UNIX_EPOCH
}

/// `now + seconds`, treating instants beyond the representable range as
/// non-cacheable
fn seconds_from(now: SystemTime, seconds: u64) -> SystemTime {
    now.checked_add(Duration::from_secs(seconds)).unwrap_or(UNIX_EPOCH)
}

/// Extracts the numeric value of a `Cache-Control` directive.
///
/// Directive name matching is case-insensitive; values must match
/// `^[1-9][0-9]*$`. Unparsable directives are skipped silently.
pub(crate) fn cache_control_directive(
    headers: &HeaderMap,
    directive: &str,
) -> Option<u64> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            if name.trim().eq_ignore_ascii_case(directive) {
                parse_positive_seconds(value.trim())
            } else {
                None
            }
        })
        .next()
}

/// Parses a string matching `^[1-9][0-9]*$` into seconds
fn parse_positive_seconds(value: &str) -> Option<u64> {
    if value.starts_with(|c: char| ('1'..='9').contains(&c))
        && value.bytes().all(|b| b.is_ascii_digit())
    {
        value.parse().ok()
    } else {
        None
    }
}

/// Decodes a fragment response body into a string.
///
/// `Content-Encoding` absent or `plaintext` is decoded directly, `gzip` is
/// decompressed first and anything else yields an empty string. The charset
/// comes from the `charset` parameter of `Content-Type`, defaulting to
/// UTF-8. Decompression failures also yield an empty string; the caller
/// keeps the response status either way.
pub(crate) fn decode_body(body: &[u8], headers: &HeaderMap) -> String {
    let raw = match header_value(headers.get(CONTENT_ENCODING)) {
        None => body.to_vec(),
        Some(enc) if enc.trim().eq_ignore_ascii_case("plaintext") => {
            body.to_vec()
        }
        Some(enc) if enc.trim().eq_ignore_ascii_case("gzip") => {
            match gunzip(body) {
                Ok(decompressed) => decompressed,
                Err(err) => {
                    debug!("unable to gunzip fragment body: {err}");
                    return String::new();
                }
            }
        }
        Some(enc) => {
            debug!("fragment body with unsupported Content-Encoding '{enc}'");
            return String::new();
        }
    };
    let (text, _, _) = charset(headers).decode(&raw);
    text.into_owned()
}

fn gunzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    GzDecoder::new(body).read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Resolves the response charset from `Content-Type`, falling back to UTF-8
/// when absent or unknown
fn charset(headers: &HeaderMap) -> &'static Encoding {
    header_value(headers.get(CONTENT_TYPE))
        .and_then(|content_type| {
            content_type.split(';').skip(1).find_map(|param| {
                let (name, value) = param.split_once('=')?;
                if name.trim().eq_ignore_ascii_case("charset") {
                    Some(value)
                } else {
                    None
                }
            })
        })
        .and_then(|label| Encoding::for_label(label.trim().as_bytes()))
        .unwrap_or(UTF_8)
}

fn header_value(value: Option<&http::HeaderValue>) -> Option<&str> {
    value.and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn headers(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn seconds_from_now(instant: SystemTime) -> i64 {
        match instant.duration_since(SystemTime::now()) {
            Ok(ahead) => ahead.as_secs() as i64,
            Err(behind) => -(behind.duration().as_secs() as i64),
        }
    }

    #[test]
    fn s_maxage_takes_precedence_over_max_age() {
        let expiration = compute_expiration(&headers(&[(
            "cache-control",
            "max-age=100, s-maxage=600",
        )]));
        assert!((598..=600).contains(&seconds_from_now(expiration)));
    }

    #[test]
    fn max_age_is_corrected_by_age() {
        let expiration = compute_expiration(&headers(&[
            ("cache-control", "max-age=3600"),
            ("age", "600"),
        ]));
        assert!((2998..=3000).contains(&seconds_from_now(expiration)));
    }

    #[test]
    fn max_age_without_age_header() {
        let expiration = compute_expiration(&headers(&[(
            "cache-control",
            "Max-Age=120",
        )]));
        assert!((118..=120).contains(&seconds_from_now(expiration)));
    }

    #[test]
    fn age_larger_than_max_age_yields_past_expiration() {
        let expiration = compute_expiration(&headers(&[
            ("cache-control", "max-age=10"),
            ("age", "60"),
        ]));
        assert!(seconds_from_now(expiration) < 0);
    }

    #[test]
    fn oversized_max_age_does_not_overflow() {
        let expiration = compute_expiration(&headers(&[(
            "cache-control",
            "max-age=18446744073709551615",
        )]));
        assert_eq!(expiration, UNIX_EPOCH);
        let expiration = compute_expiration(&headers(&[(
            "cache-control",
            "s-maxage=18446744073709551615",
        )]));
        assert_eq!(expiration, UNIX_EPOCH);
    }

    #[test]
    fn extreme_age_does_not_overflow() {
        let expiration = compute_expiration(&headers(&[
            ("cache-control", "max-age=60"),
            ("age", "-9223372036854775808"),
        ]));
        assert_eq!(expiration, UNIX_EPOCH);
    }

    #[test]
    fn zero_and_leading_zero_max_age_are_ignored() {
        assert_eq!(
            compute_expiration(&headers(&[("cache-control", "max-age=0")])),
            UNIX_EPOCH
        );
        assert_eq!(
            compute_expiration(&headers(&[("cache-control", "max-age=0600")])),
            UNIX_EPOCH
        );
    }

    #[test]
    fn expires_zero_means_epoch() {
        assert_eq!(
            compute_expiration(&headers(&[("expires", "0")])),
            UNIX_EPOCH
        );
    }

    #[test]
    fn expires_is_interpreted_relative_to_date() {
        // Expires is 120s after Date, so expiration is ~now + 120s
        // regardless of where the absolute instants lie
        let expiration = compute_expiration(&headers(&[
            ("date", "Wed, 12 Oct 2050 07:00:00 GMT"),
            ("expires", "Wed, 12 Oct 2050 07:02:00 GMT"),
        ]));
        assert!((118..=120).contains(&seconds_from_now(expiration)));
    }

    #[test]
    fn expires_without_date_is_used_as_is() {
        let expiration = compute_expiration(&headers(&[(
            "expires",
            "Wed, 12 Oct 2050 07:00:00 GMT",
        )]));
        assert_eq!(
            expiration,
            httpdate::parse_http_date("Wed, 12 Oct 2050 07:00:00 GMT")
                .unwrap()
        );
    }

    #[test]
    fn malformed_expires_falls_through_to_epoch() {
        assert_eq!(
            compute_expiration(&headers(&[("expires", "not a date")])),
            UNIX_EPOCH
        );
    }

    #[test]
    fn no_caching_headers_means_epoch() {
        assert_eq!(compute_expiration(&HeaderMap::new()), UNIX_EPOCH);
        assert_eq!(
            compute_expiration(&headers(&[("cache-control", "no-store")])),
            UNIX_EPOCH
        );
    }

    #[test]
    fn directive_matching_is_case_insensitive_and_trimmed() {
        let map = headers(&[("cache-control", "public , S-MAXAGE = 300")]);
        assert_eq!(cache_control_directive(&map, "s-maxage"), Some(300));
    }

    #[test]
    fn plain_body_is_decoded_directly() {
        assert_eq!(decode_body(b"hello", &HeaderMap::new()), "hello");
        assert_eq!(
            decode_body(
                b"hello",
                &headers(&[("content-encoding", "plaintext")])
            ),
            "hello"
        );
    }

    #[test]
    fn gzip_body_is_decompressed() {
        let mut encoder = flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        encoder.write_all("fragment £ content".as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(
            decode_body(
                &compressed,
                &headers(&[("content-encoding", "gzip")])
            ),
            "fragment £ content"
        );
    }

    #[test]
    fn gzip_garbage_yields_empty_body() {
        assert_eq!(
            decode_body(
                b"definitely not gzip",
                &headers(&[("content-encoding", "gzip")])
            ),
            ""
        );
    }

    #[test]
    fn unsupported_encoding_yields_empty_body() {
        assert_eq!(
            decode_body(b"abc", &headers(&[("content-encoding", "br")])),
            ""
        );
    }

    #[test]
    fn charset_parameter_is_honored() {
        // 0xE4 is 'ä' in ISO-8859-1 but invalid UTF-8
        assert_eq!(
            decode_body(
                &[0x61, 0xE4],
                &headers(&[(
                    "content-type",
                    "text/html; charset=ISO-8859-1"
                )])
            ),
            "aä"
        );
    }

    #[test]
    fn unknown_charset_falls_back_to_utf8() {
        assert_eq!(
            decode_body(
                b"abc",
                &headers(&[("content-type", "text/html; charset=nope")])
            ),
            "abc"
        );
    }

    #[test]
    fn status_code_sets() {
        for status in [200, 203, 204, 206, 300, 404, 405, 410, 414, 501] {
            assert!(is_status_cacheable(status));
        }
        for status in [201, 301, 302, 400, 500, 502, 503] {
            assert!(!is_status_cacheable(status));
        }
        for status in [200, 203, 204, 206] {
            assert!(is_status_success(status));
        }
        for status in [300, 404, 501] {
            assert!(!is_status_success(status));
        }
    }
}
