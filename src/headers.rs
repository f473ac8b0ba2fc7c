// src/headers.rs
//
// Small helpers over the response headers a download cares about:
// byte-range support, content length and RFC 6266 file names.

use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH};
use url::Url;

/// True when the server advertises byte-range support, i.e. `Accept-Ranges`
/// is present and not `none`.
pub fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && !value.eq_ignore_ascii_case("none")
        })
        .unwrap_or(false)
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

/// Extracts the file name from a `Content-Disposition` header, preferring
/// the extended `filename*` parameter over the plain `filename`.
pub fn content_disposition_file_name(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let mut plain = None;
    let mut extended = None;

    for part in raw.split(';').skip(1) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => extended = decode_ext_value(value.trim()),
            "filename" => plain = Some(unquote(value.trim()).to_string()),
            _ => {}
        }
    }

    extended
        .or(plain)
        .as_deref()
        .and_then(final_path_component)
}

/// Falls back to the last non-empty path segment of the resolved URL.
pub fn file_name_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    final_path_component(&decoded)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

// RFC 8187 ext-value: `charset '<language>' percent-encoded-bytes`.
// Only UTF-8 is accepted; anything else falls through to the plain name.
fn decode_ext_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;
    if !charset.eq_ignore_ascii_case("utf-8") {
        return None;
    }
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

// Keeps only the final path component of a server-supplied name.
fn final_path_component(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(name: &str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        map
    }

    #[test]
    fn accept_ranges_bytes() {
        assert!(accepts_byte_ranges(&headers("accept-ranges", "bytes")));
        assert!(accepts_byte_ranges(&headers("accept-ranges", "Bytes")));
    }

    #[test]
    fn accept_ranges_none_or_absent() {
        assert!(!accepts_byte_ranges(&headers("accept-ranges", "none")));
        assert!(!accepts_byte_ranges(&headers("accept-ranges", "NONE")));
        assert!(!accepts_byte_ranges(&headers("accept-ranges", "")));
        assert!(!accepts_byte_ranges(&HeaderMap::new()));
    }

    #[test]
    fn content_length_parses() {
        assert_eq!(content_length(&headers("content-length", "1024")), Some(1024));
        assert_eq!(content_length(&headers("content-length", "junk")), None);
        assert_eq!(content_length(&HeaderMap::new()), None);
    }

    #[test]
    fn disposition_plain_file_name() {
        let map = headers("content-disposition", "attachment; filename=report.pdf");
        assert_eq!(content_disposition_file_name(&map).as_deref(), Some("report.pdf"));
    }

    #[test]
    fn disposition_quoted_file_name() {
        let map = headers("content-disposition", "attachment; filename=\"report 2024.pdf\"");
        assert_eq!(
            content_disposition_file_name(&map).as_deref(),
            Some("report 2024.pdf")
        );
    }

    #[test]
    fn disposition_prefers_extended_name() {
        let map = headers(
            "content-disposition",
            "attachment; filename=\"fallback.bin\"; filename*=UTF-8''na%C3%AFve%20file.bin",
        );
        assert_eq!(
            content_disposition_file_name(&map).as_deref(),
            Some("na\u{ef}ve file.bin")
        );
    }

    #[test]
    fn disposition_ignores_non_utf8_ext_value() {
        let map = headers(
            "content-disposition",
            "attachment; filename=plain.bin; filename*=ISO-8859-1''n%E4me.bin",
        );
        assert_eq!(content_disposition_file_name(&map).as_deref(), Some("plain.bin"));
    }

    #[test]
    fn disposition_strips_path_components() {
        let map = headers("content-disposition", "attachment; filename=\"../../evil.sh\"");
        assert_eq!(content_disposition_file_name(&map).as_deref(), Some("evil.sh"));
    }

    #[test]
    fn disposition_without_name_is_none() {
        let map = headers("content-disposition", "inline");
        assert_eq!(content_disposition_file_name(&map), None);
    }

    #[test]
    fn url_last_segment() {
        let url = Url::parse("https://example.com/files/archive.tar.gz?token=1").unwrap();
        assert_eq!(file_name_from_url(&url).as_deref(), Some("archive.tar.gz"));
    }

    #[test]
    fn url_trailing_slash_uses_previous_segment() {
        let url = Url::parse("https://example.com/files/release/").unwrap();
        assert_eq!(file_name_from_url(&url).as_deref(), Some("release"));
    }

    #[test]
    fn url_percent_decoded_segment() {
        let url = Url::parse("https://example.com/a%20file.bin").unwrap();
        assert_eq!(file_name_from_url(&url).as_deref(), Some("a file.bin"));
    }

    #[test]
    fn url_without_path_is_none() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(file_name_from_url(&url), None);
    }
}
