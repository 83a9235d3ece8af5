//! The fixed HTTP-status tables shared by both HTTP⇄RPC translators
//! (`http-bridge`, grain side, and `gateway`'s `WebSessionBridge`).
//!
//! Keeping this table in `shared-types` instead of duplicating it in both
//! crates is the Rust-native equivalent of the original tree's single
//! `web-session.capnp` schema annotations being the one source of truth for
//! both directions (spec.md §4.4).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuccessCode {
    Ok,
    Created,
    Accepted,
    NoContent,
    NonAuthoritative,
    PartialContent,
    MultipleChoices,
}

impl SuccessCode {
    pub const fn http_status(self) -> (u16, &'static str) {
        match self {
            SuccessCode::Ok => (200, "OK"),
            SuccessCode::Created => (201, "Created"),
            SuccessCode::Accepted => (202, "Accepted"),
            SuccessCode::NoContent => (204, "No Content"),
            SuccessCode::NonAuthoritative => (203, "Non-Authoritative Information"),
            SuccessCode::PartialContent => (206, "Partial Content"),
            SuccessCode::MultipleChoices => (300, "Multiple Choices"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientErrorCode {
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    Conflict,
    Gone,
    RequestEntityTooLarge,
    RequestUriTooLong,
    UnsupportedMediaType,
    RequestRangeNotSatisfiable,
    ImATeapot,
    Unauthorized,
}

impl ClientErrorCode {
    pub const fn http_status(self) -> (u16, &'static str) {
        match self {
            ClientErrorCode::BadRequest => (400, "Bad Request"),
            ClientErrorCode::Unauthorized => (401, "Unauthorized"),
            ClientErrorCode::Forbidden => (403, "Forbidden"),
            ClientErrorCode::NotFound => (404, "Not Found"),
            ClientErrorCode::MethodNotAllowed => (405, "Method Not Allowed"),
            ClientErrorCode::NotAcceptable => (406, "Not Acceptable"),
            ClientErrorCode::Conflict => (409, "Conflict"),
            ClientErrorCode::Gone => (410, "Gone"),
            ClientErrorCode::RequestEntityTooLarge => (413, "Request Entity Too Large"),
            ClientErrorCode::RequestUriTooLong => (414, "Request-URI Too Long"),
            ClientErrorCode::UnsupportedMediaType => (415, "Unsupported Media Type"),
            ClientErrorCode::RequestRangeNotSatisfiable => (416, "Requested Range Not Satisfiable"),
            ClientErrorCode::ImATeapot => (418, "I'm a Teapot"),
        }
    }
}

/// The response kinds a `WebSession` call can resolve to (spec.md §4.4
/// step 5). `bridge` (inside-grain) produces these from a raw HTTP status
/// line; `gateway` (outside) consumes them to re-render an HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WebSessionResponse {
    Content {
        status_code: SuccessCode,
        mime_type: String,
        e_tag: Option<String>,
        additional_headers: Vec<(String, String)>,
        body: ContentBody,
        disposition: Option<Disposition>,
    },
    NoContent {
        should_reset_form: bool,
    },
    PreconditionFailed {
        matching_e_tag: Option<String>,
    },
    Redirect {
        location: String,
        is_permanent: bool,
        switch_to_get: bool,
    },
    ClientError {
        status_code: ClientErrorCode,
        html_message: Option<String>,
        body_mime_type: Option<String>,
        body: Option<Vec<u8>>,
    },
    ServerError {
        descriptive_html: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContentBody {
    Bytes(Vec<u8>),
    /// A server-streaming capability id, resolved by the caller's RPC layer.
    Stream(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disposition {
    pub download: Option<String>,
}

/// Parses `Content-Disposition: attachment; filename="…"` honouring RFC 822
/// backslash-escapes inside the quoted filename, per spec.md §4.4.
pub fn parse_content_disposition(header: &str) -> Option<Disposition> {
    let mut parts = header.split(';');
    let kind = parts.next()?.trim();
    if !kind.eq_ignore_ascii_case("attachment") {
        return None;
    }
    for part in parts {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let filename = unquote_rfc822(rest.trim());
            return Some(Disposition {
                download: Some(filename),
            });
        }
    }
    Some(Disposition { download: None })
}

fn unquote_rfc822(s: &str) -> String {
    let Some(inner) = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) else {
        return s.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Status → redirect translation table (spec.md §4.4 step 2).
pub fn redirect_status(is_permanent: bool, switch_to_get: bool) -> u16 {
    match (is_permanent, switch_to_get) {
        (true, true) => 301,
        (true, false) => 308,
        (false, true) => 303,
        (false, false) => 307,
    }
}

/// 204 vs 205 depending on whether the app asked the browser to reset the
/// submitting form (spec.md §4.4 step 5, `noContent`).
pub fn no_content_status(should_reset_form: bool) -> u16 {
    if should_reset_form {
        205
    } else {
        204
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_attachment_disposition() {
        let d = parse_content_disposition(r#"attachment; filename="report.pdf""#).unwrap();
        assert_eq!(d.download.as_deref(), Some("report.pdf"));
    }

    #[test]
    fn parses_attachment_disposition_with_escaped_quote() {
        let d = parse_content_disposition(r#"attachment; filename="weird\"name.txt""#).unwrap();
        assert_eq!(d.download.as_deref(), Some("weird\"name.txt"));
    }

    #[test]
    fn non_attachment_disposition_returns_none() {
        assert!(parse_content_disposition("inline").is_none());
    }

    #[test]
    fn redirect_status_table_matches_spec() {
        assert_eq!(redirect_status(true, true), 301);
        assert_eq!(redirect_status(true, false), 308);
        assert_eq!(redirect_status(false, true), 303);
        assert_eq!(redirect_status(false, false), 307);
    }

    #[test]
    fn no_content_status_depends_on_reset_form() {
        assert_eq!(no_content_status(true), 205);
        assert_eq!(no_content_status(false), 204);
    }
}
