//! `Set-Cookie` assembly and validation (spec.md §4.4 step 7). The app's
//! raw `Set-Cookie` header text reaches the gateway verbatim inside
//! `WebSessionResponse::Content::additional_headers` — `http_table`'s
//! `WebSessionResponse` has no dedicated `set_cookies` field, so this module
//! re-validates the app-supplied header instead of assembling one from a
//! structured cookie struct. Each cookie is re-emitted as its own
//! `Set-Cookie` line, never comma-folded, and is dropped entirely on API
//! hosts (spec.md §3's invariant and §8's testable property).

/// Rejects a cookie whose name is empty or contains a `,` — a comma in the
/// name would be ambiguous with the comma-folding some HTTP clients apply to
/// repeated headers. The name is taken as the token before the first `;`
/// then the first `=`, so it can never itself contain `;` or `=`: those are
/// already consumed as the attribute separator and the name/value delimiter
/// by construction, not by a check here.
pub fn sanitize(raw: &str) -> Option<String> {
    let name_part = raw.split(';').next()?;
    let name = name_part.split('=').next()?.trim();
    if name.is_empty() || name.contains(',') {
        return None;
    }
    Some(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_cookie() {
        assert!(sanitize("sandstorm-sid=abc123; Path=/; HttpOnly").is_some());
    }

    #[test]
    fn embedded_equals_in_value_is_allowed() {
        // The first `=` delimits name from value; a base64-padded value or
        // one that otherwise contains `=` is valid and must pass through.
        assert!(sanitize("bad=name=value; Path=/").is_some());
    }

    #[test]
    fn rejects_cookie_name_with_embedded_comma() {
        assert!(sanitize("a,b=val; Path=/").is_none());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(sanitize("=value").is_none());
    }
}
