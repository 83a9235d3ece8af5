//! Security headers injected on every translated response (spec.md §4.4
//! step 6).

use axum::http::{HeaderName, HeaderValue, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Api,
    Ui,
}

pub fn apply<B>(resp: &mut Response<B>, host_kind: HostKind, host: &str, frame_ancestor: Option<&str>) {
    let headers = resp.headers_mut();
    match host_kind {
        HostKind::Api => {
            insert(headers, "vary", "Authorization");
            insert(headers, "access-control-allow-origin", "*");
            insert(
                headers,
                "access-control-expose-headers",
                "ETag, Cache-Control, Content-Disposition",
            );
            insert(
                headers,
                "content-security-policy",
                "default-src 'none'; sandbox",
            );
        }
        HostKind::Ui => {
            if let Some(parent) = frame_ancestor {
                insert(
                    headers,
                    "content-security-policy",
                    &format!("frame-ancestors {parent} 'self'"),
                );
                insert(headers, "x-frame-options", &format!("ALLOW-FROM {parent}"));
            } else {
                let csp = format!(
                    "default-src 'none'; img-src * data: blob: 'unsafe-inline'; \
                     media-src * data: blob: 'unsafe-inline'; \
                     script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
                     style-src 'self' 'unsafe-inline'; \
                     child-src 'self'; font-src 'self' data:; \
                     frame-src 'self' {host}; worker-src 'none'; \
                     connect-src 'self' ws://{host} wss://{host}"
                );
                insert(headers, "content-security-policy", &csp);
            }
        }
    }
}

fn insert(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn api_hosts_never_get_a_set_cookie_header_injected() {
        let mut resp = Response::new(Body::empty());
        apply(&mut resp, HostKind::Api, "api-xyz.example.com", None);
        assert!(resp.headers().get("set-cookie").is_none());
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[test]
    fn ui_hosts_get_default_csp_when_not_frame_restricted() {
        let mut resp = Response::new(Body::empty());
        apply(&mut resp, HostKind::Ui, "ui-abc.example.com", None);
        let csp = resp
            .headers()
            .get("content-security-policy")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(csp.contains("default-src 'none'"));
    }
}
