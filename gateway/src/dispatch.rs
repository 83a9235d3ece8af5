//! Host-based request demux (spec.md §4.3): the eight dispatch rules,
//! first match wins.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, error, info_span, Instrument};

use crate::grain_directory::ForeignHostDirectoryEntry;
use crate::security_headers::{self, HostKind};
use crate::session_cache::{ForeignHostInfo, SessionEntry};
use crate::state::{AppState, UI_SID_COOKIE};
use crate::web_session_bridge::{self, WebSessionBridge};

/// User agents allowed to use HTTP Basic auth against the bare `api` host
/// instead of a bearer token — preserved verbatim per spec.md §9's note
/// that this hard-coded allowlist, however arbitrary, is load-bearing.
const BASIC_AUTH_USER_AGENT_ALLOWLIST: &[&str] = &["DAVdroid", "CalDAV-Sync", "CardDAV-Sync"];

pub async fn route(State(state): State<Arc<AppState>>, req: Request) -> Response {
    state
        .requests_total
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let span = info_span!("request", %host, path = %req.uri().path());

    async move { dispatch(&state, host, req).await }
        .instrument(span)
        .await
}

async fn dispatch(state: &Arc<AppState>, host: String, req: Request) -> Response {
    let bare_host = host.split(':').next().unwrap_or(&host);

    // Rule 1: base URL -> shell.
    if bare_host == state.config.base_url {
        return proxy_to_shell(state, req).await;
    }

    let Some(label) = state.wildcard.matches(bare_host) else {
        // Rule 7/8: no wildcard match — 20-char static-publish host id or a
        // foreign hostname entirely (DNS TXT / standalone). The full
        // foreign-hostname router lookup is out of scope; we resolve what
        // we can from the local cache and otherwise answer not-found.
        return foreign_or_static_host(state, bare_host).await;
    };

    // Rule 2: ddp/static/payments subdomains -> shell.
    if matches!(label, "ddp" | "static" | "payments") {
        return proxy_to_shell(state, req).await;
    }

    // Rule 5: selftest-*.
    if label.starts_with("selftest-") {
        return (StatusCode::OK, "Self-test OK.").into_response();
    }

    // Rule 4: api-<id>.
    if let Some(grain_id) = label.strip_prefix("api-") {
        return api_grain_session(state, grain_id, req).await;
    }

    // Rule 3: bare api host.
    if label == "api" {
        return bare_api_host(req);
    }

    // Rule 6: ui-<id>.
    if let Some(grain_id) = label.strip_prefix("ui-") {
        return ui_session(state, grain_id, bare_host, req).await;
    }

    foreign_or_static_host(state, bare_host).await
}

fn bare_api_host(req: Request) -> Response {
    if has_bearer_token(&req) || has_allowlisted_basic_auth(&req) {
        // No specific grain is addressed by the bare `api` host; upstream
        // Sandstorm resolves the token to a grain via the router. That
        // lookup is out of scope here, so an authenticated request to the
        // bare host has nowhere further to go.
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/plain")],
        "Unauthorized: this API host requires a bearer token.",
    )
        .into_response()
}

async fn api_grain_session(state: &Arc<AppState>, grain_id: &str, req: Request) -> Response {
    let token = bearer_token(&req);
    let Some(token) = token else {
        return api_unauthorized_response(&req);
    };

    let bridge = match get_or_create_bridge(state, &state.api_sessions, &token, grain_id, HostKind::Api).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };

    let precondition = web_session_bridge::precondition_from_headers(req.headers());
    let mut resp = bridge.handle(req, precondition).await;
    security_headers::apply(&mut resp, HostKind::Api, grain_id, None);
    resp
}

fn api_unauthorized_response(req: &Request) -> Response {
    if matches!(req.method().as_str(), "GET" | "HEAD") {
        StatusCode::UNAUTHORIZED.into_response()
    } else {
        let mut resp = StatusCode::UNAUTHORIZED.into_response();
        resp.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"sandstorm\""),
        );
        resp
    }
}

async fn ui_session(state: &Arc<AppState>, grain_id: &str, host: &str, req: Request) -> Response {
    let cookie_header = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let cookies = web_session_bridge::parse_cookies(cookie_header);
    let Some(sid) = cookies.get(UI_SID_COOKIE).cloned() else {
        return StatusCode::FORBIDDEN.into_response();
    };

    if !csrf_origin_is_acceptable(&req, host) {
        return (StatusCode::FORBIDDEN, "CSRF check failed").into_response();
    }

    if is_websocket_upgrade(&req) {
        if let Err(e) = state.ensure_grain_running(grain_id).await {
            return e.into_response();
        }
        return crate::ws_proxy::proxy(&state.config.grains_dir(), grain_id, req).await;
    }

    let bridge = match get_or_create_bridge(state, &state.ui_sessions, &sid, grain_id, HostKind::Ui).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };

    let precondition = web_session_bridge::precondition_from_headers(req.headers());
    let mut resp = bridge.handle(req, precondition).await;
    security_headers::apply(&mut resp, HostKind::Ui, host, None);
    resp
}

fn is_websocket_upgrade(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// spec.md §4.3 rule 6's CSRF check: the `Origin` header must match the
/// request host, with the documented "null origin" exception preserved
/// per spec.md §9.
fn csrf_origin_is_acceptable(req: &Request, host: &str) -> bool {
    let Some(origin) = req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        // No Origin header at all — older browsers / non-browser clients;
        // upstream treats this the same as a same-origin request.
        return true;
    };
    if origin.eq_ignore_ascii_case("null") {
        return true;
    }
    let origin_host = origin
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or("");
    let origin_host = origin_host.split(':').next().unwrap_or(origin_host);
    origin_host == host
}

async fn get_or_create_bridge(
    state: &Arc<AppState>,
    cache: &crate::session_cache::SessionCache,
    key: &str,
    grain_id: &str,
    host_kind: HostKind,
) -> Result<Arc<WebSessionBridge>, crate::error::Error> {
    if let Some(entry) = cache.get(key) {
        return Ok(Arc::clone(&entry.bridge));
    }

    state.ensure_grain_running(grain_id).await?;
    let bridge = Arc::new(
        WebSessionBridge::connect(&state.config.grains_dir(), grain_id, host_kind).await?,
    );
    cache.insert(
        key.to_string(),
        Arc::new(SessionEntry {
            bridge: Arc::clone(&bridge),
            last_used: std::sync::Mutex::new(std::time::Instant::now()),
            parent_frame_origin: None,
        }),
    );
    Ok(bridge)
}

/// Rules 7/8: resolve `host` through the foreign-hostname cache, serving a
/// stale entry immediately and kicking off a background refresh once past
/// the TTL midpoint (spec.md §3/§5), or resolving synchronously on a cold
/// miss. Static-published content itself requires the owning grain's
/// `getWwwFileHack` capability, which this build doesn't serve end to end —
/// a resolved static-publishing id still renders the not-found template,
/// just with its id acknowledged instead of a blanket "no such app".
async fn foreign_or_static_host(state: &Arc<AppState>, host: &str) -> Response {
    if let Some((info, needs_refresh)) = state.foreign_hosts.lookup(host) {
        if needs_refresh && state.foreign_hosts.try_claim_refresh(host) {
            spawn_foreign_host_refresh(Arc::clone(state), host.to_string());
        }
        return foreign_host_response(host, &info);
    }

    let (info, ttl) = resolve_foreign_host(state, host).await;
    state.foreign_hosts.insert(host.to_string(), info.clone(), ttl);
    foreign_host_response(host, &info)
}

fn spawn_foreign_host_refresh(state: Arc<AppState>, host: String) {
    tokio::spawn(async move {
        let (info, ttl) = resolve_foreign_host(&state, &host).await;
        state.foreign_hosts.insert(host.clone(), info, ttl);
        state.foreign_hosts.release_refresh(&host);
    });
}

async fn resolve_foreign_host(state: &Arc<AppState>, host: &str) -> (ForeignHostInfo, Duration) {
    match state.foreign_host_directory.lookup(host).await {
        Some(ForeignHostDirectoryEntry::StaticPublishing { public_id, ttl_secs }) => (
            ForeignHostInfo::StaticPublishing { public_id },
            Duration::from_secs(ttl_secs),
        ),
        Some(ForeignHostDirectoryEntry::Standalone { ttl_secs }) => {
            (ForeignHostInfo::Standalone, Duration::from_secs(ttl_secs))
        }
        None => (
            ForeignHostInfo::Unknown,
            state.config.foreign_hostname_unknown_ttl,
        ),
    }
}

fn foreign_host_response(host: &str, info: &ForeignHostInfo) -> Response {
    let body = match info {
        ForeignHostInfo::StaticPublishing { public_id } => format!(
            "<html><body><h1>No such app</h1><p>Host <code>{host}</code> is \
             registered for static publishing under grain <code>{public_id}</code>, \
             but this build doesn't serve static-published content.</p></body></html>"
        ),
        ForeignHostInfo::Standalone | ForeignHostInfo::Unknown => format!(
            "<html><body><h1>No such app</h1><p>No grain is published at host \
             <code>{host}</code>. If you expected this to work, check the DNS \
             TXT record for this hostname.</p></body></html>"
        ),
    };
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/html")],
        body,
    )
        .into_response()
}

fn has_bearer_token(req: &Request) -> bool {
    bearer_token(req).is_some()
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn has_allowlisted_basic_auth(req: &Request) -> bool {
    let Some(ua) = req.headers().get(header::USER_AGENT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let is_allowlisted = BASIC_AUTH_USER_AGENT_ALLOWLIST
        .iter()
        .any(|allowed| ua.contains(allowed));
    is_allowlisted
        && req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("Basic "))
            .unwrap_or(false)
}

/// Forwards to the shell HTTP backend (rules 1, 2) — structurally the same
/// plain-TCP proxy the teacher uses for sandbox traffic
/// (`hypervisor::proxy::proxy_http`), pointed at the shell instead.
async fn proxy_to_shell(state: &Arc<AppState>, req: Request) -> Response {
    let shell_addr = state.config.shell_addr.clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let target_uri = match Uri::builder()
        .scheme("http")
        .authority(shell_addr.as_str())
        .path_and_query(path_and_query)
        .build()
    {
        Ok(u) => u,
        Err(e) => {
            error!("bad shell proxy URI: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    debug!(%target_uri, "proxying to shell");

    let stream = match TcpStream::connect(&shell_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!(%shell_addr, "shell unreachable: {e}");
            return (StatusCode::BAD_GATEWAY, format!("shell unreachable: {e}")).into_response();
        }
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(c) => c,
        Err(e) => {
            error!("shell handshake failed: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            error!("shell proxy connection error: {e}");
        }
    });

    let (mut parts, body) = req.into_parts();
    parts.uri = target_uri;
    parts.headers.remove(header::CONNECTION);
    parts.headers.remove(header::TRANSFER_ENCODING);
    let proxy_req = hyper::Request::from_parts(parts, body);

    match sender.send_request(proxy_req).await {
        Ok(resp) => {
            let (parts, body) = resp.into_parts();
            let body = Body::new(
                body.map_err(|e| std::io::Error::other(e.to_string()))
                    .boxed_unsync(),
            );
            Response::from_parts(parts, body)
        }
        Err(e) => {
            error!("shell proxy request failed: {e}");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(data_root: std::path::PathBuf) -> Config {
        Config {
            http_port: 8080,
            https_port: 8443,
            smtp_port: 2525,
            bind_ip: "0.0.0.0".into(),
            base_url: "example.com".into(),
            wildcard_host: "*.example.com".into(),
            shell_addr: "127.0.0.1:3000".into(),
            shell_smtp_addr: "127.0.0.1:25".into(),
            backend_socket_path: data_root.join("socket/backend"),
            data_root,
            session_purge_interval: Duration::from_secs(120),
            session_idle_timeout: Duration::from_secs(120),
            foreign_hostname_unknown_ttl: Duration::from_secs(300),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }

    #[tokio::test]
    async fn foreign_host_cache_miss_resolves_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("foreign-hosts.json"),
            r#"{"static-host.example": {"kind": "static_publishing", "public_id": "grain0001", "ttl_secs": 60}}"#,
        )
        .await
        .unwrap();
        let state = AppState::new(test_config(dir.path().to_path_buf()));

        let resp = foreign_or_static_host(&state, "static-host.example").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        // Second call must hit the cache rather than re-reading the directory.
        assert!(state.foreign_hosts.lookup("static-host.example").is_some());
    }

    #[tokio::test]
    async fn foreign_host_unknown_host_is_cached_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path().to_path_buf()));

        let _ = foreign_or_static_host(&state, "nowhere.example").await;
        let (info, _) = state.foreign_hosts.lookup("nowhere.example").unwrap();
        assert_eq!(info, ForeignHostInfo::Unknown);
    }

    #[test]
    fn null_origin_is_accepted() {
        let req = Request::builder()
            .header(header::ORIGIN, "null")
            .body(Body::empty())
            .unwrap();
        assert!(csrf_origin_is_acceptable(&req, "ui-abc.example.com"));
    }

    #[test]
    fn mismatched_origin_is_rejected() {
        let req = Request::builder()
            .header(header::ORIGIN, "https://evil.com")
            .body(Body::empty())
            .unwrap();
        assert!(!csrf_origin_is_acceptable(&req, "ui-abc.example.com"));
    }

    #[test]
    fn matching_origin_is_accepted() {
        let req = Request::builder()
            .header(header::ORIGIN, "https://ui-abc.example.com")
            .body(Body::empty())
            .unwrap();
        assert!(csrf_origin_is_acceptable(&req, "ui-abc.example.com"));
    }
}
