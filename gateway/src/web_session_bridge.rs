//! `WebSession` → HTTP translation (spec.md §4.4, second direction): builds
//! a `Context` from the inbound request, picks the RPC method, calls
//! through to the grain's `sandstorm-http-bridge`, and re-renders the
//! `WebSessionResponse` as an axum `Response`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use shared_types::http_table::{self, ContentBody, WebSessionResponse};
use shared_types::RpcClient;
use tokio::net::UnixStream;

use crate::error::Error;
use crate::security_headers::HostKind;
use crate::set_cookie;

/// Streaming cutover point for `post`/`put`/`patch` (spec.md §4.4 step 2).
const STREAMING_THRESHOLD_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WebSessionRequest {
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

/// Precondition union derived from `If-Match`/`If-None-Match` (spec.md §4.4
/// step 1), used to re-encode a `preconditionFailed` response as 304 vs 412.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    None,
    IfMatch,
    IfNoneMatch,
}

/// Holds the RPC connection to one grain's `sandstorm-http-bridge`, wrapped
/// so transient disconnects can be retried by reconnecting (the gateway's
/// analogue of spec.md §4.5's `CapRedirector`, minus the generation
/// bookkeeping since a session bridge owns exactly one grain connection).
pub struct WebSessionBridge {
    client: Arc<RpcClient>,
    host_kind: HostKind,
}

impl WebSessionBridge {
    /// Dials the grain's bridge socket directly. The socket path is
    /// deterministic from the data root and grain id (`supervisor::config`
    /// computes the same path when it forks `http-bridge`), so no RPC round
    /// trip through `backend` is needed once the grain is known to be
    /// running.
    pub async fn connect(
        grains_dir: &Path,
        grain_id: &str,
        host_kind: HostKind,
    ) -> Result<Self, Error> {
        let socket_path = grains_dir.join(grain_id).join("bridge.sock");
        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|_| Error::Disconnected)?;
        let (read_half, write_half) = stream.into_split();
        let client = RpcClient::new(read_half, write_half);
        Ok(Self { client, host_kind })
    }

    pub async fn handle(&self, req: Request<Body>, precondition: Precondition) -> Response {
        match self.handle_inner(req, precondition).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        }
    }

    async fn handle_inner(
        &self,
        req: Request<Body>,
        precondition: Precondition,
    ) -> Result<Response, Error> {
        let method = rpc_method_for(req.method().as_str(), &req)
            .ok_or_else(|| Error::InputInvalid(format!("unsupported method {}", req.method())))?;

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let headers = forwardable_headers(req.headers(), self.host_kind);

        let (_, body) = req.into_parts();
        let body_bytes = to_bytes(body, 64 * 1024 * 1024)
            .await
            .map_err(|e| Error::InputInvalid(e.to_string()))?;
        let body = if body_bytes.is_empty() {
            None
        } else {
            Some(body_bytes.to_vec())
        };

        let request = WebSessionRequest {
            path,
            headers,
            body,
        };
        let response: WebSessionResponse = self
            .client
            .call("WebSession", method, &request)
            .await
            .map_err(Error::from)?;

        Ok(self.translate(response, precondition))
    }

    /// spec.md §4.4 step 5: translate each `WebSessionResponse` kind into
    /// an HTTP response, then apply step 6's security headers.
    fn translate(&self, response: WebSessionResponse, precondition: Precondition) -> Response {
        let built = match response {
            WebSessionResponse::Content {
                status_code,
                mime_type,
                e_tag,
                additional_headers,
                body,
                disposition,
            } => {
                let (status, _) = status_code.http_status();
                let mut resp = axum::response::Response::builder().status(status);
                resp = resp.header(axum::http::header::CONTENT_TYPE, mime_type);
                if let Some(tag) = e_tag {
                    resp = resp.header(axum::http::header::ETAG, format!("\"{tag}\""));
                }
                if let Some(d) = disposition {
                    if let Some(name) = d.download {
                        resp = resp.header(
                            axum::http::header::CONTENT_DISPOSITION,
                            format!("attachment; filename=\"{name}\""),
                        );
                    }
                }
                for (k, v) in &additional_headers {
                    if is_app_whitelisted_header(k) {
                        if let (Ok(name), Ok(value)) = (
                            HeaderName::try_from(k.as_str()),
                            HeaderValue::from_str(v),
                        ) {
                            resp = resp.header(name, value);
                        }
                    }
                }
                let cookies: Vec<&(String, String)> = additional_headers
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
                    .collect();
                let body_bytes = match body {
                    ContentBody::Bytes(b) => b,
                    ContentBody::Stream(_) => Vec::new(),
                };
                let mut response = resp.body(Body::from(body_bytes)).unwrap_or_else(|_| {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                });
                if self.host_kind == HostKind::Ui {
                    for (_, raw) in cookies {
                        if let Some(sanitized) = set_cookie::sanitize(raw) {
                            if let Ok(value) = HeaderValue::from_str(&sanitized) {
                                response
                                    .headers_mut()
                                    .append(axum::http::header::SET_COOKIE, value);
                            }
                        }
                    }
                }
                response
            }
            WebSessionResponse::NoContent { should_reset_form } => {
                let status = http_table::no_content_status(should_reset_form);
                StatusCode::from_u16(status)
                    .unwrap_or(StatusCode::NO_CONTENT)
                    .into_response()
            }
            WebSessionResponse::PreconditionFailed { matching_e_tag } => {
                if precondition == Precondition::IfNoneMatch {
                    let mut resp = StatusCode::NOT_MODIFIED.into_response();
                    if let Some(tag) = matching_e_tag {
                        if let Ok(value) = HeaderValue::from_str(&format!("\"{tag}\"")) {
                            resp.headers_mut().insert(axum::http::header::ETAG, value);
                        }
                    }
                    resp
                } else {
                    StatusCode::PRECONDITION_FAILED.into_response()
                }
            }
            WebSessionResponse::Redirect {
                location,
                is_permanent,
                switch_to_get,
            } => {
                let status = http_table::redirect_status(is_permanent, switch_to_get);
                let mut resp = (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND),
                    "redirecting",
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&location) {
                    resp.headers_mut().insert(axum::http::header::LOCATION, value);
                }
                resp
            }
            WebSessionResponse::ClientError {
                status_code,
                html_message,
                body_mime_type,
                body,
            } => {
                let (status, title) = status_code.http_status();
                let mime = body_mime_type.unwrap_or_else(|| "text/html".to_string());
                let body = body
                    .or_else(|| html_message.map(|h| h.into_bytes()))
                    .unwrap_or_else(|| title.as_bytes().to_vec());
                axum::response::Response::builder()
                    .status(status)
                    .header(axum::http::header::CONTENT_TYPE, mime)
                    .body(Body::from(body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            WebSessionResponse::ServerError { descriptive_html } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/html")],
                descriptive_html,
            )
                .into_response(),
        };
        built
    }
}

/// spec.md §4.4 step 2's method table, with the content-length threshold
/// choosing the streaming variant.
fn rpc_method_for(http_method: &str, req: &Request<Body>) -> Option<&'static str> {
    let content_length = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let streaming = content_length >= STREAMING_THRESHOLD_BYTES;

    Some(match http_method {
        "GET" => "get",
        "POST" if streaming => "postStreaming",
        "POST" => "post",
        "PUT" if streaming => "putStreaming",
        "PUT" => "put",
        "DELETE" => "delete",
        "PATCH" if streaming => "patchStreaming",
        "PATCH" => "patch",
        "COPY" => "copy",
        "MOVE" => "mv",
        "MKCOL" => "mkcol",
        "LOCK" => "lock",
        "UNLOCK" => "unlock",
        "PROPFIND" => "propfind",
        "PROPPATCH" => "proppatch",
        "ACL" => "acl",
        "REPORT" => "report",
        "OPTIONS" => "options",
        _ => return None,
    })
}

/// spec.md §4.4 step 1: cookies only forwarded on UI hosts; never forward
/// credentials the app shouldn't see (mirrors the teacher's
/// `sanitize_and_tag_proxy_request`, generalized to the RPC boundary).
fn forwardable_headers(headers: &HeaderMap, host_kind: HostKind) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str();
            if name.eq_ignore_ascii_case("cookie") && host_kind != HostKind::Ui {
                return None;
            }
            if name.eq_ignore_ascii_case("authorization") && host_kind == HostKind::Ui {
                return None;
            }
            let value = value.to_str().ok()?.to_string();
            Some((name.to_string(), value))
        })
        .collect()
}

fn is_app_whitelisted_header(name: &str) -> bool {
    const WHITELIST: &[&str] = &[
        "cache-control",
        "content-language",
        "content-disposition",
        "expires",
        "last-modified",
        "x-sandstorm-permissions",
    ];
    WHITELIST.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Parses the precondition headers into the union spec.md §4.4 step 1 names.
pub fn precondition_from_headers(headers: &HeaderMap) -> Precondition {
    if headers.contains_key(axum::http::header::IF_NONE_MATCH) {
        Precondition::IfNoneMatch
    } else if headers.contains_key(axum::http::header::IF_MATCH) {
        Precondition::IfMatch
    } else {
        Precondition::None
    }
}

/// Parses `name=value` pairs out of a raw `Cookie` header, per spec.md
/// §4.4 step 1 ("cookies are parsed into key/value pairs").
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let name = parts.next()?.trim();
            let value = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_cookies() {
        let parsed = parse_cookies("sandstorm-sid=S1; theme=dark");
        assert_eq!(parsed.get("sandstorm-sid").map(String::as_str), Some("S1"));
        assert_eq!(parsed.get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn streaming_cutover_at_64kib() {
        let mut req = Request::builder()
            .method("POST")
            .header(axum::http::header::CONTENT_LENGTH, 64 * 1024)
            .body(Body::empty())
            .unwrap();
        assert_eq!(rpc_method_for("POST", &req), Some("postStreaming"));
        *req.headers_mut() = HeaderMap::new();
        req.headers_mut()
            .insert(axum::http::header::CONTENT_LENGTH, HeaderValue::from_static("100"));
        assert_eq!(rpc_method_for("POST", &req), Some("post"));
    }

    #[test]
    fn dav_methods_map_to_rpc_names() {
        let req = Request::builder()
            .method("PROPFIND")
            .body(Body::empty())
            .unwrap();
        assert_eq!(rpc_method_for("PROPFIND", &req), Some("propfind"));
    }
}
