//! HTTP → `WebSession` translation (spec.md §4.4, first direction): the
//! bridge opens a TCP connection to the app's HTTP port per request,
//! writes a hand-built request line, and classifies the raw status line
//! through [`crate::status::classify`] into a `WebSessionResponse`.
//!
//! The real interface distinguishes buffered (`post`) from streaming
//! (`postStreaming`) uploads via a separate `RequestStream` capability
//! (spec.md §4.4's "Streaming upload request/response duality"). Since this
//! transport has no raw byte-stream capability, every streaming variant is
//! accepted as an alias of its buffered counterpart with the body already
//! materialised by the caller — recorded as a simplification in DESIGN.md.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::http_table::{ContentBody, Disposition, WebSessionResponse};
use shared_types::{RpcError, RpcTarget};

use crate::status::{classify, StatusClass};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSessionRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

pub struct HttpBridge {
    app_addr: String,
    request_timeout: Duration,
}

impl HttpBridge {
    pub fn new(app_addr: String, request_timeout: Duration) -> Self {
        Self {
            app_addr,
            request_timeout,
        }
    }

    fn http_method_for(method: &str) -> Option<&'static str> {
        Some(match method {
            "get" => "GET",
            "post" | "postStreaming" => "POST",
            "put" | "putStreaming" => "PUT",
            "delete" => "DELETE",
            "patch" | "patchStreaming" => "PATCH",
            "copy" => "COPY",
            "mv" => "MOVE",
            "mkcol" => "MKCOL",
            "lock" => "LOCK",
            "unlock" => "UNLOCK",
            "propfind" => "PROPFIND",
            "proppatch" => "PROPPATCH",
            "acl" => "ACL",
            "report" => "REPORT",
            "options" => "OPTIONS",
            _ => return None,
        })
    }

    fn send_request(
        &self,
        http_method: &str,
        req: &WebSessionRequest,
    ) -> std::io::Result<(u16, Vec<(String, String)>, Vec<u8>)> {
        let mut stream = TcpStream::connect(&self.app_addr)?;
        stream.set_read_timeout(Some(self.request_timeout))?;
        stream.set_write_timeout(Some(self.request_timeout))?;

        let body = req.body.as_deref().unwrap_or(&[]);
        let mut head = format!(
            "{http_method} {} HTTP/1.1\r\nConnection: close\r\nContent-Length: {}\r\n",
            req.path,
            body.len()
        );
        for (k, v) in &req.headers {
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        head.push_str("\r\n");

        stream.write_all(head.as_bytes())?;
        stream.write_all(body)?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        parse_http_response(&raw)
    }

    fn translate(
        &self,
        http_method: &str,
        req: &WebSessionRequest,
    ) -> Result<WebSessionResponse, RpcError> {
        let (status, headers, body) = self
            .send_request(http_method, req)
            .map_err(|e| RpcError::IoFatal(e.to_string()))?;

        let mime_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let e_tag = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("etag"))
            .map(|(_, v)| v.clone());
        let disposition: Option<Disposition> = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-disposition"))
            .and_then(|(_, v)| shared_types::http_table::parse_content_disposition(v));
        let location = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("location"))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        Ok(match classify(status) {
            StatusClass::Success(code) => WebSessionResponse::Content {
                status_code: code,
                mime_type,
                e_tag,
                additional_headers: headers,
                body: ContentBody::Bytes(body),
                disposition,
            },
            StatusClass::NoContent { should_reset_form } => {
                WebSessionResponse::NoContent { should_reset_form }
            }
            StatusClass::Redirect {
                is_permanent,
                switch_to_get,
            } => WebSessionResponse::Redirect {
                location,
                is_permanent,
                switch_to_get,
            },
            StatusClass::ClientError(code) => WebSessionResponse::ClientError {
                status_code: code,
                html_message: String::from_utf8(body.clone()).ok(),
                body_mime_type: Some(mime_type),
                body: Some(body),
            },
            StatusClass::ServerError => WebSessionResponse::ServerError {
                descriptive_html: String::from_utf8_lossy(&body).into_owned(),
            },
            StatusClass::Unmapped => WebSessionResponse::ServerError {
                descriptive_html: format!("app returned unrecognised status {status}"),
            },
        })
    }
}

fn parse_http_response(raw: &[u8]) -> std::io::Result<(u16, Vec<(String, String)>, Vec<u8>)> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers_buf);
    let parsed = response
        .parse(raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let header_len = match parsed {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated HTTP response from app",
            ))
        }
    };
    let status = response.code.unwrap_or(502);
    let headers = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();
    Ok((status, headers, raw[header_len..].to_vec()))
}

#[async_trait::async_trait]
impl RpcTarget for HttpBridge {
    async fn dispatch(
        &self,
        interface: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        if interface != "WebSession" {
            return Err(RpcError::Unimplemented);
        }
        let http_method =
            Self::http_method_for(method).ok_or(RpcError::Unimplemented)?;
        let req: WebSessionRequest =
            serde_json::from_value(params).map_err(|e| RpcError::InputInvalid(e.to_string()))?;

        // send_request performs blocking I/O; keep the async dispatch path
        // honest by running it on a blocking thread.
        let bridge_addr = self.app_addr.clone();
        let timeout = self.request_timeout;
        let http_method = http_method.to_string();
        let response = tokio::task::spawn_blocking(move || {
            let bridge = HttpBridge::new(bridge_addr, timeout);
            bridge.translate(&http_method, &req)
        })
        .await
        .map_err(|e| RpcError::IoFatal(e.to_string()))??;

        serde_json::to_value(response).map_err(|e| RpcError::InputInvalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nhello";
        let (status, headers, body) = parse_http_response(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"hello");
        assert!(headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v == "text/plain"));
    }

    #[test]
    fn method_mapping_covers_dav_verbs() {
        assert_eq!(HttpBridge::http_method_for("propfind"), Some("PROPFIND"));
        assert_eq!(HttpBridge::http_method_for("mv"), Some("MOVE"));
        assert_eq!(HttpBridge::http_method_for("bogus"), None);
    }
}
