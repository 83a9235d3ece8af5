//! Raw WebSocket relay, gateway side. The client's original upgrade
//! request travels verbatim to the grain's dedicated relay socket
//! (`SANDSTORM_BRIDGE_WS_SOCKET_PATH` on the bridge side), and the app's
//! response and subsequent bytes travel back untouched — this mirrors
//! `http-bridge::ws_relay`'s server half so neither hop re-derives
//! `Sec-WebSocket-Accept`. DESIGN.md records why this does not reuse the
//! teacher's `tokio-tungstenite`-based `proxy_ws`: that path terminates and
//! re-frames the connection as a fresh WS client, which would silently
//! drop any extension or subprotocol negotiation the app expects to see
//! echoed in its own handshake.

use std::path::Path;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{error, warn};

pub async fn proxy(grains_dir: &Path, grain_id: &str, mut req: Request) -> AxumResponse {
    let socket_path = grains_dir.join(grain_id).join("bridge-ws.sock");

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let mut head = format!("GET {path} HTTP/1.1\r\n");
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{name}: {v}\r\n"));
        }
    }
    head.push_str("\r\n");

    let mut outbound = match UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            error!(socket_path = %socket_path.display(), "ws relay socket unreachable: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if let Err(e) = outbound.write_all(head.as_bytes()).await {
        error!("ws relay write failed: {e}");
        return StatusCode::BAD_GATEWAY.into_response();
    }

    let (status, raw_response) = match read_response_head(&mut outbound).await {
        Ok(r) => r,
        Err(e) => {
            error!("ws relay response read failed: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if status != 101 {
        return StatusCode::BAD_GATEWAY.into_response();
    }

    let response = match build_response_from_raw(&raw_response) {
        Some(r) => r,
        None => return StatusCode::BAD_GATEWAY.into_response(),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut outbound).await
                {
                    warn!(error = %e, "ws relay pump ended with error");
                }
            }
            Err(e) => warn!(error = %e, "client did not complete the WS upgrade"),
        }
    });

    response
}

async fn read_response_head(stream: &mut UnixStream) -> std::io::Result<(u16, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers_buf);
    response
        .parse(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let status = response.code.unwrap_or(0);
    Ok((status, buf))
}

fn build_response_from_raw(raw: &[u8]) -> Option<Response<Body>> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers_buf);
    parsed.parse(raw).ok()?;

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for header in parsed.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_bytes(header.value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::empty()).ok()
}
