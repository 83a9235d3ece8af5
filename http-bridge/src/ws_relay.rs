//! Raw WebSocket relay: accepts a connection carrying the client's original
//! upgrade request bytes (forwarded verbatim by `gateway`), performs the app
//! upgrade, echoes the app's response head back to the caller, then pumps
//! bytes. This keeps the handshake a single pass-through end to end — the
//! app computes `Sec-WebSocket-Accept` from the client's own
//! `Sec-WebSocket-Key`, and nothing in between re-derives it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{error, warn};

use crate::websocket::{self, WebSocketError};

pub async fn run(listener: UnixListener, app_addr: String) {
    loop {
        let (inbound, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "ws relay listener accept failed");
                return;
            }
        };
        let app_addr = app_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(inbound, &app_addr).await {
                warn!(error = %e, "websocket relay connection failed");
            }
        });
    }
}

async fn handle(
    mut inbound: tokio::net::UnixStream,
    app_addr: &str,
) -> Result<(), WebSocketError> {
    let (path, headers) = read_request_head(&mut inbound)
        .await
        .map_err(WebSocketError::HandshakeRead)?;

    let (app_stream, raw_response) =
        websocket::connect_and_upgrade_with_response(app_addr, &path, &headers).await?;

    inbound
        .write_all(&raw_response)
        .await
        .map_err(WebSocketError::HandshakeWrite)?;

    websocket::pump_unix(app_stream, inbound)
        .await
        .map_err(WebSocketError::HandshakeWrite)
}

async fn read_request_head(
    stream: &mut tokio::net::UnixStream,
) -> std::io::Result<(String, Vec<(String, String)>)> {
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
                "request head too large",
            ));
        }
    }

    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers_buf);
    request
        .parse(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let path = request.path.unwrap_or("/").to_string();
    let headers = request
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();
    Ok((path, headers))
}
