//! WebSocket support for the HTTP → `WebSession` direction (spec.md §4.4):
//! "WebSockets are implemented by opening a plain TCP connection, writing a
//! hand-constructed upgrade request, parsing the response headers until the
//! blank line, and then shuttling bytes via a `WebSocketStream` capability
//! pair."

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("handshake write failed: {0}")]
    HandshakeWrite(std::io::Error),
    #[error("handshake read failed: {0}")]
    HandshakeRead(std::io::Error),
    #[error("app did not upgrade (status {0})")]
    NotUpgraded(u16),
}

/// Opens a connection to the app's HTTP port and performs the upgrade
/// handshake, returning the now-upgraded stream positioned right after the
/// blank line that ends the response headers.
pub async fn connect_and_upgrade(
    app_addr: &str,
    path: &str,
    request_headers: &[(String, String)],
) -> Result<TcpStream, WebSocketError> {
    let (stream, _raw_response) =
        connect_and_upgrade_with_response(app_addr, path, request_headers).await?;
    Ok(stream)
}

/// Same as [`connect_and_upgrade`], but also returns the app's raw response
/// head (status line + headers, including the blank line). The gateway-side
/// relay forwards these bytes verbatim to the original client so the
/// `Sec-WebSocket-Accept` the app computed from the client's own
/// `Sec-WebSocket-Key` reaches the party that needs to validate it, without
/// the bridge or gateway re-deriving it themselves.
pub async fn connect_and_upgrade_with_response(
    app_addr: &str,
    path: &str,
    request_headers: &[(String, String)],
) -> Result<(TcpStream, Vec<u8>), WebSocketError> {
    let mut stream = TcpStream::connect(app_addr)
        .await
        .map_err(WebSocketError::Connect)?;

    let mut head = format!("GET {path} HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n");
    for (k, v) in request_headers {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str("\r\n");
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(WebSocketError::HandshakeWrite)?;

    let (status, raw) = read_response_head(&mut stream).await?;
    if status != 101 {
        return Err(WebSocketError::NotUpgraded(status));
    }
    Ok((stream, raw))
}

async fn read_response_head(stream: &mut TcpStream) -> Result<(u16, Vec<u8>), WebSocketError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream
            .read_exact(&mut byte)
            .await
            .map_err(WebSocketError::HandshakeRead)?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(WebSocketError::NotUpgraded(0));
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let first_line = text.lines().next().unwrap_or("");
    let status = first_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or(WebSocketError::NotUpgraded(0))?;
    Ok((status, buf))
}

/// Bidirectionally shuttles bytes between the upgraded app connection and a
/// peer connection (the gateway-facing side), until either side closes.
pub async fn pump(app_stream: TcpStream, peer_stream: TcpStream) -> std::io::Result<()> {
    let (app_read, app_write) = app_stream.into_split();
    let (peer_read, peer_write) = peer_stream.into_split();
    pump_halves(app_read, app_write, peer_read, peer_write).await
}

/// Same as [`pump`], but the peer leg is a Unix-domain socket (the relay's
/// listener accepts connections from `gateway` over a named socket rather
/// than TCP).
pub async fn pump_unix(
    app_stream: TcpStream,
    peer_stream: tokio::net::UnixStream,
) -> std::io::Result<()> {
    let (app_read, app_write) = app_stream.into_split();
    let (peer_read, peer_write) = peer_stream.into_split();
    pump_halves(app_read, app_write, peer_read, peer_write).await
}

async fn pump_halves(
    mut app_read: impl tokio::io::AsyncRead + Unpin,
    mut app_write: impl tokio::io::AsyncWrite + Unpin,
    mut peer_read: impl tokio::io::AsyncRead + Unpin,
    mut peer_write: impl tokio::io::AsyncWrite + Unpin,
) -> std::io::Result<()> {
    let to_app = tokio::io::copy(&mut peer_read, &mut app_write);
    let to_peer = tokio::io::copy(&mut app_read, &mut peer_write);

    tokio::select! {
        r = to_app => { r?; }
        r = to_peer => { r?; }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn upgrade_succeeds_on_101_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n")
                .await
                .unwrap();
        });

        let result = connect_and_upgrade(&addr.to_string(), "/ws", &[]).await;
        server.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn upgrade_fails_on_non_101() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await.unwrap();
        });

        let result = connect_and_upgrade(&addr.to_string(), "/ws", &[]).await;
        server.await.unwrap();
        assert!(matches!(result, Err(WebSocketError::NotUpgraded(404))));
    }
}
