//! SMTP/SMTPS STARTTLS proxy (spec.md §4.3, §8 scenario 5): intercepts just
//! enough of the protocol to splice `STARTTLS` into the server's `EHLO`
//! reply, then hands the client connection off to TLS and raw-pumps both
//! directions. Any command other than `EHLO`/`STARTTLS` before the upgrade
//! falls back to a raw dual-direction pump with no inspection.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::tls::GatewayTlsManager;

pub async fn run(
    listener: TcpListener,
    upstream_addr: String,
    tls: std::sync::Arc<GatewayTlsManager>,
) {
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "smtp listener accept failed");
                return;
            }
        };
        let upstream_addr = upstream_addr.clone();
        let tls = std::sync::Arc::clone(&tls);
        tokio::spawn(async move {
            if let Err(e) = handle(client, &upstream_addr, tls).await {
                warn!(%peer, error = %e, "smtp proxy connection failed");
            }
        });
    }
}

async fn handle(
    client: TcpStream,
    upstream_addr: &str,
    tls: std::sync::Arc<GatewayTlsManager>,
) -> std::io::Result<()> {
    let upstream = TcpStream::connect(upstream_addr).await?;
    let mut upstream = BufReader::new(upstream);
    let mut client = BufReader::new(client);

    // Relay the server greeting untouched.
    let mut greeting = String::new();
    upstream.read_line(&mut greeting).await?;
    client.get_mut().write_all(greeting.as_bytes()).await?;

    let mut line = String::new();
    client.read_line(&mut line).await?;
    upstream.get_mut().write_all(line.as_bytes()).await?;

    if !line.to_ascii_uppercase().starts_with("EHLO") {
        // Not EHLO — stop inspecting, pump raw from here on.
        return pump(client.into_inner(), upstream.into_inner()).await;
    }

    // Read the (possibly multi-line) EHLO response, splicing STARTTLS into
    // the final line per spec.md §8 scenario 5.
    loop {
        let mut resp_line = String::new();
        let n = upstream.read_line(&mut resp_line).await?;
        if n == 0 {
            break;
        }
        let is_last = resp_line.as_bytes().get(3) == Some(&b' ');
        if is_last {
            let code = &resp_line[..3];
            client
                .get_mut()
                .write_all(format!("{code}-SIZE\r\n").as_bytes())
                .await?;
            client
                .get_mut()
                .write_all(format!("{code} STARTTLS\r\n").as_bytes())
                .await?;
            break;
        } else {
            client.get_mut().write_all(resp_line.as_bytes()).await?;
        }
    }

    let mut next_line = String::new();
    client.read_line(&mut next_line).await?;

    if !next_line.trim().eq_ignore_ascii_case("STARTTLS") {
        // Client chose not to upgrade — forward what it sent and raw-pump.
        upstream.get_mut().write_all(next_line.as_bytes()).await?;
        return pump(client.into_inner(), upstream.into_inner()).await;
    }

    client
        .get_mut()
        .write_all(b"220 Thank you for being secure\r\n")
        .await?;

    let acceptor: TlsAcceptor = tls.ready_acceptor().await;
    let tls_stream = acceptor.accept(client.into_inner()).await?;
    info!("smtp client upgraded to TLS");
    pump(tls_stream, upstream.into_inner()).await
}

async fn pump(
    mut a: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    mut b: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
) -> std::io::Result<()> {
    tokio::io::copy_bidirectional(&mut a, &mut b).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn splices_starttls_into_final_ehlo_line() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            sock.write_all(b"220 mail.example.com ESMTP\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("EHLO"));
            sock.write_all(b"250-mail.example.com\r\n250 SIZE 1000000\r\n")
                .await
                .unwrap();
        });

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let tls = GatewayTlsManager::new();
        let tls2 = std::sync::Arc::clone(&tls);
        let proxy = tokio::spawn(async move {
            let (client, _) = client_listener.accept().await.unwrap();
            let _ = handle(client, &upstream_addr, tls2).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220"));

        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let resp = String::from_utf8_lossy(&buf[..n]);
        assert!(resp.contains("250-SIZE"));
        assert!(resp.contains("250 STARTTLS"));

        server.await.unwrap();
        proxy.abort();
    }
}
