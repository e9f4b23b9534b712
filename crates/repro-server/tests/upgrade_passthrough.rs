use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{HeaderName, HeaderValue};
use axum::Router;
use repro_core::config::ProxyConfig;
use repro_core::run::{public_label, BackendConvention};
use repro_core::shortid::ShortIdCodec;
use repro_server::proxy::external::ExternalProxy;
use repro_server::proxy::sidecar::SidecarProxy;
use repro_server::proxy::{client_builder, Forwarder};
use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const TRUST: &str = "x-reproserver-authenticate";

/// Accepts one connection, hands back the request head, answers 101 and
/// echoes everything after that.
async fn echo_backend() -> anyhow::Result<(SocketAddr, oneshot::Receiver<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        let Ok(head) = read_head(&mut sock).await else {
            return;
        };
        let _ = tx.send(head);
        let switch = b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n";
        if sock.write_all(switch).await.is_err() {
            return;
        }
        let mut buf = [0u8; 1024];
        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sock.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    Ok((addr, rx))
}

async fn read_head(sock: &mut TcpStream) -> anyhow::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if sock.read(&mut byte).await? == 0 {
            anyhow::bail!("connection closed inside head");
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).to_ascii_lowercase())
}

async fn serve(router: Router) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(addr)
}

/// Sends an upgrade request through `proxy` and returns the response head
/// with the still-open connection.
async fn open_tunnel(
    proxy: SocketAddr,
    host: &str,
    extra_headers: &str,
) -> anyhow::Result<(String, TcpStream)> {
    let mut sock = TcpStream::connect(proxy).await?;
    let req = format!(
        "GET /socket HTTP/1.1\r\nhost: {host}\r\nconnection: Upgrade\r\nupgrade: websocket\r\n{extra_headers}\r\n"
    );
    sock.write_all(req.as_bytes()).await?;
    let head = read_head(&mut sock).await?;
    Ok((head, sock))
}

async fn echo(sock: &mut TcpStream, msg: &[u8]) -> anyhow::Result<Vec<u8>> {
    sock.write_all(msg).await?;
    let mut back = vec![0u8; msg.len()];
    sock.read_exact(&mut back).await?;
    Ok(back)
}

#[tokio::test]
async fn test_public_proxy_tunnels_upgrades_with_trust_header() -> anyhow::Result<()> {
    let (backend, head_rx) = echo_backend().await?;
    let codec = Arc::new(ShortIdCodec::new(b"proxy-test-salt", ["run"])?);
    let client = client_builder(&ProxyConfig::default())
        .resolve("run-42", backend)
        .build()?;
    let router = ExternalProxy::new(
        codec.clone(),
        BackendConvention {
            prefix: "run-".into(),
            domain: None,
            sidecar_port: None,
        },
        HeaderName::from_static(TRUST),
        HeaderValue::from_static("secret-token"),
        Forwarder::new(client, 1 << 20, Duration::from_secs(5)),
    )
    .router();
    let proxy = serve(router).await?;

    let host = format!("{}.run.example.org", public_label(&codec, 42, backend.port())?);
    let forged = format!("{TRUST}: forged-by-client\r\n");
    let (head, mut sock) = tokio::time::timeout(
        Duration::from_secs(10),
        open_tunnel(proxy, &host, &forged),
    )
    .await??;
    assert!(head.starts_with("http/1.1 101"), "{head}");
    assert!(head.contains("upgrade: websocket"), "{head}");

    let seen = head_rx.await?;
    assert!(seen.starts_with("get /socket http/1.1"), "{seen}");
    assert!(seen.contains(&format!("host: run-42:{}\r\n", backend.port())), "{seen}");
    assert!(seen.contains("connection: upgrade\r\n"), "{seen}");
    assert!(seen.contains("upgrade: websocket\r\n"), "{seen}");
    assert!(seen.contains(&format!("{TRUST}: secret-token\r\n")), "{seen}");
    assert!(!seen.contains("forged-by-client"), "{seen}");

    let back = tokio::time::timeout(Duration::from_secs(10), echo(&mut sock, b"ping")).await??;
    assert_eq!(back, b"ping");
    let back = tokio::time::timeout(Duration::from_secs(10), echo(&mut sock, b"second frame")).await??;
    assert_eq!(back, b"second frame");
    Ok(())
}

#[tokio::test]
async fn test_sidecar_tunnels_upgrades_without_trust_header() -> anyhow::Result<()> {
    let (backend, head_rx) = echo_backend().await?;
    let client = client_builder(&ProxyConfig::default()).build()?;
    let router = SidecarProxy::new(
        HeaderName::from_static(TRUST),
        SecretString::from("secret-token".to_string()),
        Forwarder::new(client, 1 << 20, Duration::from_secs(5)),
    )
    .router();
    let sidecar = serve(router).await?;

    let host = format!("run-42:{}", backend.port());
    let token = format!("{TRUST}: secret-token\r\n");
    let (head, mut sock) = tokio::time::timeout(
        Duration::from_secs(10),
        open_tunnel(sidecar, &host, &token),
    )
    .await??;
    assert!(head.starts_with("http/1.1 101"), "{head}");

    let seen = head_rx.await?;
    assert!(seen.contains("upgrade: websocket\r\n"), "{seen}");
    assert!(!seen.contains(TRUST), "{seen}");

    let back = tokio::time::timeout(Duration::from_secs(10), echo(&mut sock, b"ping")).await??;
    assert_eq!(back, b"ping");
    Ok(())
}

#[tokio::test]
async fn test_sidecar_refuses_unauthenticated_upgrade() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let backend = listener.local_addr()?;
    let client = client_builder(&ProxyConfig::default()).build()?;
    let router = SidecarProxy::new(
        HeaderName::from_static(TRUST),
        SecretString::from("secret-token".to_string()),
        Forwarder::new(client, 1 << 20, Duration::from_secs(5)),
    )
    .router();
    let sidecar = serve(router).await?;

    let host = format!("run-42:{}", backend.port());
    let (head, _sock) = tokio::time::timeout(
        Duration::from_secs(10),
        open_tunnel(sidecar, &host, ""),
    )
    .await??;
    assert!(head.starts_with("http/1.1 403"), "{head}");
    let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "backend was contacted");
    Ok(())
}
