use crate::context::ProxyContext;
use crate::tunnel;
use anyhow::Result;
use serde_json::json;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

const MAX_REQUEST_SIZE: usize = 4096;
const TOP_DOMAINS: usize = 5;

/// Loopback control plane: serves live metrics and accepts bandwidth-cap
/// updates, one request per connection.
pub struct AdminServer {
    listener: TcpListener,
    ctx: ProxyContext,
}

impl AdminServer {
    pub async fn bind(addr: SocketAddr, ctx: ProxyContext) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("admin endpoint listening on {}", self.listener.local_addr()?);
        while self.ctx.is_running() {
            let (stream, _) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            handle_request(stream, &self.ctx).await;
        }
        Ok(())
    }
}

async fn handle_request(mut stream: TcpStream, ctx: &ProxyContext) {
    let mut buf = [0u8; MAX_REQUEST_SIZE];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => {
            tunnel::graceful_close(stream).await;
            return;
        }
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let mut body = String::new();
    let mut content_type = "text/plain";
    if request.contains("GET /metrics") {
        body = json!({
            "rpm": ctx.metrics.get_rpm(),
            "limit": ctx.bandwidth_limit(),
            "top": ctx.metrics.get_top_k(TOP_DOMAINS),
        })
        .to_string();
        content_type = "application/json";
    } else if let Some(bytes_per_sec) = parse_speed(&request) {
        ctx.set_bandwidth_limit(bytes_per_sec);
        info!("bandwidth limit set to {bytes_per_sec} B/s");
        body = format!("SUCCESS: Speed updated to {bytes_per_sec} B/s\r\n");
    }

    // Unrecognized requests get no body at all, just the close.
    if !body.is_empty() {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            content_type,
            body.len(),
            body,
        );
        let _ = stream.write_all(response.as_bytes()).await;
    }
    tunnel::graceful_close(stream).await;
}

/// Extracts the decimal value following the first `speed=` in the raw
/// request, from any verb or path. Empty or non-numeric values are ignored.
fn parse_speed(request: &str) -> Option<u64> {
    let rest = &request[request.find("speed=")? + "speed=".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
