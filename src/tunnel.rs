use crate::http::READ_TIMEOUT;
use socket2::SockRef;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

pub const SHUTTLE_BUF_SIZE: usize = 8192;
const PACE_RESET_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const LINGER: Duration = Duration::from_secs(1);

/// Paces one direction of a transfer to `limit` bytes per second.
/// A limit of zero disables pacing.
pub struct Pacer {
    limit: u64,
    sent: u64,
    window_start: Instant,
}

impl Pacer {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            sent: 0,
            window_start: Instant::now(),
        }
    }

    pub async fn pace(&mut self, bytes: usize) {
        if self.limit == 0 {
            return;
        }
        self.sent += bytes as u64;
        if let Some(delay) = pace_delay(self.sent, self.limit, self.window_start.elapsed()) {
            tokio::time::sleep(delay).await;
        }
        // Restart the accounting window periodically so an idle stretch does
        // not bank an unbounded burst allowance.
        if self.window_start.elapsed() >= PACE_RESET_INTERVAL {
            self.window_start = Instant::now();
            self.sent = 0;
        }
    }
}

fn pace_delay(sent: u64, limit: u64, elapsed: Duration) -> Option<Duration> {
    let expected_ms = (sent as f64 / limit as f64) * 1000.0;
    let elapsed_ms = elapsed.as_millis() as f64;
    if elapsed_ms < expected_ms {
        Some(Duration::from_millis((expected_ms - elapsed_ms) as u64))
    } else {
        None
    }
}

/// Shuttles bytes both ways between `client` and `server` until each
/// direction sees EOF or an error, then closes both sockets. Each direction
/// paces independently against the limit snapshot taken here.
pub async fn run_tunnel(client: TcpStream, server: TcpStream, limit: u64) {
    set_linger(&client);
    set_linger(&server);
    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();

    let up = tokio::spawn(shuttle(client_read, server_write, limit));
    let down = tokio::spawn(shuttle(server_read, client_write, limit));
    let _ = up.await;
    let _ = down.await;
}

/// One tunnel direction: read, write through, pace. Shuts down its write
/// half on exit so EOF propagates to the peer.
async fn shuttle(mut src: OwnedReadHalf, mut dst: OwnedWriteHalf, limit: u64) {
    let mut buf = [0u8; SHUTTLE_BUF_SIZE];
    let mut pacer = Pacer::new(limit);
    loop {
        let n = match timeout(READ_TIMEOUT, src.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => break,
        };
        if dst.write_all(&buf[..n]).await.is_err() {
            break;
        }
        pacer.pace(n).await;
    }
    let _ = dst.shutdown().await;
}

/// Flushes and closes a socket: linger on, FIN, then drain the inbound side
/// until the peer closes or the drain window expires.
pub async fn graceful_close(mut stream: TcpStream) {
    set_linger(&stream);
    let _ = stream.shutdown().await;

    let mut drain = [0u8; 1024];
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, stream.read(&mut drain)).await {
            Ok(Ok(n)) if n > 0 => continue,
            _ => break,
        }
    }
}

fn set_linger(stream: &TcpStream) {
    let _ = SockRef::from(stream).set_linger(Some(LINGER));
}
