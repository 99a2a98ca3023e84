use crate::audit::Action;
use crate::context::ProxyContext;
use crate::http::{self, Destination, RequestHead, READ_TIMEOUT};
use crate::tunnel::{self, Pacer};
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

pub const WORKER_POOL_SIZE: usize = 20;
const LISTEN_BACKLOG: i32 = 1024;

const RESPONSE_403: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nContent-Length: 9\r\nConnection: close\r\n\r\nForbidden";
const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// The proxy listener: accepts client connections and hands each one to a
/// fixed pool of workers over a FIFO queue.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: ProxyContext,
}

impl ProxyServer {
    pub fn bind(addr: SocketAddr, ctx: ProxyContext) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        match socket.bind(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                return Err(e).with_context(|| {
                    format!("port {} is already in use by another process", addr.port())
                });
            }
            Err(e) => return Err(e.into()),
        }
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into())?;
        Ok(Self { listener, ctx })
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections and enqueues them for the worker pool until the
    /// shared running flag is cleared. Accept errors are non-fatal.
    pub async fn run(self) -> Result<()> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<TcpStream>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut workers = Vec::with_capacity(WORKER_POOL_SIZE);
        for id in 0..WORKER_POOL_SIZE {
            let queue_rx = Arc::clone(&queue_rx);
            let ctx = self.ctx.clone();
            workers.push(tokio::spawn(worker_loop(id, queue_rx, ctx)));
        }

        info!("proxy listening on {}", self.listener.local_addr()?);
        while self.ctx.is_running() {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    if queue_tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("accept failed: {e}");
                    continue;
                }
            }
        }

        // Closing the queue wakes every idle worker and lets it exit.
        drop(queue_tx);
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

async fn worker_loop(
    id: usize,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<TcpStream>>>,
    ctx: ProxyContext,
) {
    loop {
        // Pop under the queue lock; the lock is released before handling.
        let stream = { queue_rx.lock().await.recv().await };
        match stream {
            Some(stream) => handle_client(stream, &ctx).await,
            None => break,
        }
    }
    debug!("worker {id} exited");
}

/// Serves one client connection end to end: parse, classify, then forward or
/// tunnel. Every parsed request produces exactly one audit line.
async fn handle_client(mut client: TcpStream, ctx: &ProxyContext) {
    let peer = client
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let head = match http::read_head(&mut client).await {
        Some(head) => head,
        // Framing failure before a complete head: close without a log line.
        None => return,
    };
    let req = http::parse_head(&head);

    let dest = match req.destination() {
        Some(dest) => dest,
        None => {
            ctx.log_request(&peer, "", &req.request_line, Action::Error, 400, 0);
            tunnel::graceful_close(client).await;
            return;
        }
    };
    let authority = dest.authority();

    ctx.metrics.record_request(&dest.host);

    if ctx.filter.is_blocked(&dest.host) {
        let _ = client.write_all(RESPONSE_403).await;
        ctx.log_request(&peer, &authority, &req.request_line, Action::Blocked, 403, 0);
        tunnel::graceful_close(client).await;
        return;
    }

    let upstream = match connect_upstream(&dest).await {
        Ok(upstream) => upstream,
        Err(e) => {
            debug!("upstream connect to {authority} failed: {e:#}");
            ctx.log_request(&peer, &authority, &req.request_line, Action::Error, 502, 0);
            tunnel::graceful_close(client).await;
            return;
        }
    };

    let limit = ctx.bandwidth_limit();
    if req.method == "CONNECT" {
        let handshake_sent = client.write_all(RESPONSE_200_CONNECT).await.is_ok();
        ctx.log_request(&peer, &authority, &req.request_line, Action::Forward, 200, 0);
        if handshake_sent {
            tunnel::run_tunnel(client, upstream, limit).await;
        } else {
            tunnel::graceful_close(upstream).await;
            tunnel::graceful_close(client).await;
        }
    } else {
        let mut upstream = upstream;
        let bytes = forward_request(&req, &mut client, &mut upstream, limit).await;
        ctx.log_request(
            &peer,
            &authority,
            &req.request_line,
            Action::Forward,
            200,
            bytes,
        );
        tunnel::graceful_close(upstream).await;
        tunnel::graceful_close(client).await;
    }
}

/// Resolves the destination (both address families) and connects to the
/// first address. Any failure here is reported as a 502 by the caller.
async fn connect_upstream(dest: &Destination) -> Result<TcpStream> {
    let port: u16 = dest
        .port
        .parse()
        .with_context(|| format!("invalid port {:?}", dest.port))?;
    let mut addrs = lookup_host((dest.host.as_str(), port))
        .await
        .with_context(|| format!("failed to resolve {}", dest.host))?;
    let addr = addrs.next().context("no addresses resolved")?;
    let stream = timeout(READ_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("connect timed out")??;
    Ok(stream)
}

/// Relays one plaintext request upstream and streams the response back to
/// the client, pacing against the bandwidth limit. Returns the number of
/// response bytes relayed.
async fn forward_request(
    req: &RequestHead,
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    limit: u64,
) -> u64 {
    let outbound = http::build_outbound_head(req);
    if upstream.write_all(outbound.as_bytes()).await.is_err() {
        return 0;
    }

    let mut buf = [0u8; tunnel::SHUTTLE_BUF_SIZE];
    let mut pacer = Pacer::new(limit);
    let mut total = 0u64;
    loop {
        let n = match timeout(READ_TIMEOUT, upstream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => break,
        };
        if client.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
        pacer.pace(n).await;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::filter::Filter;
    use crate::metrics::Metrics;
    use std::io::Write as _;
    use std::time::{Duration, Instant};
    use tempfile::NamedTempFile;
    use tokio::task::JoinHandle;

    fn test_context(blocklist: &str) -> (ProxyContext, NamedTempFile) {
        let filter = Arc::new(Filter::new());
        if !blocklist.is_empty() {
            let mut rules = NamedTempFile::new().unwrap();
            rules.write_all(blocklist.as_bytes()).unwrap();
            rules.flush().unwrap();
            filter.load(rules.path()).unwrap();
        }
        let audit_file = NamedTempFile::new().unwrap();
        let audit = Arc::new(AuditLog::open(audit_file.path()).unwrap());
        let metrics = Arc::new(Metrics::new(crate::metrics::WINDOW_SECONDS));
        (ProxyContext::new(filter, metrics, audit), audit_file)
    }

    async fn spawn_proxy(ctx: ProxyContext) -> SocketAddr {
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), ctx).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn send_and_collect(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        response
    }

    fn audit_contents(file: &NamedTempFile) -> String {
        std::fs::read_to_string(file.path()).unwrap()
    }

    async fn spawn_mock_upstream(
        response: &'static [u8],
    ) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response).await.unwrap();
            received
        });
        (addr, handle)
    }

    async fn spawn_echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(n) if n > 0 => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn blocked_host_gets_403_and_a_blocked_line() {
        let (ctx, audit_file) = test_context("*.badsite.com\n");
        let addr = spawn_proxy(ctx.clone()).await;

        let response = send_and_collect(
            addr,
            b"GET / HTTP/1.1\r\nHost: foo.badsite.com\r\n\r\n",
        )
        .await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(response.ends_with("Forbidden"));

        let log = audit_contents(&audit_file);
        assert!(log.contains("\"GET / HTTP/1.1\" foo.badsite.com:80 BLOCKED 403 0"));
        assert_eq!(ctx.metrics.get_rpm(), 1);
    }

    #[tokio::test]
    async fn forward_strips_hop_headers_and_relays_the_response() {
        let (ctx, audit_file) = test_context("");
        let addr = spawn_proxy(ctx).await;
        let (upstream_addr, upstream) =
            spawn_mock_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;

        let request = format!(
            "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: keep-alive\r\n\r\n",
            upstream_addr.port()
        );
        let response = send_and_collect(addr, request.as_bytes()).await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("hi"));

        let received = String::from_utf8_lossy(&upstream.await.unwrap()).to_string();
        assert!(received.starts_with("GET / HTTP/1.1\r\n"));
        assert!(received.contains("host: 127.0.0.1:"));
        assert!(!received.contains("keep-alive"));
        assert!(received.ends_with("Connection: close\r\n\r\n"));

        let log = audit_contents(&audit_file);
        assert!(log.contains(&format!(
            "\"GET / HTTP/1.1\" 127.0.0.1:{} FORWARD 200 ",
            upstream_addr.port()
        )));
        let bytes: u64 = log
            .split_whitespace()
            .last()
            .unwrap()
            .parse()
            .unwrap();
        assert!(bytes >= 40);
    }

    #[tokio::test]
    async fn connect_tunnels_bytes_both_ways() {
        let (ctx, audit_file) = test_context("");
        let addr = spawn_proxy(ctx).await;
        let upstream_addr = spawn_echo_upstream().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\n\r\n", upstream_addr.port());
        client.write_all(request.as_bytes()).await.unwrap();

        let mut handshake = [0u8; 39];
        client.read_exact(&mut handshake).await.unwrap();
        assert_eq!(&handshake[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let log = audit_contents(&audit_file);
        assert!(log.contains(&format!(
            "\"CONNECT 127.0.0.1:{0} HTTP/1.1\" 127.0.0.1:{0} FORWARD 200 0",
            upstream_addr.port()
        )));
    }

    #[tokio::test]
    async fn missing_host_yields_a_400_line_and_no_response() {
        let (ctx, audit_file) = test_context("");
        let addr = spawn_proxy(ctx).await;

        let response = send_and_collect(addr, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(response.is_empty());

        let log = audit_contents(&audit_file);
        assert!(log.contains("\"GET / HTTP/1.1\""));
        assert!(log.contains("ERROR 400 0"));
    }

    #[tokio::test]
    async fn unresolvable_host_yields_a_502_line_and_no_response() {
        let (ctx, audit_file) = test_context("");
        let addr = spawn_proxy(ctx).await;

        let response =
            send_and_collect(addr, b"GET / HTTP/1.1\r\nHost: nx.invalid\r\n\r\n").await;
        assert!(response.is_empty());

        let log = audit_contents(&audit_file);
        assert!(log.contains("nx.invalid:80 ERROR 502 0"));
    }

    #[tokio::test]
    async fn garbage_port_yields_a_502_line() {
        let (ctx, audit_file) = test_context("");
        let addr = spawn_proxy(ctx).await;

        let response =
            send_and_collect(addr, b"GET / HTTP/1.1\r\nHost: a.test:notaport\r\n\r\n").await;
        assert!(response.is_empty());

        let log = audit_contents(&audit_file);
        assert!(log.contains("a.test:notaport ERROR 502 0"));
    }

    #[tokio::test]
    async fn incomplete_head_closes_silently() {
        let (ctx, audit_file) = test_context("");
        let addr = spawn_proxy(ctx.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        assert!(audit_contents(&audit_file).is_empty());
        assert_eq!(ctx.metrics.get_rpm(), 0);
    }

    #[tokio::test]
    async fn forwarding_is_paced_by_the_bandwidth_limit() {
        let (ctx, _audit_file) = test_context("");
        ctx.set_bandwidth_limit(50_000);
        let addr = spawn_proxy(ctx).await;

        // 25 KiB at 50 kB/s should take roughly half a second.
        let body: &'static [u8] = Box::leak(vec![b'x'; 25_000].into_boxed_slice());
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 25000\r\n\r\n";
        let response: &'static [u8] =
            Box::leak([head.as_slice(), body].concat().into_boxed_slice());
        let (upstream_addr, _upstream) = spawn_mock_upstream(response).await;

        let request = format!(
            "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            upstream_addr.port()
        );
        let started = Instant::now();
        let collected = send_and_collect(addr, request.as_bytes()).await;
        let elapsed = started.elapsed();

        assert_eq!(collected.len(), response.len());
        assert!(elapsed >= Duration::from_millis(300), "finished in {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn pool_serves_concurrent_connections() {
        let (ctx, _audit_file) = test_context("*.badsite.com\n");
        let addr = spawn_proxy(ctx.clone()).await;

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(tokio::spawn(send_and_collect(
                addr,
                b"GET / HTTP/1.1\r\nHost: x.badsite.com\r\n\r\n",
            )));
        }
        for client in clients {
            let response = client.await.unwrap();
            assert!(response.starts_with(b"HTTP/1.1 403"));
        }
        assert_eq!(ctx.metrics.get_rpm(), 5);
    }
}
