use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

pub const MAX_HEAD_SIZE: usize = 64 * 1024;
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed request line and header section of one client request.
///
/// Parsing is deliberately lenient: a short request line leaves fields empty,
/// and header lines without a `:` are dropped. Whether the request is usable
/// is decided by `destination()`.
pub struct RequestHead {
    pub request_line: String,
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: BTreeMap<String, String>,
}

/// Where the request wants to go. The port is kept as received so that a
/// nonsense port shows up verbatim in the audit log and fails at resolution.
pub struct Destination {
    pub host: String,
    pub port: String,
}

impl Destination {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reads from `stream` until the end of the header section (`\r\n\r\n`).
///
/// Returns `None` on timeout, EOF, read error, or when the head exceeds
/// `MAX_HEAD_SIZE`; such connections are closed without a log line. The
/// returned buffer may contain bytes past the blank line; `parse_head` stops
/// there.
pub async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0u8; 8192];
    while !contains_terminator(&head) {
        let n = match timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => return None,
        };
        head.extend_from_slice(&buf[..n]);
        if head.len() > MAX_HEAD_SIZE {
            return None;
        }
    }
    Some(head)
}

fn contains_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

pub fn parse_head(head: &[u8]) -> RequestHead {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split('\n');

    let request_line = lines
        .next()
        .unwrap_or("")
        .trim_end_matches('\r')
        .to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("").to_string();

    let mut headers = BTreeMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    RequestHead {
        request_line,
        method,
        target,
        version,
        headers,
    }
}

impl RequestHead {
    /// Destination host and port. For `CONNECT` the target is `host[:port]`
    /// with port defaulting to 443; otherwise the `host` header is used with
    /// port defaulting to 80. `None` when no host can be determined.
    pub fn destination(&self) -> Option<Destination> {
        let (raw, default_port) = if self.method == "CONNECT" {
            (self.target.as_str(), "443")
        } else {
            (
                self.headers.get("host").map(String::as_str).unwrap_or(""),
                "80",
            )
        };

        let (host, port) = match raw.split_once(':') {
            Some((host, port)) => (host, port),
            None => (raw, default_port),
        };
        if host.is_empty() {
            return None;
        }
        Some(Destination {
            host: host.to_string(),
            port: port.to_string(),
        })
    }
}

/// Rebuilds the head for the upstream hop: same request line, hop-by-hop
/// headers dropped, and the upstream connection marked close.
pub fn build_outbound_head(head: &RequestHead) -> String {
    let mut out = format!("{} {} {}\r\n", head.method, head.target, head.version);
    for (name, value) in &head.headers {
        if name == "connection" || name == "proxy-connection" {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out
}
