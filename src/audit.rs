use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Outcome of a proxied request, as recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    Blocked,
    Error,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Forward => "FORWARD",
            Action::Blocked => "BLOCKED",
            Action::Error => "ERROR",
        })
    }
}

/// Append-only request audit log.
///
/// One line per request:
/// `TIMESTAMP CLIENT "REQLINE" HOSTPORT ACTION STATUS BYTES`
/// with the timestamp in UTC as `YYYY-MM-DDTHH:MM:SSZ`.
pub struct AuditLog {
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open audit log {:?}", path))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one record and flushes. Write failures are swallowed so a full
    /// disk cannot take down request handling.
    pub fn log(
        &self,
        client: &str,
        request_line: &str,
        hostport: &str,
        action: Action,
        status: u16,
        bytes: u64,
    ) {
        let line = format!(
            "{} {} \"{}\" {} {} {} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            client,
            request_line,
            hostport,
            action,
            status,
            bytes,
        );
        let mut file = self.file.lock();
        let _ = file.write_all(line.as_bytes());
        let _ = file.flush();
    }
}
