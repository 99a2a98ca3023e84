use crate::audit::{Action, AuditLog};
use crate::filter::Filter;
use crate::metrics::Metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared state handed to every listener, worker, and admin task.
#[derive(Clone)]
pub struct ProxyContext {
    pub filter: Arc<Filter>,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<AuditLog>,
    max_bytes_per_sec: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl ProxyContext {
    pub fn new(filter: Arc<Filter>, metrics: Arc<Metrics>, audit: Arc<AuditLog>) -> Self {
        Self {
            filter,
            metrics,
            audit,
            max_bytes_per_sec: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Global bandwidth cap in bytes per second; zero means unlimited.
    pub fn bandwidth_limit(&self) -> u64 {
        self.max_bytes_per_sec.load(Ordering::Relaxed)
    }

    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.max_bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Records one request outcome in the audit file and mirrors it to the
    /// console log.
    pub fn log_request(
        &self,
        client: &str,
        hostport: &str,
        request_line: &str,
        action: Action,
        status: u16,
        bytes: u64,
    ) {
        self.audit
            .log(client, request_line, hostport, action, status, bytes);
        info!("{client} -> {hostport} \"{request_line}\" {action} {status} bytes={bytes}");
    }
}
