use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub const WINDOW_SECONDS: usize = 60;

/// Sliding-window request counter plus lifetime per-domain totals.
///
/// The ring holds one counter per second of the window. A background rotator
/// advances `current_slot` once a second, zeroing the slot it moves into, so
/// the sum of all slots approximates the request count over the most recent
/// window. Writers read the slot index and increment without synchronizing
/// against rotation; an event landing in an adjacent second is accepted.
pub struct Metrics {
    inner: Arc<Inner>,
}

struct Inner {
    slots: Vec<AtomicU64>,
    current_slot: AtomicUsize,
    running: AtomicBool,
    rotator: Mutex<Option<JoinHandle<()>>>,
    domains: Mutex<DomainCounts>,
}

#[derive(Default)]
struct DomainCounts {
    counts: HashMap<String, u64>,
    // First-seen order, used as the deterministic tie-break in get_top_k.
    order: Vec<String>,
}

impl Metrics {
    pub fn new(window_seconds: usize) -> Self {
        assert!(window_seconds > 0);
        Self {
            inner: Arc::new(Inner {
                slots: (0..window_seconds).map(|_| AtomicU64::new(0)).collect(),
                current_slot: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                rotator: Mutex::new(None),
                domains: Mutex::new(DomainCounts::default()),
            }),
        }
    }

    /// Spawns the slot rotator. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            while inner.running.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if !inner.running.load(Ordering::Relaxed) {
                    break;
                }
                inner.rotate();
            }
            debug!("metrics rotator exiting");
        });
        *self.inner.rotator.lock() = Some(handle);
    }

    /// Stops and joins the rotator. Idempotent.
    #[allow(dead_code)]
    pub async fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let handle = self.inner.rotator.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn record_request(&self, domain: &str) {
        let domain = if domain.is_empty() {
            "unknown".to_string()
        } else {
            domain.to_ascii_lowercase()
        };

        let slot = self.inner.current_slot.load(Ordering::Relaxed);
        self.inner.slots[slot].fetch_add(1, Ordering::Relaxed);

        let mut domains = self.inner.domains.lock();
        match domains.counts.get_mut(&domain) {
            Some(count) => *count += 1,
            None => {
                domains.counts.insert(domain.clone(), 1);
                domains.order.push(domain);
            }
        }
    }

    /// Request count across the window. May trail real time by up to a second.
    pub fn get_rpm(&self) -> u64 {
        self.inner
            .slots
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .sum()
    }

    /// The `k` most-requested domains, descending by count. Ties keep
    /// first-seen order.
    pub fn get_top_k(&self, k: usize) -> Vec<(String, u64)> {
        let mut snapshot: Vec<(String, u64)> = {
            let domains = self.inner.domains.lock();
            domains
                .order
                .iter()
                .map(|d| (d.clone(), domains.counts[d]))
                .collect()
        };
        snapshot.sort_by(|a, b| b.1.cmp(&a.1));
        snapshot.truncate(k);
        snapshot
    }
}

impl Inner {
    fn rotate(&self) {
        let next = (self.current_slot.load(Ordering::Relaxed) + 1) % self.slots.len();
        self.slots[next].store(0, Ordering::Relaxed);
        self.current_slot.store(next, Ordering::Relaxed);
    }
}
