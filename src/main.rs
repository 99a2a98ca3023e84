#![warn(clippy::all)]

mod admin;
mod audit;
mod context;
mod filter;
mod http;
mod metrics;
mod server;
mod tunnel;

use crate::admin::AdminServer;
use crate::audit::AuditLog;
use crate::context::ProxyContext;
use crate::filter::Filter;
use crate::metrics::Metrics;
use crate::server::ProxyServer;
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const PROXY_PORT: u16 = 8888;
const ADMIN_PORT: u16 = 8889;
const BLOCKLIST_PATH: &str = "config/blocked_domains.txt";
const AUDIT_LOG_PATH: &str = "logs/proxy.log";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .enable_all()
        .build()?;

    runtime.block_on(run())
}

async fn run() -> Result<()> {
    let filter = Arc::new(Filter::new());
    match filter.load(BLOCKLIST_PATH) {
        Ok(()) => info!(
            "loaded {} blocklist rules from {BLOCKLIST_PATH}",
            filter.rule_count()
        ),
        Err(e) => warn!("running without a blocklist: {e:#}"),
    }

    if let Some(dir) = Path::new(AUDIT_LOG_PATH).parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {:?}", dir))?;
    }
    let audit = Arc::new(AuditLog::open(AUDIT_LOG_PATH)?);

    let metrics = Arc::new(Metrics::new(metrics::WINDOW_SECONDS));
    metrics.start();

    let ctx = ProxyContext::new(filter, metrics, audit);

    let admin_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), ADMIN_PORT);
    let admin = AdminServer::bind(admin_addr, ctx.clone()).await?;
    tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            warn!("admin endpoint exited: {e:#}");
        }
    });

    let proxy_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PROXY_PORT);
    let server = ProxyServer::bind(proxy_addr, ctx)?;
    info!(
        "forwarding on port {PROXY_PORT}, admin on 127.0.0.1:{ADMIN_PORT}, {} workers",
        server::WORKER_POOL_SIZE
    );
    server.run().await
}
