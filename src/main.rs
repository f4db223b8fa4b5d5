//! vigild — node-local threat-response agent.
//!
//! Reads detection reports as JSON lines on stdin, blocks attackers at
//! the kernel immediately, and reports them to the coordination ledger
//! through an optimistic commit-reveal workflow.

mod codec;
mod commitments;
mod config;
mod defense;
mod error;
mod evidence;
mod firewall;
mod ledger;
mod registry;
mod sync;
mod types;

use crate::commitments::{CommitmentStore, InMemoryCommitmentStore};
use crate::config::Config;
use crate::defense::DefenseProtocol;
use crate::firewall::{IpsetBackend, KernelBlocklist};
use crate::ledger::{BlockWatcher, JsonRpcLedger, Ledger};
use crate::sync::GlobalSyncListener;
use crate::types::DetectionReport;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env().context("invalid configuration")?;
    info!(
        ledger = %cfg.ledger_rpc_url,
        chain_id = cfg.chain_id,
        registry = %cfg.registry_address,
        "starting vigil agent"
    );

    let ledger: Arc<dyn Ledger> = Arc::new(JsonRpcLedger::new(
        &cfg.ledger_rpc_url,
        &cfg.reporter_address,
    ));

    // Kernel blocklist comes up first; without it nothing else matters.
    let blocklist = Arc::new(KernelBlocklist::new(IpsetBackend::new(
        &cfg.blocklist_set_name,
    )));
    blocklist.initialize().await?;
    info!(
        set = %cfg.blocklist_set_name,
        entries = blocklist.count().await.unwrap_or(0),
        "kernel blocklist ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = BlockWatcher::start(
        ledger.clone(),
        Duration::from_secs(cfg.block_poll_interval_secs),
        shutdown_rx,
    );

    let store: Arc<dyn CommitmentStore> = Arc::new(InMemoryCommitmentStore::new(
        Duration::from_secs(cfg.commitment_ttl_secs),
    ));

    let protocol = Arc::new(DefenseProtocol::new(
        cfg.clone(),
        ledger.clone(),
        blocklist.clone(),
        store,
        watcher.subscribe(),
    ));

    let listener = GlobalSyncListener::new(
        ledger,
        blocklist,
        &cfg.registry_address,
        &cfg.coordination_fallback_address,
        Duration::from_secs(cfg.event_poll_interval_secs),
    );
    listener.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<DetectionReport>(line) {
                        Ok(report) => {
                            if let Err(e) = protocol.handle_attack(&report).await {
                                if e.is_fatal() {
                                    error!("{e}");
                                } else {
                                    warn!("{e}");
                                }
                            }
                        }
                        Err(e) => warn!("unparseable detection report: {e}"),
                    }
                }
                Ok(None) => {
                    info!("detection feed closed");
                    break;
                }
                Err(e) => {
                    warn!("detection feed read failed: {e}");
                    break;
                }
            }
        }
    }

    // Teardown cancels the subscriptions and the height watcher only.
    // Kernel bans persist past agent shutdown on purpose.
    listener.stop();
    let _ = shutdown_tx.send(true);
    watcher.abort();
    info!("vigil agent stopped");
    Ok(())
}
