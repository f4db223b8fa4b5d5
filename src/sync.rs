//! Network-outcome reconciliation.
//!
//! Polls the coordination contract's logs and folds network-wide outcomes
//! back into the kernel blocklist: a globally confirmed threat becomes a
//! permanent entry, a whitelist grant removes the entry. Everything else
//! is informational.

use crate::codec::{self, ParamType};
use crate::firewall::{BlocklistBackend, KernelBlocklist};
use crate::ledger::Ledger;
use crate::registry::RegistryResolver;
use crate::types::{Origin, RawLog};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Topic-0 hashes of the coordination contract's events. All parameters
/// are carried non-indexed in the log data.
pub mod event_topics {
    use crate::codec::keccak256;

    pub const LOCAL_DEFENSE_ACTIVE: &str = "LocalDefenseActive(string,address)";
    pub const GLOBAL_THREAT_CONFIRMED: &str = "GlobalThreatConfirmed(string,string)";
    pub const THREAT_REPORT_REVOKED: &str = "ThreatReportRevoked(string,address)";
    pub const WHITELIST_UPDATED: &str = "WhitelistUpdated(string,bool)";

    pub fn topic(signature: &str) -> String {
        format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
    }
}

struct Inner<B: BlocklistBackend + 'static> {
    ledger: Arc<dyn Ledger>,
    registry: RegistryResolver,
    fallback_address: String,
    blocklist: Arc<KernelBlocklist<B>>,
}

impl<B: BlocklistBackend + 'static> Inner<B> {
    async fn coordination_address(&self) -> String {
        match self.registry.resolve(crate::defense::COORDINATION_NAME).await {
            Some(addr) => addr,
            None => self.fallback_address.clone(),
        }
    }

    /// Fold one observed event into local state. Unknown topics and
    /// undecodable payloads are skipped, never fatal to the poll loop.
    async fn apply(&self, log: &RawLog) {
        let Some(topic0) = log.topics.first() else {
            return;
        };
        let result = if *topic0 == event_topics::topic(event_topics::GLOBAL_THREAT_CONFIRMED) {
            self.on_global_confirmed(log).await
        } else if *topic0 == event_topics::topic(event_topics::WHITELIST_UPDATED) {
            self.on_whitelist_updated(log).await
        } else if *topic0 == event_topics::topic(event_topics::THREAT_REPORT_REVOKED) {
            self.on_report_revoked(log)
        } else if *topic0 == event_topics::topic(event_topics::LOCAL_DEFENSE_ACTIVE) {
            self.on_local_defense(log)
        } else {
            debug!(topic = %topic0, "ignoring unknown event topic");
            Ok(())
        };
        if let Err(e) = result {
            warn!(
                tx = %log.transaction_hash,
                "failed to apply ledger event: {e:#}"
            );
        }
    }

    async fn on_global_confirmed(&self, log: &RawLog) -> Result<()> {
        let values = decode_event_data(log, &[ParamType::Str, ParamType::Str])?;
        let ip = values[0].as_str();
        let reason = values[1].as_str();
        info!(ip = %ip, reason = %reason, "global confirmation observed, promoting to permanent ban");
        self.blocklist
            .add_or_refresh(ip, 0, Origin::Global)
            .await
            .with_context(|| format!("failed to promote {ip}"))
    }

    async fn on_whitelist_updated(&self, log: &RawLog) -> Result<()> {
        let values = decode_event_data(log, &[ParamType::Str, ParamType::Bool])?;
        let ip = values[0].as_str();
        if values[1].as_bool() {
            info!(ip = %ip, "whitelist grant observed, removing kernel entry");
            self.blocklist
                .remove(ip)
                .await
                .with_context(|| format!("failed to unblock {ip}"))
        } else {
            debug!(ip = %ip, "whitelist revocation observed, no local action");
            Ok(())
        }
    }

    fn on_report_revoked(&self, log: &RawLog) -> Result<()> {
        let values = decode_event_data(log, &[ParamType::Str, ParamType::Address])?;
        // Revocation corrects ledger state; kernel unblocking stays a
        // deliberate operator action.
        info!(ip = %values[0].as_str(), reporter = %values[1].as_address(), "threat report revoked");
        Ok(())
    }

    fn on_local_defense(&self, log: &RawLog) -> Result<()> {
        let values = decode_event_data(log, &[ParamType::Str, ParamType::Address])?;
        debug!(
            ip = %values[0].as_str(),
            reporter = %values[1].as_address(),
            "peer local defense observed"
        );
        Ok(())
    }
}

fn decode_event_data(log: &RawLog, schema: &[ParamType]) -> Result<Vec<codec::Value>> {
    let raw = hex::decode(log.data.trim_start_matches("0x"))
        .context("event data is not valid hex")?;
    codec::decode_return(schema, &raw)
}

/// Polls coordination-contract logs and reconciles the kernel blocklist.
/// `start`/`stop` are explicit and idempotent.
pub struct GlobalSyncListener<B: BlocklistBackend + 'static> {
    inner: Arc<Inner<B>>,
    poll_interval: Duration,
    task: std::sync::Mutex<Option<(watch::Sender<bool>, tokio::task::JoinHandle<()>)>>,
}

impl<B: BlocklistBackend + 'static> GlobalSyncListener<B> {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        blocklist: Arc<KernelBlocklist<B>>,
        registry_address: &str,
        fallback_address: &str,
        poll_interval: Duration,
    ) -> Self {
        let registry = RegistryResolver::new(ledger.clone(), registry_address);
        Self {
            inner: Arc::new(Inner {
                ledger,
                registry,
                fallback_address: fallback_address.to_string(),
                blocklist,
            }),
            poll_interval,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Begin polling. A second call while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            debug!("sync listener already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            let mut last_seen = inner.ledger.block_number().await.unwrap_or(0);
            info!(from_block = last_seen, "global sync listener started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let height = match inner.ledger.block_number().await {
                            Ok(h) => h,
                            Err(e) => {
                                warn!("height poll failed: {e:#}");
                                continue;
                            }
                        };
                        if height <= last_seen {
                            continue;
                        }
                        let address = inner.coordination_address().await;
                        match inner.ledger.get_logs(&address, last_seen + 1, height).await {
                            Ok(logs) => {
                                for log in &logs {
                                    inner.apply(log).await;
                                }
                                last_seen = height;
                            }
                            // Leave last_seen so the range is re-fetched.
                            Err(e) => warn!("log fetch failed: {e:#}"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("global sync listener stopping");
                            break;
                        }
                    }
                }
            }
        });
        *task = Some((shutdown_tx, handle));
    }

    /// Cancel the poll loop. A second call after stopping is a no-op.
    pub fn stop(&self) {
        if let Some((shutdown_tx, handle)) = self.task.lock().unwrap().take() {
            let _ = shutdown_tx.send(true);
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }
}

impl<B: BlocklistBackend + 'static> Drop for GlobalSyncListener<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
