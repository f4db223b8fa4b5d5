//! Pending commit-reveal state.
//!
//! Every submitted commitment is held here until its reveal lands (or the
//! entry ages out). The store is the sole keeper of the salt — losing an
//! entry before reveal orphans the commitment on the ledger.

use crate::evidence::Evidence;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Everything needed to later reveal a commitment.
#[derive(Debug, Clone)]
pub struct ThreatCommitment {
    pub commitment_hash: [u8; 32],
    pub ip: String,
    /// keccak256 of the dotted-quad string, hex-encoded at reveal time.
    pub ip_hash: [u8; 32],
    /// Random per-commitment blinding value, hex-encoded.
    pub salt: String,
    pub reporter: String,
    pub commit_block: u64,
    /// Collected at detection time, disclosed only at reveal.
    pub evidence: Evidence,
    pub revealed: bool,
    pub created_at: Instant,
}

/// Keyed by commitment hash. Trait so tests can substitute a scripted
/// store; the in-memory one is the production default (the agent accepts
/// that a crash loses unrevealed salts).
#[async_trait]
pub trait CommitmentStore: Send + Sync {
    async fn insert(&self, commitment: ThreatCommitment) -> Result<()>;

    async fn get(&self, commitment_hash: &[u8; 32]) -> Result<Option<ThreatCommitment>>;

    /// Flag an entry as revealed. Unknown hashes are a no-op.
    async fn mark_revealed(&self, commitment_hash: &[u8; 32]) -> Result<()>;

    async fn remove(&self, commitment_hash: &[u8; 32]) -> Result<()>;

    /// All entries still awaiting reveal.
    async fn pending(&self) -> Result<Vec<ThreatCommitment>>;
}

/// HashMap-backed store with lazy TTL expiry: each insert sweeps entries
/// older than the configured horizon, so an idle agent holds at most one
/// stale generation.
pub struct InMemoryCommitmentStore {
    entries: Mutex<HashMap<[u8; 32], ThreatCommitment>>,
    ttl: Duration,
}

impl InMemoryCommitmentStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Drop entries past the TTL horizon. Unrevealed expiries are
    /// abandoned commitments and worth a warning.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        Self::sweep_locked(&mut entries, self.ttl)
    }

    fn sweep_locked(entries: &mut HashMap<[u8; 32], ThreatCommitment>, ttl: Duration) -> usize {
        let before = entries.len();
        entries.retain(|hash, c| {
            let live = c.created_at.elapsed() < ttl;
            if !live && !c.revealed {
                warn!(
                    ip = %c.ip,
                    commitment = %hex::encode(hash),
                    "expiring unrevealed commitment"
                );
            }
            live
        });
        before - entries.len()
    }
}

#[async_trait]
impl CommitmentStore for InMemoryCommitmentStore {
    async fn insert(&self, commitment: ThreatCommitment) -> Result<()> {
        let mut entries = self.entries.lock().await;
        Self::sweep_locked(&mut entries, self.ttl);
        entries.insert(commitment.commitment_hash, commitment);
        Ok(())
    }

    async fn get(&self, commitment_hash: &[u8; 32]) -> Result<Option<ThreatCommitment>> {
        Ok(self.entries.lock().await.get(commitment_hash).cloned())
    }

    async fn mark_revealed(&self, commitment_hash: &[u8; 32]) -> Result<()> {
        if let Some(c) = self.entries.lock().await.get_mut(commitment_hash) {
            c.revealed = true;
        }
        Ok(())
    }

    async fn remove(&self, commitment_hash: &[u8; 32]) -> Result<()> {
        self.entries.lock().await.remove(commitment_hash);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<ThreatCommitment>> {
        Ok(self
            .entries
            .lock()
            .await
            .values()
            .filter(|c| !c.revealed)
            .cloned()
            .collect())
    }
}
