//! Kernel-level blocklist adapter.
//!
//! One `ipset` hash set plus a single iptables rule referencing it gives
//! O(1) match cost on inbound packets no matter how many addresses are
//! banned. Batched changes go through `ipset restore` in one kernel
//! submission instead of N `exec` round trips.
//!
//! The kernel is the source of truth for membership and TTL. The adapter
//! additionally remembers each entry's origin (local temp ban vs.
//! network-confirmed permanent ban) so a racing temp refresh can never
//! silently downgrade a permanent entry.

use crate::types::Origin;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// One change in a batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert, or refresh the TTL of an existing entry. `ttl_secs == 0`
    /// means permanent.
    Add { ip: String, ttl_secs: u64 },
    Del { ip: String },
}

/// The kernel interface, chosen once at startup. The real backend shells
/// out to `ipset`/`iptables`; tests use the in-memory one.
#[async_trait]
pub trait BlocklistBackend: Send + Sync {
    /// Idempotently ensure the hash set exists and exactly one inbound
    /// packet-filter rule references it. Privilege failures must error.
    async fn initialize(&self) -> Result<()>;

    /// Apply a batch of changes in a single kernel submission.
    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<()>;

    async fn contains(&self, ip: &str) -> Result<bool>;

    async fn count(&self) -> Result<usize>;

    /// Every blocked address. Potentially large; not O(1).
    async fn list_all(&self) -> Result<Vec<String>>;
}

/// Shell-out backend driving `ipset` and `iptables`. Requires elevated
/// rights on the host.
pub struct IpsetBackend {
    set_name: String,
}

impl IpsetBackend {
    pub fn new(set_name: &str) -> Self {
        Self {
            set_name: set_name.to_string(),
        }
    }

    async fn run(program: &str, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {program}"))?;
        Ok(output)
    }

    fn check(program: &str, output: &std::process::Output) -> Result<()> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{program} exited {}: {}", output.status, stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl BlocklistBackend for IpsetBackend {
    async fn initialize(&self) -> Result<()> {
        // `-exist` makes repeated creation a no-op instead of a failure.
        let create = Self::run(
            "ipset",
            &[
                "create",
                &self.set_name,
                "hash:ip",
                "timeout",
                "0",
                "maxelem",
                "200000",
                "-exist",
            ],
        )
        .await?;
        Self::check("ipset create", &create).context("kernel hash set creation failed")?;

        // Check-then-insert: exactly one INPUT rule references the set.
        let check = Self::run(
            "iptables",
            &[
                "-C", "INPUT", "-m", "set", "--match-set", &self.set_name, "src", "-j", "DROP",
            ],
        )
        .await?;
        if !check.status.success() {
            let insert = Self::run(
                "iptables",
                &[
                    "-I", "INPUT", "-m", "set", "--match-set", &self.set_name, "src", "-j",
                    "DROP",
                ],
            )
            .await?;
            Self::check("iptables insert", &insert)
                .context("packet-filter rule installation failed")?;
        }

        info!(set = %self.set_name, "kernel blocklist initialized");
        Ok(())
    }

    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        // One restore script, one kernel round trip. `-exist` turns a
        // re-add into a TTL refresh; `del` lines get `-exist` too so a
        // kernel-side expiry racing the delete does not fail the batch.
        let mut script = String::new();
        for op in ops {
            match op {
                BatchOp::Add { ip, ttl_secs } => {
                    script.push_str(&format!(
                        "add {} {} timeout {} -exist\n",
                        self.set_name, ip, ttl_secs
                    ));
                }
                BatchOp::Del { ip } => {
                    script.push_str(&format!("del {} {} -exist\n", self.set_name, ip));
                }
            }
        }

        let mut child = Command::new("ipset")
            .arg("restore")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn ipset restore")?;

        child
            .stdin
            .take()
            .context("ipset restore stdin unavailable")?
            .write_all(script.as_bytes())
            .await
            .context("failed to stream batch to ipset restore")?;

        let output = child
            .wait_with_output()
            .await
            .context("ipset restore did not exit")?;
        Self::check("ipset restore", &output)
    }

    async fn contains(&self, ip: &str) -> Result<bool> {
        // `ipset test` exits 0 when the entry is present.
        let output = Self::run("ipset", &["test", &self.set_name, ip]).await?;
        Ok(output.status.success())
    }

    async fn count(&self) -> Result<usize> {
        let output = Self::run("ipset", &["list", &self.set_name, "-t"]).await?;
        Self::check("ipset list", &output)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(rest) = line.strip_prefix("Number of entries:") {
                return rest.trim().parse().context("unparseable entry count");
            }
        }
        bail!("ipset list header missing entry count")
    }

    async fn list_all(&self) -> Result<Vec<String>> {
        let output = Self::run("ipset", &["list", &self.set_name, "-o", "plain"]).await?;
        Self::check("ipset list", &output)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let first = line.split_whitespace().next()?;
                first.parse::<std::net::Ipv4Addr>().ok().map(|_| first.to_string())
            })
            .collect())
    }
}

/// In-memory backend with the same batch semantics, for tests and dry
/// runs on hosts without ipset.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, u64>>,
    /// When set, the next N `apply_batch` calls fail.
    fail_next: std::sync::atomic::AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_batches(&self, n: u32) {
        self.fail_next.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn ttl_of(&self, ip: &str) -> Option<u64> {
        self.entries.lock().await.get(ip).copied()
    }
}

#[async_trait]
impl BlocklistBackend for MemoryBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<()> {
        use std::sync::atomic::Ordering;
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            bail!("injected batch failure");
        }
        let mut entries = self.entries.lock().await;
        for op in ops {
            match op {
                BatchOp::Add { ip, ttl_secs } => {
                    entries.insert(ip.clone(), *ttl_secs);
                }
                BatchOp::Del { ip } => {
                    entries.remove(ip);
                }
            }
        }
        Ok(())
    }

    async fn contains(&self, ip: &str) -> Result<bool> {
        Ok(self.entries.lock().await.contains_key(ip))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.lock().await.len())
    }

    async fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

/// The blocklist the rest of the agent talks to. Serializes batch
/// submissions and enforces the temp/permanent origin rule on top of the
/// chosen backend.
pub struct KernelBlocklist<B: BlocklistBackend> {
    backend: B,
    /// Origin per live entry, plus the batch-serialization lock: holding
    /// this across `apply_batch` guarantees no two batches are in flight.
    origins: Mutex<HashMap<String, Origin>>,
}

impl<B: BlocklistBackend> KernelBlocklist<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Fatal if the kernel interface is unavailable or unprivileged —
    /// a firewall that silently failed to come up is worse than a crash.
    pub async fn initialize(&self) -> Result<()> {
        self.backend
            .initialize()
            .await
            .context("kernel blocklist initialization failed (elevated rights required)")
    }

    pub async fn add_or_refresh(&self, ip: &str, ttl_secs: u64, origin: Origin) -> Result<()> {
        self.add_or_refresh_batch(&[(ip.to_string(), ttl_secs)], origin)
            .await
    }

    /// Insert or TTL-refresh many entries in one kernel submission.
    ///
    /// Entries already promoted to `Global` are dropped from a `Local`
    /// batch rather than overwritten. A failed submission is retried
    /// wholesale exactly once — never split into per-entry calls.
    pub async fn add_or_refresh_batch(
        &self,
        entries: &[(String, u64)],
        origin: Origin,
    ) -> Result<()> {
        let mut origins = self.origins.lock().await;

        let ops: Vec<BatchOp> = entries
            .iter()
            .filter(|(ip, _)| {
                let promoted = origins.get(ip.as_str()) == Some(&Origin::Global);
                if promoted && origin == Origin::Local {
                    warn!(ip = %ip, "skipping temp refresh of permanently banned ip");
                }
                !(promoted && origin == Origin::Local)
            })
            .map(|(ip, ttl)| BatchOp::Add {
                ip: ip.clone(),
                ttl_secs: *ttl,
            })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }

        if let Err(first) = self.backend.apply_batch(&ops).await {
            warn!("batch submission failed, retrying wholesale: {first:#}");
            self.backend
                .apply_batch(&ops)
                .await
                .context("batch submission failed twice")?;
        }

        for op in &ops {
            if let BatchOp::Add { ip, .. } = op {
                origins.insert(ip.clone(), origin);
            }
        }
        Ok(())
    }

    pub async fn remove(&self, ip: &str) -> Result<()> {
        self.remove_batch(std::slice::from_ref(&ip.to_string())).await
    }

    pub async fn remove_batch(&self, ips: &[String]) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }
        let mut origins = self.origins.lock().await;
        let ops: Vec<BatchOp> = ips.iter().map(|ip| BatchOp::Del { ip: ip.clone() }).collect();

        if let Err(first) = self.backend.apply_batch(&ops).await {
            warn!("batch removal failed, retrying wholesale: {first:#}");
            self.backend
                .apply_batch(&ops)
                .await
                .context("batch removal failed twice")?;
        }

        for ip in ips {
            origins.remove(ip);
        }
        Ok(())
    }

    pub async fn contains(&self, ip: &str) -> Result<bool> {
        self.backend.contains(ip).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.backend.count().await
    }

    /// Potentially expensive on large blocklists.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        self.backend.list_all().await
    }

    pub async fn origin_of(&self, ip: &str) -> Option<Origin> {
        self.origins.lock().await.get(ip).copied()
    }
}

/// Convenience for fatal local-defense logging at call sites.
pub fn log_fatal_defense_failure(ip: &str, err: &anyhow::Error) {
    error!(ip = %ip, "LOCAL DEFENSE FAILED — host is exposed to {ip}: {err:#}");
}
