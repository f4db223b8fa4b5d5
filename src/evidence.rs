//! Forensic evidence captured at detection time.
//!
//! The payload stays private until the reveal step: only its commitment
//! hash goes to the ledger up front, so other operators cannot front-run
//! or tamper with a report they have not yet seen.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What a reveal discloses. Each field maps to one reveal-call argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evidence {
    pub attack_type: String,
    /// Host CPU load at detection, as an integer percentage 0..=100.
    pub cpu_load: u8,
    /// sha256 hex digest of the triggering log excerpt.
    pub log_hash: String,
    pub risk_score: u32,
}

impl Evidence {
    pub fn collect(attack_type: &str, log_excerpt: &str, risk_score: u32) -> Self {
        Self {
            attack_type: attack_type.to_string(),
            cpu_load: cpu_load_percent(),
            log_hash: sha256_hex(log_excerpt.as_bytes()),
            risk_score,
        }
    }

}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 1-minute load average normalized against twice the core count and
/// clamped, so a briefly oversubscribed box reads as 100 rather than
/// overflowing. Non-Linux hosts report 0.
pub fn cpu_load_percent() -> u8 {
    #[cfg(target_os = "linux")]
    {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        let load1 = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .and_then(|first| first.parse::<f64>().ok())
            .unwrap_or(0.0);
        let pct = (load1 / (2.0 * cores)) * 100.0;
        pct.min(100.0).max(0.0) as u8
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}
