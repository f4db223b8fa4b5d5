//! Configuration for the vigil defense agent.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger JSON-RPC endpoint URL.
    pub ledger_rpc_url: String,

    /// Chain identifier of the coordination ledger.
    pub chain_id: u64,

    /// Fixed, well-known registry contract address used for logical-name
    /// resolution. This is the only address clients need baked in.
    pub registry_address: String,

    /// Fallback coordination-contract address for critical paths when
    /// registry resolution fails.
    pub coordination_fallback_address: String,

    /// Reporter account address used as `from` in outbound transactions.
    pub reporter_address: String,

    /// Minimum ledger blocks between a commit and its reveal.
    pub reveal_delay_blocks: u64,

    /// TTL in seconds for a locally-applied temp ban.
    pub temp_ban_ttl_secs: u64,

    /// Suggested risk score attached to revealed evidence.
    pub risk_score: u64,

    /// Name of the kernel hash set holding blocked addresses.
    pub blocklist_set_name: String,

    /// How often the block-height watcher polls `eth_blockNumber`.
    pub block_poll_interval_secs: u64,

    /// How often the global sync listener polls `eth_getLogs`.
    pub event_poll_interval_secs: u64,

    /// TTL in seconds after which an un-revealed commitment is garbage
    /// collected from the pending store.
    pub commitment_ttl_secs: u64,

    /// Reveal submission retry budget (transport failures only; protocol
    /// rejections are never blindly retried).
    pub reveal_max_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            ledger_rpc_url: std::env::var("VIGIL_LEDGER_RPC")
                .unwrap_or_else(|_| "http://127.0.0.1:8545".into()),
            chain_id: std::env::var("VIGIL_CHAIN_ID")
                .unwrap_or_else(|_| "8888".into())
                .parse()
                .context("Invalid VIGIL_CHAIN_ID")?,
            registry_address: std::env::var("VIGIL_REGISTRY_ADDRESS").unwrap_or_else(|_| {
                "0x0b306bf915c4d645ff596e518faf3f9669b97016".into()
            }),
            coordination_fallback_address: std::env::var("VIGIL_COORDINATION_FALLBACK")
                .unwrap_or_else(|_| "0x0000000000000000000000000000000000000000".into()),
            reporter_address: std::env::var("VIGIL_REPORTER_ADDRESS")
                .unwrap_or_else(|_| "0x0000000000000000000000000000000000000000".into()),
            reveal_delay_blocks: std::env::var("VIGIL_REVEAL_DELAY_BLOCKS")
                .unwrap_or_else(|_| "10".into())
                .parse()
                .context("Invalid VIGIL_REVEAL_DELAY_BLOCKS")?,
            temp_ban_ttl_secs: std::env::var("VIGIL_TEMP_BAN_TTL")
                .unwrap_or_else(|_| "86400".into())
                .parse()
                .context("Invalid VIGIL_TEMP_BAN_TTL")?,
            risk_score: std::env::var("VIGIL_RISK_SCORE")
                .unwrap_or_else(|_| "50".into())
                .parse()
                .unwrap_or(50),
            blocklist_set_name: std::env::var("VIGIL_BLOCKLIST_SET")
                .unwrap_or_else(|_| "vigil_blocklist".into()),
            block_poll_interval_secs: std::env::var("VIGIL_BLOCK_POLL_SECS")
                .unwrap_or_else(|_| "2".into())
                .parse()
                .unwrap_or(2),
            event_poll_interval_secs: std::env::var("VIGIL_EVENT_POLL_SECS")
                .unwrap_or_else(|_| "5".into())
                .parse()
                .unwrap_or(5),
            commitment_ttl_secs: std::env::var("VIGIL_COMMITMENT_TTL")
                .unwrap_or_else(|_| "86400".into())
                .parse()
                .unwrap_or(86_400),
            reveal_max_retries: std::env::var("VIGIL_REVEAL_MAX_RETRIES")
                .unwrap_or_else(|_| "3".into())
                .parse()
                .unwrap_or(3),
        })
    }
}
