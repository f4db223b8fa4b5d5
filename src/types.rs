//! Shared types: JSON-RPC envelopes, detection reports, and the read
//! projections the agent keeps of ledger-owned state.

use serde::{Deserialize, Serialize};

/// Standard JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
    pub id: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: serde_json::json!(1),
        }
    }
}

/// Standard JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Raw log entry from an `eth_getLogs` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
}

impl RawLog {
    pub fn block_number_u64(&self) -> u64 {
        u64::from_str_radix(self.block_number.trim_start_matches("0x"), 16).unwrap_or(0)
    }
}

/// A detection report handed over by the external attack-detection pipeline.
/// The raw log blob never leaves the host; only its digest is reported.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionReport {
    pub ip: String,
    pub attack_type: String,
    #[serde(default)]
    pub raw_log: String,
}

/// Aggregate report state for an ip, owned by the ledger. Never mutated
/// locally — this is a read projection of `getThreatStatus`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreatStatus {
    pub confirmed: bool,
    pub report_count: u64,
    pub total_risk_score: u64,
    pub confirmed_at_block: u64,
}

/// Where a firewall entry came from. A `Global` entry (network-confirmed,
/// permanent) must never be downgraded by a later `Local` temp ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Global,
}
