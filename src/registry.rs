//! Logical contract-name resolution through a fixed, well-known registry
//! contract.
//!
//! Deliberately uncached: the network hot-swaps deployed contract
//! addresses, and a stale cache here would point every agent at a dead
//! deployment. Every lookup re-queries the ledger.

use crate::codec::{self, ParamType, Token};
use crate::ledger::Ledger;
use std::sync::Arc;
use tracing::debug;

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

pub struct RegistryResolver {
    ledger: Arc<dyn Ledger>,
    registry_address: String,
}

impl RegistryResolver {
    pub fn new(ledger: Arc<dyn Ledger>, registry_address: &str) -> Self {
        Self {
            ledger,
            registry_address: registry_address.to_string(),
        }
    }

    /// Resolve a logical name to its currently deployed address.
    ///
    /// Returns `None` for a zero address, a short or empty payload, or any
    /// transport failure — callers on critical paths carry a fixed
    /// fallback address instead of treating those as valid.
    pub async fn resolve(&self, logical_name: &str) -> Option<String> {
        let data = codec::encode_call(
            codec::selector("getContractAddress(string)"),
            &[Token::Str(logical_name.to_string())],
        );

        let payload = match self.ledger.call(&self.registry_address, &data).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(name = logical_name, "registry lookup failed: {e:#}");
                return None;
            }
        };

        let values = match codec::decode_return(&[ParamType::Address], &payload) {
            Ok(values) => values,
            Err(e) => {
                debug!(name = logical_name, "registry returned malformed payload: {e:#}");
                return None;
            }
        };

        let address = values[0].as_address().to_string();
        if address == ZERO_ADDRESS {
            debug!(name = logical_name, "registry has no address for name");
            return None;
        }
        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::{CallScript, MockLedger};

    const GET_ADDR: &str = "getContractAddress(string)";

    fn address_payload(byte: u8) -> Vec<u8> {
        let mut payload = vec![0u8; 32];
        payload[12..].copy_from_slice(&[byte; 20]);
        payload
    }

    #[tokio::test]
    async fn resolves_deployed_address() {
        let ledger = Arc::new(MockLedger::new());
        ledger.script_call(codec::selector(GET_ADDR), CallScript::Return(address_payload(0x42)));
        let resolver = RegistryResolver::new(ledger, "0xregistry");

        let addr = resolver.resolve("ThreatCoordination").await;
        assert_eq!(addr.unwrap(), format!("0x{}", "42".repeat(20)));
    }

    #[tokio::test]
    async fn zero_address_is_not_found() {
        let ledger = Arc::new(MockLedger::new());
        ledger.script_call(codec::selector(GET_ADDR), CallScript::Return(vec![0u8; 32]));
        let resolver = RegistryResolver::new(ledger, "0xregistry");
        assert!(resolver.resolve("ThreatCoordination").await.is_none());
    }

    #[tokio::test]
    async fn short_payload_is_not_found() {
        let ledger = Arc::new(MockLedger::new());
        ledger.script_call(codec::selector(GET_ADDR), CallScript::Return(vec![0u8; 8]));
        let resolver = RegistryResolver::new(ledger, "0xregistry");
        assert!(resolver.resolve("ThreatCoordination").await.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_not_found() {
        let ledger = Arc::new(MockLedger::new());
        ledger.script_call(
            codec::selector(GET_ADDR),
            CallScript::Fail("connection refused".into()),
        );
        let resolver = RegistryResolver::new(ledger, "0xregistry");
        assert!(resolver.resolve("ThreatCoordination").await.is_none());
    }

    #[tokio::test]
    async fn second_lookup_sees_hot_swapped_address() {
        let ledger = Arc::new(MockLedger::new());
        ledger.script_call(codec::selector(GET_ADDR), CallScript::Return(address_payload(0x11)));
        let resolver = RegistryResolver::new(ledger.clone(), "0xregistry");

        let first = resolver.resolve("ThreatCoordination").await.unwrap();

        // The network redeploys the contract; no client restart, no cache.
        ledger.script_call(codec::selector(GET_ADDR), CallScript::Return(address_payload(0x22)));
        let second = resolver.resolve("ThreatCoordination").await.unwrap();

        assert_eq!(first, format!("0x{}", "11".repeat(20)));
        assert_eq!(second, format!("0x{}", "22".repeat(20)));
    }
}
