//! Error taxonomy for the defense path.
//!
//! The split matters operationally: a local-defense failure means the host
//! is unprotected and must be escalated; a reporting failure only means the
//! network did not hear about an attack the kernel is already blocking.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefenseError {
    /// The kernel blocklist could not be updated even after a retry. The
    /// host is exposed — this must never be swallowed.
    #[error("local defense failure for {ip}: {source}")]
    LocalDefense {
        ip: String,
        #[source]
        source: anyhow::Error,
    },

    /// The reporting transition was aborted (whitelist hit, duplicate
    /// report, insufficient stake, transport failure). The local block
    /// stands regardless.
    #[error("reporting aborted for {ip}: {reason}")]
    ReportingAborted { ip: String, reason: String },

    /// A reveal was rejected for timing reasons (fired early, or the
    /// commitment was already consumed). Retrying a hash mismatch is
    /// incorrect by construction.
    #[error("protocol timing violation: {0}")]
    Timing(String),
}

impl DefenseError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DefenseError::LocalDefense { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_defense_is_fatal() {
        let fatal = DefenseError::LocalDefense {
            ip: "203.0.113.5".into(),
            source: anyhow::anyhow!("ipset exited 1"),
        };
        let soft = DefenseError::ReportingAborted {
            ip: "203.0.113.5".into(),
            reason: "whitelisted".into(),
        };
        assert!(fatal.is_fatal());
        assert!(!soft.is_fatal());
        assert!(!DefenseError::Timing("early".into()).is_fatal());
    }
}
