//! Centralized configuration for the simulator backend.
//!
//! Constants for the IPC transport, default server/client instance settings
//! and host network configuration.

use crate::engine::FunctionalConstraint;
use std::time::Duration;

/// IPC transport configuration.
pub struct IpcConfig;

impl IpcConfig {
    pub const DEFAULT_SOCKET_PATH: &'static str = "/tmp/iec61850_simulator.sock";
    pub const DEFAULT_WORKER_THREADS: usize = 4;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Defaults applied to newly created server instances.
pub struct ServerDefaults;

impl ServerDefaults {
    pub const IED_NAME: &'static str = "IED";
    pub const PORT: u16 = 102;
    pub const IP_ADDRESS: &'static str = "0.0.0.0";
    pub const MAX_CONNECTIONS: u32 = 10;
}

/// Defaults applied to client instances.
pub struct ClientDefaults;

impl ClientDefaults {
    pub const IED_NAME: &'static str = "IED";
    pub const PORT: u16 = 102;
    pub const REQUEST_TIMEOUT_MS: u64 = 5000;

    /// Functional constraints tried, in order, by `client.read`.
    pub const READ_FCS: [FunctionalConstraint; 4] = [
        FunctionalConstraint::ST,
        FunctionalConstraint::MX,
        FunctionalConstraint::SP,
        FunctionalConstraint::CF,
    ];

    /// Functional constraints tried, in order, by `client.write`.
    pub const WRITE_FCS: [FunctionalConstraint; 4] = [
        FunctionalConstraint::SP,
        FunctionalConstraint::CF,
        FunctionalConstraint::ST,
        FunctionalConstraint::MX,
    ];
}

/// Host network interface configuration.
pub struct NetworkDefaults;

impl NetworkDefaults {
    pub const PREFIX_LEN: u8 = 24;
    pub const LABEL_TAG: &'static str = "iec";
    /// Kernel address labels are limited to IFNAMSIZ - 1 bytes.
    pub const MAX_LABEL_LEN: usize = 15;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_limits_are_reasonable() {
        assert!(IpcConfig::DEFAULT_WORKER_THREADS >= 1);
        assert!(IpcConfig::MAX_CONNECTIONS >= IpcConfig::DEFAULT_WORKER_THREADS);
        assert!(IpcConfig::MAX_FRAME_SIZE <= u32::MAX as usize);
        assert!(IpcConfig::CONNECT_TIMEOUT > Duration::ZERO);
        assert!(ClientDefaults::REQUEST_TIMEOUT_MS > 0);
    }

    #[test]
    fn test_fc_orders_cover_the_same_constraints() {
        for fc in ClientDefaults::READ_FCS {
            assert!(ClientDefaults::WRITE_FCS.contains(&fc));
        }
        assert_eq!(ClientDefaults::READ_FCS[0], FunctionalConstraint::ST);
        assert_eq!(ClientDefaults::WRITE_FCS[0], FunctionalConstraint::SP);
    }

    #[test]
    fn test_label_budget_fits_tag() {
        assert!(NetworkDefaults::LABEL_TAG.len() < NetworkDefaults::MAX_LABEL_LEN);
        assert!(NetworkDefaults::PREFIX_LEN <= 32);
    }
}
