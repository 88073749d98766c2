//! Host network-interface configuration.
//!
//! Server instances that bind a concrete (non-wildcard, non-loopback)
//! address get that address added to the selected interface on start and
//! removed again on `server.remove`. Everything goes through
//! [`NetworkConfigurator`] so tests can record calls instead of touching the
//! host.

use crate::config::NetworkDefaults;
use crate::{Result, SimError};
use std::net::Ipv4Addr;
use std::process::Command;
use tracing::{info, warn};

/// One host interface with its IPv4 addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub description: String,
    pub is_up: bool,
    pub addresses: Vec<String>,
}

/// Interface enumeration and address management.
pub trait NetworkConfigurator: Send + Sync {
    fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    fn add_address(
        &self,
        interface: &str,
        ip: &str,
        prefix_len: u8,
        label: Option<&str>,
    ) -> Result<()>;

    fn remove_address(&self, interface: &str, ip: &str, prefix_len: u8) -> Result<()>;
}

/// Whether an address needs to be configured on a host interface.
///
/// Wildcard and loopback addresses are always available.
pub fn should_configure_ip(ip: &str) -> bool {
    let ip = ip.trim();
    !(ip.is_empty() || ip == "0.0.0.0" || ip.starts_with("127."))
}

/// Address label for an instance, e.g. `eth0:iecied1`.
pub fn address_label(interface: &str, instance_id: &str) -> String {
    let mut label = format!("{}:{}{}", interface, NetworkDefaults::LABEL_TAG, instance_id);
    if label.len() > NetworkDefaults::MAX_LABEL_LEN {
        let mut cut = NetworkDefaults::MAX_LABEL_LEN;
        while !label.is_char_boundary(cut) {
            cut -= 1;
        }
        label.truncate(cut);
    }
    label
}

/// Configurator backed by the host: `getifaddrs` for enumeration and the
/// `ip` tool for address changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNetwork;

impl SystemNetwork {
    fn validate(interface: &str, ip: &str, prefix_len: u8) -> Result<()> {
        if interface.is_empty()
            || interface.starts_with('-')
            || interface.chars().any(|c| c.is_whitespace() || c == '/')
        {
            return Err(SimError::Validation {
                field: "interface_name".to_string(),
                message: format!("invalid interface name '{}'", interface),
            });
        }
        if ip.parse::<Ipv4Addr>().is_err() {
            return Err(SimError::Validation {
                field: "ip_address".to_string(),
                message: format!("invalid IPv4 address '{}'", ip),
            });
        }
        if prefix_len > 32 {
            return Err(SimError::Validation {
                field: "prefix_len".to_string(),
                message: format!("prefix length {} out of range", prefix_len),
            });
        }
        Ok(())
    }

    /// Run `ip addr <args>`; a stderr containing `tolerated` counts as success.
    fn run_ip(args: &[&str], tolerated: &str) -> Result<()> {
        let output = Command::new("ip").arg("addr").args(args).output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(tolerated) {
            warn!("ip addr {}: {}", args.join(" "), stderr.trim());
            return Ok(());
        }
        Err(SimError::Network {
            message: format!("ip addr {} failed: {}", args.join(" "), stderr.trim()),
        })
    }
}

impl NetworkConfigurator for SystemNetwork {
    #[cfg(unix)]
    fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        use nix::net::if_::InterfaceFlags;
        use std::net::SocketAddrV4;

        let addrs = nix::ifaddrs::getifaddrs().map_err(|e| SimError::Network {
            message: format!("getifaddrs failed: {}", e),
        })?;

        let mut interfaces: Vec<InterfaceInfo> = Vec::new();
        for ifaddr in addrs {
            if ifaddr.interface_name == "lo" {
                continue;
            }
            let index = match interfaces.iter().position(|i| i.name == ifaddr.interface_name) {
                Some(index) => index,
                None => {
                    interfaces.push(InterfaceInfo {
                        name: ifaddr.interface_name.clone(),
                        description: ifaddr.interface_name.clone(),
                        is_up: false,
                        addresses: Vec::new(),
                    });
                    interfaces.len() - 1
                }
            };
            let entry = &mut interfaces[index];
            entry.is_up |= ifaddr.flags.contains(InterfaceFlags::IFF_UP);
            if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                let ip = SocketAddrV4::from(*sin).ip().to_string();
                if !entry.addresses.contains(&ip) {
                    entry.addresses.push(ip);
                }
            }
        }
        Ok(interfaces)
    }

    #[cfg(not(unix))]
    fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(Vec::new())
    }

    fn add_address(
        &self,
        interface: &str,
        ip: &str,
        prefix_len: u8,
        label: Option<&str>,
    ) -> Result<()> {
        if !should_configure_ip(ip) {
            return Ok(());
        }
        Self::validate(interface, ip, prefix_len)?;

        let cidr = format!("{}/{}", ip, prefix_len);
        let mut args = vec!["add", cidr.as_str(), "dev", interface];
        if let Some(label) = label {
            args.extend(["label", label]);
        }
        Self::run_ip(&args, "File exists")?;
        info!("Added {} to {}", cidr, interface);
        Ok(())
    }

    fn remove_address(&self, interface: &str, ip: &str, prefix_len: u8) -> Result<()> {
        if !should_configure_ip(ip) {
            return Ok(());
        }
        Self::validate(interface, ip, prefix_len)?;

        let cidr = format!("{}/{}", ip, prefix_len);
        Self::run_ip(
            &["del", cidr.as_str(), "dev", interface],
            "Cannot assign requested address",
        )?;
        info!("Removed {} from {}", cidr, interface);
        Ok(())
    }
}
