//! Storage device access policy built from an SPDK-style JSON config.
//!
//! The allow-list holds the PCI address of every NVMe controller the bdev
//! subsystem attaches. With VMD enabled, backing devices are addressed
//! through their VMD domain and are rewritten to the VMD endpoint address.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{TierError, TierResult};

const BDEV_SUBSYSTEM: &str = "bdev";
const VMD_SUBSYSTEM: &str = "vmd";
const NVME_ATTACH_METHOD: &str = "bdev_nvme_attach_controller";
const VMD_ENABLE_METHOD: &str = "enable_vmd";

fn device_error(reason: impl Into<String>) -> TierError {
    TierError::DeviceConfig {
        reason: reason.into(),
    }
}

/// PCI address `domain:bus:device.function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddr {
    /// PCI domain.
    pub domain: u32,
    /// Bus number.
    pub bus: u8,
    /// Device number.
    pub device: u8,
    /// Function number.
    pub function: u8,
}

impl FromStr for PciAddr {
    type Err = TierError;

    /// Parses `[domain:]bus:device.function` with hex fields.
    fn from_str(s: &str) -> TierResult<Self> {
        let invalid = || device_error(format!("invalid PCI address '{}'", s));

        let (head, function) = s.rsplit_once('.').ok_or_else(invalid)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [bus, device] => ("0", *bus, *device),
            [domain, bus, device] => (*domain, *bus, *device),
            _ => return Err(invalid()),
        };

        let field = |text: &str| {
            if text.is_empty() {
                return Err(invalid());
            }
            u32::from_str_radix(text, 16).map_err(|_| invalid())
        };
        let domain = field(domain)?;
        let bus = u8::try_from(field(bus)?).map_err(|_| invalid())?;
        let device = field(device)?;
        let function = field(function)?;
        if device > 0x1f || function > 0x7 {
            return Err(invalid());
        }

        Ok(PciAddr {
            domain,
            bus,
            device: device as u8,
            function: function as u8,
        })
    }
}

impl fmt::Display for PciAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Rewrites a VMD backing device address to its VMD endpoint address.
///
/// Only the part before the first `:` is used: `5d0505:01:00.0` becomes
/// `0000:5d:05.5`.
pub fn traddr_to_vmd(traddr: &str) -> TierResult<String> {
    let (prefix, _) = traddr
        .split_once(':')
        .ok_or_else(|| device_error(format!("transport id '{}' not valid", traddr)))?;
    if prefix.len() < 6 || !prefix.is_ascii() {
        return Err(device_error(format!("transport id '{}' not valid", traddr)));
    }
    Ok(format!("0000:{}:{}.{}", &prefix[0..2], &prefix[2..4], &prefix[5..6]))
}

#[derive(Debug, Deserialize)]
struct DeviceConfigDoc {
    subsystems: Option<Vec<SubsystemDoc>>,
}

#[derive(Debug, Deserialize)]
struct SubsystemDoc {
    subsystem: String,
    #[serde(default)]
    config: Option<Vec<ConfigEntry>>,
}

#[derive(Debug, Deserialize)]
struct ConfigEntry {
    method: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

impl SubsystemDoc {
    fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.config.iter().flatten()
    }
}

/// Set of PCI devices this process may open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAccessPolicy {
    allowed: Vec<PciAddr>,
    vmd_enabled: bool,
}

impl DeviceAccessPolicy {
    /// Builds the policy from a JSON document.
    pub fn from_json_str(json: &str) -> TierResult<Self> {
        let doc: DeviceConfigDoc = serde_json::from_str(json)
            .map_err(|e| device_error(format!("failed to parse device config: {}", e)))?;

        let subsystems = match doc.subsystems {
            Some(list) if !list.is_empty() => list,
            _ => return Err(device_error("missing or empty 'subsystems' array")),
        };

        let vmd_enabled = subsystems
            .iter()
            .filter(|s| s.subsystem == VMD_SUBSYSTEM)
            .flat_map(|s| s.entries())
            .any(|e| e.method == VMD_ENABLE_METHOD);

        let bdev = subsystems
            .iter()
            .find(|s| s.subsystem == BDEV_SUBSYSTEM)
            .ok_or_else(|| device_error("missing 'bdev' subsystem"))?;

        let mut policy = DeviceAccessPolicy {
            allowed: Vec::new(),
            vmd_enabled,
        };

        for entry in bdev.entries().filter(|e| e.method == NVME_ATTACH_METHOD) {
            let Some(traddr) = entry
                .params
                .as_ref()
                .and_then(|p| p.get("traddr"))
                .and_then(|t| t.as_str())
            else {
                debug!(method = %entry.method, "attach entry without traddr");
                continue;
            };

            let address = if vmd_enabled && !traddr.starts_with('0') {
                let converted = traddr_to_vmd(traddr)?;
                info!(traddr, vmd = %converted, "VMD backing address reverted");
                converted
            } else {
                traddr.to_string()
            };
            policy.allow(address.parse()?);
        }

        info!(devices = policy.allowed.len(), vmd = vmd_enabled, "device access policy loaded");
        Ok(policy)
    }

    /// Reads and builds the policy from a JSON file.
    pub fn from_file(path: &Path) -> TierResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    fn allow(&mut self, addr: PciAddr) {
        if self.allowed.contains(&addr) {
            debug!(addr = %addr, "duplicate device address ignored");
            return;
        }
        self.allowed.push(addr);
    }

    /// Allowed addresses, in configuration order.
    pub fn allowed(&self) -> &[PciAddr] {
        &self.allowed
    }

    /// Whether VMD is enabled.
    pub fn vmd_enabled(&self) -> bool {
        self.vmd_enabled
    }

    /// Whether the device at `addr` may be opened.
    pub fn is_allowed(&self, addr: &PciAddr) -> bool {
        self.allowed.contains(addr)
    }
}
