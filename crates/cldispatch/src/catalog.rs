//! Platform and device enumeration.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::backend::ComputeBackend;
use crate::error::{ConfigurationError, Result};

const TYPE_CPU: u64 = 1 << 1;
const TYPE_GPU: u64 = 1 << 2;
const TYPE_ACCELERATOR: u64 = 1 << 3;

/// Device classification. Unrecognized type codes map to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
    Unknown,
}

impl DeviceType {
    /// Classify a raw device-type code.
    pub fn from_raw(code: u64) -> Self {
        match code {
            TYPE_CPU => Self::Cpu,
            TYPE_GPU => Self::Gpu,
            TYPE_ACCELERATOR => Self::Accelerator,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu => write!(f, "GPU"),
            Self::Accelerator => write!(f, "Accelerator"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Stable (platform, device) index pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceAddress {
    pub platform: usize,
    pub device: usize,
}

impl DeviceAddress {
    pub const fn new(platform: usize, device: usize) -> Self {
        Self { platform, device }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.device)
    }
}

/// Capability snapshot of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    pub device_type: DeviceType,
    pub name: String,
    pub version: String,
    pub available: bool,
    pub global_mem_bytes: u64,
    pub max_alloc_bytes: u64,
    pub extensions: Vec<String>,
}

impl DeviceInfo {
    /// The eight listing columns in their fixed order.
    ///
    /// Global memory appears twice; hosts index the columns by position.
    pub fn table_row(&self) -> [String; 8] {
        [
            self.device_type.to_string(),
            self.name.clone(),
            self.version.clone(),
            if self.available { "device is available" } else { "device is unavailable" }
                .to_string(),
            self.global_mem_bytes.to_string(),
            self.global_mem_bytes.to_string(),
            self.max_alloc_bytes.to_string(),
            self.extensions.join(" "),
        ]
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }
}

/// Split a space separated extension string.
pub fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// One platform and its devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<DeviceInfo>,
}

/// Read-only view over a backend's platforms and devices.
pub struct DeviceCatalog<'b, B: ComputeBackend> {
    backend: &'b B,
}

impl<'b, B: ComputeBackend> DeviceCatalog<'b, B> {
    pub fn new(backend: &'b B) -> Self {
        Self { backend }
    }

    /// Enumerate every platform, then every device of any type on it.
    pub fn list(&self) -> Result<Vec<PlatformInfo>> {
        let platforms = self.backend.enumerate()?;
        debug!(
            backend = self.backend.name(),
            platforms = platforms.len(),
            devices = platforms.iter().map(|p| p.devices.len()).sum::<usize>(),
            "enumerated compute devices"
        );
        Ok(platforms)
    }

    /// Validate an index pair against the current device counts.
    pub fn resolve(&self, platform: usize, device: usize) -> Result<DeviceAddress> {
        check_address(&self.backend.device_counts()?, platform, device)
    }
}

pub(crate) fn check_address(
    counts: &[usize],
    platform: usize,
    device: usize,
) -> Result<DeviceAddress> {
    let invalid =
        |reason: String| ConfigurationError::InvalidDeviceIndex { platform, device, reason };

    let Some(&n_devices) = counts.get(platform) else {
        return Err(invalid(format!("{} platform(s) available", counts.len())).into());
    };
    if device >= n_devices {
        return Err(invalid(format!("platform {platform} has {n_devices} device(s)")).into());
    }
    Ok(DeviceAddress::new(platform, device))
}
