//! Error taxonomy for device enumeration, program builds and dispatch.
//!
//! Every failure surfaces as a [`DispatchError`]. Callers that need a flat
//! discriminated result use [`DispatchError::status_code`], which yields the
//! underlying device status when one exists and a stable negative code per
//! error class otherwise.

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Result of a single device runtime call.
pub type DeviceResult<T> = std::result::Result<T, DeviceStatus>;


/// Numeric status returned by a device runtime call.
///
/// Values follow the OpenCL status vocabulary (`0` is success, negative
/// values are failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceStatus(pub i32);

impl DeviceStatus {
    pub const SUCCESS: Self = Self(0);
    pub const DEVICE_NOT_FOUND: Self = Self(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Self = Self(-4);
    pub const OUT_OF_RESOURCES: Self = Self(-5);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-6);
    pub const BUILD_PROGRAM_FAILURE: Self = Self(-11);
    pub const INVALID_VALUE: Self = Self(-30);
    pub const INVALID_DEVICE: Self = Self(-33);
    pub const INVALID_MEM_OBJECT: Self = Self(-38);
    pub const INVALID_BINARY: Self = Self(-42);
    pub const INVALID_PROGRAM_EXECUTABLE: Self = Self(-45);
    pub const INVALID_KERNEL_NAME: Self = Self(-46);
    pub const INVALID_KERNEL: Self = Self(-48);
    pub const INVALID_ARG_INDEX: Self = Self(-49);
    pub const INVALID_ARG_VALUE: Self = Self(-50);
    pub const INVALID_ARG_SIZE: Self = Self(-51);
    pub const INVALID_KERNEL_ARGS: Self = Self(-52);
    pub const INVALID_WORK_DIMENSION: Self = Self(-53);
    pub const INVALID_WORK_GROUP_SIZE: Self = Self(-54);
    pub const INVALID_GLOBAL_WORK_SIZE: Self = Self(-63);
    pub const PLATFORM_NOT_FOUND: Self = Self(-1001);

    /// Symbolic name of the status, when it is one of the well-known codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "CL_SUCCESS",
            -1 => "CL_DEVICE_NOT_FOUND",
            -2 => "CL_DEVICE_NOT_AVAILABLE",
            -3 => "CL_COMPILER_NOT_AVAILABLE",
            -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -12 => "CL_MAP_FAILURE",
            -30 => "CL_INVALID_VALUE",
            -33 => "CL_INVALID_DEVICE",
            -34 => "CL_INVALID_CONTEXT",
            -36 => "CL_INVALID_COMMAND_QUEUE",
            -38 => "CL_INVALID_MEM_OBJECT",
            -42 => "CL_INVALID_BINARY",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -53 => "CL_INVALID_WORK_DIMENSION",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -55 => "CL_INVALID_WORK_ITEM_SIZE",
            -61 => "CL_INVALID_BUFFER_SIZE",
            -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
            -1001 => "CL_PLATFORM_NOT_FOUND_KHR",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

/// Pipeline stage in which a runtime call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OpenSession,
    CreateProgram,
    ResolveKernel,
    Allocate,
    Launch,
    Finish,
    ExtractBinary,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OpenSession => "open session",
            Self::CreateProgram => "create program",
            Self::ResolveKernel => "resolve kernel",
            Self::Allocate => "allocate buffer",
            Self::Launch => "launch kernel",
            Self::Finish => "finish queue",
            Self::ExtractBinary => "extract binary",
        };
        f.write_str(s)
    }
}

/// Caller mistakes. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("invalid device index: platform {platform}, device {device} ({reason})")]
    InvalidDeviceIndex { platform: usize, device: usize, reason: String },

    #[error("no kernel source or binary supplied")]
    MissingSource,

    #[error("kernel source and binary are mutually exclusive")]
    ConflictingSource,

    #[error("kernel name is empty")]
    EmptyKernelName,

    #[error("kernel '{name}' not found in program")]
    UnknownKernel { name: String },

    #[error("conflicting argument flags {bits:#04x}: {reason}")]
    ConflictingFlags { bits: u32, reason: &'static str },

    #[error("unknown argument flag bits {bits:#04x}")]
    UnknownFlagBits { bits: u32 },

    #[error("invalid execution range: {reason}")]
    InvalidRange { reason: String },

    #[error("argument {index} has zero size")]
    EmptyArgument { index: usize },
}

/// Errors from device enumeration, program builds and dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("kernel build failed with {status}:\n{log}")]
    Build { status: DeviceStatus, log: String },

    #[error("program binary rejected by device with {status}")]
    BinaryLoad { status: DeviceStatus, log: String },

    #[error("program has no compiled binary")]
    NotBuilt,

    #[error("platform enumeration failed with {status}")]
    PlatformEnumeration { status: DeviceStatus },

    #[error("device query failed with {status}")]
    DeviceQuery { status: DeviceStatus },

    #[error("kernel argument {index} failed with {status}")]
    KernelArgument { index: usize, status: DeviceStatus },

    #[error("{stage} failed with {status}")]
    Runtime { stage: Stage, status: DeviceStatus },

    #[error("host allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    #[error("unclassified runtime failure: {0}")]
    UnknownRuntime(String),
}

/// Codes reported for error classes that carry no device status.
pub mod codes {
    pub const CONFIGURATION: i32 = -10_001;
    pub const NOT_BUILT: i32 = -10_002;
    pub const ALLOCATION: i32 = -10_003;
    pub const UNKNOWN_RUNTIME: i32 = -10_004;
}

impl DispatchError {
    pub(crate) fn runtime(stage: Stage) -> impl FnOnce(DeviceStatus) -> Self {
        move |status| Self::Runtime { stage, status }
    }

    pub(crate) fn argument(index: usize) -> impl FnOnce(DeviceStatus) -> Self {
        move |status| Self::KernelArgument { index, status }
    }

    /// Flat status code for hosts that only understand integers.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => codes::CONFIGURATION,
            Self::Build { status, .. }
            | Self::BinaryLoad { status, .. }
            | Self::PlatformEnumeration { status }
            | Self::DeviceQuery { status }
            | Self::KernelArgument { status, .. }
            | Self::Runtime { status, .. } => status.0,
            Self::NotBuilt => codes::NOT_BUILT,
            Self::Allocation { .. } => codes::ALLOCATION,
            Self::UnknownRuntime(_) => codes::UNKNOWN_RUNTIME,
        }
    }

    /// Whether the failure was caused by the caller's request.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Build log attached to the error, if any.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::Build { log, .. } | Self::BinaryLoad { log, .. } => Some(log),
            _ => None,
        }
    }
}
