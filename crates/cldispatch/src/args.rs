//! Kernel argument descriptions and their memory flags.
//!
//! Hosts describe each argument with a small bit vocabulary ([`ArgFlags`]).
//! The bits are validated once into an [`ArgSpec`] record, so later stages
//! never depend on bit-test order.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::ptr::NonNull;

use crate::error::ConfigurationError;

/// Raw per-argument flag bits as supplied by the host layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArgFlags(u32);

impl ArgFlags {
    pub const NONE: Self = Self(0);
    pub const READ_WRITE: Self = Self(1 << 0);
    /// The kernel only writes this argument.
    pub const WRITE_ONLY: Self = Self(1 << 1);
    /// The kernel only reads this argument.
    pub const READ_ONLY: Self = Self(1 << 2);
    pub const USE_HOST_POINTER: Self = Self(1 << 3);
    pub const LOCAL_MEMORY: Self = Self(1 << 4);
    pub const SCALAR: Self = Self(1 << 5);
    pub const PINNED_STAGING: Self = Self(1 << 6);

    const ALL: u32 = (1 << 7) - 1;
    const DIRECTIONS: u32 = Self::READ_WRITE.0 | Self::WRITE_ONLY.0 | Self::READ_ONLY.0;

    /// Accepts any bit pattern; unknown bits are reported by [`ArgSpec::from_flags`].
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ArgFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ArgFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ArgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ArgFlags, &str); 7] = [
            (ArgFlags::READ_WRITE, "READ_WRITE"),
            (ArgFlags::WRITE_ONLY, "WRITE_ONLY"),
            (ArgFlags::READ_ONLY, "READ_ONLY"),
            (ArgFlags::USE_HOST_POINTER, "USE_HOST_POINTER"),
            (ArgFlags::LOCAL_MEMORY, "LOCAL_MEMORY"),
            (ArgFlags::SCALAR, "SCALAR"),
            (ArgFlags::PINNED_STAGING, "PINNED_STAGING"),
        ];
        let set: Vec<&str> =
            NAMES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| *name).collect();
        write!(f, "ArgFlags({})", if set.is_empty() { "NONE".to_string() } else { set.join(" | ") })
    }
}

/// Access direction from the kernel's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    #[default]
    ReadWrite,
    /// The device reads; the host does not expect updates.
    ReadOnly,
    /// The device writes; nothing meaningful is sent from the host.
    WriteOnly,
}

impl Access {
    /// Whether host data must reach the device before launch.
    pub fn needs_upload(self) -> bool {
        !matches!(self, Self::WriteOnly)
    }

    /// Whether device data must come back to the host after launch.
    pub fn needs_download(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Validated description of one kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgSpec {
    pub access: Access,
    pub host_alias: bool,
    pub local_memory: bool,
    pub scalar: bool,
    pub pinned_staging: bool,
}

impl ArgSpec {
    pub const fn buffer(access: Access) -> Self {
        Self {
            access,
            host_alias: false,
            local_memory: false,
            scalar: false,
            pinned_staging: false,
        }
    }

    pub const fn read_only() -> Self {
        Self::buffer(Access::ReadOnly)
    }

    pub const fn write_only() -> Self {
        Self::buffer(Access::WriteOnly)
    }

    pub const fn read_write() -> Self {
        Self::buffer(Access::ReadWrite)
    }

    pub const fn host_alias(mut self) -> Self {
        self.host_alias = true;
        self
    }

    pub const fn pinned(mut self) -> Self {
        self.pinned_staging = true;
        self
    }

    /// Validate raw host flags into a spec.
    ///
    /// No direction bit means read-write, which is what the device runtime
    /// assumes for an allocation without a direction.
    pub fn from_flags(flags: ArgFlags) -> Result<Self, ConfigurationError> {
        let bits = flags.bits();
        if bits & !ArgFlags::ALL != 0 {
            return Err(ConfigurationError::UnknownFlagBits { bits: bits & !ArgFlags::ALL });
        }

        let directions = bits & ArgFlags::DIRECTIONS;
        if directions.count_ones() > 1 {
            return Err(ConfigurationError::ConflictingFlags {
                bits,
                reason: "at most one of read-write, write-only, read-only",
            });
        }

        let spec = Self {
            access: if flags.contains(ArgFlags::WRITE_ONLY) {
                Access::WriteOnly
            } else if flags.contains(ArgFlags::READ_ONLY) {
                Access::ReadOnly
            } else {
                Access::ReadWrite
            },
            host_alias: flags.contains(ArgFlags::USE_HOST_POINTER),
            local_memory: flags.contains(ArgFlags::LOCAL_MEMORY),
            scalar: flags.contains(ArgFlags::SCALAR),
            pinned_staging: flags.contains(ArgFlags::PINNED_STAGING),
        };
        spec.validate()
            .map(|()| spec)
            .map_err(|reason| ConfigurationError::ConflictingFlags { bits, reason })
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.local_memory && self.scalar {
            return Err("local memory and scalar are exclusive");
        }
        if self.host_alias && self.pinned_staging {
            return Err("host pointer aliasing and pinned staging are exclusive");
        }
        Ok(())
    }

    /// Whether this argument is backed by a device buffer.
    pub fn is_buffer(&self) -> bool {
        !self.local_memory && !self.scalar
    }

    /// Inverse of [`ArgSpec::from_flags`].
    pub fn to_flags(&self) -> ArgFlags {
        let mut flags = match self.access {
            Access::ReadWrite => ArgFlags::READ_WRITE,
            Access::ReadOnly => ArgFlags::READ_ONLY,
            Access::WriteOnly => ArgFlags::WRITE_ONLY,
        };
        for (set, flag) in [
            (self.host_alias, ArgFlags::USE_HOST_POINTER),
            (self.local_memory, ArgFlags::LOCAL_MEMORY),
            (self.scalar, ArgFlags::SCALAR),
            (self.pinned_staging, ArgFlags::PINNED_STAGING),
        ] {
            if set {
                flags |= flag;
            }
        }
        flags
    }
}

/// Host data behind one positional kernel argument.
#[derive(Debug)]
pub(crate) enum ArgData<'a> {
    Buffer(&'a mut [u8]),
    Scalar(&'a [u8]),
    Local(usize),
}

/// One positional kernel argument: a host memory span plus its spec.
///
/// The span is borrowed for the whole dispatch. Downloads write into it in
/// place; host-aliased buffers let the device use it directly.
#[derive(Debug)]
pub struct KernelArgument<'a> {
    pub(crate) data: ArgData<'a>,
    spec: ArgSpec,
}

impl<'a> KernelArgument<'a> {
    /// A buffer argument.
    pub fn buffer(data: &'a mut [u8], spec: ArgSpec) -> Result<Self, ConfigurationError> {
        let bits = spec.to_flags().bits();
        spec.validate().map_err(|reason| ConfigurationError::ConflictingFlags { bits, reason })?;
        if !spec.is_buffer() {
            return Err(ConfigurationError::ConflictingFlags {
                bits,
                reason: "buffer arguments cannot be local memory or scalars",

            });
        }
        Ok(Self { data: ArgData::Buffer(data), spec })
    }

    /// A value copied verbatim as the kernel argument.
    pub fn scalar(bytes: &'a [u8]) -> Self {
        Self { data: ArgData::Scalar(bytes), spec: ArgSpec { scalar: true, ..ArgSpec::default() } }
    }

    /// A reservation of `size` bytes of per-workgroup local memory.
    pub fn local(size: usize) -> Self {
        Self {
            data: ArgData::Local(size),
            spec: ArgSpec { local_memory: true, ..ArgSpec::default() },
        }
    }

    /// Build an argument from raw host flags.
    ///
    /// For local memory the declared size is the span length; the span
    /// itself is never read.
    pub fn from_flags(data: &'a mut [u8], flags: ArgFlags) -> Result<Self, ConfigurationError> {
        let spec = ArgSpec::from_flags(flags)?;
        let data = if spec.local_memory {
            ArgData::Local(data.len())
        } else if spec.scalar {
            ArgData::Scalar(data)
        } else {
            ArgData::Buffer(data)
        };
        Ok(Self { data, spec })
    }

    pub fn spec(&self) -> &ArgSpec {
        &self.spec
    }

    /// Start of the host span, for device buffers that alias it.
    pub(crate) fn host_ptr(&mut self) -> Option<NonNull<u8>> {
        match &mut self.data {
            ArgData::Buffer(data) => NonNull::new(data.as_mut_ptr()),
            ArgData::Scalar(_) | ArgData::Local(_) => None,
        }
    }

    /// Declared size in bytes.
    pub fn byte_len(&self) -> usize {
        match &self.data {
            ArgData::Buffer(data) => data.len(),
            ArgData::Scalar(bytes) => bytes.len(),
            ArgData::Local(size) => *size,
        }
    }
}
