//! The device-runtime seam.
//!
//! [`ComputeBackend`] is the narrow set of runtime calls the dispatcher
//! needs. The OpenCL driver implements it for real hardware; the reference
//! backend implements it on the host so dispatch policies can be exercised
//! without a driver.

use std::ptr::NonNull;

use crate::catalog::{DeviceAddress, PlatformInfo};
use crate::error::{DeviceResult, DeviceStatus, Result};
use crate::marshal::MemoryPolicy;
use crate::range::NdRange;

/// Kernel program input: source text or a precompiled device binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSource<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl ProgramSource<'_> {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Text(_) => SourceKind::Text,
            Self::Binary(_) => SourceKind::Binary,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Binary(bytes) => bytes.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Text,
    Binary,
}

/// Outcome of a program build. The log is captured whether or not the
/// build succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStatus {
    pub status: DeviceStatus,
    pub log: String,
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        self.status == DeviceStatus::SUCCESS
    }
}

/// Runtime operations used by enumeration, program builds and dispatch.
///
/// Every queue operation is submitted to the session's single in-order
/// queue, so a later command observes the effects of earlier ones.
pub trait ComputeBackend {
    /// A context plus one in-order command queue bound to one device.
    type Session;
    type Program;
    type Kernel;
    type Buffer;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Enumerate platforms and their devices of every type.
    fn enumerate(&self) -> Result<Vec<PlatformInfo>>;

    /// Device count per platform, in platform order.
    fn device_counts(&self) -> Result<Vec<usize>> {
        Ok(self.enumerate()?.iter().map(|p| p.devices.len()).collect())
    }

    fn open_session(&self, address: DeviceAddress) -> DeviceResult<Self::Session>;

    fn create_program(
        &self,
        session: &Self::Session,
        source: ProgramSource<'_>,
    ) -> DeviceResult<Self::Program>;

    /// Build for the session's device and return the status with its raw log.
    fn build_program(
        &self,
        session: &Self::Session,
        program: &mut Self::Program,
        options: &str,
    ) -> BuildStatus;

    /// Device binaries of a built program, one per device.
    fn program_binaries(&self, program: &Self::Program) -> DeviceResult<Vec<Vec<u8>>>;

    fn create_kernel(&self, program: &Self::Program, name: &str) -> DeviceResult<Self::Kernel>;

    /// Allocate a device buffer of `len` bytes.
    ///
    /// # Safety
    ///
    /// When `policy.alias_host` is set, `host` points at `len` bytes that
    /// stay valid, and are not accessed by the caller, until the buffer is
    /// dropped and the queue has drained.
    unsafe fn create_buffer(
        &self,
        session: &Self::Session,
        policy: MemoryPolicy,
        len: usize,
        host: Option<NonNull<u8>>,
    ) -> DeviceResult<Self::Buffer>;

    /// Enqueue a copy of `data` into `buffer`. May return before the copy
    /// completes.
    ///
    /// # Safety
    ///
    /// `data` must stay valid and unmodified until [`ComputeBackend::finish`]
    /// returns for this session.
    unsafe fn write_buffer(
        &self,
        session: &Self::Session,
        buffer: &mut Self::Buffer,
        data: &[u8],
    ) -> DeviceResult<()>;

    /// Upload through a pinned host buffer: blocking map, copy in, enqueue
    /// the device write, unmap. `data` is no longer referenced on return.
    fn write_buffer_pinned(
        &self,
        session: &Self::Session,
        buffer: &mut Self::Buffer,
        data: &[u8],
    ) -> DeviceResult<()>;

    /// Blocking read of the whole buffer into `dst`.
    fn read_buffer(
        &self,
        session: &Self::Session,
        buffer: &Self::Buffer,
        dst: &mut [u8],
    ) -> DeviceResult<()>;

    /// Download through a pinned host buffer, ending with a copy into `dst`.
    fn read_buffer_pinned(
        &self,
        session: &Self::Session,
        buffer: &Self::Buffer,
        dst: &mut [u8],
    ) -> DeviceResult<()>;

    fn set_arg_buffer(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        buffer: &Self::Buffer,
    ) -> DeviceResult<()>;

    /// Reserve `size` bytes of local memory for the argument.
    fn set_arg_local(&self, kernel: &mut Self::Kernel, index: u32, size: usize) -> DeviceResult<()>;

    /// Pass `value` by copy as the argument.
    fn set_arg_scalar(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        value: &[u8],
    ) -> DeviceResult<()>;


    /// Enqueue the kernel over `global`; `None` lets the runtime pick the
    /// workgroup size.
    fn enqueue_range(
        &self,
        session: &Self::Session,
        kernel: &Self::Kernel,
        global: &NdRange,
        local: Option<&NdRange>,
    ) -> DeviceResult<()>;

    /// Block until every command on the session's queue has completed.
    fn finish(&self, session: &Self::Session) -> DeviceResult<()>;
}
