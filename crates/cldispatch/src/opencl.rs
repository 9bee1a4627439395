//! OpenCL driver backend.
//!
//! Implements [`ComputeBackend`] on top of `opencl3`. Raw scalar arguments
//! go through `cl3` directly because `opencl3` only sets typed values.

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use opencl3::command_queue::{CL_QUEUE_PROFILING_ENABLE, CommandQueue};
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ALL, Device};
use opencl3::error_codes::ClError;
use opencl3::kernel::Kernel;
use opencl3::memory::{
    Buffer, CL_MAP_READ, CL_MAP_WRITE, CL_MEM_ALLOC_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE,
    CL_MEM_USE_HOST_PTR, CL_MEM_WRITE_ONLY, ClMem,
};
use opencl3::platform::{Platform, get_platforms};
use opencl3::program::Program;
use opencl3::types::{
    CL_BLOCKING, CL_NON_BLOCKING, cl_device_id, cl_map_flags, cl_mem, cl_mem_flags,
};
use tracing::{debug, warn};

use crate::args::Access;
use crate::backend::{BuildStatus, ComputeBackend, ProgramSource};
use crate::catalog::{DeviceAddress, DeviceInfo, DeviceType, PlatformInfo, parse_extensions};
use crate::config::DispatchConfig;
use crate::error::{DeviceResult, DeviceStatus, DispatchError, Result};
use crate::marshal::MemoryPolicy;
use crate::range::NdRange;

fn status(err: ClError) -> DeviceStatus {
    DeviceStatus(err.0)
}

/// Device allocation flags for a marshal policy.
pub fn mem_flags(policy: MemoryPolicy) -> cl_mem_flags {
    let access = match policy.access {
        Access::ReadWrite => CL_MEM_READ_WRITE,
        Access::ReadOnly => CL_MEM_READ_ONLY,
        Access::WriteOnly => CL_MEM_WRITE_ONLY,
    };
    if policy.alias_host { access | CL_MEM_USE_HOST_PTR } else { access }
}

/// Backend over the installed OpenCL ICD loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenClBackend {
    profile_queue: bool,
}

impl OpenClBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create queues with `CL_QUEUE_PROFILING_ENABLE`.
    pub fn with_profiling(profile_queue: bool) -> Self {
        Self { profile_queue }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::with_profiling(config.profile_queue)
    }

    /// Platforms in ICD order. A missing ICD loader yields no platforms.
    fn platforms() -> DeviceResult<Vec<Platform>> {
        match get_platforms() {
            Ok(platforms) => Ok(platforms),
            Err(err) if DeviceStatus(err.0) == DeviceStatus::PLATFORM_NOT_FOUND => Ok(Vec::new()),
            Err(err) => Err(status(err)),
        }
    }

    fn device_ids(platform: &Platform) -> DeviceResult<Vec<cl_device_id>> {
        match platform.get_devices(CL_DEVICE_TYPE_ALL) {
            Ok(ids) => Ok(ids),
            Err(err) if DeviceStatus(err.0) == DeviceStatus::DEVICE_NOT_FOUND => Ok(Vec::new()),
            Err(err) => Err(status(err)),
        }
    }

    fn device_info(address: DeviceAddress, device: &Device) -> DeviceResult<DeviceInfo> {
        Ok(DeviceInfo {
            address,
            device_type: DeviceType::from_raw(device.dev_type().map_err(status)?),
            name: device.name().map_err(status)?.trim().to_string(),
            version: device.version().map_err(status)?.trim().to_string(),
            available: device.available().map_err(status)?,
            global_mem_bytes: device.global_mem_size().map_err(status)?,
            max_alloc_bytes: device.max_mem_alloc_size().map_err(status)?,
            extensions: parse_extensions(&device.extensions().map_err(status)?),
        })
    }

    /// Allocate a host-accessible staging buffer and map it for the host.
    fn map_staging(
        &self,
        session: &OpenClSession,
        len: usize,
        map_flags: cl_map_flags,
    ) -> DeviceResult<(Buffer<u8>, NonNull<u8>)> {
        let flags = CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR;
        // SAFETY: no host pointer is passed, the runtime owns the storage.
        let mut staging =
            unsafe { Buffer::<u8>::create(&session.context, flags, len, ptr::null_mut()) }
                .map_err(status)?;
        let mut mapped: cl_mem = ptr::null_mut();
        // SAFETY: blocking map of the whole staging buffer; `mapped` is valid
        // for `len` bytes until it is unmapped.
        unsafe {
            session.queue.enqueue_map_buffer(
                &mut staging,
                CL_BLOCKING,
                map_flags,
                0,
                len,
                &mut mapped,
                &[],
            )
        }
        .map_err(status)?;
        let mapped = NonNull::new(mapped.cast::<u8>()).ok_or(DeviceStatus::OUT_OF_HOST_MEMORY)?;
        Ok((staging, mapped))
    }

    fn unmap_staging(
        session: &OpenClSession,
        staging: &Buffer<u8>,
        mapped: NonNull<u8>,
    ) -> DeviceResult<()> {
        let host = mapped.as_ptr().cast::<c_void>();
        // SAFETY: `mapped` came from mapping `staging` on this queue.
        unsafe { session.queue.enqueue_unmap_mem_object(staging.get(), host, &[]) }
            .map_err(status)?;

        Ok(())
    }
}

/// Context plus one in-order queue bound to a single device.
pub struct OpenClSession {
    address: DeviceAddress,
    device_id: cl_device_id,
    context: Context,
    queue: CommandQueue,
}

// SAFETY: OpenCL objects are reference counted by the runtime and the API is
// thread-safe; concurrent use of one queue is serialized by the caller.
unsafe impl Send for OpenClSession {}
unsafe impl Sync for OpenClSession {}

impl OpenClSession {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl std::fmt::Debug for OpenClSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClSession").field("address", &self.address).finish()
    }
}

pub struct OpenClProgram {
    program: Program,
    device_id: cl_device_id,
}

pub struct OpenClKernel {
    kernel: Kernel,
}

pub struct OpenClBuffer {
    inner: Buffer<u8>,
    len: usize,
}

impl ComputeBackend for OpenClBackend {
    type Session = OpenClSession;
    type Program = OpenClProgram;
    type Kernel = OpenClKernel;
    type Buffer = OpenClBuffer;

    fn name(&self) -> &'static str {
        "opencl"
    }

    fn enumerate(&self) -> Result<Vec<PlatformInfo>> {
        let platforms =
            Self::platforms().map_err(|status| DispatchError::PlatformEnumeration { status })?;
        let mut out = Vec::with_capacity(platforms.len());
        for (p, platform) in platforms.iter().enumerate() {
            let query = |status| DispatchError::DeviceQuery { status };
            let ids = Self::device_ids(platform).map_err(query)?;
            let mut devices = Vec::with_capacity(ids.len());
            for (d, id) in ids.into_iter().enumerate() {
                let address = DeviceAddress::new(p, d);
                devices.push(Self::device_info(address, &Device::new(id)).map_err(query)?);
            }
            out.push(PlatformInfo {
                index: p,
                name: platform.name().map_err(status).map_err(query)?.trim().to_string(),
                vendor: platform.vendor().map_err(status).map_err(query)?.trim().to_string(),
                version: platform.version().map_err(status).map_err(query)?.trim().to_string(),
                devices,
            });
        }
        Ok(out)
    }

    fn device_counts(&self) -> Result<Vec<usize>> {
        let platforms =
            Self::platforms().map_err(|status| DispatchError::PlatformEnumeration { status })?;
        platforms
            .iter()
            .map(|p| {
                Self::device_ids(p)
                    .map(|ids| ids.len())
                    .map_err(|status| DispatchError::DeviceQuery { status })
            })
            .collect()
    }

    fn open_session(&self, address: DeviceAddress) -> DeviceResult<OpenClSession> {
        let platforms = Self::platforms()?;
        let platform = platforms.get(address.platform).ok_or(DeviceStatus::INVALID_DEVICE)?;
        let device_id =
            *Self::device_ids(platform)?.get(address.device).ok_or(DeviceStatus::INVALID_DEVICE)?;
        let device = Device::new(device_id);
        let context = Context::from_device(&device).map_err(status)?;
        let properties = if self.profile_queue { CL_QUEUE_PROFILING_ENABLE } else { 0 };
        // OpenCL 1.2 entry point; 2.0 queue properties are not required.
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, properties).map_err(status)?;
        let device_name = device.name().unwrap_or_default();
        debug!(%address, device = device_name.trim(), "created context and queue");
        Ok(OpenClSession { address, device_id, context, queue })
    }

    fn create_program(
        &self,
        session: &OpenClSession,
        source: ProgramSource<'_>,
    ) -> DeviceResult<OpenClProgram> {
        let program = match source {
            ProgramSource::Text(text) => {
                Program::create_from_source(&session.context, text).map_err(status)?
            }
            ProgramSource::Binary(bytes) => {
                let devices = [session.device_id];
                // SAFETY: the binary is only handed to the driver, which validates it.
                unsafe { Program::create_from_binary(&session.context, &devices, &[bytes]) }
                    .map_err(status)?
            }

        };
        Ok(OpenClProgram { program, device_id: session.device_id })
    }

    fn build_program(
        &self,
        _session: &OpenClSession,
        program: &mut OpenClProgram,
        options: &str,
    ) -> BuildStatus {
        let device_id = program.device_id;
        let result = program.program.build(&[device_id], options);
        let log = match program.program.get_build_log(device_id) {
            Ok(log) => log,
            Err(err) => {
                warn!(status = %status(err), "build log unavailable");
                String::new()
            }
        };
        match result {
            Ok(()) => BuildStatus { status: DeviceStatus::SUCCESS, log },
            Err(err) => BuildStatus { status: status(err), log },
        }
    }

    fn program_binaries(&self, program: &OpenClProgram) -> DeviceResult<Vec<Vec<u8>>> {
        program.program.get_binaries().map_err(status)
    }

    fn create_kernel(&self, program: &OpenClProgram, name: &str) -> DeviceResult<OpenClKernel> {
        Ok(OpenClKernel { kernel: Kernel::create(&program.program, name).map_err(status)? })
    }

    unsafe fn create_buffer(
        &self,
        session: &OpenClSession,
        policy: MemoryPolicy,
        len: usize,
        host: Option<NonNull<u8>>,
    ) -> DeviceResult<OpenClBuffer> {
        let host_ptr = match (policy.alias_host, host) {
            (true, Some(ptr)) => ptr.as_ptr().cast::<c_void>(),
            (true, None) => return Err(DeviceStatus::INVALID_VALUE),
            (false, _) => ptr::null_mut(),
        };
        // SAFETY: upheld by the caller per the trait contract.
        let inner =
            unsafe { Buffer::<u8>::create(&session.context, mem_flags(policy), len, host_ptr) }
                .map_err(status)?;
        Ok(OpenClBuffer { inner, len })
    }

    unsafe fn write_buffer(
        &self,
        session: &OpenClSession,
        buffer: &mut OpenClBuffer,
        data: &[u8],
    ) -> DeviceResult<()> {
        if data.len() > buffer.len {
            return Err(DeviceStatus::INVALID_VALUE);
        }
        // SAFETY: the caller keeps `data` alive until the queue is finished.
        unsafe {
            session.queue.enqueue_write_buffer(&mut buffer.inner, CL_NON_BLOCKING, 0, data, &[])
        }
        .map_err(status)?;
        Ok(())
    }

    fn write_buffer_pinned(
        &self,
        session: &OpenClSession,
        buffer: &mut OpenClBuffer,
        data: &[u8],
    ) -> DeviceResult<()> {
        if data.len() > buffer.len {
            return Err(DeviceStatus::INVALID_VALUE);
        }
        let (staging, mapped) = self.map_staging(session, data.len(), CL_MAP_WRITE)?;
        // SAFETY: `mapped` is a host mapping of `data.len()` bytes that does
        // not overlap `data`. The device write is blocking, so the mapping is
        // no longer read when it is unmapped.
        let written = unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr(), data.len());
            let staged = std::slice::from_raw_parts(mapped.as_ptr(), data.len());
            session.queue.enqueue_write_buffer(&mut buffer.inner, CL_BLOCKING, 0, staged, &[])
        };
        Self::unmap_staging(session, &staging, mapped)?;
        written.map_err(status)?;
        Ok(())
    }

    fn read_buffer(
        &self,
        session: &OpenClSession,
        buffer: &OpenClBuffer,
        dst: &mut [u8],
    ) -> DeviceResult<()> {
        if dst.len() > buffer.len {
            return Err(DeviceStatus::INVALID_VALUE);
        }
        // SAFETY: blocking read into an exclusively borrowed slice.
        unsafe { session.queue.enqueue_read_buffer(&buffer.inner, CL_BLOCKING, 0, dst, &[]) }
            .map_err(status)?;
        Ok(())
    }

    fn read_buffer_pinned(
        &self,
        session: &OpenClSession,
        buffer: &OpenClBuffer,
        dst: &mut [u8],
    ) -> DeviceResult<()> {
        if dst.len() > buffer.len {
            return Err(DeviceStatus::INVALID_VALUE);
        }
        let (staging, mapped) = self.map_staging(session, dst.len(), CL_MAP_READ | CL_MAP_WRITE)?;
        // SAFETY: blocking read into the mapping, then a host copy out of it
        // before it is unmapped.
        let read = unsafe {
            let staged = std::slice::from_raw_parts_mut(mapped.as_ptr(), dst.len());
            let read =
                session.queue.enqueue_read_buffer(&buffer.inner, CL_BLOCKING, 0, staged, &[]);
            if read.is_ok() {
                dst.copy_from_slice(staged);
            }
            read
        };
        Self::unmap_staging(session, &staging, mapped)?;
        read.map_err(status)?;
        Ok(())
    }

    fn set_arg_buffer(
        &self,
        kernel: &mut OpenClKernel,
        index: u32,
        buffer: &OpenClBuffer,
    ) -> DeviceResult<()> {
        // SAFETY: the argument is a `cl_mem` handle owned by `buffer`.
        unsafe { kernel.kernel.set_arg(index, &buffer.inner.get()) }.map_err(status)
    }

    fn set_arg_local(
        &self,
        kernel: &mut OpenClKernel,
        index: u32,
        size: usize,
    ) -> DeviceResult<()> {
        // SAFETY: local reservations carry no host pointer.
        unsafe { kernel.kernel.set_arg_local_buffer(index, size) }.map_err(status)
    }

    fn set_arg_scalar(
        &self,
        kernel: &mut OpenClKernel,
        index: u32,
        value: &[u8],
    ) -> DeviceResult<()> {
        let ptr = value.as_ptr().cast::<c_void>();
        // SAFETY: the runtime copies `value.len()` bytes before returning.
        #[allow(unused_unsafe)]
        let result =
            unsafe { cl3::kernel::set_kernel_arg(kernel.kernel.get(), index, value.len(), ptr) };
        result.map_err(DeviceStatus)
    }

    fn enqueue_range(
        &self,
        session: &OpenClSession,
        kernel: &OpenClKernel,
        global: &NdRange,
        local: Option<&NdRange>,
    ) -> DeviceResult<()> {
        let work_dim =
            u32::try_from(global.work_dim()).map_err(|_| DeviceStatus::INVALID_WORK_DIMENSION)?;
        let local_ptr = local.map_or(ptr::null(), |l| l.as_slice().as_ptr());
        // SAFETY: the size arrays hold `work_dim` entries and outlive the call.
        unsafe {
            session.queue.enqueue_nd_range_kernel(
                kernel.kernel.get(),
                work_dim,
                ptr::null(),
                global.as_slice().as_ptr(),
                local_ptr,
                &[],
            )
        }
        .map_err(status)?;
        Ok(())
    }

    fn finish(&self, session: &OpenClSession) -> DeviceResult<()> {
        session.queue.finish().map_err(status)
    }
}
