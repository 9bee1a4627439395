//! Host-side reference backend.
//!
//! Executes registered Rust closures in place of device kernels so that
//! dispatch policies can be exercised without a driver. Programs are
//! "compiled" by scanning the source for `__kernel void name(` entry points
//! and checking bracket balance. Every allocation, transfer, binding and
//! launch is appended to an operation journal.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{BuildStatus, ComputeBackend, ProgramSource, SourceKind};
use crate::catalog::{DeviceAddress, DeviceInfo, DeviceType, PlatformInfo};
use crate::error::{DeviceResult, DeviceStatus, DispatchError, Result};
use crate::marshal::MemoryPolicy;
use crate::range::NdRange;

/// Leading bytes of a reference program binary.
pub const BINARY_MAGIC: &[u8; 8] = b"CLDREF1\0";

/// Local memory available per workgroup on reference devices.
pub const LOCAL_MEM_BYTES: usize = 64 * 1024;

/// A kernel argument as seen by a reference kernel body.
#[derive(Debug)]
pub enum KernelArgView<'k> {
    Buffer(&'k mut [u8]),
    Local(usize),
    Scalar(&'k [u8]),
}

impl KernelArgView<'_> {
    pub fn bytes(&self) -> DeviceResult<&[u8]> {
        match self {
            Self::Buffer(data) => Ok(data),
            Self::Scalar(bytes) => Ok(bytes),
            Self::Local(_) => Err(DeviceStatus::INVALID_ARG_VALUE),
        }
    }

    pub fn bytes_mut(&mut self) -> DeviceResult<&mut [u8]> {
        match self {
            Self::Buffer(data) => Ok(data),
            Self::Local(_) | Self::Scalar(_) => Err(DeviceStatus::INVALID_ARG_VALUE),
        }
    }
}

/// Body of a reference kernel: global range and bound arguments in order.
pub type KernelFn = dyn Fn(&NdRange, &mut [KernelArgView<'_>]) -> DeviceResult<()> + Send + Sync;

/// Decode native-endian `f32` values.
pub fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect()
}

/// Encode `values` into the front of `dst` as native-endian `f32`.
pub fn write_f32(dst: &mut [u8], values: &[f32]) {
    for (chunk, v) in dst.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
}

/// A runtime call that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Enumerate,
    OpenSession,
    CreateBuffer,
    Write,
    Read,
    Launch,
    Finish,
}

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    OpenSession(DeviceAddress),
    Build { kind: SourceKind, success: bool },
    CreateBuffer { buffer: usize, len: usize, policy: MemoryPolicy },
    Write { buffer: usize, len: usize, pinned: bool },
    Read { buffer: usize, len: usize, pinned: bool },
    BindBuffer { index: u32, buffer: usize },
    BindLocal { index: u32, size: usize },
    BindScalar { index: u32, len: usize },
    Launch { kernel: String, global: NdRange, local: Option<NdRange> },
    Finish,
}

/// Reference backend with a configurable platform/device topology.
pub struct ReferenceBackend {
    topology: Vec<usize>,
    kernels: HashMap<String, Arc<KernelFn>>,
    faults: HashMap<FaultPoint, DeviceStatus>,
    journal: Mutex<Vec<Operation>>,
    next_buffer: AtomicUsize,
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceBackend {
    /// One platform with one device.
    pub fn new() -> Self {
        Self::with_topology(vec![1])
    }

    /// `topology[p]` devices on platform `p`.
    pub fn with_topology(topology: Vec<usize>) -> Self {
        Self {
            topology,
            kernels: HashMap::new(),
            faults: HashMap::new(),
            journal: Mutex::new(Vec::new()),
            next_buffer: AtomicUsize::new(0),
        }
    }

    /// Register the host implementation of kernel `name`.
    pub fn with_kernel<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&NdRange, &mut [KernelArgView<'_>]) -> DeviceResult<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(body));
        self
    }

    /// Make every call at `point` fail with `status`.
    pub fn with_fault(mut self, point: FaultPoint, status: DeviceStatus) -> Self {
        self.faults.insert(point, status);
        self
    }

    /// Snapshot of the operation journal.
    pub fn journal(&self) -> Vec<Operation> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain the operation journal.
    pub fn take_journal(&self) -> Vec<Operation> {
        std::mem::take(&mut *self.journal.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Encode a reference binary declaring `kernels`.
    pub fn encode_binary<S: AsRef<str>>(kernels: &[S]) -> Vec<u8> {
        let names: Vec<&str> = kernels.iter().map(AsRef::as_ref).collect();
        let mut out = BINARY_MAGIC.to_vec();
        out.extend_from_slice(names.join("\n").as_bytes());
        out
    }

    fn record(&self, op: Operation) {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).push(op);
    }

    fn check(&self, point: FaultPoint) -> DeviceResult<()> {
        match self.faults.get(&point) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }

    fn device_info(address: DeviceAddress) -> DeviceInfo {
        DeviceInfo {
            address,
            device_type: DeviceType::Cpu,
            name: format!("Reference Device {}.{}", address.platform, address.device),
            version: "OpenCL 1.2 reference".to_string(),
            available: true,
            global_mem_bytes: 1 << 30,
            max_alloc_bytes: 256 << 20,
            extensions: vec![
                "cl_khr_byte_addressable_store".to_string(),
                "cl_khr_fp64".to_string(),
            ],
        }
    }
}

impl fmt::Debug for ReferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kernels: Vec<&String> = self.kernels.keys().collect();
        kernels.sort();
        f.debug_struct("ReferenceBackend")
            .field("topology", &self.topology)
            .field("kernels", &kernels)
            .field("faults", &self.faults)
            .finish()
    }
}

#[derive(Debug)]
pub struct ReferenceSession {
    address: DeviceAddress,
}

impl ReferenceSession {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

#[derive(Debug)]
pub struct ReferenceProgram {
    kind: SourceKind,
    declared: std::result::Result<Vec<String>, String>,
    built: bool,
}

enum Storage {
    Owned(Vec<u8>),
    Alias { ptr: NonNull<u8>, len: usize },
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Self::Owned(data) => data.len(),
            Self::Alias { len, .. } => *len,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Self::Owned(data) => data,
            // SAFETY: `create_buffer` callers guarantee the aliased span
            // outlives the buffer.
            Self::Alias { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Owned(data) => data,
            // SAFETY: as in `bytes`; the caller does not touch the span
            // while the buffer exists.
            Self::Alias { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
        }
    }
}

pub struct ReferenceBuffer {
    id: usize,
    storage: Rc<RefCell<Storage>>,
}

impl ReferenceBuffer {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl fmt::Debug for ReferenceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceBuffer")
            .field("id", &self.id)
            .field("len", &self.storage.borrow().len())
            .finish()
    }
}

enum BoundArg {
    Buffer(Rc<RefCell<Storage>>),
    Local(usize),
    Scalar(Vec<u8>),
}

pub struct ReferenceKernel {
    name: String,
    body: Arc<KernelFn>,
    args: Vec<Option<BoundArg>>,
}

impl ReferenceKernel {
    fn bind(&mut self, index: u32, arg: BoundArg) {
        let index = index as usize;
        if self.args.len() <= index {
            self.args.resize_with(index + 1, || None);
        }
        self.args[index] = Some(arg);
    }
}

impl fmt::Debug for ReferenceKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceKernel")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .finish()
    }
}

enum ArgGuard<'k> {
    Buffer(RefMut<'k, Storage>),
    Local(usize),
    Scalar(&'k [u8]),
}

impl ComputeBackend for ReferenceBackend {
    type Session = ReferenceSession;
    type Program = ReferenceProgram;
    type Kernel = ReferenceKernel;
    type Buffer = ReferenceBuffer;

    fn name(&self) -> &'static str {
        "reference"
    }

    fn enumerate(&self) -> Result<Vec<PlatformInfo>> {
        self.check(FaultPoint::Enumerate)
            .map_err(|status| DispatchError::PlatformEnumeration { status })?;
        Ok(self
            .topology
            .iter()
            .enumerate()
            .map(|(p, &n_devices)| PlatformInfo {
                index: p,
                name: format!("Reference Platform {p}"),
                vendor: "cldispatch".to_string(),
                version: "OpenCL 1.2 reference".to_string(),
                devices: (0..n_devices)
                    .map(|d| Self::device_info(DeviceAddress::new(p, d)))
                    .collect(),
            })
            .collect())
    }

    fn device_counts(&self) -> Result<Vec<usize>> {
        self.check(FaultPoint::Enumerate)
            .map_err(|status| DispatchError::PlatformEnumeration { status })?;
        Ok(self.topology.clone())
    }

    fn open_session(&self, address: DeviceAddress) -> DeviceResult<ReferenceSession> {
        self.check(FaultPoint::OpenSession)?;
        self.record(Operation::OpenSession(address));
        Ok(ReferenceSession { address })
    }

    fn create_program(
        &self,
        _session: &ReferenceSession,
        source: ProgramSource<'_>,
    ) -> DeviceResult<ReferenceProgram> {
        let declared = match source {
            ProgramSource::Text(text) => scan_entry_points(text),
            ProgramSource::Binary(bytes) => Ok(decode_binary(bytes)?),
        };
        Ok(ReferenceProgram { kind: source.kind(), declared, built: false })
    }

    fn build_program(
        &self,
        _session: &ReferenceSession,
        program: &mut ReferenceProgram,
        _options: &str,
    ) -> BuildStatus {
        let status = match &program.declared {
            Ok(_) => {
                program.built = true;
                BuildStatus { status: DeviceStatus::SUCCESS, log: String::new() }
            }
            Err(log) => {
                BuildStatus { status: DeviceStatus::BUILD_PROGRAM_FAILURE, log: log.clone() }
            }
        };
        self.record(Operation::Build { kind: program.kind, success: status.is_success() });
        status
    }

    fn program_binaries(&self, program: &ReferenceProgram) -> DeviceResult<Vec<Vec<u8>>> {
        match (&program.declared, program.built) {
            (Ok(names), true) => Ok(vec![Self::encode_binary(names)]),
            _ => Ok(vec![Vec::new()]),
        }
    }

    fn create_kernel(
        &self,
        program: &ReferenceProgram,
        name: &str,
    ) -> DeviceResult<ReferenceKernel> {

        let declared = match (&program.declared, program.built) {
            (Ok(names), true) => names,
            _ => return Err(DeviceStatus::INVALID_PROGRAM_EXECUTABLE),
        };
        if !declared.iter().any(|n| n == name) {
            return Err(DeviceStatus::INVALID_KERNEL_NAME);
        }
        let body = self.kernels.get(name).ok_or(DeviceStatus::INVALID_KERNEL)?;
        Ok(ReferenceKernel { name: name.to_string(), body: Arc::clone(body), args: Vec::new() })
    }

    unsafe fn create_buffer(
        &self,
        _session: &ReferenceSession,
        policy: MemoryPolicy,
        len: usize,
        host: Option<NonNull<u8>>,
    ) -> DeviceResult<ReferenceBuffer> {
        self.check(FaultPoint::CreateBuffer)?;
        let storage = match (policy.alias_host, host) {
            (true, Some(ptr)) => Storage::Alias { ptr, len },
            (true, None) => return Err(DeviceStatus::INVALID_VALUE),
            (false, _) => Storage::Owned(vec![0; len]),
        };
        let id = self.next_buffer.fetch_add(1, Ordering::Relaxed);
        self.record(Operation::CreateBuffer { buffer: id, len, policy });
        Ok(ReferenceBuffer { id, storage: Rc::new(RefCell::new(storage)) })
    }

    unsafe fn write_buffer(
        &self,
        _session: &ReferenceSession,
        buffer: &mut ReferenceBuffer,
        data: &[u8],
    ) -> DeviceResult<()> {
        self.copy_in(buffer, data, false)
    }

    fn write_buffer_pinned(
        &self,
        _session: &ReferenceSession,
        buffer: &mut ReferenceBuffer,
        data: &[u8],
    ) -> DeviceResult<()> {
        self.copy_in(buffer, data, true)
    }

    fn read_buffer(
        &self,
        _session: &ReferenceSession,
        buffer: &ReferenceBuffer,
        dst: &mut [u8],
    ) -> DeviceResult<()> {
        self.copy_out(buffer, dst, false)
    }

    fn read_buffer_pinned(
        &self,
        _session: &ReferenceSession,
        buffer: &ReferenceBuffer,
        dst: &mut [u8],
    ) -> DeviceResult<()> {
        self.copy_out(buffer, dst, true)
    }

    fn set_arg_buffer(
        &self,
        kernel: &mut ReferenceKernel,
        index: u32,
        buffer: &ReferenceBuffer,
    ) -> DeviceResult<()> {
        kernel.bind(index, BoundArg::Buffer(Rc::clone(&buffer.storage)));
        self.record(Operation::BindBuffer { index, buffer: buffer.id });
        Ok(())
    }

    fn set_arg_local(
        &self,
        kernel: &mut ReferenceKernel,
        index: u32,
        size: usize,
    ) -> DeviceResult<()> {
        if size == 0 || size > LOCAL_MEM_BYTES {
            return Err(DeviceStatus::INVALID_ARG_SIZE);
        }
        kernel.bind(index, BoundArg::Local(size));
        self.record(Operation::BindLocal { index, size });
        Ok(())
    }

    fn set_arg_scalar(
        &self,
        kernel: &mut ReferenceKernel,
        index: u32,
        value: &[u8],
    ) -> DeviceResult<()> {
        if value.is_empty() {
            return Err(DeviceStatus::INVALID_ARG_SIZE);
        }
        kernel.bind(index, BoundArg::Scalar(value.to_vec()));
        self.record(Operation::BindScalar { index, len: value.len() });
        Ok(())
    }

    fn enqueue_range(
        &self,
        _session: &ReferenceSession,
        kernel: &ReferenceKernel,
        global: &NdRange,
        local: Option<&NdRange>,
    ) -> DeviceResult<()> {
        self.check(FaultPoint::Launch)?;
        if let Some(local) = local {
            if local.work_dim() != global.work_dim() {
                return Err(DeviceStatus::INVALID_WORK_DIMENSION);
            }
            if global.as_slice().iter().zip(local.as_slice()).any(|(g, l)| g % l != 0) {
                return Err(DeviceStatus::INVALID_WORK_GROUP_SIZE);
            }
        }

        let mut guards = Vec::with_capacity(kernel.args.len());
        for arg in &kernel.args {
            let guard = match arg {
                None => return Err(DeviceStatus::INVALID_KERNEL_ARGS),
                Some(BoundArg::Buffer(storage)) => ArgGuard::Buffer(
                    storage.try_borrow_mut().map_err(|_| DeviceStatus::INVALID_MEM_OBJECT)?,
                ),
                Some(BoundArg::Local(size)) => ArgGuard::Local(*size),
                Some(BoundArg::Scalar(bytes)) => ArgGuard::Scalar(bytes),
            };
            guards.push(guard);
        }
        let mut views: Vec<KernelArgView<'_>> = guards
            .iter_mut()
            .map(|guard| match guard {
                ArgGuard::Buffer(storage) => KernelArgView::Buffer(storage.bytes_mut()),
                ArgGuard::Local(size) => KernelArgView::Local(*size),
                ArgGuard::Scalar(bytes) => KernelArgView::Scalar(*bytes),
            })
            .collect();

        (kernel.body)(global, &mut views)?;
        self.record(Operation::Launch {
            kernel: kernel.name.clone(),
            global: *global,
            local: local.copied(),
        });
        Ok(())
    }

    fn finish(&self, _session: &ReferenceSession) -> DeviceResult<()> {
        self.check(FaultPoint::Finish)?;
        self.record(Operation::Finish);
        Ok(())
    }
}

impl ReferenceBackend {
    fn copy_in(&self, buffer: &mut ReferenceBuffer, data: &[u8], pinned: bool) -> DeviceResult<()> {
        self.check(FaultPoint::Write)?;
        let mut storage = buffer.storage.borrow_mut();
        let dst = storage.bytes_mut();
        if data.len() > dst.len() {
            return Err(DeviceStatus::INVALID_VALUE);
        }
        dst[..data.len()].copy_from_slice(data);
        self.record(Operation::Write { buffer: buffer.id, len: data.len(), pinned });
        Ok(())
    }

    fn copy_out(&self, buffer: &ReferenceBuffer, dst: &mut [u8], pinned: bool) -> DeviceResult<()> {
        self.check(FaultPoint::Read)?;
        let storage = buffer.storage.borrow();
        let src = storage.bytes();
        if dst.len() > src.len() {
            return Err(DeviceStatus::INVALID_VALUE);
        }
        dst.copy_from_slice(&src[..dst.len()]);
        self.record(Operation::Read { buffer: buffer.id, len: dst.len(), pinned });
        Ok(())
    }
}

fn decode_binary(bytes: &[u8]) -> DeviceResult<Vec<String>> {
    let body = bytes.strip_prefix(BINARY_MAGIC.as_slice()).ok_or(DeviceStatus::INVALID_BINARY)?;
    let text = std::str::from_utf8(body).map_err(|_| DeviceStatus::INVALID_BINARY)?;
    Ok(text.split('\n').filter(|n| !n.is_empty()).map(str::to_string).collect())
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'s> {
    Ident(&'s str),
    Punct(char),
}

/// Tokens of `source` with their 1-based line numbers. Comments are skipped.
fn tokenize(source: &str) -> Vec<(usize, Token<'_>)> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\n' {
            line += 1;
            i += 1;
        } else if c.is_ascii_whitespace() {
            i += 1;
        } else if bytes[i..].starts_with(b"//") {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if bytes[i..].starts_with(b"/*") {
            i += 2;
            while i < bytes.len() && !bytes[i..].starts_with(b"*/") {
                if bytes[i] == b'\n' {
                    line += 1;
                }
                i += 1;
            }
            i = (i + 2).min(bytes.len());
        } else if c.is_ascii_alphanumeric() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((line, Token::Ident(&source[start..i])));
        } else {
            let ch = source[i..].chars().next().unwrap_or('\0');
            tokens.push((line, Token::Punct(ch)));
            i += ch.len_utf8().max(1);
        }
    }
    tokens
}

/// Entry points declared in `source`, or a compiler-style log on failure.
fn scan_entry_points(source: &str) -> std::result::Result<Vec<String>, String> {
    let tokens = tokenize(source);

    let mut stack: Vec<(char, usize)> = Vec::new();
    for (line, token) in &tokens {
        match token {
            Token::Punct(open @ ('(' | '{' | '[')) => stack.push((*open, *line)),
            Token::Punct(close @ (')' | '}' | ']')) => {
                let expected = match close {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => {
                        let log = format!("<kernel source>:{line}: error: unexpected '{close}'\n");
                        return Err(log);
                    }

                }
            }
            _ => {}
        }
    }
    if let Some((open, line)) = stack.pop() {
        return Err(format!("<kernel source>:{line}: error: unmatched '{open}'\n"));
    }

    let mut names = Vec::new();
    for window in tokens.windows(4) {
        if let [
            (_, Token::Ident("__kernel" | "kernel")),
            (_, Token::Ident("void")),
            (_, Token::Ident(name)),
            (_, Token::Punct('(')),
        ] = window
        {
            names.push((*name).to_string());
        }
    }
    if names.is_empty() {
        return Err("<kernel source>:1: error: no kernel entry points found\n".to_string());
    }
    Ok(names)
}
