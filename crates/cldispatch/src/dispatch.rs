//! The calculation dispatcher.
//!
//! A dispatch is strictly sequential: resolve session, build or load the
//! program, resolve the kernel, allocate buffers, upload, bind, launch,
//! download, drain the queue. Any stage failure returns immediately.
//! Buffers and the program live only for the call.

use std::sync::Arc;

use tracing::{debug, debug_span, warn};

use crate::args::{ArgData, KernelArgument};
use crate::backend::{ComputeBackend, ProgramSource};
use crate::catalog::{DeviceCatalog, PlatformInfo};
use crate::config::DispatchConfig;
use crate::error::{ConfigurationError, DeviceStatus, DispatchError, Result, Stage};
use crate::marshal::{Binding, Transfer, plan_arguments};
use crate::program::ProgramBuilder;
use crate::range::NdRange;
use crate::session::SessionRegistry;

/// One kernel invocation with its arguments.
#[derive(Debug)]
pub struct DispatchRequest<'a> {
    pub platform: usize,
    pub device: usize,
    pub kernel: String,
    pub global: NdRange,
    /// `None` lets the runtime choose the workgroup size.
    pub local: Option<NdRange>,
    pub source: ProgramSource<'a>,
    pub args: Vec<KernelArgument<'a>>,
}

impl<'a> DispatchRequest<'a> {
    pub fn builder(kernel: impl Into<String>) -> DispatchRequestBuilder<'a> {
        DispatchRequestBuilder {
            platform: None,
            device: None,
            kernel: kernel.into(),
            global: None,
            local: None,
            text: None,
            binary: None,
            args: Vec::new(),
        }
    }
}

/// Builder enforcing the request contract: a non-empty kernel name, a
/// global range, and exactly one of source text or binary.
#[derive(Debug)]
pub struct DispatchRequestBuilder<'a> {
    platform: Option<usize>,
    device: Option<usize>,
    kernel: String,
    global: Option<NdRange>,
    local: Option<NdRange>,
    text: Option<&'a str>,
    binary: Option<&'a [u8]>,
    args: Vec<KernelArgument<'a>>,
}

impl<'a> DispatchRequestBuilder<'a> {
    /// Target device. Unset indices fall back to the dispatcher's config.
    pub fn device(mut self, platform: usize, device: usize) -> Self {
        self.platform = Some(platform);
        self.device = Some(device);
        self
    }

    pub fn global(mut self, range: NdRange) -> Self {
        self.global = Some(range);
        self
    }

    pub fn local(mut self, range: NdRange) -> Self {
        self.local = Some(range);
        self
    }

    pub fn source_text(mut self, text: &'a str) -> Self {
        self.text = Some(text);
        self
    }

    pub fn source_binary(mut self, binary: &'a [u8]) -> Self {
        self.binary = Some(binary);
        self
    }

    pub fn arg(mut self, arg: KernelArgument<'a>) -> Self {
        self.args.push(arg);
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = KernelArgument<'a>>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn build(self) -> std::result::Result<DispatchRequest<'a>, ConfigurationError> {
        self.build_with(&DispatchConfig::default())
    }

    /// Build, taking default device indices from `config`.
    pub fn build_with(
        self,
        config: &DispatchConfig,
    ) -> std::result::Result<DispatchRequest<'a>, ConfigurationError> {
        if self.kernel.trim().is_empty() {
            return Err(ConfigurationError::EmptyKernelName);
        }
        let source = match (self.text, self.binary) {
            (Some(_), Some(_)) => return Err(ConfigurationError::ConflictingSource),
            (None, None) => return Err(ConfigurationError::MissingSource),
            (Some(text), None) => ProgramSource::Text(text),
            (None, Some(binary)) => ProgramSource::Binary(binary),
        };
        let global = self.global.ok_or_else(|| ConfigurationError::InvalidRange {
            reason: "global range not set".into(),
        })?;
        if let Some(local) = &self.local {
            global.check_local(local)?;
        }
        Ok(DispatchRequest {
            platform: self.platform.unwrap_or(config.platform_index),
            device: self.device.unwrap_or(config.device_index),
            kernel: self.kernel,
            global,
            local: self.local,
            source,
            args: self.args,
        })
    }
}

/// Output of the compile-only path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    pub binary: Vec<u8>,
    /// Normalized build log; may be empty.
    pub build_log: String,
}

/// Runs kernels and compiles programs against a shared session registry.
pub struct Dispatcher<B: ComputeBackend> {
    registry: Arc<SessionRegistry<B>>,
    config: DispatchConfig,
}

impl<B: ComputeBackend> Dispatcher<B> {
    pub fn new(registry: Arc<SessionRegistry<B>>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<B>> {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn list_devices(&self) -> Result<Vec<PlatformInfo>> {
        DeviceCatalog::new(self.registry.backend()).list()
    }

    /// Compile source text and return the device binary with its build log.
    /// Allocates no buffers and executes nothing.
    pub fn compile(&self, platform: usize, device: usize, source: &str) -> Result<CompiledProgram> {
        let _span = debug_span!("compile", platform, device).entered();
        let session = self.registry.get(platform, device)?;
        let builder = self.program_builder();
        let artifact = builder.build_from_source(&session, source)?;
        let binary = builder.extract_binary(&artifact)?;
        Ok(CompiledProgram { binary, build_log: artifact.build_log().to_string() })
    }

    /// Execute one kernel synchronously.
    ///
    /// On success every downloaded argument holds the device result and the
    /// session's queue has drained.
    pub fn run(&self, request: &mut DispatchRequest<'_>) -> Result<()> {
        let _span =
            debug_span!("dispatch", kernel = %request.kernel, global = %request.global).entered();
        if let Some(local) = &request.local {
            request.global.check_local(local)?;
        }
        let plans = plan_arguments(&request.args, self.config.pinned_staging)?;

        let backend = self.registry.backend();
        let session = self.registry.get(request.platform, request.device)?;
        let artifact = self.program_builder().build(&session, request.source)?;
        let mut kernel =
            backend.create_kernel(artifact.program(), &request.kernel).map_err(|status| {
                if status == DeviceStatus::INVALID_KERNEL_NAME {
                    ConfigurationError::UnknownKernel { name: request.kernel.clone() }.into()
                } else {
                    DispatchError::Runtime { stage: Stage::ResolveKernel, status }
                }
            })?;

        let mut buffers: Vec<Option<B::Buffer>> = Vec::with_capacity(plans.len());
        // Declared after `buffers` so the queue drains before they are released.
        let mut drain = DrainGuard { backend, session: &session, armed: true };

        for (plan, arg) in plans.iter().zip(request.args.iter_mut()) {
            let buffer = match plan.binding {
                Binding::Buffer { policy, len, .. } => {
                    let host = if policy.alias_host { arg.host_ptr() } else { None };
                    // SAFETY: an aliased span is borrowed by `request` for longer
                    // than this call, and aliased arguments are skipped by every
                    // transfer below, so the host never touches it while the
                    // device may.
                    let buffer = unsafe { backend.create_buffer(&session, policy, len, host) }
                        .map_err(DispatchError::runtime(Stage::Allocate))?;
                    Some(buffer)
                }
                Binding::Local(_) | Binding::Scalar(_) => None,
            };
            buffers.push(buffer);
        }
        debug!(buffers = buffers.iter().flatten().count(), "buffers allocated");

        for ((plan, arg), slot) in plans.iter().zip(&request.args).zip(buffers.iter_mut()) {
            let (ArgData::Buffer(data), Some(buffer)) = (&arg.data, slot.as_mut()) else {
                continue;
            };
            match plan.upload() {
                Transfer::Skip => {}
                Transfer::Direct => {
                    // SAFETY: `data` is borrowed by `request` past the drain guard,
                    // which finishes the queue on every exit path.
                    unsafe { backend.write_buffer(&session, buffer, data) }
                        .map_err(DispatchError::argument(plan.index))?;
                }
                Transfer::Pinned => backend
                    .write_buffer_pinned(&session, buffer, data)
                    .map_err(staging_error(plan.index, data.len()))?,
            }
        }

        for ((plan, arg), slot) in plans.iter().zip(&request.args).zip(&buffers) {
            let index = u32::try_from(plan.index).map_err(|_| DispatchError::KernelArgument {
                index: plan.index,
                status: DeviceStatus::INVALID_ARG_INDEX,
            })?;
            let bound = match (&arg.data, slot) {
                (ArgData::Local(size), _) => backend.set_arg_local(&mut kernel, index, *size),
                (ArgData::Scalar(bytes), _) => backend.set_arg_scalar(&mut kernel, index, bytes),
                (ArgData::Buffer(_), Some(buffer)) => {
                    backend.set_arg_buffer(&mut kernel, index, buffer)
                }
                (ArgData::Buffer(_), None) => {
                    let reason = format!("no device buffer for argument {}", plan.index);
                    return Err(DispatchError::UnknownRuntime(reason));
                }
            };
            bound.map_err(DispatchError::argument(plan.index))?;
        }

        backend
            .enqueue_range(&session, &kernel, &request.global, request.local.as_ref())
            .map_err(DispatchError::runtime(Stage::Launch))?;
        debug!(local = ?request.local, "kernel enqueued");

        for ((plan, arg), slot) in plans.iter().zip(request.args.iter_mut()).zip(&buffers) {
            let (ArgData::Buffer(data), Some(buffer)) = (&mut arg.data, slot) else { continue };
            match plan.download() {
                Transfer::Skip => {}
                Transfer::Direct => {
                    backend
                        .read_buffer(&session, buffer, data)
                        .map_err(DispatchError::argument(plan.index))?;
                }
                Transfer::Pinned => {
                    let len = data.len();
                    backend
                        .read_buffer_pinned(&session, buffer, data)
                        .map_err(staging_error(plan.index, len))?;
                }
            }
        }

        drain.finish()?;
        debug!("dispatch complete");
        Ok(())
    }

    fn program_builder(&self) -> ProgramBuilder<'_, B> {
        ProgramBuilder::new(self.registry.backend())
            .with_options(&self.config.build_options)
            .with_line_ending(self.config.build_log_line_ending)
    }
}

impl<B: ComputeBackend> std::fmt::Debug for Dispatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()

    }
}

/// Host-side exhaustion during staging is an allocation failure; anything
/// else is charged to the argument.
fn staging_error(index: usize, bytes: usize) -> impl FnOnce(DeviceStatus) -> DispatchError {
    move |status| {
        if status == DeviceStatus::OUT_OF_HOST_MEMORY {
            DispatchError::Allocation { bytes }
        } else {
            DispatchError::KernelArgument { index, status }
        }
    }
}

/// Blocks on the session's queue when a dispatch exits early, so no enqueued
/// command outlives the host memory it reads or writes.
struct DrainGuard<'s, B: ComputeBackend> {
    backend: &'s B,
    session: &'s B::Session,
    armed: bool,
}

impl<B: ComputeBackend> DrainGuard<'_, B> {
    fn finish(&mut self) -> Result<()> {
        self.armed = false;
        self.backend.finish(self.session).map_err(DispatchError::runtime(Stage::Finish))
    }
}

impl<B: ComputeBackend> Drop for DrainGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed
            && let Err(status) = self.backend.finish(self.session)
        {
            warn!(%status, "queue drain after failed dispatch also failed");
        }
    }
}
