//! Synchronous OpenCL kernel dispatch.
//!
//! This crate provides:
//! - [`catalog`]: platform and device enumeration with index validation
//! - [`session`]: a per-device cache of context plus in-order queue
//! - [`program`]: program builds from source or binary, with build logs
//! - [`marshal`]: per-argument allocation and transfer policies
//! - [`dispatch`]: the end-to-end calculation dispatcher
//!
//! All device calls go through [`backend::ComputeBackend`]. The
//! [`reference::ReferenceBackend`] runs kernels as host closures; the
//! `opencl-runtime` feature adds [`opencl::OpenClBackend`].

pub mod args;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod marshal;
#[cfg(feature = "opencl-runtime")]
pub mod opencl;
pub mod program;
pub mod range;
pub mod reference;
pub mod session;

// Re-export primary public types.
pub use args::{Access, ArgFlags, ArgSpec, KernelArgument};
pub use backend::{BuildStatus, ComputeBackend, ProgramSource, SourceKind};
pub use catalog::{DeviceAddress, DeviceCatalog, DeviceInfo, DeviceType, PlatformInfo};
pub use config::{ConfigError, DispatchConfig, LineEnding};
pub use dispatch::{CompiledProgram, DispatchRequest, DispatchRequestBuilder, Dispatcher};
pub use error::{ConfigurationError, DeviceResult, DeviceStatus, DispatchError, Result, Stage};
pub use marshal::{ArgPlan, Binding, MemoryPolicy, Transfer, plan_arguments};
#[cfg(feature = "opencl-runtime")]
pub use opencl::OpenClBackend;
pub use program::{ProgramArtifact, ProgramBuilder};
pub use range::NdRange;
pub use reference::ReferenceBackend;
pub use session::SessionRegistry;
