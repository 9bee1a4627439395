//! Per-argument marshaling policy.
//!
//! [`plan_arguments`] turns validated argument specs into an [`ArgPlan`]
//! per position: how the argument binds, which allocation mode its device
//! buffer gets, and whether data moves before and after launch. Planning is
//! pure; the dispatcher executes the plan against a backend.

use crate::args::{Access, ArgData, KernelArgument};
use crate::error::ConfigurationError;

/// Device allocation mode for a buffer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryPolicy {
    /// Declared kernel access, translated verbatim into the allocation mode.
    pub access: Access,
    /// The device uses the caller's memory directly instead of a copy.
    pub alias_host: bool,
}

/// How data moves between the host span and its device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Skip,
    Direct,
    /// Routed through a page-locked host buffer.
    Pinned,
}

impl Transfer {
    pub fn is_skip(self) -> bool {
        matches!(self, Self::Skip)
    }
}

/// How an argument is bound to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Buffer { policy: MemoryPolicy, len: usize, upload: Transfer, download: Transfer },
    /// Reserve this many bytes of local memory; no data.
    Local(usize),
    /// Copy this many host bytes as the argument value.
    Scalar(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgPlan {
    pub index: usize,
    pub binding: Binding,
}

impl ArgPlan {
    pub fn upload(&self) -> Transfer {
        match self.binding {
            Binding::Buffer { upload, .. } => upload,
            _ => Transfer::Skip,
        }
    }

    pub fn download(&self) -> Transfer {
        match self.binding {
            Binding::Buffer { download, .. } => download,
            _ => Transfer::Skip,
        }
    }

    pub fn needs_buffer(&self) -> bool {
        matches!(self.binding, Binding::Buffer { .. })
    }
}

/// Plan every argument in position order.
///
/// `force_pinned` stages every transfer through pinned memory, except for
/// host-aliased buffers which never transfer.
pub fn plan_arguments(
    args: &[KernelArgument<'_>],
    force_pinned: bool,
) -> Result<Vec<ArgPlan>, ConfigurationError> {
    args.iter().enumerate().map(|(index, arg)| plan_one(index, arg, force_pinned)).collect()
}

fn plan_one(
    index: usize,
    arg: &KernelArgument<'_>,
    force_pinned: bool,
) -> Result<ArgPlan, ConfigurationError> {
    let spec = arg.spec();
    let len = arg.byte_len();
    if len == 0 {
        return Err(ConfigurationError::EmptyArgument { index });
    }

    let binding = match &arg.data {
        ArgData::Local(size) => Binding::Local(*size),
        ArgData::Scalar(bytes) => Binding::Scalar(bytes.len()),
        ArgData::Buffer(_) => {
            let mode = if spec.pinned_staging || force_pinned {
                Transfer::Pinned
            } else {
                Transfer::Direct
            };

            let moves =
                |wanted: bool| if wanted && !spec.host_alias { mode } else { Transfer::Skip };
            Binding::Buffer {
                policy: MemoryPolicy { access: spec.access, alias_host: spec.host_alias },
                len,
                upload: moves(spec.access.needs_upload()),
                download: moves(spec.access.needs_download()),
            }
        }
    };
    Ok(ArgPlan { index, binding })
}
