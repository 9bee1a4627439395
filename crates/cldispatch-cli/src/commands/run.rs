//! Kernel run command

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use cldispatch::{
    ArgFlags, ArgSpec, ComputeBackend, DispatchError, DispatchRequest, Dispatcher, KernelArgument,
    NdRange,
};
use serde_json::json;
use tracing::{debug, info};

/// Run one kernel with arguments loaded from raw files
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Kernel entry point name
    #[arg(short, long)]
    pub kernel: String,

    /// Global range: X, X,Y or X,Y,Z
    #[arg(short, long, value_name = "RANGE")]
    pub range: NdRange,

    /// Workgroup size with the same dimensions as the range
    #[arg(short, long, value_name = "RANGE")]
    pub workgroup: Option<NdRange>,

    /// Kernel source file
    #[arg(
        long,
        value_name = "PATH",
        conflicts_with = "binary",
        required_unless_present = "binary"
    )]
    pub source: Option<PathBuf>,

    /// Precompiled device binary
    #[arg(long, value_name = "PATH")]
    pub binary: Option<PathBuf>,

    /// Kernel argument, in position order: FLAGS:PATH, local:BYTES or
    /// scalar:PATH. FLAGS is a raw bit value or names joined by `+`
    /// (rw, ro, wo, host, pinned).
    #[arg(short, long = "arg", value_name = "SPEC")]
    pub args: Vec<ArgSource>,

    /// Platform index (defaults to config)
    #[arg(long)]
    pub platform: Option<usize>,

    /// Device index (defaults to config)
    #[arg(long)]
    pub device: Option<usize>,
}

/// Where one kernel argument comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgSource {
    /// File contents bound with the given flags.
    File { flags: ArgFlags, path: PathBuf },
    /// Local memory reservation in bytes.
    Local(usize),
    /// File contents passed by value.
    Scalar(PathBuf),
}

impl ArgSource {
    fn load(&self) -> Result<Vec<u8>> {
        match self {
            Self::File { path, .. } | Self::Scalar(path) => std::fs::read(path)
                .with_context(|| format!("Failed to read argument file {}", path.display())),
            Self::Local(_) => Ok(Vec::new()),
        }
    }

    fn bind<'a>(&self, data: &'a mut Vec<u8>) -> Result<KernelArgument<'a>> {
        Ok(match self {
            Self::File { flags, .. } => {
                KernelArgument::from_flags(data, *flags).map_err(DispatchError::from)?
            }
            Self::Local(size) => KernelArgument::local(*size),
            Self::Scalar(_) => KernelArgument::scalar(data),
        })
    }

    /// File to rewrite after the run, for arguments the device writes.
    fn write_back(&self) -> Option<&PathBuf> {
        let Self::File { flags, path } = self else { return None };
        let spec = ArgSpec::from_flags(*flags).ok()?;
        (spec.is_buffer() && spec.access.needs_download()).then_some(path)
    }
}

fn parse_flags(text: &str) -> Result<ArgFlags, String> {
    let numeric = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse::<u32>().ok(),
    };
    if let Some(bits) = numeric {
        return Ok(ArgFlags::from_bits(bits));
    }
    text.split('+').try_fold(ArgFlags::NONE, |flags, name| {
        let flag = match name.trim().to_ascii_lowercase().as_str() {
            "rw" | "read-write" => ArgFlags::READ_WRITE,
            "ro" | "read-only" => ArgFlags::READ_ONLY,
            "wo" | "write-only" => ArgFlags::WRITE_ONLY,
            "host" | "use-host-ptr" => ArgFlags::USE_HOST_POINTER,
            "pinned" => ArgFlags::PINNED_STAGING,
            other => return Err(format!("unknown argument flag '{other}'")),
        };
        Ok(flags | flag)
    })
}

impl FromStr for ArgSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, tail) =
            s.split_once(':').ok_or_else(|| format!("expected FLAGS:PATH, got '{s}'"))?;
        if tail.is_empty() {
            return Err(format!("missing value after '{head}:'"));
        }
        match head {
            "local" => {
                let size =
                    tail.parse::<usize>().map_err(|e| format!("local size '{tail}': {e}"))?;
                Ok(Self::Local(size))
            }
            "scalar" => Ok(Self::Scalar(PathBuf::from(tail))),
            flags => {
                let flags = parse_flags(flags)?;
                ArgSpec::from_flags(flags).map_err(|e| e.to_string())?;
                Ok(Self::File { flags, path: PathBuf::from(tail) })
            }
        }
    }
}

enum Program {
    Text(String),
    Binary(Vec<u8>),
}

impl RunCommand {
    pub fn execute<B: ComputeBackend>(self, dispatcher: &Dispatcher<B>, json: bool) -> Result<()> {
        let program = match (&self.source, &self.binary) {
            (Some(path), _) => Program::Text(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read kernel source {}", path.display()))?,
            ),
            (None, Some(path)) => Program::Binary(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read program binary {}", path.display()))?,
            ),
            (None, None) => {
                let missing = cldispatch::ConfigurationError::MissingSource;
                return Err(DispatchError::from(missing).into());
            }
        };

        let mut data = self.args.iter().map(ArgSource::load).collect::<Result<Vec<_>>>()?;
        let arguments = self
            .args
            .iter()
            .zip(data.iter_mut())
            .enumerate()
            .map(|(i, (source, bytes))| {
                source.bind(bytes).with_context(|| format!("Invalid argument {i}"))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(count = arguments.len(), "arguments loaded");

        let mut builder = DispatchRequest::builder(&self.kernel)
            .global(self.range)
            .args(arguments)
            .device(
                self.platform.unwrap_or(dispatcher.config().platform_index),
                self.device.unwrap_or(dispatcher.config().device_index),
            );
        if let Some(workgroup) = self.workgroup {
            builder = builder.local(workgroup);
        }
        builder = match &program {
            Program::Text(text) => builder.source_text(text),
            Program::Binary(bytes) => builder.source_binary(bytes),
        };
        let mut request = builder.build_with(dispatcher.config()).map_err(DispatchError::from)?;
        dispatcher.run(&mut request).with_context(|| format!("Kernel '{}' failed", self.kernel))?;
        drop(request);

        let mut written = Vec::new();
        for (source, bytes) in self.args.iter().zip(&data) {
            if let Some(path) = source.write_back() {
                std::fs::write(path, bytes)
                    .with_context(|| format!("Failed to write result to {}", path.display()))?;
                written.push(path.display().to_string());
            }
        }
        info!(
            kernel = %self.kernel,
            global = %self.range,
            written = written.len(),
            "kernel run complete"
        );

        if json {
            let output = json!({
                "kernel": self.kernel,
                "global": self.range.as_slice(),
                "workgroup": self.workgroup.map(|w| w.as_slice().to_vec()),
                "written": written,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("ran {} over {}", self.kernel, self.range);
            for path in &written {
                println!("  wrote {path}");
            }
        }
        Ok(())
    }
}
