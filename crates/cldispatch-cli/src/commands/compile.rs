//! Compile-only command

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cldispatch::{ComputeBackend, Dispatcher};
use serde_json::json;
use tracing::info;

/// Compile kernel source and write the device binary
#[derive(Debug, Parser)]
pub struct CompileCommand {
    /// Kernel source file
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Output path for the device binary
    #[arg(short, long, value_name = "PATH")]
    pub out: PathBuf,

    /// Platform index (defaults to config)
    #[arg(long)]
    pub platform: Option<usize>,

    /// Device index (defaults to config)
    #[arg(long)]
    pub device: Option<usize>,
}

impl CompileCommand {
    pub fn execute<B: ComputeBackend>(self, dispatcher: &Dispatcher<B>, json: bool) -> Result<()> {
        let source = std::fs::read_to_string(&self.source)
            .with_context(|| format!("Failed to read kernel source {}", self.source.display()))?;
        let platform = self.platform.unwrap_or(dispatcher.config().platform_index);
        let device = self.device.unwrap_or(dispatcher.config().device_index);

        let compiled = match dispatcher.compile(platform, device, &source) {
            Ok(compiled) => compiled,
            Err(e) => {
                if let Some(log) = e.build_log().filter(|log| !log.trim().is_empty()) {
                    eprintln!("{log}");
                }
                return Err(anyhow::Error::new(e))
                    .context(format!("Failed to compile {}", self.source.display()));
            }
        };
        if !compiled.build_log.trim().is_empty() {
            eprintln!("{}", compiled.build_log);
        }

        std::fs::write(&self.out, &compiled.binary)
            .with_context(|| format!("Failed to write binary to {}", self.out.display()))?;
        info!(out = %self.out.display(), bytes = compiled.binary.len(), "wrote program binary");

        if json {
            let output = json!({
                "source": self.source.display().to_string(),
                "out": self.out.display().to_string(),
                "bytes": compiled.binary.len(),
                "build_log": compiled.build_log,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!(
                "{} -> {} ({} bytes)",
                self.source.display(),
                self.out.display(),
                compiled.binary.len()
            );
        }
        Ok(())
    }
}
