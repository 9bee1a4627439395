//! Device listing command

use anyhow::{Context, Result};
use clap::Parser;
use cldispatch::{ComputeBackend, Dispatcher, PlatformInfo};

const COLUMNS: [&str; 8] = [
    "type",
    "name",
    "version",
    "availability",
    "global memory",
    "global memory",
    "max allocation",
    "extensions",
];

/// List every platform and every device on it
#[derive(Debug, Parser)]
pub struct InfoCommand {
    /// Include the extension column in text output
    #[arg(long)]
    pub extensions: bool,
}

impl InfoCommand {
    pub fn execute<B: ComputeBackend>(self, dispatcher: &Dispatcher<B>, json: bool) -> Result<()> {
        let platforms = dispatcher.list_devices().context("Failed to enumerate OpenCL devices")?;
        if json {
            println!("{}", serde_json::to_string_pretty(&platforms)?);
        } else {
            print!("{}", self.render(&platforms));
        }
        Ok(())
    }

    fn render(&self, platforms: &[PlatformInfo]) -> String {
        if platforms.is_empty() {
            return "No OpenCL platforms found\n".to_string();
        }
        let width = if self.extensions { COLUMNS.len() } else { COLUMNS.len() - 1 };
        let mut out = String::new();
        for platform in platforms {
            out.push_str(&format!(
                "Platform {}: {} ({}, {})\n",
                platform.index, platform.name, platform.vendor, platform.version
            ));
            if platform.devices.is_empty() {
                out.push_str("  (no devices)\n");
                continue;
            }
            let rows: Vec<[String; 8]> = platform.devices.iter().map(|d| d.table_row()).collect();
            let widths: Vec<usize> = (0..width)
                .map(|c| {
                    rows.iter().map(|r| r[c].len()).chain([COLUMNS[c].len()]).max().unwrap_or(0)
                })
                .collect();
            let line = |cells: Vec<&str>| {
                let padded: Vec<String> = cells
                    .iter()
                    .zip(widths.iter().copied())
                    .map(|(cell, w)| format!("{cell:<w$}"))
                    .collect();

                format!("  {}\n", padded.join("  ").trim_end())
            };
            out.push_str(&line(COLUMNS[..width].to_vec()));
            for row in &rows {
                out.push_str(&line(row[..width].iter().map(String::as_str).collect()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cldispatch::{DispatchConfig, ReferenceBackend, SessionRegistry};
    use std::sync::Arc;

    fn platforms(topology: Vec<usize>) -> Vec<PlatformInfo> {
        let dispatcher = Dispatcher::new(
            Arc::new(SessionRegistry::new(ReferenceBackend::with_topology(topology))),
            DispatchConfig::default(),
        );
        dispatcher.list_devices().unwrap()
    }

    #[test]
    fn text_listing_has_one_row_per_device() {
        let text = InfoCommand { extensions: false }.render(&platforms(vec![2, 0]));
        assert!(text.contains("Platform 0: Reference Platform 0"));
        assert!(text.contains("Platform 1"));
        assert!(text.contains("(no devices)"));
        assert_eq!(text.matches("device is available").count(), 2);
        assert!(!text.contains("cl_khr_fp64"));
    }

    #[test]
    fn extensions_column_is_optional() {
        let text = InfoCommand { extensions: true }.render(&platforms(vec![1]));
        assert!(text.contains("cl_khr_fp64"));
    }

    #[test]
    fn empty_machine() {
        assert_eq!(InfoCommand { extensions: false }.render(&[]), "No OpenCL platforms found\n");
    }

    #[test]
    fn json_listing_serializes() {
        let value = serde_json::to_value(platforms(vec![1])).unwrap();
        assert_eq!(value[0]["devices"][0]["device_type"], "Cpu");
        assert_eq!(value[0]["devices"][0]["address"]["platform"], 0);
    }
}
