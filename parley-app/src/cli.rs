//! Command-line interface for parley.

use std::path::PathBuf;

use clap::Parser;

/// Live voice sessions from the terminal
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Live voice sessions from the terminal")]
pub struct Cli {
    /// Context string for the system instruction
    #[arg(long, value_name = "TEXT", conflicts_with = "context_file")]
    pub context: Option<String>,

    /// Read the context string from a file
    #[arg(long, value_name = "PATH")]
    pub context_file: Option<PathBuf>,

    /// Settings file (default: $PARLEY_SETTINGS or ./parley.settings.json)
    #[arg(long, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Start with the microphone muted
    #[arg(long)]
    pub muted: bool,

    /// No audio hardware: silent mic and a clocked virtual speaker
    #[arg(long)]
    pub offline: bool,

    /// Print audio devices as JSON and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Write the effective settings file and exit
    #[arg(long)]
    pub init_settings: bool,
}

impl Cli {
    /// Context from `--context-file`, `--context`, or empty.
    pub fn read_context(&self) -> anyhow::Result<String> {
        use anyhow::Context;

        if let Some(path) = &self.context_file {
            return std::fs::read_to_string(path)
                .with_context(|| format!("failed to read context file {}", path.display()));
        }
        Ok(self.context.clone().unwrap_or_default())
    }
}
