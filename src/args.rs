use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Drives displays through kernel mode setting
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct GlobalArgs {
    /// Append logs to this file instead of stderr
    #[arg(short, long)]
    pub log_file: Option<String>,

    /// Graphics device to use, may be given multiple times. Defaults to all cards.
    #[arg(short, long = "device")]
    pub devices: Vec<PathBuf>,

    /// Never attempt atomic mode setting
    #[arg(long)]
    pub legacy_modeset: bool,

    /// Pace frames with a timer instead of page flip events
    #[arg(long)]
    pub software_vsync: bool,

    /// Where to persist output configuration
    #[arg(long)]
    pub output_config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the outputs of every graphics device
    Probe,
    /// Show an animated test scene on every connected display
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Stop after this many presented frames
    #[arg(short, long)]
    pub frames: Option<u64>,
}

pub fn get_global_args() -> GlobalArgs {
    GlobalArgs::parse()
}
