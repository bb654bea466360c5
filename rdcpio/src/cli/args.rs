// SPDX-FileCopyrightText: 2025-2026 The rdcpio developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::cli::cpio;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };

        f.write_str(s)
    }
}

/// Run a sequence of commands against a ramdisk cpio archive.
///
/// Each command string is split on spaces; a first token starting with `#`
/// comments out the whole command. Unless a command terminates the run
/// (`test`, `exists`, `extract`), the archive is written back to its original
/// path after all commands complete, re-applying the compression format that
/// was detected when it was loaded.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the ramdisk cpio archive.
    pub archive: PathBuf,

    /// Commands to run, e.g. "exists init" or "mkdir 750 overlay.d".
    pub commands: Vec<String>,

    /// Minimum log message severity.
    #[arg(long, value_name = "LEVEL", default_value_t)]
    pub log_level: LogLevel,
}

fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };

    // Diagnostics go to stderr; stdout is never used.
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_writer(io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<u8> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    cpio::cpio_main(&cli, cancel_signal)
}
