use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::error::TransferError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Bytes moved per loop iteration; also the cancellation granularity
    pub chunk_size: usize,
    /// Call `sync_all` on the destination after the last chunk of a write
    pub sync_on_complete: bool,
    /// Name given to the background worker thread
    pub worker_name: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            sync_on_complete: false,
            worker_name: "fxfer-worker".to_string(),
        }
    }
}

impl TransferOptions {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidOptions(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if self.worker_name.is_empty() {
            return Err(TransferError::InvalidOptions(
                "worker name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_string_flags(&self) -> String {
        let mut result = Vec::new();

        if self.chunk_size != crate::DEFAULT_CHUNK_SIZE {
            result.push(format!("--chunk-size {}", self.chunk_size));
        }

        if self.sync_on_complete {
            result.push("--sync".to_string());
        }

        result.join(" ")
    }
}

#[derive(Debug, Parser)]
#[command(name = "fxfer")]
#[command(author, version, about = "Chunked file transfer with progress and cancellation", long_about = None)]
pub struct Cli {
    /// Bytes per chunk
    #[arg(long, global = true, default_value_t = crate::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Flush written data to disk before reporting completion
    #[arg(long, global = true)]
    pub sync: bool,

    /// Don't display % transferred
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write log output to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Read a file into memory and report its size
    Read {
        path: PathBuf,
    },
    /// Write a payload to a file, replacing its contents
    Write {
        path: PathBuf,
        #[command(flatten)]
        payload: Payload,
    },
    /// Read SRC, then write its contents to DST
    Copy {
        source: PathBuf,
        destination: PathBuf,
    },
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct Payload {
    /// Take the payload from this file
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Generate this many random bytes
    #[arg(long, value_name = "BYTES")]
    pub random: Option<usize>,
}

impl Cli {
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size,
            sync_on_complete: self.sync,
            ..TransferOptions::default()
        }
    }
}
