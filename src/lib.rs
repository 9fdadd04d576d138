//! FXFER - chunked background file transfer library
//!
//! Reads or writes one local file at a time in fixed-size chunks on a
//! dedicated worker thread, reporting progress as events and honouring
//! cooperative cancellation at chunk boundaries. Frontends (CLI, GUI)
//! drive it through [`TransferController`] and consume [`TransferEvent`]s.

pub mod args;
pub mod error;
pub mod event;
pub mod state;
pub mod utils;

mod controller;
mod engine;

pub use args::TransferOptions;
pub use controller::TransferController;
pub use engine::TransferEngine;
pub use error::{ErrorKind, TransferError};
pub use event::{
    ChannelSink, Completion, ErrorEvent, EventSink, FnSink, NullSink, ProgressEvent, Transfer,
    TransferEvent, TransferMode, TransferOutcome, TransferRequest,
};
pub use state::{ActiveOperation, CancelHandle, TransferState};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FXFER";

/// Default bytes per chunk (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
