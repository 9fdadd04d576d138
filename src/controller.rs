//! Command-facing API that runs the engine on its own worker thread.
//!
//! Start commands are admitted synchronously on the caller's thread: either
//! the operation becomes the single running one, or the call fails with
//! [`TransferError::Busy`]. Nothing is queued. Admitted requests are handed
//! to the worker, which runs the chunk loop and reports through the
//! operation's event stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::args::TransferOptions;
use crate::engine::TransferEngine;
use crate::error::{Result, TransferError};
use crate::event::{ChannelSink, EventSink, ProgressEvent, Transfer, TransferRequest};
use crate::state::{ActiveOperation, CancelHandle, TransferState};

struct Job {
    op: ActiveOperation,
    request: TransferRequest,
    sink: Arc<dyn EventSink>,
}

pub struct TransferController {
    engine: Arc<TransferEngine>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl TransferController {
    /// Validate `options` and spawn the worker thread.
    pub fn new(options: TransferOptions) -> Result<Self> {
        let engine = Arc::new(TransferEngine::new(options)?);
        let (jobs, queue) = unbounded();

        let worker_engine = Arc::clone(&engine);
        let worker = thread::Builder::new()
            .name(engine.options().worker_name.clone())
            .spawn(move || run_worker(&worker_engine, queue))
            .map_err(|err| {
                warn!(error = %err, "failed to spawn transfer worker");
                TransferError::WorkerUnavailable
            })?;

        info!(
            worker = %engine.options().worker_name,
            chunk_size = engine.options().chunk_size,
            "transfer controller ready"
        );

        Ok(Self {
            engine,
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    /// Start reading `path`. Events arrive on the returned handle.
    pub fn start_read(&self, path: impl Into<PathBuf>) -> Result<Transfer> {
        self.submit(TransferRequest::read(path))
    }

    /// Start writing `data` to `path`. Events arrive on the returned handle.
    pub fn start_write(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Result<Transfer> {
        self.submit(TransferRequest::write(path, data))
    }

    pub fn submit(&self, request: TransferRequest) -> Result<Transfer> {
        let (events, receiver) = unbounded();
        let mode = request.mode();
        let released = self.admit(request, Arc::new(ChannelSink::new(events)))?;
        Ok(Transfer::new(mode, receiver, released))
    }

    /// Like [`submit`](Self::submit), but deliver events to `sink` on the
    /// worker thread instead of a channel. The sink sees the terminal event
    /// while the operation still counts as running.
    pub fn submit_with(&self, request: TransferRequest, sink: Arc<dyn EventSink>) -> Result<()> {
        self.admit(request, sink).map(drop)
    }

    fn admit(&self, request: TransferRequest, sink: Arc<dyn EventSink>) -> Result<Receiver<()>> {
        let jobs = self.jobs.as_ref().ok_or(TransferError::WorkerUnavailable)?;

        let op = self.engine.begin().inspect_err(|_| {
            debug!(
                mode = ?request.mode(),
                path = %request.path().display(),
                "transfer rejected: another operation is running"
            );
        })?;

        debug!(
            mode = ?request.mode(),
            path = %request.path().display(),
            "transfer accepted"
        );

        // On failure the job, and with it the admission ticket, is dropped,
        // which frees the running slot again.
        let released = op.released();
        jobs.send(Job { op, request, sink })
            .map_err(|_| TransferError::WorkerUnavailable)?;
        Ok(released)
    }

    /// Ask the running operation to stop at its next chunk boundary. No-op
    /// when idle; the effect is observed as a `Cancelled` event.
    pub fn cancel(&self) {
        self.engine.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.engine.cancel_handle()
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Progress snapshot for pollers that don't drain events
    pub fn snapshot(&self) -> ProgressEvent {
        self.engine.state().snapshot()
    }

    pub fn last_operation_duration_ms(&self) -> u64 {
        self.engine.last_operation_duration_ms()
    }

    pub fn state(&self) -> &Arc<TransferState> {
        self.engine.state()
    }

    pub fn options(&self) -> &TransferOptions {
        self.engine.options()
    }

    /// Cancel whatever is running and wait for the worker to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.engine.cancel();
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("transfer worker panicked");
            }
        }
    }
}

impl Drop for TransferController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(engine: &TransferEngine, queue: Receiver<Job>) {
    debug!("transfer worker started");

    for Job { op, request, sink } in queue.iter() {
        let mode = request.mode();
        engine.execute(op, &request, sink.as_ref());

        let progress = engine.state().snapshot();
        debug!(
            ?mode,
            path = %request.path().display(),
            bytes = progress.bytes_moved,
            total = progress.total_bytes,
            last_duration_ms = engine.last_operation_duration_ms(),
            "transfer finished"
        );
    }

    debug!("transfer worker stopped");
}
