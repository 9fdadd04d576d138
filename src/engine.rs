use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::args::TransferOptions;
use crate::error::{Result, TransferError};
use crate::event::{
    Completion, ErrorEvent, EventSink, ProgressEvent, TransferEvent, TransferMode,
    TransferRequest,
};
use crate::state::{ActiveOperation, CancelHandle, TransferState};

/// Chunks' worth of buffer reserved up front for a read. The file size is
/// only a hint, so anything beyond this grows on demand.
const PREALLOCATED_CHUNKS: usize = 4;

/// Runs one read or write at a time, in fixed-size chunks.
///
/// The engine is the only component that touches the filesystem. It reports
/// through an [`EventSink`] and never logs: every failure ends up in the
/// terminal `Failed` event of its operation.
pub struct TransferEngine {
    options: TransferOptions,
    state: Arc<TransferState>,
}

/// How the chunk loop stopped
enum Step {
    Done(Completion, Duration),
    Cancelled,
}

/// Per-operation progress de-duplication. Emits when the whole percentage
/// changes, and always for the final chunk.
struct ProgressTracker {
    total: u64,
    moved: u64,
    last_percent: u64,
}

impl ProgressTracker {
    fn new(total: u64) -> Self {
        Self {
            total,
            moved: 0,
            last_percent: 0,
        }
    }

    fn advance(&mut self, bytes: usize) -> Option<ProgressEvent> {
        self.moved = self.moved.saturating_add(bytes as u64);
        if self.total == 0 {
            return None;
        }

        let event = ProgressEvent {
            bytes_moved: self.moved,
            total_bytes: self.total,
        };
        let percent = event.percentage();
        if percent != self.last_percent || self.moved == self.total {
            self.last_percent = percent;
            Some(event)
        } else {
            None
        }
    }

    /// Reconcile with the bytes actually moved once the source is exhausted.
    /// A file that changed size since it was measured still ends at 100%.
    fn finish(&mut self) -> Option<ProgressEvent> {
        if self.moved == self.total || self.moved == 0 {
            return None;
        }
        self.total = self.moved;
        self.last_percent = 100;
        Some(ProgressEvent {
            bytes_moved: self.moved,
            total_bytes: self.moved,
        })
    }
}

impl TransferEngine {
    pub fn new(options: TransferOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            state: Arc::new(TransferState::new()),
        })
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn state(&self) -> &Arc<TransferState> {
        &self.state
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.state))
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn last_operation_duration_ms(&self) -> u64 {
        self.state.last_operation_duration_ms()
    }

    /// Admit an operation. It counts as running from here until its
    /// terminal event.
    pub fn begin(&self) -> Result<ActiveOperation> {
        self.state.begin()
    }

    /// Read `path` on the calling thread. Only `Busy` is returned as an
    /// error; everything else is reported through `sink`.
    pub fn read_file(&self, path: impl AsRef<Path>, sink: &dyn EventSink) -> Result<()> {
        let op = self.begin()?;
        self.execute(op, &TransferRequest::read(path.as_ref()), sink);
        Ok(())
    }

    /// Write `data` to `path` on the calling thread. Only `Busy` is returned
    /// as an error; everything else is reported through `sink`.
    pub fn write_file(
        &self,
        path: impl AsRef<Path>,
        data: &[u8],
        sink: &dyn EventSink,
    ) -> Result<()> {
        let op = self.begin()?;
        let step = self.write_chunks(&op, path.as_ref(), data, sink);
        self.commit(op, step, sink);
        Ok(())
    }

    /// Run an admitted request to its terminal event.
    pub fn execute(&self, op: ActiveOperation, request: &TransferRequest, sink: &dyn EventSink) {
        let step = match request {
            TransferRequest::Read { path } => self.read_chunks(&op, path, sink),
            TransferRequest::Write { path, data } => self.write_chunks(&op, path, data, sink),
        };
        self.commit(op, step, sink);
    }

    fn commit(&self, op: ActiveOperation, step: Result<Step>, sink: &dyn EventSink) {
        // A cancel that lands after the last chunk boundary still wins over
        // completion, as long as it was issued before this point.
        let late_cancel = op.settle();
        let event = match step {
            Ok(Step::Done(completion, elapsed)) if !late_cancel => {
                self.state.record_duration(elapsed);
                TransferEvent::Completed(completion)
            }
            Ok(_) => TransferEvent::Cancelled,
            Err(err) => TransferEvent::Failed(ErrorEvent::from(&err)),
        };
        sink.emit(event);
        drop(op);
    }

    fn read_chunks(&self, op: &ActiveOperation, path: &Path, sink: &dyn EventSink) -> Result<Step> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(not_found(path)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(not_found(path)),
            Err(source) => {
                return Err(TransferError::OpenFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let file = File::open(path).map_err(|source| TransferError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;

        read_loop(op, file, metadata.len(), self.options.chunk_size, sink).map_err(|source| {
            TransferError::Io {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    fn write_chunks(
        &self,
        op: &ActiveOperation,
        path: &Path,
        data: &[u8],
        sink: &dyn EventSink,
    ) -> Result<Step> {
        let file = File::create(path).map_err(|source| TransferError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;

        write_loop(op, file, data, &self.options, sink).map_err(|source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn not_found(path: &Path) -> TransferError {
    TransferError::NotFound {
        path: path.to_path_buf(),
    }
}

fn read_loop<R: Read>(
    op: &ActiveOperation,
    mut reader: R,
    total: u64,
    chunk_size: usize,
    sink: &dyn EventSink,
) -> io::Result<Step> {
    let started = Instant::now();
    op.state().set_total_bytes(total);
    sink.emit(TransferEvent::Started {
        mode: TransferMode::Read,
        total_bytes: total,
    });

    let reserve = usize::try_from(total)
        .unwrap_or(usize::MAX)
        .min(chunk_size.saturating_mul(PREALLOCATED_CHUNKS));
    let mut data = Vec::with_capacity(reserve);
    let mut buffer = vec![0u8; chunk_size];
    let mut tracker = ProgressTracker::new(total);

    loop {
        if op.take_cancel() {
            return Ok(Step::Cancelled);
        }

        let bytes_read = read_chunk(&mut reader, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..bytes_read]);

        if let Some(progress) = tracker.advance(bytes_read) {
            op.state().set_bytes_transferred(progress.bytes_moved);
            sink.emit(TransferEvent::Progress(progress));
        }
    }

    if let Some(progress) = tracker.finish() {
        op.state().set_total_bytes(progress.total_bytes);
        sink.emit(TransferEvent::Progress(progress));
    }

    op.state().set_bytes_transferred(data.len() as u64);
    Ok(Step::Done(Completion::Read { data }, started.elapsed()))
}

fn write_loop<W: Write + Syncable>(
    op: &ActiveOperation,
    mut writer: W,
    data: &[u8],
    options: &TransferOptions,
    sink: &dyn EventSink,
) -> io::Result<Step> {
    let started = Instant::now();
    let total = data.len() as u64;
    op.state().set_total_bytes(total);
    sink.emit(TransferEvent::Started {
        mode: TransferMode::Write,
        total_bytes: total,
    });

    let mut tracker = ProgressTracker::new(total);

    for chunk in data.chunks(options.chunk_size) {
        if op.take_cancel() {
            return Ok(Step::Cancelled);
        }

        writer.write_all(chunk)?;

        if let Some(progress) = tracker.advance(chunk.len()) {
            op.state().set_bytes_transferred(progress.bytes_moved);
            sink.emit(TransferEvent::Progress(progress));
        }
    }

    writer.flush()?;
    if options.sync_on_complete {
        writer.sync()?;
    }

    op.state().set_bytes_transferred(total);
    Ok(Step::Done(
        Completion::Write {
            bytes_written: total,
        },
        started.elapsed(),
    ))
}

/// Fill `buf` completely unless the reader hits end of file first.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Durable flush for write destinations.
trait Syncable {
    fn sync(&mut self) -> io::Result<()>;
}

impl Syncable for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}
