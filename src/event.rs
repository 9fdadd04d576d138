//! Event delivery from the transfer worker to its consumers.
//!
//! The engine reports everything through an [`EventSink`], so it never knows
//! whether the consumer is a CLI, a GUI polling a channel, or a test. Events
//! of one operation are delivered in emission order and the terminal event
//! (`Completed`, `Failed` or `Cancelled`) is always the last one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;

use crate::error::{ErrorKind, TransferError};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferMode {
    Read,
    Write,
}

/// A unit of work submitted to the controller. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    /// Read the whole file into memory
    Read { path: PathBuf },
    /// Replace the file contents with `data`
    Write { path: PathBuf, data: Vec<u8> },
}

impl TransferRequest {
    pub fn read(path: impl Into<PathBuf>) -> Self {
        TransferRequest::Read { path: path.into() }
    }

    pub fn write(path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        TransferRequest::Write {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn mode(&self) -> TransferMode {
        match self {
            TransferRequest::Read { .. } => TransferMode::Read,
            TransferRequest::Write { .. } => TransferMode::Write,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            TransferRequest::Read { path } | TransferRequest::Write { path, .. } => path,
        }
    }
}

/// Cumulative progress of the running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressEvent {
    /// Bytes moved so far
    pub bytes_moved: u64,
    /// Size of the whole operation
    pub total_bytes: u64,
}

impl ProgressEvent {
    /// Whole percentage, rounded down and capped at 100. Zero when the
    /// total is unknown or empty.
    pub fn percentage(&self) -> u64 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = u128::from(self.bytes_moved) * 100 / u128::from(self.total_bytes);
        pct.min(100) as u64
    }
}

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Completion {
    /// Full file contents
    Read { data: Vec<u8> },
    Write { bytes_written: u64 },
}

impl Completion {
    pub fn mode(&self) -> TransferMode {
        match self {
            Completion::Read { .. } => TransferMode::Read,
            Completion::Write { .. } => TransferMode::Write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TransferError> for ErrorEvent {
    fn from(err: &TransferError) -> Self {
        ErrorEvent {
            kind: err.kind().unwrap_or(ErrorKind::IoError),
            message: err.to_string(),
        }
    }
}

/// Notification emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferEvent {
    /// The file is open and the chunk loop is about to run
    Started { mode: TransferMode, total_bytes: u64 },
    Progress(ProgressEvent),
    Completed(Completion),
    Failed(ErrorEvent),
    Cancelled,
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed(_) | TransferEvent::Failed(_) | TransferEvent::Cancelled
        )
    }
}

/// How an operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(Completion),
    Failed(ErrorEvent),
    Cancelled,
}

/// Receiver side of the event path.
///
/// Implementations are called from the worker thread and must not block for
/// long: the chunk loop waits for `emit` to return.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TransferEvent);
}

/// Forwards events into an unbounded FIFO channel.
pub struct ChannelSink {
    sender: Sender<TransferEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<TransferEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: TransferEvent) {
        // A consumer that dropped its receiver no longer cares.
        let _ = self.sender.send(event);
    }
}

/// Callback registration: runs `F` on the worker thread for every event.
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: Fn(TransferEvent) + Send + Sync,
{
    fn emit(&self, event: TransferEvent) {
        (self.0)(event)
    }
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: TransferEvent) {}
}

/// Consumer handle for one accepted operation.
///
/// Events arrive in emission order. Once the terminal event has been
/// returned the engine is idle again, so the next start command is accepted.
/// After that the stream is finished and `recv` reports
/// [`TransferError::WorkerUnavailable`].
pub struct Transfer {
    mode: TransferMode,
    events: Receiver<TransferEvent>,
    released: Receiver<()>,
}

impl Transfer {
    pub(crate) fn new(
        mode: TransferMode,
        events: Receiver<TransferEvent>,
        released: Receiver<()>,
    ) -> Self {
        Self {
            mode,
            events,
            released,
        }
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Block until the next event.
    pub fn recv(&self) -> Result<TransferEvent, TransferError> {
        let event = self
            .events
            .recv()
            .map_err(|_| TransferError::WorkerUnavailable)?;
        Ok(self.settled(event))
    }

    /// Block for at most `timeout`. `Ok(None)` means nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<TransferEvent>, TransferError> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(self.settled(event))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransferError::WorkerUnavailable),
        }
    }

    /// Poll without blocking, for consumers driving their own frame loop.
    pub fn try_recv(&self) -> Result<Option<TransferEvent>, TransferError> {
        match self.events.try_recv() {
            Ok(event) => Ok(Some(self.settled(event))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransferError::WorkerUnavailable),
        }
    }

    /// Blocking iterator that yields every event up to and including the
    /// terminal one.
    pub fn iter(&self) -> Events<'_> {
        Events {
            transfer: self,
            done: false,
        }
    }

    /// Drain the stream and return how the operation ended.
    pub fn wait(self) -> Result<TransferOutcome, TransferError> {
        for event in self.iter() {
            match event {
                TransferEvent::Completed(completion) => {
                    return Ok(TransferOutcome::Completed(completion));
                }
                TransferEvent::Failed(err) => return Ok(TransferOutcome::Failed(err)),
                TransferEvent::Cancelled => return Ok(TransferOutcome::Cancelled),
                TransferEvent::Started { .. } | TransferEvent::Progress(_) => {}
            }
        }
        Err(TransferError::WorkerUnavailable)
    }

    // The worker frees the running slot right after emitting the terminal
    // event; hold it back until then.
    fn settled(&self, event: TransferEvent) -> TransferEvent {
        if event.is_terminal() {
            let _ = self.released.recv();
        }
        event
    }
}

pub struct Events<'a> {
    transfer: &'a Transfer,
    done: bool,
}

impl Iterator for Events<'_> {
    type Item = TransferEvent;

    fn next(&mut self) -> Option<TransferEvent> {
        if self.done {
            return None;
        }
        match self.transfer.recv() {
            Ok(event) => {
                self.done = event.is_terminal();
                Some(event)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};

    /// A release signal that has already fired.
    fn idle() -> Receiver<()> {
        bounded(0).1
    }

    fn progress(bytes_moved: u64, total_bytes: u64) -> ProgressEvent {
        ProgressEvent {
            bytes_moved,
            total_bytes,
        }
    }

    #[test]
    fn percentage_rounds_down() {
        assert_eq!(progress(65_536, 150_000).percentage(), 43);
        assert_eq!(progress(131_072, 150_000).percentage(), 87);
        assert_eq!(progress(150_000, 150_000).percentage(), 100);
    }

    #[test]
    fn percentage_handles_empty_and_overshoot() {
        assert_eq!(progress(0, 0).percentage(), 0);
        assert_eq!(progress(200, 100).percentage(), 100);
        assert_eq!(progress(u64::MAX, u64::MAX).percentage(), 100);
    }

    #[test]
    fn request_accessors() {
        let read = TransferRequest::read("/tmp/a");
        assert_eq!(read.mode(), TransferMode::Read);
        assert_eq!(read.path(), Path::new("/tmp/a"));

        let write = TransferRequest::write("/tmp/b", vec![1, 2, 3]);
        assert_eq!(write.mode(), TransferMode::Write);
        assert_eq!(write.path(), Path::new("/tmp/b"));
    }

    #[test]
    fn iterator_stops_after_terminal_event() {
        let (tx, rx) = unbounded();
        let sink = ChannelSink::new(tx);
        sink.emit(TransferEvent::Progress(progress(1, 2)));
        sink.emit(TransferEvent::Cancelled);
        sink.emit(TransferEvent::Progress(progress(2, 2)));

        let transfer = Transfer::new(TransferMode::Read, rx, idle());
        let seen: Vec<_> = transfer.iter().collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], TransferEvent::Cancelled);
    }

    #[test]
    fn wait_reports_lost_worker() {
        let (tx, rx) = unbounded();
        tx.send(TransferEvent::Progress(progress(1, 2))).unwrap();
        drop(tx);

        let transfer = Transfer::new(TransferMode::Write, rx, idle());
        assert!(matches!(
            transfer.wait(),
            Err(TransferError::WorkerUnavailable)
        ));
    }

    #[test]
    fn try_recv_polls() {
        let (tx, rx) = unbounded();
        let transfer = Transfer::new(TransferMode::Read, rx, idle());
        assert_eq!(transfer.try_recv().unwrap(), None);
        tx.send(TransferEvent::Cancelled).unwrap();
        assert_eq!(transfer.try_recv().unwrap(), Some(TransferEvent::Cancelled));
    }

    #[test]
    fn recv_blocks_until_event_then_reports_lost_worker() {
        let (tx, rx) = unbounded();
        let transfer = Transfer::new(TransferMode::Read, rx, idle());

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send(TransferEvent::Progress(progress(1, 2))).unwrap();
        });
        assert_eq!(
            transfer.recv().unwrap(),
            TransferEvent::Progress(progress(1, 2))
        );
        sender.join().unwrap();

        assert!(matches!(
            transfer.recv(),
            Err(TransferError::WorkerUnavailable)
        ));
    }

    #[test]
    fn recv_timeout_distinguishes_timeout_from_disconnect() {
        let (tx, rx) = unbounded();
        let transfer = Transfer::new(TransferMode::Write, rx, idle());
        assert_eq!(
            transfer.recv_timeout(Duration::from_millis(10)).unwrap(),
            None
        );

        tx.send(TransferEvent::Cancelled).unwrap();
        assert_eq!(
            transfer.recv_timeout(Duration::from_millis(10)).unwrap(),
            Some(TransferEvent::Cancelled)
        );

        drop(tx);
        assert!(matches!(
            transfer.recv_timeout(Duration::from_millis(10)),
            Err(TransferError::WorkerUnavailable)
        ));
    }

    #[test]
    fn terminal_event_waits_for_release() {
        let (tx, rx) = unbounded();
        let (release, released) = bounded::<()>(0);
        let transfer = Transfer::new(TransferMode::Read, rx, released);
        tx.send(TransferEvent::Progress(progress(1, 1))).unwrap();
        tx.send(TransferEvent::Cancelled).unwrap();

        // Non-terminal events do not wait.
        assert!(matches!(transfer.recv(), Ok(TransferEvent::Progress(_))));

        let started = std::time::Instant::now();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(release);
        });
        assert_eq!(transfer.recv().unwrap(), TransferEvent::Cancelled);
        assert!(started.elapsed() >= Duration::from_millis(20));
        releaser.join().unwrap();
    }

    #[test]
    fn null_sink_discards_events() {
        let sink: &dyn EventSink = &NullSink;
        sink.emit(TransferEvent::Progress(progress(1, 2)));
        sink.emit(TransferEvent::Cancelled);
    }

    #[test]
    fn fn_sink_invokes_callback() {
        use std::sync::Mutex;

        let seen = Mutex::new(Vec::new());
        let sink = FnSink(|event: TransferEvent| seen.lock().unwrap().push(event));
        sink.emit(TransferEvent::Cancelled);
        assert_eq!(seen.lock().unwrap().as_slice(), &[TransferEvent::Cancelled]);
    }

    #[test]
    fn events_serialize_for_frontends() {
        let json = serde_json::to_string(&TransferEvent::Progress(progress(10, 20))).unwrap();
        assert_eq!(json, r#"{"Progress":{"bytes_moved":10,"total_bytes":20}}"#);
    }
}
