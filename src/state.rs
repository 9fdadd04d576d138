use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::error::TransferError;
use crate::event::ProgressEvent;

/// The admitted operation as seen by `cancel` and `begin`.
#[derive(Debug)]
struct Slot {
    token: Arc<AtomicBool>,
    /// Outcome already decided; the terminal event is being delivered.
    committing: bool,
}

/// Shared record of the engine's current (or last) operation.
///
/// Counters are plain atomics so pollers can read them at any time. The
/// running flag and the cancellation token of the active operation live
/// behind one mutex: `cancel` and the engine's final commit both take it,
/// which makes "cancel before the terminal event" race-free.
#[derive(Debug, Default)]
pub struct TransferState {
    bytes_transferred: AtomicU64,
    total_bytes: AtomicU64,
    last_operation_duration_ms: AtomicU64,
    active: Mutex<Option<Slot>>,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Slot>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new operation, or fail with `Busy` if one is still running.
    /// An operation counts as running until its terminal event has been
    /// delivered.
    pub fn begin(self: &Arc<Self>) -> Result<ActiveOperation, TransferError> {
        let mut active = self.lock_active();
        if active.is_some() {
            return Err(TransferError::Busy);
        }
        let token = Arc::new(AtomicBool::new(false));
        *active = Some(Slot {
            token: Arc::clone(&token),
            committing: false,
        });
        self.bytes_transferred.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);

        let (release, released) = bounded(0);
        Ok(ActiveOperation {
            state: Arc::clone(self),
            token,
            _release: release,
            released,
        })
    }

    pub fn is_running(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Request cancellation of the running operation. No-op when idle, and
    /// once the operation's outcome has been settled.
    pub fn cancel(&self) {
        if let Some(slot) = self.lock_active().as_ref() {
            if !slot.committing {
                slot.token.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Progress of the running operation (or the last one, once idle)
    pub fn snapshot(&self) -> ProgressEvent {
        ProgressEvent {
            bytes_moved: self.bytes_transferred.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Duration of the last successful operation; 0 until one completes.
    pub fn last_operation_duration_ms(&self) -> u64 {
        self.last_operation_duration_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn set_total_bytes(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    pub(crate) fn set_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_duration(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.last_operation_duration_ms.store(ms, Ordering::Relaxed);
    }

    fn settle(&self, token: &Arc<AtomicBool>) -> bool {
        let mut active = self.lock_active();
        if let Some(slot) = active.as_mut().filter(|slot| Arc::ptr_eq(&slot.token, token)) {
            slot.committing = true;
        }
        token.swap(false, Ordering::SeqCst)
    }

    fn release(&self, token: &Arc<AtomicBool>) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|slot| Arc::ptr_eq(&slot.token, token)) {
            *active = None;
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.snapshot();
        writeln!(f, "Transfer state:")?;
        writeln!(f, "    Running:           {}", self.is_running())?;
        writeln!(
            f,
            "    Bytes transferred: {} of {} ({}%)",
            progress.bytes_moved,
            progress.total_bytes,
            progress.percentage()
        )?;
        writeln!(
            f,
            "    Last duration:     {} ms",
            self.last_operation_duration_ms()
        )
    }
}

/// Admission ticket of the one operation allowed to run.
///
/// The slot is freed when the ticket is dropped, so a command that never
/// reaches the worker does not wedge the engine.
#[derive(Debug)]
pub struct ActiveOperation {
    state: Arc<TransferState>,
    token: Arc<AtomicBool>,
    // Disconnects `released` once the slot is free.
    _release: Sender<()>,
    released: Receiver<()>,
}

impl ActiveOperation {
    /// Cancellation has been requested for this operation
    pub fn is_cancelled(&self) -> bool {
        self.token.load(Ordering::SeqCst)
    }

    /// Consume a pending cancel request, clearing the flag.
    pub(crate) fn take_cancel(&self) -> bool {
        self.token.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> &TransferState {
        &self.state
    }

    /// Decide the outcome. Returns `true` if a cancel arrived after the last
    /// chunk boundary, in which case the operation must end as cancelled.
    /// Later cancels are ignored; the operation keeps running until dropped.
    pub(crate) fn settle(&self) -> bool {
        self.state.settle(&self.token)
    }

    /// Disconnects once this operation has left the running state.
    pub(crate) fn released(&self) -> Receiver<()> {
        self.released.clone()
    }
}

impl Drop for ActiveOperation {
    fn drop(&mut self) {
        self.state.release(&self.token);
    }
}

/// Cloneable handle that can cancel the running operation from any thread,
/// including a signal handler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<TransferState>,
}

impl CancelHandle {
    pub(crate) fn new(state: Arc<TransferState>) -> Self {
        Self { state }
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_operation_admitted() {
        let state = Arc::new(TransferState::new());
        let first = state.begin().unwrap();
        assert!(state.is_running());
        assert!(matches!(state.begin(), Err(TransferError::Busy)));

        drop(first);
        assert!(!state.is_running());
        assert!(state.begin().is_ok());
    }

    #[test]
    fn cancel_while_idle_is_noop() {
        let state = Arc::new(TransferState::new());
        state.cancel();
        state.cancel();

        let op = state.begin().unwrap();
        assert!(!op.is_cancelled());
        assert!(!op.settle());
    }

    #[test]
    fn cancel_targets_active_operation() {
        let state = Arc::new(TransferState::new());
        let op = state.begin().unwrap();
        CancelHandle::new(Arc::clone(&state)).cancel();
        assert!(op.is_cancelled());
        assert!(op.take_cancel());
        assert!(!op.is_cancelled());
    }

    #[test]
    fn late_cancel_is_reported_by_settle() {
        let state = Arc::new(TransferState::new());
        let op = state.begin().unwrap();
        state.cancel();
        assert!(op.settle());
        drop(op);

        let next = state.begin().unwrap();
        assert!(!next.is_cancelled());
    }

    #[test]
    fn settled_operation_runs_until_dropped() {
        let state = Arc::new(TransferState::new());
        let op = state.begin().unwrap();
        assert!(!op.settle());

        // Outcome is fixed: still running, but cancel no longer lands.
        state.cancel();
        assert!(state.is_running());
        assert!(!op.is_cancelled());
        assert!(matches!(state.begin(), Err(TransferError::Busy)));

        drop(op);
        assert!(!state.is_running());
    }

    #[test]
    fn released_disconnects_after_drop() {
        let state = Arc::new(TransferState::new());
        let op = state.begin().unwrap();
        let released = op.released();
        assert!(matches!(
            released.try_recv(),
            Err(crossbeam_channel::TryRecvError::Empty)
        ));

        drop(op);
        assert!(matches!(
            released.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn dropping_ticket_frees_slot() {
        let state = Arc::new(TransferState::new());
        drop(state.begin().unwrap());
        assert!(!state.is_running());
    }

    #[test]
    fn begin_resets_progress_but_keeps_duration() {
        let state = Arc::new(TransferState::new());
        let op = state.begin().unwrap();
        state.set_total_bytes(100);
        state.set_bytes_transferred(40);
        state.record_duration(Duration::from_millis(12));
        assert_eq!(state.snapshot().percentage(), 40);
        drop(op);

        let _op = state.begin().unwrap();
        assert_eq!(state.snapshot(), ProgressEvent::default());
        assert_eq!(state.last_operation_duration_ms(), 12);
    }

    #[test]
    fn display_summarises_state() {
        let state = Arc::new(TransferState::new());
        let op = state.begin().unwrap();
        state.set_total_bytes(200);
        state.set_bytes_transferred(50);
        state.record_duration(Duration::from_millis(7));

        let text = state.to_string();
        assert!(text.contains("Running:           true"));
        assert!(text.contains("Bytes transferred: 50 of 200 (25%)"));
        assert!(text.contains("Last duration:     7 ms"));

        drop(op);
        assert!(state.to_string().contains("Running:           false"));
    }
}
