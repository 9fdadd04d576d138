use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

use crate::state::CancelHandle;

/// Install the global tracing subscriber. Output goes to stderr and, if
/// given, to `log_file` as well. `RUST_LOG` takes precedence over `verbose`.
pub fn init_logging(verbose: bool, log_file: Option<File>) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
}

/// Ctrl+C latch. Cancels whatever is running and remembers the request, so
/// the caller can refuse to start anything afterwards.
#[derive(Debug, Clone)]
pub struct Interrupt {
    requested: Arc<AtomicBool>,
    cancel: CancelHandle,
}

impl Interrupt {
    pub fn new(cancel: CancelHandle) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

pub fn format_duration_ms(ms: u64) -> String {
    let (secs, millis) = (ms / 1000, ms % 1000);
    let (min, sec) = (secs / 60, secs % 60);

    if min > 0 {
        format!("{}m {:02}.{:03}s", min, sec, millis)
    } else {
        format!("{}.{:03}s", sec, millis)
    }
}

/// Throughput in bytes per second; 0 when the duration rounds to nothing.
pub fn throughput(bytes: u64, ms: u64) -> u64 {
    if ms == 0 {
        return 0;
    }
    (u128::from(bytes) * 1000 / u128::from(ms)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransferEngine, TransferOptions};

    #[test]
    fn interrupt_is_remembered_while_idle() {
        let engine = TransferEngine::new(TransferOptions::default()).unwrap();
        let interrupt = Interrupt::new(engine.cancel_handle());
        assert!(!interrupt.is_triggered());

        interrupt.clone().trigger();
        assert!(interrupt.is_triggered());
        assert!(!engine.is_running());
    }

    #[test]
    fn interrupt_cancels_running_operation() {
        let engine = TransferEngine::new(TransferOptions::default()).unwrap();
        let interrupt = Interrupt::new(engine.cancel_handle());
        let op = engine.begin().unwrap();

        interrupt.trigger();
        assert!(op.is_cancelled());
        assert!(interrupt.is_triggered());
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(64 * 1024), "64.0 KiB");
        assert_eq!(format_bytes(150_000), "146.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration_ms(0), "0.000s");
        assert_eq!(format_duration_ms(1_234), "1.234s");
        assert_eq!(format_duration_ms(125_007), "2m 05.007s");
    }

    #[test]
    fn throughput_per_second() {
        assert_eq!(throughput(1000, 0), 0);
        assert_eq!(throughput(1000, 500), 2000);
    }
}
