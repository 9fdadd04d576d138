use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::RngCore;
use tracing::{debug, info};

use fxfer::args::{Cli, Command, Payload};
use fxfer::utils::{Interrupt, format_bytes, format_duration_ms, init_logging, throughput};
use fxfer::{APP_NAME, Completion, Transfer, TransferController, TransferEvent, VERSION};

/// Exit status for a transfer stopped by Ctrl+C
const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let log_file = cli
        .log
        .as_ref()
        .map(File::create)
        .transpose()
        .context("cannot create log file")?;
    init_logging(cli.verbose, log_file).context("cannot initialise logging")?;

    let options = cli.transfer_options();
    info!(
        "{} {} - options: {}",
        APP_NAME,
        VERSION,
        options.to_string_flags()
    );

    let controller = TransferController::new(options)?;

    // Handle Ctrl+C
    let interrupt = Interrupt::new(controller.cancel_handle());
    let handler = interrupt.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        handler.trigger();
    })
    .context("error setting Ctrl-C handler")?;

    let session = Session {
        controller,
        interrupt,
        show_progress: !cli.no_progress,
    };

    let finished = match cli.command {
        Command::Read { path } => match session.read(&path)? {
            Some(data) => {
                println!("Read {} from {}", format_bytes(data.len() as u64), path.display());
                session.report_timing(data.len() as u64);
                true
            }
            None => false,
        },
        Command::Write { path, payload } => match session.payload_bytes(payload)? {
            Some(data) => session.write(&path, data)?,
            None => false,
        },
        Command::Copy {
            source,
            destination,
        } => match session.read(&source)? {
            Some(data) => session.write(&destination, data)?,
            None => false,
        },
    };

    session.controller.shutdown();
    if finished {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_CANCELLED))
    }
}

struct Session {
    controller: TransferController,
    interrupt: Interrupt,
    show_progress: bool,
}

impl Session {
    /// `Ok(None)` means Ctrl+C stopped the read, or came before it started.
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        if self.interrupted() {
            return Ok(None);
        }
        let transfer = self.controller.start_read(path)?;
        match self.drive(transfer)? {
            Some(Completion::Read { data }) => Ok(Some(data)),
            Some(other) => bail!("unexpected completion for read: {:?}", other.mode()),
            None => Ok(None),
        }
    }

    /// Returns `false` if the write was cancelled or never started.
    fn write(&self, path: &Path, data: Vec<u8>) -> Result<bool> {
        if self.interrupted() {
            return Ok(false);
        }
        let transfer = self.controller.start_write(path, data)?;
        match self.drive(transfer)? {
            Some(Completion::Write { bytes_written }) => {
                println!("Wrote {} to {}", format_bytes(bytes_written), path.display());
                self.report_timing(bytes_written);
                Ok(true)
            }
            Some(other) => bail!("unexpected completion for write: {:?}", other.mode()),
            None => Ok(false),
        }
    }

    fn payload_bytes(&self, payload: Payload) -> Result<Option<Vec<u8>>> {
        if let Some(input) = payload.input {
            return self.read(&input);
        }

        let len = payload.random.unwrap_or(0);
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        debug!(bytes = len, "generated random payload");
        Ok(Some(data))
    }

    fn interrupted(&self) -> bool {
        if self.interrupt.is_triggered() {
            println!("Cancelled.");
            return true;
        }
        false
    }

    /// Drain one transfer, printing progress. `Ok(None)` means it was cancelled.
    fn drive(&self, transfer: Transfer) -> Result<Option<Completion>> {
        let mut printed = false;

        for event in transfer.iter() {
            match event {
                TransferEvent::Started { mode, total_bytes } => {
                    debug!(?mode, total_bytes, "transfer started");
                }
                TransferEvent::Progress(progress) => {
                    if self.show_progress {
                        print!(
                            "\r{}% - {} of {}",
                            progress.percentage(),
                            format_bytes(progress.bytes_moved),
                            format_bytes(progress.total_bytes)
                        );
                        let _ = std::io::stdout().flush();
                        printed = true;
                    }
                }
                TransferEvent::Completed(completion) => {
                    if printed {
                        println!();
                    }
                    return Ok(Some(completion));
                }
                TransferEvent::Failed(err) => {
                    if printed {
                        println!();
                    }
                    bail!("{:?}: {}", err.kind, err.message);
                }
                TransferEvent::Cancelled => {
                    if printed {
                        println!();
                    }
                    println!("Cancelled.");
                    return Ok(None);
                }
            }
        }

        bail!("transfer worker stopped before the operation finished")
    }

    fn report_timing(&self, bytes: u64) {
        let ms = self.controller.last_operation_duration_ms();
        println!(
            "Elapsed time: {} ({}/s)",
            format_duration_ms(ms),
            format_bytes(throughput(bytes, ms))
        );
    }
}
