//! Subcommand implementations.
//!
//! Every command builds one [`TransferRequest`], submits it to the reactor and
//! blocks the main thread until its callback has fired.

pub mod delete;
pub mod get;
pub mod put;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rangefetch::{Reactor, SparseBuffer, TransferCallback, TransferRequest, TransferResult};

use crate::error::CliError;

const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// What a finished transfer delivered.
pub struct Outcome {
    pub request: Arc<TransferRequest>,
    pub data: Arc<SparseBuffer>,
}

/// Submits the request built by `build` and waits for its completion.
///
/// Ctrl-C aborts the transfer. Fails if the callback reports failure.
pub fn run_transfer<F>(reactor: &Reactor, build: F) -> Result<Outcome, CliError>
where
    F: FnOnce(TransferCallback) -> TransferResult<Arc<TransferRequest>>,
{
    let (tx, rx) = mpsc::channel();
    let request = build(Box::new(move |_, data, success| {
        tx.send((data, success)).ok();
    }))?;

    let interrupt = Arc::clone(&request);
    ctrlc::set_handler(move || interrupt.abort()).map_err(|e| CliError::Signal(e.to_string()))?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} {bytes} ({bytes_per_sec}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    progress.set_message(request.uri().to_string());

    request.submit(reactor)?;
    let (data, success) = loop {
        match rx.recv_timeout(PROGRESS_TICK) {
            Ok(outcome) => break outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let stats = reactor.stats();
                progress.set_position(stats.bytes_received + stats.bytes_sent);
                progress.tick();
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(CliError::Failed),
        }
    };
    progress.finish_and_clear();

    if !success {
        return Err(request.last_error().map_or(CliError::Failed, CliError::from));
    }
    Ok(Outcome { request, data })
}
