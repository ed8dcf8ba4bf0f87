//! `rangefetch get`: download a resource or a byte range of it.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::Args;
use rangefetch::{ByteRange, Reactor, SparseBuffer, TransferRequest};
use tracing::warn;

use super::run_transfer;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Resource to download
    pub url: String,

    /// Byte range as `start-last` (inclusive) or `start-`
    #[arg(short, long)]
    pub range: Option<ByteRange>,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Extra request header (`Name: value`), repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
}

pub fn run(reactor: &Reactor, args: GetArgs) -> Result<(), CliError> {
    let range = args.range.unwrap_or_default();
    let outcome = run_transfer(reactor, |callback| {
        TransferRequest::get(&args.url, range, args.headers.clone(), callback)
    })?;

    let data = &outcome.data;
    report_gaps(data);

    match &args.output {
        Some(path) => {
            let mut file = File::create(path).map_err(CliError::WriteOutput)?;
            write_body(&mut file, data)?;
        }
        None => write_body(&mut io::stdout().lock(), data)?,
    }

    eprintln!(
        "{}: {} bytes at {} (status {})",
        outcome.request.uri(),
        data.len(),
        data.range(),
        outcome
            .request
            .status()
            .map_or_else(|| "-".to_string(), |s| s.to_string())
    );
    Ok(())
}

/// Writes the buffer, zero-filling anything that never arrived.
fn write_body(out: &mut impl Write, data: &SparseBuffer) -> Result<(), CliError> {
    let written = match data.contiguous() {
        Some(bytes) => out.write_all(bytes),
        None => out.write_all(&data.to_vec()),
    };
    written
        .and_then(|()| out.flush())
        .map_err(CliError::WriteOutput)
}

fn report_gaps(data: &SparseBuffer) {
    for gap in data.gaps() {
        warn!(%gap, "range missing from response");
    }
}
