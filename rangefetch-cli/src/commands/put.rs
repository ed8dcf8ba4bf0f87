//! `rangefetch put`: upload a local file.

use std::path::PathBuf;

use clap::Args;
use rangefetch::{Reactor, SparseBuffer, TransferRequest};

use super::run_transfer;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct PutArgs {
    /// Destination resource
    pub url: String,

    /// Local file to upload
    pub file: PathBuf,

    /// Offset of the first byte of the file within the remote resource
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// Extra request header (`Name: value`), repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
}

pub fn run(reactor: &Reactor, args: PutArgs) -> Result<(), CliError> {
    let bytes = std::fs::read(&args.file).map_err(|source| CliError::ReadInput {
        path: args.file.clone(),
        source,
    })?;
    let size = bytes.len();
    let upload = SparseBuffer::from_bytes(args.start, bytes);

    let outcome = run_transfer(reactor, |callback| {
        TransferRequest::put(&args.url, upload, args.headers.clone(), callback)
    })?;

    eprintln!(
        "{}: uploaded {} bytes from {}",
        outcome.request.uri(),
        size,
        args.file.display()
    );
    Ok(())
}
