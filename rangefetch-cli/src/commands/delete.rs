//! `rangefetch delete`: remove a remote resource.

use clap::Args;
use rangefetch::{Reactor, TransferRequest};

use super::run_transfer;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct DeleteArgs {
    /// Resource to delete
    pub url: String,

    /// Extra request header (`Name: value`), repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
}

pub fn run(reactor: &Reactor, args: DeleteArgs) -> Result<(), CliError> {
    let outcome = run_transfer(reactor, |callback| {
        TransferRequest::delete(&args.url, args.headers.clone(), callback)
    })?;
    eprintln!("{}: deleted", outcome.request.uri());
    Ok(())
}
