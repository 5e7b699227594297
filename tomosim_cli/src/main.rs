#![allow(missing_docs)]

use clap::Parser;
use std::process::ExitCode;
use tomosim_cli::{Opts, Subcommand};

fn main() -> ExitCode {
    let opts = Opts::parse();

    match opts.subcommand.run(&opts.configuration) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            tomosim_cli::exit_code_for(&err)
        }
    }
}
