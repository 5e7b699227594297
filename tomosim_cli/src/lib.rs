#![allow(clippy::missing_errors_doc)]
#![allow(missing_docs)]

mod addrandoms;
mod helpers;
mod read;
mod timesort;

use anyhow::Result;
use clap::Parser;
use enum_dispatch::enum_dispatch;
use std::process::ExitCode;

#[derive(Parser)]
pub struct GlobalConfiguration {
    /// Suppress progress messages.
    #[arg(long, short)]
    pub quiet: bool,
}

#[enum_dispatch]
pub trait Subcommand {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode>;
}

#[enum_dispatch(Subcommand)]
#[derive(Parser)]
pub enum SubcommandEnum {
    Addrandoms(addrandoms::Opts),
    Read(read::Opts),
    Timesort(timesort::Opts),
}

#[derive(Parser)]
#[command(
    arg_required_else_help = true,
    author,
    about,
    disable_help_subcommand = true,
    name = "tomosim",
    version
)]
pub struct Opts {
    #[command(flatten)]
    pub configuration: GlobalConfiguration,
    #[command(subcommand)]
    pub subcommand: SubcommandEnum,
}

/// The exit code for a failed run: 1 for setup problems, 2 for runtime
/// fatals, 3 for cancellation.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    err.downcast_ref::<tomosim::Error>()
        .map_or(ExitCode::from(1), |err| ExitCode::from(err.exit_code()))
}
