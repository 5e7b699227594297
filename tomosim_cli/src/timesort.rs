use super::helpers::{self, GlobalConfiguration, Subcommand};
use anyhow::{bail, Result};
use clap::{Args, Parser, ValueHint};
use std::path::PathBuf;
use std::process::ExitCode;
use tomosim::history::HistoryKind;
use tomosim::timesort::{verify_sorted, TimeSorter};

#[derive(Args)]
#[group(multiple = false)]
struct Source {
    /// The input is a PHG history file.
    #[arg(long, short = 'p')]
    phg: bool,
    /// The input is a collimator history file.
    #[arg(long, short = 'c')]
    collimator: bool,
    /// The input is a detector history file.
    #[arg(long, short = 'd')]
    detector: bool,
}

/// Sort a history file by decay time.
#[derive(Parser)]
pub struct Opts {
    #[command(flatten)]
    source: Source,
    /// Only check whether the file is already time sorted.
    #[arg(long, short = 't')]
    test_sorted: bool,
    /// Delete the input file after sorting.
    #[arg(long, short = 'r')]
    remove_input: bool,
    /// Size of the main sort buffer in megabytes.
    #[arg(default_value = "64", long, value_name = "MB")]
    buffer: usize,
    /// Path to the input history file.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Path to the sorted output file (not used with --test-sorted).
    #[arg(value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let reader = helpers::open_history(&self.input)?;
        let expected = if self.source.collimator {
            HistoryKind::Collimator
        } else if self.source.detector {
            HistoryKind::Detector
        } else {
            HistoryKind::Phg
        };
        helpers::require_kind(&reader, expected, &self.input)?;
        drop(reader);

        if self.test_sorted {
            return match verify_sorted(&self.input)? {
                Ok(()) => {
                    println!("'{}' is time sorted.", self.input.display());
                    Ok(ExitCode::SUCCESS)
                }
                Err((before, after)) => {
                    println!(
                        "'{}' is NOT time sorted: decay at {after} s follows decay at {before} s.",
                        self.input.display()
                    );
                    Ok(ExitCode::FAILURE)
                }
            };
        }

        let Some(output) = &self.output else {
            bail!("no sorted output file name supplied");
        };

        if !cfg.quiet {
            println!(
                "Sorting input file:\n  '{}'\n  into output file:\n  '{}'.",
                self.input.display(),
                output.display()
            );
            println!("Buffer size is {} megabytes.", self.buffer);
        }

        let mut sorter = TimeSorter::new(self.buffer)?;
        let counters = sorter.sort(&self.input, output)?;

        if !cfg.quiet {
            for message in sorter.messages() {
                println!("{message}");
            }
            println!(
                "Sorted {} decays through {} subfiles and {} merge batches.",
                counters.num_decays_read, counters.num_runs, counters.num_merge_batches
            );
            println!("Final file and sorting process now completed.");
        }

        if self.remove_input {
            if !cfg.quiet {
                println!("Deleting input history file, as requested.");
            }
            helpers::remove_input(&self.input);
        }

        Ok(ExitCode::SUCCESS)
    }
}
