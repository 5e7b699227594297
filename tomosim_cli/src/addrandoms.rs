use super::helpers::{self, GlobalConfiguration, Subcommand};
use anyhow::{bail, Result};
use clap::{Parser, ValueHint};
use std::path::PathBuf;
use std::process::ExitCode;
use tomosim::coincidence::{CoincidenceCounters, CoincidenceEngine, DefaultPolicy, MAX_TW_DECAYS};
use tomosim::params::TriplesMethod;

/// Scan a time-sorted list-mode file, add randoms, and delete triples.
#[derive(Parser)]
pub struct Opts {
    /// Only scan the windows and report the histogram, writing nothing.
    #[arg(long, short = 't')]
    test_window: bool,
    /// Delete the input file after processing.
    #[arg(long, short = 'r')]
    remove_input: bool,
    /// Coincidence timing window in nanoseconds; defaults to the value in
    /// the file header.
    #[arg(long, value_name = "NS")]
    window: Option<f64>,
    /// Pair every photon combination in multi-photon windows instead of
    /// deleting them as triples.
    #[arg(long)]
    pair_all: bool,
    /// Path to the time-sorted input history file.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Path to the randoms-added output file (not used with --test-window).
    #[arg(value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let mut reader = helpers::open_history(&self.input)?;
        let mut header = reader.header().clone();

        if let Some(window) = self.window {
            header.params.detector.coincidence_timing_window_ns = window;
        }
        if self.pair_all {
            header.params.detector.triples_method = TriplesMethod::PairAll;
        }
        header.params.detector.do_randoms_processing = true;

        if !cfg.quiet {
            println!("Name of input history file: {}.", self.input.display());
            println!(
                "Coincidence window = {:.3} nanoseconds.",
                header.params.detector.coincidence_timing_window_ns
            );
        }

        let engine = CoincidenceEngine::new(&header, DefaultPolicy)?;

        let counters = if self.test_window {
            engine.process::<_, std::fs::File>(&mut reader, None)?
        } else {
            let Some(output) = &self.output else {
                bail!("no randoms-added output file name supplied");
            };
            if !cfg.quiet {
                println!(
                    "Name of output randoms-added history file: {}.",
                    output.display()
                );
            }

            let mut writer = helpers::create_history(output, header.clone())?;
            let counters = engine.process(&mut reader, Some(&mut writer))?;

            // mark the output as randoms-added
            writer.header_mut().is_randoms_added = true;
            writer.rewrite_header()?;
            writer.into_inner()?;
            counters
        };

        if !cfg.quiet {
            print_report(&counters);
        }

        if self.remove_input && !self.test_window {
            helpers::remove_input(&self.input);
        }

        Ok(ExitCode::SUCCESS)
    }
}

fn print_report(counters: &CoincidenceCounters) {
    println!("\n\tNumber of decays read in: {}", counters.num_decays_read);
    println!(
        "\n\tNumber of decays written out: {}",
        counters.num_written
    );
    println!(
        "\tOf the decays written out, {} were written out unchanged.",
        counters.num_unchanged
    );
    println!(
        "\tOf the decays written out, {} were randoms created by addrandoms.",
        counters.num_random
    );
    println!(
        "\n\tNumber of decays lost as triples: {}",
        counters.num_lost_triples
    );
    println!(
        "\tNumber of decays lost to correct windowing: {}",
        counters.num_lost_correct_window
    );

    println!("\n\tHistogram of the number of decays found per time window:");
    println!(
        "\tTime windows with 1 decay  =\t\t{}",
        counters.decays_per_window[0]
    );
    for decays in 2..MAX_TW_DECAYS {
        println!(
            "\tTime windows with {decays} decays =\t\t{}",
            counters.decays_per_window[decays - 1]
        );
    }
    println!(
        "\tTime windows with {MAX_TW_DECAYS} or more decays =\t{}",
        counters.decays_per_window[MAX_TW_DECAYS - 1]
    );
}
