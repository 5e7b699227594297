use super::helpers::{self, GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use prettytable::{format, row, Table};
use std::path::PathBuf;
use std::process::ExitCode;

/// Print the header of a history file.
#[derive(Parser)]
pub struct Opts {
    /// Path to the history file.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let reader = helpers::open_history(&self.input)?;
        let header = reader.header();
        let params = &header.params;

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);

        table.add_row(row!["history kind", header.kind.name()]);
        table.add_row(row!["header version", header.version]);
        table.add_row(row!["events to simulate", params.num_to_simulate]);
        table.add_row(row!["random seed", params.random_seed]);
        table.add_row(row!["length of scan (s)", params.length_of_scan]);
        table.add_row(row!["acceptance angle (deg)", params.acceptance_angle]);
        table.add_row(row!["minimum energy (keV)", params.minimum_energy]);
        table.add_row(row!["photon energy (keV)", params.photon_energy_kev]);
        table.add_row(row!["isotope", format!("{:?}", params.isotope)]);
        table.add_row(row!["scan mode", format!("{:?}", params.scan_mode)]);
        table.add_row(row!["forced detection", params.is_forced_detection]);
        table.add_row(row!["stratification", params.is_stratification]);
        table.add_row(row!["forced non-absorption", params.is_forced_non_absorption]);
        table.add_row(row![
            "positron range adjustment",
            params.is_adjust_for_positron_range
        ]);
        table.add_row(row![
            "non-collinearity adjustment",
            params.is_adjust_for_non_collinearity
        ]);
        table.add_row(row!["polarization", params.is_model_polarization]);
        table.add_row(row![
            "coherent scatter in object",
            params.is_model_coherent_in_obj
        ]);
        table.add_row(row![
            "coincidence window (ns)",
            params.detector.coincidence_timing_window_ns
        ]);
        table.add_row(row![
            "energy resolution (% FWHM)",
            params.detector.energy_resolution_percentage
        ]);
        table.add_row(row![
            "reference energy (keV)",
            params.detector.reference_energy
        ]);
        table.add_row(row!["time sorted", header.is_time_sorted]);
        table.add_row(row!["randoms added", header.is_randoms_added]);
        table.add_row(row![
            "attenuation corrected",
            header.is_attenuation_corrected
        ]);

        let target = params.cylinders.target;
        table.add_row(row![
            "target cylinder",
            format!(
                "r = {} cm, z = [{}, {}] cm",
                target.radius, target.z_min, target.z_max
            )
        ]);
        let object = params.cylinders.object;
        table.add_row(row![
            "object cylinder",
            format!(
                "r = {} cm, z = [{}, {}] cm",
                object.radius, object.z_min, object.z_max
            )
        ]);

        table.printstd();

        Ok(ExitCode::SUCCESS)
    }
}
