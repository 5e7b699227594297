//! The run-time parameter block. Read-only after initialization; a copy is
//! embedded in every history-file header.

use crate::geometry::Cylinder;
use serde::{Deserialize, Serialize};

/// Supported positron emitters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Isotope {
    /// No isotope selected.
    #[default]
    None,
    /// Fluorine-18.
    F18,
    /// Carbon-11.
    C11,
    /// Oxygen-15.
    O15,
    /// Sodium-22.
    Na22,
    /// Technetium-99m (SPECT).
    Tc99m,
}

/// How the overall scan simulates.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ScanMode {
    /// Single-photon scan.
    #[default]
    Spect,
    /// PET, tracking only coincident pairs.
    PetCoincidencesOnly,
    /// PET, tracking coincidences plus unpaired singles.
    PetCoincidencesPlusSingles,
}

/// How a window with three or more photons is handled.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum TriplesMethod {
    /// Drop every decay in the window.
    #[default]
    DeleteTriples,
    /// Pair every blue/pink combination (example policy).
    PairAll,
}

/// Detector-stage parameters.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectorParams {
    /// FWHM energy resolution as a percentage at `reference_energy`;
    /// negative disables blurring.
    pub energy_resolution_percentage: f64,
    /// Energy at which the resolution percentage is quoted, keV.
    pub reference_energy: f64,
    /// FWHM of the detection-time blur in seconds; zero disables.
    pub photon_time_fwhm: f64,
    /// Force at least one interaction in the crystal.
    pub do_forced_interaction: bool,
    /// Coincidence timing window in nanoseconds.
    pub coincidence_timing_window_ns: f64,
    /// Triples handling for randoms processing.
    pub triples_method: TriplesMethod,
    /// Whether randoms processing is enabled for this detector.
    pub do_randoms_processing: bool,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            energy_resolution_percentage: -1.0,
            reference_energy: 511.0,
            photon_time_fwhm: 0.0,
            do_forced_interaction: false,
            coincidence_timing_window_ns: 0.0,
            triples_method: TriplesMethod::default(),
            do_randoms_processing: false,
        }
    }
}

/// The geometry cylinders carried in every header.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct GeometryCylinders {
    /// Photons that reach this cylinder are "detected".
    pub target: Cylinder,
    /// Contains the object voxels.
    pub object: Cylinder,
    /// Critical zone for acceptance-angle stratification.
    pub critical_zone: Cylinder,
    /// Bounds for safe tracking.
    pub limit: Cylinder,
}

impl Default for GeometryCylinders {
    fn default() -> Self {
        let unit = Cylinder {
            radius: 1.0,
            z_min: -1.0,
            z_max: 1.0,
            center_x: 0.0,
            center_y: 0.0,
        };
        Self {
            target: unit,
            object: unit,
            critical_zone: unit,
            limit: unit,
        }
    }
}

/// The complete run-time parameter block.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RunTimeParams {
    /// Number of decays requested.
    pub num_to_simulate: u64,
    /// Whether `num_to_simulate` was computed by the scan rather than given.
    pub is_calc_events_to_simulate: bool,
    /// RNG seed for the run.
    pub random_seed: u64,
    /// Length of the scan in seconds.
    pub length_of_scan: f64,
    /// Acceptance angle, degrees.
    pub acceptance_angle: f64,
    /// Sine of the acceptance angle.
    pub acceptance_angle_sine: f64,
    /// Minimum photon energy, keV; photons below it are discarded.
    pub minimum_energy: f64,
    /// Weight-window minimum ratio; scatter weights falling below it play
    /// Russian roulette. Zero disables the window.
    pub min_ww_ratio: f64,
    /// Weight-window maximum ratio. Zero disables the window.
    pub max_ww_ratio: f64,
    /// Isotope simulated.
    pub isotope: Isotope,
    /// Emission photon energy, keV.
    pub photon_energy_kev: f64,
    /// Scan mode.
    pub scan_mode: ScanMode,
    /// Forced detection enabled.
    pub is_forced_detection: bool,
    /// Stratified emission sampling enabled.
    pub is_stratification: bool,
    /// Forced non-absorption (interaction weighting) enabled.
    pub is_forced_non_absorption: bool,
    /// A history file is written.
    pub is_history_file: bool,
    /// Positron range adjustment enabled.
    pub is_adjust_for_positron_range: bool,
    /// Pair non-collinearity adjustment enabled.
    pub is_adjust_for_non_collinearity: bool,
    /// The productivity table was computed by a previous run.
    pub is_computed_productivity_table: bool,
    /// Treat voxels as point sources.
    pub is_voxel_point_source: bool,
    /// Treat voxels as line sources.
    pub is_voxel_line_source: bool,
    /// Model polarization of annihilation pairs.
    pub is_model_polarization: bool,
    /// Model coherent scatter in the object.
    pub is_model_coherent_in_obj: bool,
    /// Model coherent scatter in the collimator/detector.
    pub is_model_coherent_in_tomo: bool,
    /// Multi-emission isotopes (not simulated).
    pub is_multi_emission: bool,
    /// Detector parameters.
    pub detector: DetectorParams,
    /// Geometry cylinders.
    pub cylinders: GeometryCylinders,
}

impl Default for RunTimeParams {
    fn default() -> Self {
        Self {
            num_to_simulate: 0,
            is_calc_events_to_simulate: true,
            random_seed: 0,
            length_of_scan: 0.0,
            acceptance_angle: 90.0,
            acceptance_angle_sine: 1.0,
            minimum_energy: 0.0,
            min_ww_ratio: 0.0,
            max_ww_ratio: 0.0,
            isotope: Isotope::default(),
            photon_energy_kev: 511.0,
            scan_mode: ScanMode::default(),
            is_forced_detection: false,
            is_stratification: false,
            is_forced_non_absorption: false,
            is_history_file: true,
            is_adjust_for_positron_range: false,
            is_adjust_for_non_collinearity: false,
            is_computed_productivity_table: false,
            is_voxel_point_source: false,
            is_voxel_line_source: false,
            is_model_polarization: false,
            is_model_coherent_in_obj: false,
            is_model_coherent_in_tomo: false,
            is_multi_emission: false,
            detector: DetectorParams::default(),
            cylinders: GeometryCylinders::default(),
        }
    }
}

impl RunTimeParams {
    /// Whether the scan is PET (either coincidence mode).
    #[must_use]
    pub fn is_pet(&self) -> bool {
        matches!(
            self.scan_mode,
            ScanMode::PetCoincidencesOnly | ScanMode::PetCoincidencesPlusSingles
        )
    }

    /// Whether any importance-sampling feature is on. Randoms processing
    /// refuses files produced with one of these.
    #[must_use]
    pub fn uses_importance_sampling(&self) -> bool {
        self.is_forced_detection
            || self.is_stratification
            || self.is_forced_non_absorption
            || self.detector.do_forced_interaction
    }
}
