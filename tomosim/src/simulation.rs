//! The simulation driver: decays through tracking, collimation, detection,
//! and on to the binner and history file.

use crate::binner::Binner;
use crate::collimator::{CollimatorStats, SlatCollimator};
use crate::detector::{Detector, DetectorGeometry, DetectorStats};
use crate::emission::{DecayGenerator, GeneratedDecay, GeneratorStats};
use crate::error::Result;
use crate::history::HistoryWriter;
use crate::materials::MaterialTable;
use crate::object::ObjectGrid;
use crate::params::{RunTimeParams, ScanMode};
use crate::photon::{Decay, DetectedPhoton, TrackingPhoton};
use crate::prodtbl::ProductivityTable;
use crate::sampling::Sampler;
use crate::tracking::{ObjectTracker, TrackingStats};
use rayon::prelude::*;
use std::io::{Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// Statistics from a completed (or cancelled) run.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimulationReport {
    /// Decay-generator statistics.
    pub generator: GeneratorStats,
    /// Object-tracker statistics.
    pub tracking: TrackingStats,
    /// Collimator statistics.
    pub collimator: CollimatorStats,
    /// Detector statistics.
    pub detector: DetectorStats,
    /// Decays written to the history output.
    pub num_decays_written: u64,
    /// Photons written to the history output.
    pub num_photons_written: u64,
    /// Whether the run stopped on the cancellation flag.
    pub cancelled: bool,
}

/// All detections belonging to one decay.
pub type DecayRecord = (Decay, Vec<DetectedPhoton>);

/// A configured simulation. The tables are read-only during the run; the
/// productivity table accumulates contributions for the next run.
pub struct Simulation<'a> {
    /// The voxelized object.
    pub object: &'a ObjectGrid,
    /// The material table.
    pub materials: &'a MaterialTable,
    /// The run parameters.
    pub params: &'a RunTimeParams,
    /// Optional collimator stage.
    pub collimator: Option<&'a SlatCollimator>,
    /// Optional detector stage.
    pub detector_geometry: Option<DetectorGeometry>,
}

impl Simulation<'_> {
    /// Track one generated decay through every configured stage, returning
    /// the photons that survived to the end of the pipeline.
    fn follow_decay(
        &self,
        generated: GeneratedDecay,
        tracker: &ObjectTracker,
        prodtbl: &mut ProductivityTable,
        report: &mut SimulationReport,
        sampler: &mut Sampler,
    ) -> Result<Vec<DetectedPhoton>> {
        let mut reached_target = Vec::new();

        let GeneratedDecay {
            decay: _,
            mut blue,
            pink,
            polarization,
        } = generated;

        tracker.split_branches(&mut blue, prodtbl, sampler);
        tracker.track(
            blue,
            polarization.as_ref(),
            prodtbl,
            &mut report.tracking,
            sampler,
            &mut reached_target,
        )?;

        if let Some(mut pink) = pink {
            tracker.split_branches(&mut pink, prodtbl, sampler);
            tracker.track(
                pink,
                polarization.as_ref(),
                prodtbl,
                &mut report.tracking,
                sampler,
                &mut reached_target,
            )?;
        }

        let mut survivors: Vec<TrackingPhoton> = Vec::with_capacity(reached_target.len());
        for mut photon in reached_target {
            if let Some(collimator) = self.collimator {
                // one detector head position per decay would also do; per
                // photon matches a continuously rotating camera
                photon.detector_angle = sampler.uniform_to(2.0 * std::f64::consts::PI);
                let kept = collimator.track(
                    &mut photon,
                    self.materials,
                    self.params.minimum_energy,
                    self.params.is_model_coherent_in_tomo,
                    &mut report.collimator,
                    sampler,
                )?;
                if !kept {
                    continue;
                }
            }

            if let Some(geometry) = self.detector_geometry {
                let detector = Detector::new(&self.params.detector, geometry, self.materials);
                if !detector.detect(&mut photon, &mut report.detector, sampler)? {
                    continue;
                }
            }

            survivors.push(photon);
        }

        // PET coincidence-only scans keep a decay only when both photons of
        // the pair survive
        if self.params.scan_mode == ScanMode::PetCoincidencesOnly {
            let has_blue = survivors.iter().any(TrackingPhoton::is_blue);
            let has_pink = survivors.iter().any(|photon| !photon.is_blue());
            if !has_blue || !has_pink {
                return Ok(Vec::new());
            }
        }

        let detector = self
            .detector_geometry
            .map(|geometry| Detector::new(&self.params.detector, geometry, self.materials));

        let mut detections = Vec::with_capacity(survivors.len());
        for photon in survivors {
            let mut detected = photon.to_detected();
            if let Some(detector) = &detector {
                detected.time_since_creation =
                    detector.blur_time(detected.time_since_creation, sampler);
            }
            detections.push(detected);
        }
        Ok(detections)
    }

    /// Run the simulation serially. Detections stream into `writer` and
    /// `binner` when given. The cancellation flag is checked between
    /// decays; when it trips, the run finishes cleanly with
    /// `report.cancelled` set.
    ///
    /// # Errors
    ///
    /// Tracking invariant violations and I/O failures are fatal.
    pub fn run<W: Write + Seek>(
        &self,
        prodtbl: &mut ProductivityTable,
        mut writer: Option<&mut HistoryWriter<W>>,
        mut binner: Option<&mut Binner>,
        cancel: &AtomicBool,
        sampler: &mut Sampler,
    ) -> Result<SimulationReport> {
        let mut report = SimulationReport::default();
        let tracker = ObjectTracker::new(self.object, self.materials, self.params);
        let mut generator = DecayGenerator::new(self.object, self.materials, self.params);

        loop {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }

            let Some(generated) = generator.next_decay(prodtbl, sampler) else {
                break;
            };
            let decay = generated.decay;

            let detections =
                self.follow_decay(generated, &tracker, prodtbl, &mut report, sampler)?;

            if detections.is_empty() {
                continue;
            }

            if let Some(writer) = writer.as_deref_mut() {
                writer.write_decay(&decay)?;
                for photon in &detections {
                    writer.write_photon(photon)?;
                }
                report.num_decays_written += 1;
                report.num_photons_written += detections.len() as u64;
            }
            if let Some(binner) = binner.as_deref_mut() {
                for photon in &detections {
                    binner.accumulate(photon, photon.weight * decay.start_weight);
                }
            }
        }

        report.generator = generator.stats();
        Ok(report)
    }

    /// Run decay-parallel across `num_workers` rayon tasks. Each worker
    /// owns an independent RNG sub-stream, a share of the decay budget, and
    /// a private productivity accumulator; outputs are concatenated in
    /// worker order (not time order — feed them to the time sorter).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::run`].
    pub fn run_parallel(
        &self,
        prodtbl: &ProductivityTable,
        cancel: &AtomicBool,
        num_workers: usize,
    ) -> Result<(Vec<DecayRecord>, SimulationReport)>
    where
        Self: Sync,
    {
        let num_workers = num_workers.max(1);
        let share = self.params.num_to_simulate / num_workers as u64;
        let remainder = self.params.num_to_simulate % num_workers as u64;

        let results: Vec<Result<(Vec<DecayRecord>, SimulationReport)>> = (0..num_workers)
            .into_par_iter()
            .map(|worker| {
                let mut params = self.params.clone();
                params.num_to_simulate = share + u64::from((worker as u64) < remainder);

                let worker_sim = Simulation {
                    object: self.object,
                    materials: self.materials,
                    params: &params,
                    collimator: self.collimator,
                    detector_geometry: self.detector_geometry,
                };

                let mut sampler = Sampler::split(params.random_seed, worker as u64);
                let mut worker_prodtbl = prodtbl.clone();
                let tracker =
                    ObjectTracker::new(worker_sim.object, worker_sim.materials, worker_sim.params);
                let mut generator = DecayGenerator::new(
                    worker_sim.object,
                    worker_sim.materials,
                    worker_sim.params,
                );

                let mut report = SimulationReport::default();
                let mut records = Vec::new();
                loop {
                    if cancel.load(Ordering::Relaxed) {
                        report.cancelled = true;
                        break;
                    }
                    let Some(generated) = generator.next_decay(&worker_prodtbl, &mut sampler)
                    else {
                        break;
                    };
                    let decay = generated.decay;
                    let detections = worker_sim.follow_decay(
                        generated,
                        &tracker,
                        &mut worker_prodtbl,
                        &mut report,
                        &mut sampler,
                    )?;
                    if !detections.is_empty() {
                        records.push((decay, detections));
                    }
                }
                report.generator = generator.stats();
                Ok((records, report))
            })
            .collect();

        let mut all_records = Vec::new();
        let mut merged = SimulationReport::default();
        for result in results {
            let (records, report) = result?;
            all_records.extend(records);
            merge_reports(&mut merged, &report);
        }
        Ok((all_records, merged))
    }
}

fn merge_reports(into: &mut SimulationReport, from: &SimulationReport) {
    into.generator.num_generated += from.generator.num_generated;
    into.generator.num_positron_escapes += from.generator.num_positron_escapes;
    into.tracking.num_detected += from.tracking.num_detected;
    into.tracking.num_absorbed += from.tracking.num_absorbed;
    into.tracking.num_low_energy += from.tracking.num_low_energy;
    into.tracking.num_out_of_acceptance += from.tracking.num_out_of_acceptance;
    into.tracking.num_primary_only_scatter += from.tracking.num_primary_only_scatter;
    into.tracking.num_rouletted += from.tracking.num_rouletted;
    into.tracking.num_forced_detections += from.tracking.num_forced_detections;
    into.collimator.num_reaching_collimator += from.collimator.num_reaching_collimator;
    into.collimator.num_collimated += from.collimator.num_collimated;
    into.collimator.primary_weight_passed += from.collimator.primary_weight_passed;
    into.collimator.scatter_weight_passed += from.collimator.scatter_weight_passed;
    into.detector.num_detected += from.detector.num_detected;
    into.detector.num_passed_through += from.detector.num_passed_through;
    into.detector.num_interaction_overflows += from.detector.num_interaction_overflows;
    into.cancelled |= from.cancelled;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Cylinder;
    use crate::history::{HistoryHeader, HistoryKind, HistoryReader};
    use std::io::Cursor;

    fn setup() -> (ObjectGrid, MaterialTable, RunTimeParams) {
        let cylinder = Cylinder {
            radius: 10.0,
            z_min: -5.0,
            z_max: 5.0,
            center_x: 0.0,
            center_y: 0.0,
        };
        let object = ObjectGrid::uniform(cylinder, 5, 20, 20, 1);

        let mut params = RunTimeParams::default();
        params.num_to_simulate = 200;
        params.length_of_scan = 60.0;
        params.minimum_energy = 100.0;
        params.scan_mode = ScanMode::PetCoincidencesPlusSingles;
        params.cylinders.object = cylinder;
        params.cylinders.target = Cylinder {
            radius: 30.0,
            ..cylinder
        };

        (object, MaterialTable::basic(), params)
    }

    #[test]
    fn serial_run_writes_history() {
        let (object, materials, params) = setup();
        let simulation = Simulation {
            object: &object,
            materials: &materials,
            params: &params,
            collimator: None,
            detector_geometry: None,
        };
        let mut prodtbl = ProductivityTable::flat(5, 8);
        let mut writer = HistoryWriter::create(
            Cursor::new(Vec::new()),
            HistoryHeader::new(HistoryKind::Phg, params.clone()),
        )
        .unwrap();
        let cancel = AtomicBool::new(false);
        let mut sampler = Sampler::new(123);

        let report = simulation
            .run(&mut prodtbl, Some(&mut writer), None, &cancel, &mut sampler)
            .unwrap();

        assert_eq!(report.generator.num_generated, 200);
        assert!(report.num_decays_written > 0);
        assert!(!report.cancelled);

        // every written decay is followed by its photons
        let bytes = writer.into_inner().unwrap().into_inner();
        let mut reader = HistoryReader::open(Cursor::new(bytes)).unwrap();
        let mut decays = 0;
        let mut photons = 0;
        while let Some(event) = reader.read_event().unwrap() {
            match event {
                crate::history::Event::Decay(_) => decays += 1,
                crate::history::Event::Photon(photon) => {
                    photons += 1;
                    assert!(photon.energy >= 100.0);
                }
            }
        }
        assert_eq!(decays, report.num_decays_written);
        assert_eq!(photons, report.num_photons_written);
    }

    #[test]
    fn cancellation_stops_cleanly() {
        let (object, materials, params) = setup();
        let simulation = Simulation {
            object: &object,
            materials: &materials,
            params: &params,
            collimator: None,
            detector_geometry: None,
        };
        let mut prodtbl = ProductivityTable::flat(5, 8);
        let cancel = AtomicBool::new(true);
        let mut sampler = Sampler::new(1);

        let report = simulation
            .run::<Cursor<Vec<u8>>>(&mut prodtbl, None, None, &cancel, &mut sampler)
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.generator.num_generated, 0);
    }

    #[test]
    fn parallel_run_covers_the_budget() {
        let (object, materials, params) = setup();
        let simulation = Simulation {
            object: &object,
            materials: &materials,
            params: &params,
            collimator: None,
            detector_geometry: None,
        };
        let prodtbl = ProductivityTable::flat(5, 8);
        let cancel = AtomicBool::new(false);

        let (records, report) = simulation.run_parallel(&prodtbl, &cancel, 4).unwrap();

        assert_eq!(report.generator.num_generated, 200);
        assert!(!records.is_empty());
    }
}
