//! Coincidence-time windowing: randoms creation and triples handling over a
//! time-sorted singles history.

use crate::error::{Error, Result};
use crate::history::{Event, HistoryHeader, HistoryReader, HistoryWriter};
use crate::params::{ScanMode, TriplesMethod};
use crate::photon::{Decay, DecayType, DetectedPhoton, PhotonFlags};
use arrayvec::ArrayVec;
use itertools::Itertools;
use std::io::{Read, Seek, Write};

/// Maximum number of decays a time window tracks. Windows that would exceed
/// it keep replacing their last decay; such windows are dropped as triples
/// anyway.
pub const MAX_TW_DECAYS: usize = 10;

/// One decay's detections inside the current window.
#[derive(Clone, Debug)]
pub struct DecayDetections {
    /// The decay.
    pub decay: Decay,
    /// Its blue photons.
    pub blues: Vec<DetectedPhoton>,
    /// Its pink photons.
    pub pinks: Vec<DetectedPhoton>,
}

impl DecayDetections {
    fn new(decay: Decay) -> Self {
        Self {
            decay,
            blues: Vec::new(),
            pinks: Vec::new(),
        }
    }

    fn num_photons(&self) -> usize {
        self.blues.len() + self.pinks.len()
    }
}

/// The sliding time window.
#[derive(Clone, Debug)]
pub struct TimeWindow {
    /// Decays currently in the window.
    pub decays: ArrayVec<DecayDetections, MAX_TW_DECAYS>,
    /// Latest detection time seen in the window, seconds since scan start.
    pub last_detection_time: f64,
}

impl TimeWindow {
    fn new() -> Self {
        Self {
            decays: ArrayVec::new(),
            last_detection_time: 0.0,
        }
    }

    fn total_photons(&self) -> usize {
        self.decays.iter().map(DecayDetections::num_photons).sum()
    }

    fn restart(&mut self, decay: Decay) {
        self.decays.clear();
        self.decays.push(DecayDetections::new(decay));
        self.last_detection_time = decay.time;
    }

    fn admit(&mut self, decay: Decay) {
        if self.decays.is_full() {
            // bounce the previous last decay; the window is over-full and
            // will be dropped as a triple regardless
            *self.decays.last_mut().unwrap() = DecayDetections::new(decay);
        } else {
            self.decays.push(DecayDetections::new(decay));
        }
        if decay.time > self.last_detection_time {
            self.last_detection_time = decay.time;
        }
    }
}

/// Counters of the coincidence engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoincidenceCounters {
    /// Decays read from the input.
    pub num_decays_read: u64,
    /// Decays written to the output.
    pub num_written: u64,
    /// Decays written out unchanged (true coincidences).
    pub num_unchanged: u64,
    /// Random decays created.
    pub num_random: u64,
    /// Decays dropped by the triples rule.
    pub num_lost_triples: u64,
    /// Randoms lost to the by-photon window check.
    pub num_lost_correct_window: u64,
    /// Histogram of decays per closed window; the last bin holds windows
    /// with [`MAX_TW_DECAYS`] or more.
    pub decays_per_window: [u64; MAX_TW_DECAYS],
}

/// Pluggable policy for randoms processing. Every method has a default
/// no-op implementation; the default engine behavior is the drop-triples
/// rule.
pub trait CoincidencePolicy {
    /// Called once before any window is processed.
    fn initialize(&mut self, _header: &HistoryHeader) {}

    /// Called on each window before standard processing; may mutate it.
    fn modify_window(&mut self, _window: &mut TimeWindow, _counters: &mut CoincidenceCounters) {}

    /// Accept or reject a coincidence about to be written.
    fn accept(
        &mut self,
        _decay: &Decay,
        _blues: &[DetectedPhoton],
        _pinks: &[DetectedPhoton],
        _counters: &mut CoincidenceCounters,
    ) -> bool {
        true
    }

    /// Called once after the last window.
    fn terminate(&mut self, _counters: &CoincidenceCounters) {}
}

/// The default policy: no hooks, triples dropped by the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPolicy;

impl CoincidencePolicy for DefaultPolicy {}

/// Verify the preconditions randoms processing places on its input file.
///
/// # Errors
///
/// [`Error::PreconditionFailed`] naming the first violated precondition.
pub fn check_preconditions(header: &HistoryHeader) -> Result<()> {
    if !header.params.is_calc_events_to_simulate {
        return Err(Error::PreconditionFailed(
            "randoms processing requires data generated with num_to_simulate computed by the scan"
                .to_string(),
        ));
    }
    if header.params.is_forced_detection {
        return Err(Error::PreconditionFailed(
            "randoms processing is incompatible with forced detection".to_string(),
        ));
    }
    if header.params.is_stratification {
        return Err(Error::PreconditionFailed(
            "randoms processing is incompatible with stratification".to_string(),
        ));
    }
    if header.params.is_forced_non_absorption {
        return Err(Error::PreconditionFailed(
            "randoms processing is incompatible with forced non-absorption".to_string(),
        ));
    }
    if header.params.detector.do_forced_interaction {
        return Err(Error::PreconditionFailed(
            "randoms processing is incompatible with forced interaction in the detector"
                .to_string(),
        ));
    }
    if header.params.scan_mode != ScanMode::PetCoincidencesPlusSingles {
        return Err(Error::PreconditionFailed(
            "randoms processing requires a PET coincidences-plus-singles scan".to_string(),
        ));
    }
    if !header.is_time_sorted {
        return Err(Error::PreconditionFailed(
            "randoms processing requires a time-sorted history file".to_string(),
        ));
    }
    Ok(())
}

/// The coincidence engine: groups a time-sorted singles stream into
/// windows, writes true coincidences unchanged, synthesizes randoms from
/// two-photon multi-decay windows, and applies the triples rule.
pub struct CoincidenceEngine<P> {
    policy: P,
    window_secs: f64,
    triples_method: TriplesMethod,
    counters: CoincidenceCounters,
}

impl<P: CoincidencePolicy> CoincidenceEngine<P> {
    /// Build an engine with `policy` for a file described by `header`. The
    /// window length and triples method come from the header's detector
    /// parameters.
    ///
    /// # Errors
    ///
    /// [`Error::PreconditionFailed`] if the window is not positive or a
    /// header precondition fails.
    pub fn new(header: &HistoryHeader, policy: P) -> Result<Self> {
        check_preconditions(header)?;

        let window_secs = header.params.detector.coincidence_timing_window_ns * 1.0e-9;
        if window_secs <= 0.0 {
            return Err(Error::PreconditionFailed(
                "non-positive coincidence timing window not allowed".to_string(),
            ));
        }

        Ok(Self {
            policy,
            window_secs,
            triples_method: header.params.detector.triples_method,
            counters: CoincidenceCounters::default(),
        })
    }

    /// Process the whole input stream. When `writer` is `None` the engine
    /// only scans and counts (the test-window mode).
    ///
    /// # Errors
    ///
    /// Propagates I/O errors and [`Error::FileFormatMismatch`] when the
    /// stream does not start with a decay.
    pub fn process<R: Read, W: Write + Seek>(
        mut self,
        reader: &mut HistoryReader<R>,
        mut writer: Option<&mut HistoryWriter<W>>,
    ) -> Result<CoincidenceCounters> {
        self.policy.initialize(reader.header());

        let mut window = TimeWindow::new();

        let first = reader.read_event()?;
        match first {
            None => {
                self.policy.terminate(&self.counters);
                return Ok(self.counters);
            }
            Some(Event::Decay(decay)) => {
                window.restart(decay);
                self.counters.num_decays_read = 1;
            }
            Some(Event::Photon(_)) => {
                return Err(Error::FileFormatMismatch(
                    "expected first event to be a decay, and it wasn't".to_string(),
                ));
            }
        }

        while let Some(event) = reader.read_event()? {
            match event {
                Event::Photon(photon) => {
                    let current = window.decays.last_mut().expect("window holds a decay");
                    let detection_time = current.decay.time + photon.time_since_creation;
                    if detection_time > window.last_detection_time {
                        window.last_detection_time = detection_time;
                    }
                    if photon.is_blue() {
                        current.blues.push(photon);
                    } else {
                        current.pinks.push(photon);
                    }
                }
                Event::Decay(decay) => {
                    self.counters.num_decays_read += 1;
                    if decay.time >= window.last_detection_time + self.window_secs {
                        self.process_window(&mut window, writer.as_deref_mut())?;
                        window.restart(decay);
                    } else {
                        window.admit(decay);
                    }
                }
            }
        }

        if !window.decays.is_empty() {
            self.process_window(&mut window, writer.as_deref_mut())?;
        }

        self.policy.terminate(&self.counters);
        Ok(self.counters)
    }

    fn process_window<W: Write + Seek>(
        &mut self,
        window: &mut TimeWindow,
        mut writer: Option<&mut HistoryWriter<W>>,
    ) -> Result<()> {
        let histogram_bin = window.decays.len().min(MAX_TW_DECAYS) - 1;
        self.counters.decays_per_window[histogram_bin] += 1;

        self.policy.modify_window(window, &mut self.counters);

        if window.decays.len() == 1 {
            let detections = &window.decays[0];
            if !detections.blues.is_empty()
                && !detections.pinks.is_empty()
                && self.policy.accept(
                    &detections.decay,
                    &detections.blues,
                    &detections.pinks,
                    &mut self.counters,
                )
            {
                if let Some(writer) = writer.as_deref_mut() {
                    writer.write_detections(
                        &detections.decay,
                        &detections.blues,
                        &detections.pinks,
                    )?;
                }
                self.counters.num_written += 1;
                self.counters.num_unchanged += 1;
            }
            return Ok(());
        }

        match window.total_photons() {
            0 | 1 => {}
            2 => self.write_random(window, writer)?,
            _ => match self.triples_method {
                TriplesMethod::DeleteTriples => {
                    self.counters.num_lost_triples += window.decays.len() as u64;
                }
                TriplesMethod::PairAll => self.pair_everything(window, writer)?,
            },
        }

        Ok(())
    }

    /// A multi-decay window holding exactly two photons becomes an
    /// artificial random coincidence.
    fn write_random<W: Write + Seek>(
        &mut self,
        window: &TimeWindow,
        writer: Option<&mut HistoryWriter<W>>,
    ) -> Result<()> {
        let mut photons = window.decays.iter().flat_map(|detections| {
            detections
                .blues
                .iter()
                .chain(&detections.pinks)
                .map(move |photon| (detections.decay, *photon))
        });
        let (first_decay, first_photon) = photons.next().expect("window has two photons");
        let (second_decay, second_photon) = photons.next().expect("window has two photons");

        // the location of a synthesized random is the first decay's, and is
        // physically meaningless
        let mut random_decay = first_decay;
        random_decay.decay_type = DecayType::PetRandom;

        let mut blue = first_photon;
        blue.flags = PhotonFlags::BLUE.bits();
        let mut pink = second_photon;
        pink.flags = 0;
        // shift so both detection times are relative to the first decay
        pink.time_since_creation += second_decay.time - first_decay.time;

        if (pink.time_since_creation - blue.time_since_creation).abs() <= self.window_secs {
            if self
                .policy
                .accept(&random_decay, &[blue], &[pink], &mut self.counters)
            {
                if let Some(writer) = writer {
                    writer.write_detections(&random_decay, &[blue], &[pink])?;
                }
                self.counters.num_written += 1;
                self.counters.num_random += 1;
            }
        } else {
            self.counters.num_lost_correct_window += 1;
        }

        Ok(())
    }

    /// The pair-everything alternative to the triples rule: every pair of
    /// photons from different decays that survives the window check is
    /// written as a random.
    fn pair_everything<W: Write + Seek>(
        &mut self,
        window: &TimeWindow,
        mut writer: Option<&mut HistoryWriter<W>>,
    ) -> Result<()> {
        let photons: Vec<(usize, Decay, DetectedPhoton)> = window
            .decays
            .iter()
            .enumerate()
            .flat_map(|(index, detections)| {
                detections
                    .blues
                    .iter()
                    .chain(&detections.pinks)
                    .map(move |photon| (index, detections.decay, *photon))
            })
            .collect();

        for (&(decay_index_a, decay_a, a), &(decay_index_b, decay_b, b)) in
            photons.iter().tuple_combinations()
        {
            if decay_index_a == decay_index_b {
                continue;
            }

            let mut random_decay = decay_a;
            random_decay.decay_type = DecayType::PetRandom;

            let mut blue = a;
            blue.flags = PhotonFlags::BLUE.bits();
            let mut pink = b;
            pink.flags = 0;
            pink.time_since_creation += decay_b.time - decay_a.time;

            if (pink.time_since_creation - blue.time_since_creation).abs() <= self.window_secs {
                if self
                    .policy
                    .accept(&random_decay, &[blue], &[pink], &mut self.counters)
                {
                    if let Some(writer) = writer.as_deref_mut() {
                        writer.write_detections(&random_decay, &[blue], &[pink])?;
                    }
                    self.counters.num_written += 1;
                    self.counters.num_random += 1;
                }
            } else {
                self.counters.num_lost_correct_window += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::history::HistoryKind;
    use crate::params::RunTimeParams;
    use crate::photon::{FloatDirection, FloatPosition, Position};
    use float_cmp::assert_approx_eq;
    use std::io::Cursor;

    fn singles_params(window_ns: f64) -> RunTimeParams {
        let mut params = RunTimeParams::default();
        params.scan_mode = ScanMode::PetCoincidencesPlusSingles;
        params.detector.coincidence_timing_window_ns = window_ns;
        params.detector.do_randoms_processing = true;
        params
    }

    fn sorted_header(window_ns: f64) -> HistoryHeader {
        let mut header = HistoryHeader::new(HistoryKind::Detector, singles_params(window_ns));
        header.is_time_sorted = true;
        header
    }

    fn decay(time: f64) -> Decay {
        Decay {
            location: Position::new(1.0, 2.0, 3.0),
            start_weight: 1.0,
            time,
            decay_type: DecayType::Positron,
        }
    }

    fn photon(blue: bool, time_since_creation: f64) -> DetectedPhoton {
        DetectedPhoton {
            location: FloatPosition {
                x: 30.0,
                y: 0.0,
                z: 0.0,
            },
            direction: FloatDirection {
                cx: 1.0,
                cy: 0.0,
                cz: 0.0,
            },
            flags: u8::from(blue),
            weight: 1.0,
            energy: 511.0,
            time_since_creation,
            transaxial_position: 0.0,
            azimuthal_angle_index: 0,
            detector_angle: 0.0,
            det_crystal: -1,
        }
    }

    struct Run {
        counters: CoincidenceCounters,
        output: Vec<Event>,
    }

    fn run_engine(header: &HistoryHeader, events: &[Event]) -> Run {
        let mut input = HistoryWriter::create(Cursor::new(Vec::new()), header.clone()).unwrap();
        for event in events {
            match event {
                Event::Decay(decay) => input.write_decay(decay).unwrap(),
                Event::Photon(photon) => input.write_photon(photon).unwrap(),
            }
        }
        let bytes = input.into_inner().unwrap().into_inner();

        let mut reader = HistoryReader::open(Cursor::new(bytes)).unwrap();
        let mut writer =
            HistoryWriter::create(Cursor::new(Vec::new()), header.clone()).unwrap();
        let engine = CoincidenceEngine::new(reader.header(), DefaultPolicy).unwrap();
        let counters = engine.process(&mut reader, Some(&mut writer)).unwrap();

        let bytes = writer.into_inner().unwrap().into_inner();
        let mut reader = HistoryReader::open(Cursor::new(bytes)).unwrap();
        let mut output = Vec::new();
        while let Some(event) = reader.read_event().unwrap() {
            output.push(event);
        }

        Run { counters, output }
    }

    #[test]
    fn empty_window_scenario() {
        // one decay, zero photons
        let run = run_engine(&sorted_header(12.0), &[Event::Decay(decay(0.0))]);

        assert_eq!(run.counters.num_decays_read, 1);
        assert_eq!(run.counters.num_written, 0);
        assert_eq!(run.counters.num_unchanged, 0);
        assert_eq!(run.counters.num_random, 0);
        assert_eq!(run.counters.num_lost_triples, 0);
        assert!(run.output.is_empty());
        assert_eq!(run.counters.decays_per_window[0], 1);
    }

    #[test]
    fn pure_coincidence_scenario() {
        let events = [
            Event::Decay(decay(1.0)),
            Event::Photon(photon(true, 1e-10)),
            Event::Photon(photon(false, 2e-10)),
        ];
        let run = run_engine(&sorted_header(12.0), &events);

        assert_eq!(run.counters.num_written, 1);
        assert_eq!(run.counters.num_unchanged, 1);
        assert_eq!(run.counters.num_random, 0);
        assert_eq!(run.output.len(), 3);
        assert_eq!(run.output[0], Event::Decay(decay(1.0)));
        assert_eq!(run.output[1], Event::Photon(photon(true, 1e-10)));
        assert_eq!(run.output[2], Event::Photon(photon(false, 2e-10)));
    }

    #[test]
    fn random_pair_scenario() {
        let events = [
            Event::Decay(decay(1.0)),
            Event::Photon(photon(true, 1e-10)),
            Event::Decay(decay(1.000000005)),
            Event::Photon(photon(true, 1e-10)),
        ];
        let run = run_engine(&sorted_header(12.0), &events);

        assert_eq!(run.counters.num_written, 1);
        assert_eq!(run.counters.num_random, 1);
        assert_eq!(run.counters.num_unchanged, 0);
        assert_eq!(run.counters.num_lost_correct_window, 0);

        let Event::Decay(written) = run.output[0] else {
            panic!("expected a decay first");
        };
        assert_eq!(written.decay_type, DecayType::PetRandom);
        // takes decay A's location and time
        assert_eq!(written.location, Position::new(1.0, 2.0, 3.0));
        assert_approx_eq!(f64, written.time, 1.0);

        let Event::Photon(blue) = run.output[1] else {
            panic!("expected the blue photon");
        };
        assert!(blue.is_blue());
        assert_approx_eq!(f64, blue.time_since_creation, 1e-10);

        let Event::Photon(pink) = run.output[2] else {
            panic!("expected the pink photon");
        };
        assert!(!pink.is_blue());
        // B's photon, shifted by the 5 ns decay-time difference
        assert_approx_eq!(f64, pink.time_since_creation, 1e-10 + 5e-9, epsilon = 1e-15);
    }

    #[test]
    fn triple_scenario() {
        let events = [
            Event::Decay(decay(1.0)),
            Event::Photon(photon(true, 1e-10)),
            Event::Decay(decay(1.000000002)),
            Event::Photon(photon(false, 1e-10)),
            Event::Decay(decay(1.000000004)),
            Event::Photon(photon(true, 1e-10)),
        ];
        let run = run_engine(&sorted_header(12.0), &events);

        assert_eq!(run.counters.num_written, 0);
        assert_eq!(run.counters.num_lost_triples, 3);
        assert!(run.output.is_empty());
        assert_eq!(run.counters.decays_per_window[2], 1);
    }

    #[test]
    fn window_histogram_totals_match_decays() {
        let events = [
            Event::Decay(decay(1.0)),
            Event::Photon(photon(true, 1e-10)),
            Event::Photon(photon(false, 2e-10)),
            Event::Decay(decay(2.0)),
            Event::Decay(decay(2.000000001)),
            Event::Decay(decay(3.0)),
        ];
        let run = run_engine(&sorted_header(12.0), &events);

        assert_eq!(run.counters.num_decays_read, 4);
        let histogrammed: u64 = run
            .counters
            .decays_per_window
            .iter()
            .enumerate()
            .map(|(index, count)| (index as u64 + 1) * count)
            .sum();
        assert_eq!(histogrammed, 4);
    }

    #[test]
    fn random_outside_photon_window_is_lost() {
        // decays close together, but the second photon detects 20 ns late
        let events = [
            Event::Decay(decay(1.0)),
            Event::Photon(photon(true, 1e-10)),
            Event::Decay(decay(1.000000005)),
            Event::Photon(photon(true, 2e-8)),
        ];
        let run = run_engine(&sorted_header(12.0), &events);

        assert_eq!(run.counters.num_written, 0);
        assert_eq!(run.counters.num_lost_correct_window, 1);
    }

    #[test]
    fn unsorted_input_is_rejected() {
        let mut header = sorted_header(12.0);
        header.is_time_sorted = false;

        let result = CoincidenceEngine::new(&header, DefaultPolicy);
        assert!(matches!(result, Err(Error::PreconditionFailed(_))));
    }

    #[test]
    fn importance_sampling_input_is_rejected() {
        let mut header = sorted_header(12.0);
        header.params.is_forced_detection = true;

        let result = CoincidenceEngine::new(&header, DefaultPolicy);
        assert!(matches!(result, Err(Error::PreconditionFailed(_))));
    }

    #[test]
    fn pair_all_policy_pairs_triples() {
        let mut header = sorted_header(12.0);
        header.params.detector.triples_method = TriplesMethod::PairAll;

        let events = [
            Event::Decay(decay(1.0)),
            Event::Photon(photon(true, 1e-10)),
            Event::Decay(decay(1.000000002)),
            Event::Photon(photon(false, 1e-10)),
            Event::Decay(decay(1.000000004)),
            Event::Photon(photon(true, 1e-10)),
        ];
        let run = run_engine(&header, &events);

        // three photons from three decays: three pairs
        assert_eq!(run.counters.num_random, 3);
        assert_eq!(run.counters.num_lost_triples, 0);
    }
}
