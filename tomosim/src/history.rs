//! The list-mode history file codec.
//!
//! A history file is a fixed 32 KiB header followed by a stream of events.
//! The header is a table of tagged elements (tag, length, payload — all
//! little-endian) so single elements keep stable identities across versions.
//! Each event starts with a one-byte flag: bit 0 set marks a decay record,
//! bit 1 a photon record; for photons, bits 2-7 carry the scatter count
//! (saturating at 63). The records themselves are fixed-size little-endian
//! structures.

use crate::error::{Error, Result};
use crate::params::{RunTimeParams, ScanMode};
use crate::photon::{Decay, DetectedPhoton};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};

/// Size of the fixed header block.
pub const HEADER_SIZE: usize = 32_768;

/// Current header version.
pub const HEADER_VERSION: u32 = 2;

/// Event flag bit marking a decay record.
pub const EVENT_FLAG_DECAY: u8 = 0b01;

/// Event flag bit marking a photon record.
pub const EVENT_FLAG_PHOTON: u8 = 0b10;

// Stable element tags. Gaps in the numbering are tags retired with older
// header versions.
const TAG_HEADER_KIND: u32 = 10002;
const TAG_HEADER_VERSION: u32 = 10003;
const TAG_EVENTS_TO_SIMULATE: u32 = 10000;
const TAG_IS_CALC_EVENTS: u32 = 10054;
const TAG_RANDOM_SEED: u32 = 10005;
const TAG_LENGTH_OF_SCAN: u32 = 10006;
const TAG_ACCEPTANCE_ANGLE: u32 = 10007;
const TAG_ACCEPTANCE_ANGLE_SINE: u32 = 10008;
const TAG_MINIMUM_ENERGY: u32 = 10009;
const TAG_MAX_WW_RATIO: u32 = 10010;
const TAG_MIN_WW_RATIO: u32 = 10046;
const TAG_ISOTOPE: u32 = 10011;
const TAG_PHOTON_ENERGY: u32 = 10012;
const TAG_SCAN_MODE: u32 = 10017;
const TAG_IS_FORCED_DETECTION: u32 = 10014;
const TAG_IS_STRATIFICATION: u32 = 10015;
const TAG_IS_NON_ABSORPTION: u32 = 10016;
const TAG_IS_HISTORY_FILE: u32 = 10019;
const TAG_IS_POSITRON_RANGE: u32 = 10020;
const TAG_IS_NON_COLLINEARITY: u32 = 10021;
const TAG_IS_COMPUTED_PROD_TBL: u32 = 10022;
const TAG_IS_VOXEL_POINT_SOURCE: u32 = 10023;
const TAG_IS_VOXEL_LINE_SOURCE: u32 = 10047;
const TAG_IS_POLARIZATION: u32 = 10048;
const TAG_IS_COHERENT_IN_OBJ: u32 = 10055;
const TAG_IS_COHERENT_IN_TOMO: u32 = 10056;
const TAG_IS_MULTI_EMISSION: u32 = 10050;
const TAG_DET_ENERGY_RESOLUTION: u32 = 30004;
const TAG_DET_REFERENCE_ENERGY: u32 = 30005;
const TAG_DET_FORCED_INTERACTION: u32 = 30007;
const TAG_DET_PHOTON_TIME_FWHM: u32 = 30008;
const TAG_DET_COINC_WINDOW: u32 = 30009;
const TAG_DET_TRIPLES_METHOD: u32 = 30010;
const TAG_DET_DO_RANDOMS: u32 = 30012;
const TAG_CYL_TARGET: u32 = 40001;
const TAG_CYL_OBJECT: u32 = 40011;
const TAG_CYL_CRIT_ZONE: u32 = 40006;
const TAG_CYL_LIMIT: u32 = 40016;
const TAG_IS_TIME_SORTED: u32 = 70101;
const TAG_IS_RANDOMS_ADDED: u32 = 70201;
const TAG_IS_ATTEN_CORRECTED: u32 = 70301;

/// Which stage wrote the file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum HistoryKind {
    /// Photon history generator output (object-tracking stage).
    Phg,
    /// Collimator-stage output.
    Collimator,
    /// Detector-stage output.
    Detector,
}

impl HistoryKind {
    const fn to_u32(self) -> u32 {
        match self {
            Self::Phg => 1,
            Self::Collimator => 2,
            Self::Detector => 3,
        }
    }

    fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Phg),
            2 => Ok(Self::Collimator),
            3 => Ok(Self::Detector),
            _ => Err(Error::FileFormatMismatch(format!(
                "unknown history kind {value}"
            ))),
        }
    }

    /// Display name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Phg => "PHG",
            Self::Collimator => "collimator",
            Self::Detector => "detector",
        }
    }
}

/// The decoded history-file header.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryHeader {
    /// Which stage wrote the file.
    pub kind: HistoryKind,
    /// Header version.
    pub version: u32,
    /// The run parameters the file was produced with.
    pub params: RunTimeParams,
    /// Whether the event stream is sorted by decay time.
    pub is_time_sorted: bool,
    /// Whether randoms processing produced this file.
    pub is_randoms_added: bool,
    /// Whether attenuation correction has been applied.
    pub is_attenuation_corrected: bool,
}

impl HistoryHeader {
    /// A header for a fresh file of the given kind.
    #[must_use]
    pub fn new(kind: HistoryKind, params: RunTimeParams) -> Self {
        Self {
            kind,
            version: HEADER_VERSION,
            params,
            is_time_sorted: false,
            is_randoms_added: false,
            is_attenuation_corrected: false,
        }
    }

    /// Serialize into a fixed [`HEADER_SIZE`] block.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] if the element table overflows the block
    /// (cannot happen with the current tag set).
    pub fn to_block(&self) -> Result<Vec<u8>> {
        let mut elements = ElementWriter::default();
        let p = &self.params;

        elements.push_u32(TAG_HEADER_KIND, self.kind.to_u32());
        elements.push_u32(TAG_HEADER_VERSION, self.version);
        elements.push_u64(TAG_EVENTS_TO_SIMULATE, p.num_to_simulate);
        elements.push_bool(TAG_IS_CALC_EVENTS, p.is_calc_events_to_simulate);
        elements.push_u64(TAG_RANDOM_SEED, p.random_seed);
        elements.push_f64(TAG_LENGTH_OF_SCAN, p.length_of_scan);
        elements.push_f64(TAG_ACCEPTANCE_ANGLE, p.acceptance_angle);
        elements.push_f64(TAG_ACCEPTANCE_ANGLE_SINE, p.acceptance_angle_sine);
        elements.push_f64(TAG_MINIMUM_ENERGY, p.minimum_energy);
        elements.push_f64(TAG_MAX_WW_RATIO, p.max_ww_ratio);
        elements.push_f64(TAG_MIN_WW_RATIO, p.min_ww_ratio);
        elements.push_u32(TAG_ISOTOPE, p.isotope as u32);
        elements.push_f64(TAG_PHOTON_ENERGY, p.photon_energy_kev);
        elements.push_u32(TAG_SCAN_MODE, p.scan_mode as u32);
        elements.push_bool(TAG_IS_FORCED_DETECTION, p.is_forced_detection);
        elements.push_bool(TAG_IS_STRATIFICATION, p.is_stratification);
        elements.push_bool(TAG_IS_NON_ABSORPTION, p.is_forced_non_absorption);
        elements.push_bool(TAG_IS_HISTORY_FILE, p.is_history_file);
        elements.push_bool(TAG_IS_POSITRON_RANGE, p.is_adjust_for_positron_range);
        elements.push_bool(TAG_IS_NON_COLLINEARITY, p.is_adjust_for_non_collinearity);
        elements.push_bool(TAG_IS_COMPUTED_PROD_TBL, p.is_computed_productivity_table);
        elements.push_bool(TAG_IS_VOXEL_POINT_SOURCE, p.is_voxel_point_source);
        elements.push_bool(TAG_IS_VOXEL_LINE_SOURCE, p.is_voxel_line_source);
        elements.push_bool(TAG_IS_POLARIZATION, p.is_model_polarization);
        elements.push_bool(TAG_IS_COHERENT_IN_OBJ, p.is_model_coherent_in_obj);
        elements.push_bool(TAG_IS_COHERENT_IN_TOMO, p.is_model_coherent_in_tomo);
        elements.push_bool(TAG_IS_MULTI_EMISSION, p.is_multi_emission);
        elements.push_f64(TAG_DET_ENERGY_RESOLUTION, p.detector.energy_resolution_percentage);
        elements.push_f64(TAG_DET_REFERENCE_ENERGY, p.detector.reference_energy);
        elements.push_bool(TAG_DET_FORCED_INTERACTION, p.detector.do_forced_interaction);
        elements.push_f64(TAG_DET_PHOTON_TIME_FWHM, p.detector.photon_time_fwhm);
        elements.push_f64(TAG_DET_COINC_WINDOW, p.detector.coincidence_timing_window_ns);
        elements.push_u32(TAG_DET_TRIPLES_METHOD, p.detector.triples_method as u32);
        elements.push_bool(TAG_DET_DO_RANDOMS, p.detector.do_randoms_processing);
        elements.push_cylinder(TAG_CYL_TARGET, &p.cylinders.target);
        elements.push_cylinder(TAG_CYL_OBJECT, &p.cylinders.object);
        elements.push_cylinder(TAG_CYL_CRIT_ZONE, &p.cylinders.critical_zone);
        elements.push_cylinder(TAG_CYL_LIMIT, &p.cylinders.limit);
        elements.push_bool(TAG_IS_TIME_SORTED, self.is_time_sorted);
        elements.push_bool(TAG_IS_RANDOMS_ADDED, self.is_randoms_added);
        elements.push_bool(TAG_IS_ATTEN_CORRECTED, self.is_attenuation_corrected);

        elements.into_block()
    }

    /// Decode a [`HEADER_SIZE`] block.
    ///
    /// # Errors
    ///
    /// [`Error::FileFormatMismatch`] when the block is not a valid header.
    pub fn from_block(block: &[u8]) -> Result<Self> {
        let elements = ElementReader::parse(block)?;
        let mut params = RunTimeParams::default();

        let kind = HistoryKind::from_u32(elements.u32(TAG_HEADER_KIND)?)?;
        let version = elements.u32(TAG_HEADER_VERSION)?;
        params.num_to_simulate = elements.u64(TAG_EVENTS_TO_SIMULATE)?;
        params.is_calc_events_to_simulate = elements.bool(TAG_IS_CALC_EVENTS)?;
        params.random_seed = elements.u64(TAG_RANDOM_SEED)?;
        params.length_of_scan = elements.f64(TAG_LENGTH_OF_SCAN)?;
        params.acceptance_angle = elements.f64(TAG_ACCEPTANCE_ANGLE)?;
        params.acceptance_angle_sine = elements.f64(TAG_ACCEPTANCE_ANGLE_SINE)?;
        params.minimum_energy = elements.f64(TAG_MINIMUM_ENERGY)?;
        params.max_ww_ratio = elements.f64(TAG_MAX_WW_RATIO)?;
        params.min_ww_ratio = elements.f64(TAG_MIN_WW_RATIO)?;
        params.isotope = decode_isotope(elements.u32(TAG_ISOTOPE)?);
        params.photon_energy_kev = elements.f64(TAG_PHOTON_ENERGY)?;
        params.scan_mode = decode_scan_mode(elements.u32(TAG_SCAN_MODE)?);
        params.is_forced_detection = elements.bool(TAG_IS_FORCED_DETECTION)?;
        params.is_stratification = elements.bool(TAG_IS_STRATIFICATION)?;
        params.is_forced_non_absorption = elements.bool(TAG_IS_NON_ABSORPTION)?;
        params.is_history_file = elements.bool(TAG_IS_HISTORY_FILE)?;
        params.is_adjust_for_positron_range = elements.bool(TAG_IS_POSITRON_RANGE)?;
        params.is_adjust_for_non_collinearity = elements.bool(TAG_IS_NON_COLLINEARITY)?;
        params.is_computed_productivity_table = elements.bool(TAG_IS_COMPUTED_PROD_TBL)?;
        params.is_voxel_point_source = elements.bool(TAG_IS_VOXEL_POINT_SOURCE)?;
        params.is_voxel_line_source = elements.bool(TAG_IS_VOXEL_LINE_SOURCE)?;
        params.is_model_polarization = elements.bool(TAG_IS_POLARIZATION)?;
        params.is_model_coherent_in_obj = elements.bool(TAG_IS_COHERENT_IN_OBJ)?;
        params.is_model_coherent_in_tomo = elements.bool(TAG_IS_COHERENT_IN_TOMO)?;
        params.is_multi_emission = elements.bool(TAG_IS_MULTI_EMISSION)?;
        params.detector.energy_resolution_percentage = elements.f64(TAG_DET_ENERGY_RESOLUTION)?;
        params.detector.reference_energy = elements.f64(TAG_DET_REFERENCE_ENERGY)?;
        params.detector.do_forced_interaction = elements.bool(TAG_DET_FORCED_INTERACTION)?;
        params.detector.photon_time_fwhm = elements.f64(TAG_DET_PHOTON_TIME_FWHM)?;
        params.detector.coincidence_timing_window_ns = elements.f64(TAG_DET_COINC_WINDOW)?;
        params.detector.triples_method = decode_triples(elements.u32(TAG_DET_TRIPLES_METHOD)?);
        params.detector.do_randoms_processing = elements.bool(TAG_DET_DO_RANDOMS)?;
        params.cylinders.target = elements.cylinder(TAG_CYL_TARGET)?;
        params.cylinders.object = elements.cylinder(TAG_CYL_OBJECT)?;
        params.cylinders.critical_zone = elements.cylinder(TAG_CYL_CRIT_ZONE)?;
        params.cylinders.limit = elements.cylinder(TAG_CYL_LIMIT)?;

        Ok(Self {
            kind,
            version,
            params,
            is_time_sorted: elements.bool(TAG_IS_TIME_SORTED)?,
            is_randoms_added: elements.bool(TAG_IS_RANDOMS_ADDED)?,
            is_attenuation_corrected: elements.bool(TAG_IS_ATTEN_CORRECTED)?,
        })
    }
}

fn decode_isotope(value: u32) -> crate::params::Isotope {
    use crate::params::Isotope;
    match value {
        1 => Isotope::F18,
        2 => Isotope::C11,
        3 => Isotope::O15,
        4 => Isotope::Na22,
        5 => Isotope::Tc99m,
        _ => Isotope::None,
    }
}

fn decode_scan_mode(value: u32) -> ScanMode {
    match value {
        1 => ScanMode::PetCoincidencesOnly,
        2 => ScanMode::PetCoincidencesPlusSingles,
        _ => ScanMode::Spect,
    }
}

fn decode_triples(value: u32) -> crate::params::TriplesMethod {
    use crate::params::TriplesMethod;
    match value {
        1 => TriplesMethod::PairAll,
        _ => TriplesMethod::DeleteTriples,
    }
}

#[derive(Default)]
struct ElementWriter {
    buffer: Vec<u8>,
}

impl ElementWriter {
    fn push(&mut self, tag: u32, payload: &[u8]) {
        self.buffer.extend_from_slice(&tag.to_le_bytes());
        self.buffer
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buffer.extend_from_slice(payload);
    }

    fn push_u32(&mut self, tag: u32, value: u32) {
        self.push(tag, &value.to_le_bytes());
    }

    fn push_u64(&mut self, tag: u32, value: u64) {
        self.push(tag, &value.to_le_bytes());
    }

    fn push_f64(&mut self, tag: u32, value: f64) {
        self.push(tag, &value.to_le_bytes());
    }

    fn push_bool(&mut self, tag: u32, value: bool) {
        self.push(tag, &[u8::from(value)]);
    }

    fn push_cylinder(&mut self, tag: u32, cylinder: &crate::geometry::Cylinder) {
        let mut payload = Vec::with_capacity(40);
        for value in [
            cylinder.radius,
            cylinder.z_min,
            cylinder.z_max,
            cylinder.center_x,
            cylinder.center_y,
        ] {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        self.push(tag, &payload);
    }

    fn into_block(self) -> Result<Vec<u8>> {
        if self.buffer.len() > HEADER_SIZE {
            return Err(Error::ResourceExhausted(format!(
                "header element table ({} bytes) exceeds the header block",
                self.buffer.len()
            )));
        }
        let mut block = self.buffer;
        block.resize(HEADER_SIZE, 0);
        Ok(block)
    }
}

struct ElementReader {
    elements: Vec<(u32, Vec<u8>)>,
}

impl ElementReader {
    fn parse(block: &[u8]) -> Result<Self> {
        if block.len() != HEADER_SIZE {
            return Err(Error::FileFormatMismatch(format!(
                "header block is {} bytes, expected {HEADER_SIZE}",
                block.len()
            )));
        }

        let mut elements = Vec::new();
        let mut offset = 0;
        while offset + 8 <= block.len() {
            let tag = u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap());
            if tag == 0 {
                break;
            }
            let len =
                u32::from_le_bytes(block[offset + 4..offset + 8].try_into().unwrap()) as usize;
            offset += 8;
            if offset + len > block.len() {
                return Err(Error::FileFormatMismatch(format!(
                    "header element {tag} overruns the header block"
                )));
            }
            elements.push((tag, block[offset..offset + len].to_vec()));
            offset += len;
        }

        Ok(Self { elements })
    }

    fn payload(&self, tag: u32) -> Result<&[u8]> {
        self.elements
            .iter()
            .find(|(candidate, _)| *candidate == tag)
            .map(|(_, payload)| payload.as_slice())
            .ok_or_else(|| {
                Error::FileFormatMismatch(format!("header element {tag} is missing"))
            })
    }

    fn u32(&self, tag: u32) -> Result<u32> {
        let payload = self.payload(tag)?;
        payload
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| Error::FileFormatMismatch(format!("header element {tag} has a bad size")))
    }

    fn u64(&self, tag: u32) -> Result<u64> {
        let payload = self.payload(tag)?;
        payload
            .try_into()
            .map(u64::from_le_bytes)
            .map_err(|_| Error::FileFormatMismatch(format!("header element {tag} has a bad size")))
    }

    fn f64(&self, tag: u32) -> Result<f64> {
        let payload = self.payload(tag)?;
        payload
            .try_into()
            .map(f64::from_le_bytes)
            .map_err(|_| Error::FileFormatMismatch(format!("header element {tag} has a bad size")))
    }

    fn bool(&self, tag: u32) -> Result<bool> {
        let payload = self.payload(tag)?;
        match payload {
            [value] => Ok(*value != 0),
            _ => Err(Error::FileFormatMismatch(format!(
                "header element {tag} has a bad size"
            ))),
        }
    }

    fn cylinder(&self, tag: u32) -> Result<crate::geometry::Cylinder> {
        let payload = self.payload(tag)?;
        if payload.len() != 40 {
            return Err(Error::FileFormatMismatch(format!(
                "header element {tag} has a bad size"
            )));
        }
        let mut values = [0.0; 5];
        for (index, value) in values.iter_mut().enumerate() {
            *value = f64::from_le_bytes(payload[index * 8..index * 8 + 8].try_into().unwrap());
        }
        Ok(crate::geometry::Cylinder {
            radius: values[0],
            z_min: values[1],
            z_max: values[2],
            center_x: values[3],
            center_y: values[4],
        })
    }
}

/// One event from the history stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A decay record; subsequent photon records belong to it.
    Decay(Decay),
    /// A detected-photon record.
    Photon(DetectedPhoton),
}

/// Writer for a history file: header first, then appended events.
#[derive(Debug)]
pub struct HistoryWriter<W> {
    writer: W,
    header: HistoryHeader,
}

impl<W: Write + Seek> HistoryWriter<W> {
    /// Start a history file by writing `header` at the current position.
    ///
    /// # Errors
    ///
    /// Propagates I/O and header-encoding failures.
    pub fn create(mut writer: W, header: HistoryHeader) -> Result<Self> {
        writer.write_all(&header.to_block()?)?;
        Ok(Self { writer, header })
    }

    /// The header this file was created with.
    #[must_use]
    pub const fn header(&self) -> &HistoryHeader {
        &self.header
    }

    /// Mutable access to the header; call [`Self::rewrite_header`] after
    /// changing it.
    pub fn header_mut(&mut self) -> &mut HistoryHeader {
        &mut self.header
    }

    /// Rewrite the header block in place, preserving the stream position.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn rewrite_header(&mut self) -> Result<()> {
        let position = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.header.to_block()?)?;
        self.writer.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    /// Append a decay record.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn write_decay(&mut self, decay: &Decay) -> Result<()> {
        self.writer.write_all(&[EVENT_FLAG_DECAY])?;
        bincode::serialize_into(&mut self.writer, decay)
            .map_err(|err| Error::Io(bincode_io_error(err)))?;
        Ok(())
    }

    /// Append a photon record. The record's scatter count (upper six flag
    /// bits) is mirrored into the event flag byte.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn write_photon(&mut self, photon: &DetectedPhoton) -> Result<()> {
        let flag = EVENT_FLAG_PHOTON | (photon.flags & !0b11);
        self.writer.write_all(&[flag])?;
        bincode::serialize_into(&mut self.writer, photon)
            .map_err(|err| Error::Io(bincode_io_error(err)))?;
        Ok(())
    }

    /// Write a decay followed by its blue and pink photons.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn write_detections(
        &mut self,
        decay: &Decay,
        blues: &[DetectedPhoton],
        pinks: &[DetectedPhoton],
    ) -> Result<()> {
        self.write_decay(decay)?;
        for photon in blues.iter().chain(pinks) {
            self.write_photon(photon)?;
        }
        Ok(())
    }

    /// Flush and return the underlying writer.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Reader for a history file.
#[derive(Debug)]
pub struct HistoryReader<R> {
    reader: R,
    header: HistoryHeader,
}

impl<R: Read> HistoryReader<R> {
    /// Read and decode the header, leaving the stream at the first event.
    ///
    /// # Errors
    ///
    /// [`Error::FileFormatMismatch`] for malformed headers, otherwise I/O.
    pub fn open(mut reader: R) -> Result<Self> {
        let mut block = vec![0; HEADER_SIZE];
        reader.read_exact(&mut block)?;
        let header = HistoryHeader::from_block(&block)?;
        Ok(Self { reader, header })
    }

    /// The decoded header.
    #[must_use]
    pub const fn header(&self) -> &HistoryHeader {
        &self.header
    }

    /// Read the next event, or `None` at a clean end of stream.
    ///
    /// # Errors
    ///
    /// [`Error::FileFormatMismatch`] for an unknown flag byte, otherwise
    /// I/O (including truncation mid-record).
    pub fn read_event(&mut self) -> Result<Option<Event>> {
        let mut flag = [0u8];
        match self.reader.read_exact(&mut flag) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        if flag[0] & EVENT_FLAG_DECAY != 0 {
            let decay = bincode::deserialize_from(&mut self.reader)
                .map_err(|err| Error::Io(bincode_io_error(err)))?;
            Ok(Some(Event::Decay(decay)))
        } else if flag[0] & EVENT_FLAG_PHOTON != 0 {
            let photon = bincode::deserialize_from(&mut self.reader)
                .map_err(|err| Error::Io(bincode_io_error(err)))?;
            Ok(Some(Event::Photon(photon)))
        } else {
            Err(Error::FileFormatMismatch(format!(
                "unknown event flag byte {:#04x}",
                flag[0]
            )))
        }
    }

    /// Return the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn bincode_io_error(err: bincode::Error) -> std::io::Error {
    match *err {
        bincode::ErrorKind::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Serialized size of a decay record including its event flag byte.
#[must_use]
pub fn decay_record_size() -> usize {
    1 + bincode::serialized_size(&Decay {
        location: crate::photon::Position::default(),
        start_weight: 0.0,
        time: 0.0,
        decay_type: crate::photon::DecayType::Positron,
    })
    .expect("decay size") as usize
}

/// Serialized size of a photon record including its event flag byte.
#[must_use]
pub fn photon_record_size() -> usize {
    1 + bincode::serialized_size(&DetectedPhoton {
        location: crate::photon::FloatPosition::default(),
        direction: crate::photon::FloatDirection::default(),
        flags: 0,
        weight: 0.0,
        energy: 0.0,
        time_since_creation: 0.0,
        transaxial_position: 0.0,
        azimuthal_angle_index: 0,
        detector_angle: 0.0,
        det_crystal: 0,
    })
    .expect("photon size") as usize
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::photon::{DecayType, FloatDirection, FloatPosition, Position};
    use std::io::Cursor;

    fn sample_decay(time: f64) -> Decay {
        Decay {
            location: Position::new(1.0, -2.0, 0.5),
            start_weight: 1.0,
            time,
            decay_type: DecayType::Positron,
        }
    }

    fn sample_photon(blue: bool) -> DetectedPhoton {
        DetectedPhoton {
            location: FloatPosition {
                x: 10.0,
                y: 0.0,
                z: 1.0,
            },
            direction: FloatDirection {
                cx: 1.0,
                cy: 0.0,
                cz: 0.0,
            },
            flags: u8::from(blue),
            weight: 1.0,
            energy: 511.0,
            time_since_creation: 1e-10,
            transaxial_position: 0.0,
            azimuthal_angle_index: 0,
            detector_angle: 0.0,
            det_crystal: -1,
        }
    }

    #[test]
    fn header_roundtrip() {
        let mut params = RunTimeParams::default();
        params.random_seed = 1234;
        params.scan_mode = ScanMode::PetCoincidencesPlusSingles;
        params.detector.coincidence_timing_window_ns = 12.0;
        let mut header = HistoryHeader::new(HistoryKind::Detector, params);
        header.is_time_sorted = true;

        let block = header.to_block().unwrap();
        assert_eq!(block.len(), HEADER_SIZE);
        let decoded = HistoryHeader::from_block(&block).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn event_roundtrip() {
        let header = HistoryHeader::new(HistoryKind::Phg, RunTimeParams::default());
        let mut writer =
            HistoryWriter::create(Cursor::new(Vec::new()), header.clone()).unwrap();
        writer.write_decay(&sample_decay(1.0)).unwrap();
        writer.write_photon(&sample_photon(true)).unwrap();
        writer.write_photon(&sample_photon(false)).unwrap();
        let buffer = writer.into_inner().unwrap().into_inner();

        let mut reader = HistoryReader::open(Cursor::new(buffer)).unwrap();
        assert_eq!(reader.header(), &header);

        assert_eq!(
            reader.read_event().unwrap(),
            Some(Event::Decay(sample_decay(1.0)))
        );
        assert_eq!(
            reader.read_event().unwrap(),
            Some(Event::Photon(sample_photon(true)))
        );
        assert_eq!(
            reader.read_event().unwrap(),
            Some(Event::Photon(sample_photon(false)))
        );
        assert_eq!(reader.read_event().unwrap(), None);
    }

    #[test]
    fn record_sizes_are_fixed() {
        // flag + 3*f64 + f64 + f64 + u32 enum tag
        assert_eq!(decay_record_size(), 1 + 44);
        // flag + 3*f32 + 3*f32 + u8 + f64 + f32 + f64 + f32 + i16 + f32 + i32
        assert_eq!(photon_record_size(), 1 + 59);
    }

    #[test]
    fn header_rewrite_in_place() {
        let header = HistoryHeader::new(HistoryKind::Phg, RunTimeParams::default());
        let mut writer = HistoryWriter::create(Cursor::new(Vec::new()), header).unwrap();
        writer.write_decay(&sample_decay(3.0)).unwrap();
        writer.header_mut().is_time_sorted = true;
        writer.rewrite_header().unwrap();
        let buffer = writer.into_inner().unwrap().into_inner();

        let reader = HistoryReader::open(Cursor::new(buffer)).unwrap();
        assert!(reader.header().is_time_sorted);
    }

    #[test]
    fn truncated_header_is_a_format_error() {
        let result = HistoryHeader::from_block(&[0; 100]);
        assert!(matches!(result, Err(Error::FileFormatMismatch(_))));
    }
}
