//! Custom (field-subset) history layouts.
//!
//! A custom layout lists a subset of the per-photon fields; only those are
//! written, always in the fixed enumeration order below. A field may carry a
//! min/max filter: photons whose value falls outside it are skipped
//! entirely. Decay records keep their full layout with per-field toggles.

use crate::error::{Error, Result};
use crate::photon::{Decay, DecayType, DetectedPhoton, Position, SPEED_OF_LIGHT};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// The per-photon fields, in their fixed on-disk order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum PhotonField {
    /// X position, f32.
    XPosition,
    /// Y position, f32.
    YPosition,
    /// Z position, f32.
    ZPosition,
    /// X direction cosine, f32.
    XCosine,
    /// Y direction cosine, f32.
    YCosine,
    /// Z direction cosine, f32.
    ZCosine,
    /// Flag byte.
    Flags,
    /// Current weight, f64.
    Weight,
    /// Energy, f32.
    Energy,
    /// Seconds since creation, f64.
    TimeSinceCreation,
    /// Travel distance in cm, f64 (time since creation times c).
    TravelDistance,
    /// Transaxial position, f32.
    TransaxialPosition,
    /// Azimuthal angle index, i16.
    AzimuthalAngleIndex,
    /// Detector angle, f32.
    DetectorAngle,
    /// Detector crystal, i32.
    DetCrystal,
}

impl PhotonField {
    fn value(self, photon: &DetectedPhoton) -> f64 {
        match self {
            Self::XPosition => f64::from(photon.location.x),
            Self::YPosition => f64::from(photon.location.y),
            Self::ZPosition => f64::from(photon.location.z),
            Self::XCosine => f64::from(photon.direction.cx),
            Self::YCosine => f64::from(photon.direction.cy),
            Self::ZCosine => f64::from(photon.direction.cz),
            Self::Flags => f64::from(photon.flags),
            Self::Weight => photon.weight,
            Self::Energy => f64::from(photon.energy),
            Self::TimeSinceCreation => photon.time_since_creation,
            Self::TravelDistance => photon.time_since_creation * SPEED_OF_LIGHT,
            Self::TransaxialPosition => f64::from(photon.transaxial_position),
            Self::AzimuthalAngleIndex => f64::from(photon.azimuthal_angle_index),
            Self::DetectorAngle => f64::from(photon.detector_angle),
            Self::DetCrystal => f64::from(photon.det_crystal),
        }
    }
}

/// An inclusive acceptance range on a field's value.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FieldFilter {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl FieldFilter {
    fn accepts(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// A custom history layout.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CustomLayout {
    /// Write the decay location.
    pub do_decay_location: bool,
    /// Write the decay start weight.
    pub do_decay_weight: bool,
    /// Write the decay time.
    pub do_decay_time: bool,
    /// Write the decay type.
    pub do_decay_type: bool,
    fields: Vec<(PhotonField, Option<FieldFilter>)>,
}

impl CustomLayout {
    /// A layout with every decay field and no photon fields yet.
    #[must_use]
    pub fn with_full_decays() -> Self {
        Self {
            do_decay_location: true,
            do_decay_weight: true,
            do_decay_time: true,
            do_decay_type: true,
            fields: Vec::new(),
        }
    }

    /// Enable a photon field. Fields are kept in their enumeration order
    /// regardless of the call order.
    #[must_use]
    pub fn field(mut self, field: PhotonField) -> Self {
        self.insert(field, None);
        self
    }

    /// Enable a photon field with an acceptance range. Photons whose value
    /// falls outside the range are not written at all.
    #[must_use]
    pub fn filtered_field(mut self, field: PhotonField, min: f64, max: f64) -> Self {
        self.insert(field, Some(FieldFilter { min, max }));
        self
    }

    fn insert(&mut self, field: PhotonField, filter: Option<FieldFilter>) {
        match self
            .fields
            .binary_search_by(|(existing, _)| existing.cmp(&field))
        {
            Ok(index) => self.fields[index].1 = filter,
            Err(index) => self.fields.insert(index, (field, filter)),
        }
    }

    /// The enabled photon fields in on-disk order.
    #[must_use]
    pub fn fields(&self) -> &[(PhotonField, Option<FieldFilter>)] {
        &self.fields
    }

    /// Check the layout carries what randoms processing and time sorting
    /// need.
    ///
    /// # Errors
    ///
    /// [`Error::PreconditionFailed`] naming the missing field.
    pub fn validate_for_randoms(&self) -> Result<()> {
        if !self.do_decay_time {
            return Err(Error::PreconditionFailed(
                "randoms processing of custom list mode requires the decay time field".to_string(),
            ));
        }
        if !self.do_decay_type {
            return Err(Error::PreconditionFailed(
                "randoms processing of custom list mode requires the decay type field".to_string(),
            ));
        }
        if !self
            .fields
            .iter()
            .any(|(field, _)| *field == PhotonField::TravelDistance)
        {
            return Err(Error::PreconditionFailed(
                "randoms processing of custom list mode requires the travel distance field"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Write a decay with the enabled decay fields.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn write_decay<W: Write>(&self, writer: &mut W, decay: &Decay) -> Result<()> {
        if self.do_decay_location {
            writer.write_all(&decay.location.x.to_le_bytes())?;
            writer.write_all(&decay.location.y.to_le_bytes())?;
            writer.write_all(&decay.location.z.to_le_bytes())?;
        }
        if self.do_decay_weight {
            writer.write_all(&decay.start_weight.to_le_bytes())?;
        }
        if self.do_decay_time {
            writer.write_all(&decay.time.to_le_bytes())?;
        }
        if self.do_decay_type {
            writer.write_all(&(decay.decay_type as u32).to_le_bytes())?;
        }
        Ok(())
    }

    /// Read a decay written by [`Self::write_decay`]. Disabled fields come
    /// back as defaults.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn read_decay<R: Read>(&self, reader: &mut R) -> Result<Decay> {
        let mut decay = Decay {
            location: Position::default(),
            start_weight: 0.0,
            time: 0.0,
            decay_type: DecayType::Unknown,
        };
        if self.do_decay_location {
            decay.location.x = read_f64(reader)?;
            decay.location.y = read_f64(reader)?;
            decay.location.z = read_f64(reader)?;
        }
        if self.do_decay_weight {
            decay.start_weight = read_f64(reader)?;
        }
        if self.do_decay_time {
            decay.time = read_f64(reader)?;
        }
        if self.do_decay_type {
            decay.decay_type = match read_u32(reader)? {
                0 => DecayType::SinglePhoton,
                1 => DecayType::Positron,
                2 => DecayType::PetRandom,
                3 => DecayType::Complex,
                _ => DecayType::Unknown,
            };
        }
        Ok(decay)
    }

    /// Write the enabled fields of `photon`, or skip it entirely when a
    /// filter rejects it. Returns whether the photon was written.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn write_photon<W: Write>(&self, writer: &mut W, photon: &DetectedPhoton) -> Result<bool> {
        for (field, filter) in &self.fields {
            if let Some(filter) = filter {
                if !filter.accepts(field.value(photon)) {
                    return Ok(false);
                }
            }
        }

        for (field, _) in &self.fields {
            match field {
                PhotonField::XPosition => writer.write_all(&photon.location.x.to_le_bytes())?,
                PhotonField::YPosition => writer.write_all(&photon.location.y.to_le_bytes())?,
                PhotonField::ZPosition => writer.write_all(&photon.location.z.to_le_bytes())?,
                PhotonField::XCosine => writer.write_all(&photon.direction.cx.to_le_bytes())?,
                PhotonField::YCosine => writer.write_all(&photon.direction.cy.to_le_bytes())?,
                PhotonField::ZCosine => writer.write_all(&photon.direction.cz.to_le_bytes())?,
                PhotonField::Flags => writer.write_all(&[photon.flags])?,
                PhotonField::Weight => writer.write_all(&photon.weight.to_le_bytes())?,
                PhotonField::Energy => writer.write_all(&photon.energy.to_le_bytes())?,
                PhotonField::TimeSinceCreation => {
                    writer.write_all(&photon.time_since_creation.to_le_bytes())?;
                }
                PhotonField::TravelDistance => {
                    let distance = photon.time_since_creation * SPEED_OF_LIGHT;
                    writer.write_all(&distance.to_le_bytes())?;
                }
                PhotonField::TransaxialPosition => {
                    writer.write_all(&photon.transaxial_position.to_le_bytes())?;
                }
                PhotonField::AzimuthalAngleIndex => {
                    writer.write_all(&photon.azimuthal_angle_index.to_le_bytes())?;
                }
                PhotonField::DetectorAngle => {
                    writer.write_all(&photon.detector_angle.to_le_bytes())?;
                }
                PhotonField::DetCrystal => writer.write_all(&photon.det_crystal.to_le_bytes())?,
            }
        }
        Ok(true)
    }

    /// Read a photon written by [`Self::write_photon`]. Disabled fields come
    /// back as defaults.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn read_photon<R: Read>(&self, reader: &mut R) -> Result<DetectedPhoton> {
        let mut photon = DetectedPhoton {
            location: crate::photon::FloatPosition::default(),
            direction: crate::photon::FloatDirection::default(),
            flags: 0,
            weight: 0.0,
            energy: 0.0,
            time_since_creation: 0.0,
            transaxial_position: 0.0,
            azimuthal_angle_index: 0,
            detector_angle: 0.0,
            det_crystal: -1,
        };

        for (field, _) in &self.fields {
            match field {
                PhotonField::XPosition => photon.location.x = read_f32(reader)?,
                PhotonField::YPosition => photon.location.y = read_f32(reader)?,
                PhotonField::ZPosition => photon.location.z = read_f32(reader)?,
                PhotonField::XCosine => photon.direction.cx = read_f32(reader)?,
                PhotonField::YCosine => photon.direction.cy = read_f32(reader)?,
                PhotonField::ZCosine => photon.direction.cz = read_f32(reader)?,
                PhotonField::Flags => {
                    let mut byte = [0u8];
                    reader.read_exact(&mut byte)?;
                    photon.flags = byte[0];
                }
                PhotonField::Weight => photon.weight = read_f64(reader)?,
                PhotonField::Energy => photon.energy = read_f32(reader)?,
                PhotonField::TimeSinceCreation => {
                    photon.time_since_creation = read_f64(reader)?;
                }
                PhotonField::TravelDistance => {
                    let distance = read_f64(reader)?;
                    if photon.time_since_creation == 0.0 {
                        photon.time_since_creation = distance / SPEED_OF_LIGHT;
                    }
                }
                PhotonField::TransaxialPosition => {
                    photon.transaxial_position = read_f32(reader)?;
                }
                PhotonField::AzimuthalAngleIndex => {
                    let mut bytes = [0u8; 2];
                    reader.read_exact(&mut bytes)?;
                    photon.azimuthal_angle_index = i16::from_le_bytes(bytes);
                }
                PhotonField::DetectorAngle => photon.detector_angle = read_f32(reader)?,
                PhotonField::DetCrystal => {
                    let mut bytes = [0u8; 4];
                    reader.read_exact(&mut bytes)?;
                    photon.det_crystal = i32::from_le_bytes(bytes);
                }
            }
        }
        Ok(photon)
    }
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(f64::from_le_bytes(bytes))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(f32::from_le_bytes(bytes))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}
