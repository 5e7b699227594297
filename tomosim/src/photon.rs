//! The decay and photon data model shared by all tracking stages.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Maximum number of "starts" recorded per photon. Interactions past this
/// limit are still counted, just not recorded.
pub const MAXIMUM_STARTS: usize = 20;

/// Maximum number of detector interactions recorded per photon.
pub const MAX_DET_INTERACTIONS: usize = 30;

/// Speed of light in cm/s, used to convert travel distance to time.
pub const SPEED_OF_LIGHT: f64 = 2.99792458e10;

/// Electron rest energy in keV; the energy of an annihilation photon.
pub const ELECTRON_REST_ENERGY_KEV: f64 = 511.0;

/// A point in object space, in centimeters.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z (axial) coordinate.
    pub z: f64,
}

impl Position {
    /// Constructor.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
}

/// A unit vector of direction cosines.
///
/// Invariant: `cx^2 + cy^2 + cz^2 = 1` to within `1e-6`; every interaction
/// renormalizes after rotating.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Direction {
    /// Cosine of the angle along the x direction.
    pub cx: f64,
    /// Cosine of the angle along the y direction.
    pub cy: f64,
    /// Cosine of the angle along the z direction.
    pub cz: f64,
}

impl Direction {
    /// Constructor; does not normalize.
    #[must_use]
    pub const fn new(cx: f64, cy: f64, cz: f64) -> Self {
        Self { cx, cy, cz }
    }

    /// The reversed direction.
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            cx: -self.cx,
            cy: -self.cy,
            cz: -self.cz,
        }
    }

    /// Dot product with `other`.
    #[must_use]
    pub fn dot(&self, other: &Self) -> f64 {
        self.cx * other.cx + self.cy * other.cy + self.cz * other.cz
    }

    /// Rescale to magnitude one.
    pub fn normalize(&mut self) {
        let magnitude = self.dot(self).sqrt();
        self.cx /= magnitude;
        self.cy /= magnitude;
        self.cz /= magnitude;
    }

    /// Rotate this direction by the polar cosine `mu` about itself, with
    /// azimuth `phi`. This is the single rotation used by Compton and
    /// coherent scatter, non-collinearity, and polarization setup.
    ///
    /// When `|cz|` is within `1e-7` of one the simplified branch is taken;
    /// the general branch divides by `sqrt(1 - cz^2)`.
    pub fn rotate(&mut self, mu: f64, phi: f64) {
        let (sin_phi, cos_phi) = phi.sin_cos();
        let orig = *self;

        if (orig.cz.abs() - 1.0).abs() < 1e-7 {
            let sin_theta = (1.0 - mu * mu).sqrt();
            self.cx = sin_theta * cos_phi;
            self.cy = sin_theta * sin_phi;
            self.cz = orig.cz * mu;
        } else {
            let scale = ((1.0 - mu * mu) / (1.0 - orig.cz * orig.cz)).sqrt();
            self.cx = mu * orig.cx + scale * (orig.cx * orig.cz * cos_phi - orig.cy * sin_phi);
            self.cy = mu * orig.cy + scale * (orig.cy * orig.cz * cos_phi + orig.cx * sin_phi);
            self.cz = mu * orig.cz - scale * (1.0 - orig.cz * orig.cz) * cos_phi;
        }

        self.normalize();
    }
}

bitflags! {
    /// Modifier flags for a tracking photon. At most eight because the
    /// history file stores them in one byte.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct PhotonFlags: u8 {
        /// This is the blue photon of a pair (clear means pink).
        const BLUE = 0b001;
        /// The photon is being tracked in the scatter weight branch.
        const TRACK_AS_SCATTER = 0b010;
        /// The photon is being tracked in the primary weight branch.
        const TRACK_AS_PRIMARY = 0b100;
    }
}

/// How a decay emits.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DecayType {
    /// Single-photon emission (SPECT).
    SinglePhoton,
    /// Positron annihilation pair (PET).
    Positron,
    /// Artificial random coincidence created by randoms processing. The
    /// location stored on such a decay is copied from the first decay of
    /// the window and is physically meaningless.
    PetRandom,
    /// Multi-emission isotope (not simulated).
    Complex,
    /// Unassigned or error situations.
    Unknown,
}

/// A single radioactive decay event.
///
/// `start_weight` and `time` are immutable after creation.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Decay {
    /// Origination point of the decay.
    pub location: Position,
    /// Starting importance-sampling weight.
    pub start_weight: f64,
    /// Seconds between scan start and the decay.
    pub time: f64,
    /// Emission kind.
    pub decay_type: DecayType,
}

/// A (slice, angle) cell recorded when an interaction opens a new scatter
/// pedigree.
#[derive(Clone, Copy, Debug, Default)]
pub struct StartRecord {
    /// Stratification angle index at the time of the interaction.
    pub angle_index: i32,
    /// Slice the pedigree started in.
    pub slice_index: i32,
}

/// One energy deposition inside the detector.
#[derive(Clone, Copy, Debug)]
pub struct DetInteraction {
    /// Where the deposition happened.
    pub pos: Position,
    /// Energy deposited there, keV.
    pub energy_deposited: f64,
    /// Whether the layer the interaction took place in is active.
    pub is_active: bool,
}

/// A photon being tracked through the object, collimator, and detector.
#[derive(Clone, Debug)]
pub struct TrackingPhoton {
    /// Modifier flags.
    pub flags: PhotonFlags,
    /// Current location.
    pub location: Position,
    /// Current direction of travel.
    pub direction: Direction,
    /// Slice the photon is in.
    pub slice_index: i32,
    /// Stratification angle cell the photon is in.
    pub angle_index: i32,
    /// Slice the photon originated from.
    pub orig_slice_index: i32,
    /// Stratification angle cell the photon originated from.
    pub orig_angle_index: i32,
    /// X voxel index into the object.
    pub x_index: i32,
    /// Y voxel index into the object.
    pub y_index: i32,
    /// Number of scatters in the object.
    pub num_of_scatters: u32,
    /// Number of scatters in the collimator.
    pub scatters_in_col: u32,
    /// Scatter-branch weight.
    pub scatter_weight: f64,
    /// Primary-branch weight.
    pub primary_weight: f64,
    /// Weight seen by modules downstream of the object tracker; chosen from
    /// the scatter or primary weight at emission to the next stage.
    pub current_weight: f64,
    /// Weight of the originating decay.
    pub decay_weight: f64,
    /// Photon energy, keV.
    pub energy: f64,
    /// Cumulative travel distance, cm.
    pub travel_distance: f64,
    /// For SPECT, transaxial position on the back of the collimator.
    pub transaxial_position: f64,
    /// For SPECT/DHCI, index of the collimator/detector angle.
    pub azimuthal_angle_index: i16,
    /// For SPECT, axial position on the back of the collimator.
    pub axial_position: f64,
    /// For SPECT/DHCI, angle of the detector.
    pub detector_angle: f64,
    /// Number of starts used; keeps counting past [`MAXIMUM_STARTS`].
    pub num_starts: u32,
    /// Recorded starts.
    pub starts: ArrayVec<StartRecord, MAXIMUM_STARTS>,
    /// Interactions in the detector.
    pub det_interactions: ArrayVec<DetInteraction, MAX_DET_INTERACTIONS>,
    /// Centroid location in detector coordinates.
    pub det_location: Position,
    /// For block detectors, the crystal number for detection.
    pub det_crystal: i32,
}

impl TrackingPhoton {
    /// A photon at `location` heading along `direction` with `energy` keV.
    /// Weights start at one, indices at zero.
    #[must_use]
    pub fn new(
        flags: PhotonFlags,
        location: Position,
        direction: Direction,
        energy: f64,
    ) -> Self {
        Self {
            flags,
            location,
            direction,
            slice_index: 0,
            angle_index: 0,
            orig_slice_index: 0,
            orig_angle_index: 0,
            x_index: 0,
            y_index: 0,
            num_of_scatters: 0,
            scatters_in_col: 0,
            scatter_weight: 1.0,
            primary_weight: 1.0,
            current_weight: 1.0,
            decay_weight: 1.0,
            energy,
            travel_distance: 0.0,
            transaxial_position: 0.0,
            azimuthal_angle_index: 0,
            axial_position: 0.0,
            detector_angle: 0.0,
            num_starts: 0,
            starts: ArrayVec::new(),
            det_interactions: ArrayVec::new(),
            det_location: Position::default(),
            det_crystal: -1,
        }
    }

    /// Whether this is the blue photon of its pair.
    #[must_use]
    pub const fn is_blue(&self) -> bool {
        self.flags.contains(PhotonFlags::BLUE)
    }

    /// Whether the photon is tracked in the primary branch.
    #[must_use]
    pub const fn is_track_as_primary(&self) -> bool {
        self.flags.contains(PhotonFlags::TRACK_AS_PRIMARY)
    }

    /// Whether the photon is tracked in the scatter branch.
    #[must_use]
    pub const fn is_track_as_scatter(&self) -> bool {
        self.flags.contains(PhotonFlags::TRACK_AS_SCATTER)
    }

    /// Record a new start, if capacity remains. The start counter is
    /// incremented regardless so overflow remains observable.
    pub fn push_start(&mut self, slice_index: i32, angle_index: i32) {
        if (self.num_starts as usize) < MAXIMUM_STARTS {
            self.starts.push(StartRecord {
                angle_index,
                slice_index,
            });
        }
        self.num_starts += 1;
    }

    /// Choose the downstream weight: primary while unscattered, scatter
    /// afterwards.
    pub fn select_current_weight(&mut self) {
        self.current_weight = if self.num_of_scatters == 0 {
            self.primary_weight
        } else {
            self.scatter_weight
        };
    }

    /// Seconds since the photon's creation, from the travel distance.
    #[must_use]
    pub fn time_since_creation(&self) -> f64 {
        self.travel_distance / SPEED_OF_LIGHT
    }

    /// Convert to the serialized detected-photon form. The wire flags carry
    /// the blue and track-as-scatter bits in the low two bits and the
    /// scatter count (saturating at 63) in the upper six.
    #[must_use]
    pub fn to_detected(&self) -> DetectedPhoton {
        DetectedPhoton {
            location: FloatPosition {
                x: self.location.x as f32,
                y: self.location.y as f32,
                z: self.location.z as f32,
            },
            direction: FloatDirection {
                cx: self.direction.cx as f32,
                cy: self.direction.cy as f32,
                cz: self.direction.cz as f32,
            },
            flags: (self.flags.bits() & (PhotonFlags::BLUE | PhotonFlags::TRACK_AS_SCATTER).bits())
                | ((self.num_of_scatters.min(63) as u8) << 2),
            weight: self.current_weight,
            energy: self.energy as f32,
            time_since_creation: self.time_since_creation(),
            transaxial_position: self.transaxial_position as f32,
            azimuthal_angle_index: self.azimuthal_angle_index,
            detector_angle: self.detector_angle as f32,
            det_crystal: self.det_crystal,
        }
    }
}

/// Detected position, reduced to float for the history file.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FloatPosition {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate.
    pub z: f32,
}

/// Detected direction, reduced to float for the history file.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FloatDirection {
    /// Cosine along x.
    pub cx: f32,
    /// Cosine along y.
    pub cy: f32,
    /// Cosine along z.
    pub cz: f32,
}

/// The wire form of a photon that reached the target cylinder or detector.
///
/// The lower bits of `flags` are [`PhotonFlags`]; the event flag byte that
/// precedes the record on disk additionally carries the scatter count in its
/// upper six bits.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectedPhoton {
    /// Detection (or current) position.
    pub location: FloatPosition,
    /// Direction at detection.
    pub direction: FloatDirection,
    /// Photon flag bits.
    pub flags: u8,
    /// Current weight.
    pub weight: f64,
    /// Energy, keV.
    pub energy: f32,
    /// Seconds since the photon's creation.
    pub time_since_creation: f64,
    /// For SPECT, transaxial position on the back of the collimator.
    pub transaxial_position: f32,
    /// For SPECT/DHCI, index of the collimator/detector angle.
    pub azimuthal_angle_index: i16,
    /// For SPECT/DHCI, angle of the detector.
    pub detector_angle: f32,
    /// For block detectors, the crystal number for detection.
    pub det_crystal: i32,
}

impl DetectedPhoton {
    /// Whether the blue flag bit is set.
    #[must_use]
    pub const fn is_blue(&self) -> bool {
        self.flags & PhotonFlags::BLUE.bits() != 0
    }

    /// The scatter count encoded in the upper six flag bits.
    #[must_use]
    pub const fn num_scatters(&self) -> u32 {
        (self.flags >> 2) as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn rotation_preserves_mu() {
        let mut dir = Direction::new(0.26726124, 0.53452248, 0.80178373);
        let orig = dir;
        let mu = -0.4;
        dir.rotate(mu, 1.2345);

        assert_approx_eq!(f64, dir.dot(&dir), 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, dir.dot(&orig), mu, epsilon = 1e-7);
    }

    #[test]
    fn rotation_near_z_axis() {
        let mut dir = Direction::new(0.0, 0.0, 1.0);
        let orig = dir;
        let mu = 0.5;
        dir.rotate(mu, 0.7);

        assert_approx_eq!(f64, dir.dot(&dir), 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, dir.dot(&orig), mu, epsilon = 1e-7);
    }

    #[test]
    fn start_overflow_keeps_counting() {
        let mut photon = TrackingPhoton::new(
            PhotonFlags::BLUE,
            Position::default(),
            Direction::new(1.0, 0.0, 0.0),
            511.0,
        );

        for index in 0..25 {
            photon.push_start(index, 0);
        }

        assert_eq!(photon.num_starts, 25);
        assert_eq!(photon.starts.len(), MAXIMUM_STARTS);
    }

    #[test]
    fn current_weight_tracks_scatter_count() {
        let mut photon = TrackingPhoton::new(
            PhotonFlags::TRACK_AS_PRIMARY,
            Position::default(),
            Direction::new(1.0, 0.0, 0.0),
            511.0,
        );
        photon.primary_weight = 0.25;
        photon.scatter_weight = 0.75;

        photon.select_current_weight();
        assert_approx_eq!(f64, photon.current_weight, 0.25);

        photon.num_of_scatters = 1;
        photon.select_current_weight();
        assert_approx_eq!(f64, photon.current_weight, 0.75);
    }
}
