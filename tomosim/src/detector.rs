//! Detector response: crystal interactions, energy and time blurring, and
//! centroid/crystal assignment.

use crate::error::Result;
use crate::materials::MaterialTable;
use crate::params::DetectorParams;
use crate::photon::{DetInteraction, Position, TrackingPhoton, ELECTRON_REST_ENERGY_KEV};
use crate::sampling::Sampler;
use serde::{Deserialize, Serialize};

/// Conversion between a Gaussian FWHM and its standard deviation.
pub const FWHM_TO_SIGMA: f64 = 2.354_820_045;

/// Geometry of a cylindrical block detector.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectorGeometry {
    /// Inner radius of the crystal ring, cm.
    pub inner_radius: f64,
    /// Radial crystal depth, cm.
    pub depth: f64,
    /// Lower axial bound.
    pub z_min: f64,
    /// Upper axial bound.
    pub z_max: f64,
    /// Number of crystal rings along z.
    pub num_rings: usize,
    /// Number of crystals per ring.
    pub crystals_per_ring: usize,
    /// Crystal material index.
    pub material: usize,
}

impl DetectorGeometry {
    /// The block-model crystal index for a detection at `pos`, or -1 when
    /// the position is outside the crystal rings.
    #[must_use]
    pub fn crystal_index(&self, pos: &Position) -> i32 {
        if pos.z < self.z_min || pos.z >= self.z_max {
            return -1;
        }
        let ring = ((pos.z - self.z_min) / (self.z_max - self.z_min) * self.num_rings as f64)
            as usize;
        let ring = ring.min(self.num_rings - 1);

        let mut azimuth = pos.y.atan2(pos.x);
        if azimuth < 0.0 {
            azimuth += 2.0 * std::f64::consts::PI;
        }
        let crystal = (azimuth / (2.0 * std::f64::consts::PI) * self.crystals_per_ring as f64)
            as usize;
        let crystal = crystal.min(self.crystals_per_ring - 1);

        (ring * self.crystals_per_ring + crystal) as i32
    }
}

/// Counters the detector accumulates over a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetectorStats {
    /// Photons that deposited enough energy to be recorded.
    pub num_detected: u64,
    /// Photons that passed through without interacting.
    pub num_passed_through: u64,
    /// Photons whose interaction list overflowed its fixed capacity.
    pub num_interaction_overflows: u64,
}

/// The detector stage.
pub struct Detector<'a> {
    params: &'a DetectorParams,
    geometry: DetectorGeometry,
    materials: &'a MaterialTable,
}

impl<'a> Detector<'a> {
    /// Constructor.
    #[must_use]
    pub const fn new(
        params: &'a DetectorParams,
        geometry: DetectorGeometry,
        materials: &'a MaterialTable,
    ) -> Self {
        Self {
            params,
            geometry,
            materials,
        }
    }

    /// The detector geometry.
    #[must_use]
    pub const fn geometry(&self) -> &DetectorGeometry {
        &self.geometry
    }

    /// Run the photon through the crystal. Returns `true` when it deposited
    /// energy and was recorded; the photon's energy, detector location,
    /// crystal index, and travel time are updated in place.
    ///
    /// # Errors
    ///
    /// Material lookups propagate [`crate::error::Error::MaterialOutOfRange`].
    pub fn detect(
        &self,
        photon: &mut TrackingPhoton,
        stats: &mut DetectorStats,
        sampler: &mut Sampler,
    ) -> Result<bool> {
        let mut remaining_depth = self.geometry.depth;
        let mut position = photon.location;
        let mut deposited_total = 0.0;

        photon.det_interactions.clear();

        loop {
            let attenuation = self
                .materials
                .attenuation(self.geometry.material, photon.energy)?;
            if attenuation <= 0.0 {
                break;
            }

            let distance = if self.params.do_forced_interaction && photon.det_interactions.is_empty()
            {
                // force the first interaction inside the remaining depth and
                // carry the interaction probability in the weight
                let interaction_probability = 1.0 - (-attenuation * remaining_depth).exp();
                let draw = sampler.uniform();
                let weight_factor = interaction_probability;
                photon.primary_weight *= weight_factor;
                photon.scatter_weight *= weight_factor;
                photon.current_weight *= weight_factor;
                -(1.0 - draw * interaction_probability).ln() / attenuation
            } else {
                sampler.free_paths() / attenuation
            };

            if distance >= remaining_depth {
                // passes out the back of the crystal
                break;
            }

            photon.travel_distance += distance;
            remaining_depth -= distance;
            position = crate::geometry::project(&position, &photon.direction, distance);

            let scatter_probability = self
                .materials
                .scatter_probability(self.geometry.material, photon.energy)?;

            let deposited = if sampler.uniform() < scatter_probability {
                // Compton deposit: the recoil electron's share
                let (mu, energy_ratio) =
                    sampler.klein_nishina(photon.energy / ELECTRON_REST_ENERGY_KEV);
                let deposit = photon.energy * (1.0 - energy_ratio);
                photon.energy *= energy_ratio;
                photon
                    .direction
                    .rotate(mu, sampler.uniform_to(2.0 * std::f64::consts::PI));
                deposit
            } else {
                // photoelectric: everything
                let deposit = photon.energy;
                photon.energy = 0.0;
                deposit
            };

            deposited_total += deposited;
            if photon
                .det_interactions
                .try_push(DetInteraction {
                    pos: position,
                    energy_deposited: deposited,
                    is_active: true,
                })
                .is_err()
            {
                stats.num_interaction_overflows += 1;
            }

            if photon.energy <= 0.0 {
                break;
            }
        }

        if deposited_total <= 0.0 {
            stats.num_passed_through += 1;
            return Ok(false);
        }

        photon.det_location = centroid(&photon.det_interactions);
        photon.det_crystal = self.geometry.crystal_index(&photon.det_location);
        photon.energy = deposited_total;
        self.blur_energy(photon, sampler);
        stats.num_detected += 1;
        Ok(true)
    }

    /// Gaussian energy blur with the FWHM percentage quoted at the
    /// reference energy, scaling statistically with 1/sqrt(E / reference).
    pub fn blur_energy(&self, photon: &mut TrackingPhoton, sampler: &mut Sampler) {
        if self.params.energy_resolution_percentage < 0.0 {
            return;
        }

        let fwhm = self.params.energy_resolution_percentage / 100.0
            * (photon.energy * self.params.reference_energy).sqrt();
        photon.energy = sampler.gaussian(photon.energy, fwhm / FWHM_TO_SIGMA).max(0.0);
    }

    /// Gaussian time blur in seconds applied to a detection time.
    #[must_use]
    pub fn blur_time(&self, time_since_creation: f64, sampler: &mut Sampler) -> f64 {
        if self.params.photon_time_fwhm <= 0.0 {
            return time_since_creation;
        }
        time_since_creation + sampler.gaussian(0.0, self.params.photon_time_fwhm / FWHM_TO_SIGMA)
    }
}

/// Energy-weighted mean of the interaction points.
#[must_use]
pub fn centroid(interactions: &[DetInteraction]) -> Position {
    let total: f64 = interactions
        .iter()
        .map(|interaction| interaction.energy_deposited)
        .sum();
    if total <= 0.0 {
        return Position::default();
    }

    let mut mean = Position::default();
    for interaction in interactions {
        let share = interaction.energy_deposited / total;
        mean.x += share * interaction.pos.x;
        mean.y += share * interaction.pos.y;
        mean.z += share * interaction.pos.z;
    }
    mean
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::DetectorParams;
    use crate::photon::{Direction, PhotonFlags};
    use float_cmp::assert_approx_eq;

    fn geometry() -> DetectorGeometry {
        DetectorGeometry {
            inner_radius: 30.0,
            depth: 3.0,
            z_min: -5.0,
            z_max: 5.0,
            num_rings: 10,
            crystals_per_ring: 64,
            material: 2,
        }
    }

    fn photon() -> TrackingPhoton {
        TrackingPhoton::new(
            PhotonFlags::BLUE,
            Position::new(30.0, 0.0, 0.0),
            Direction::new(1.0, 0.0, 0.0),
            511.0,
        )
    }

    #[test]
    fn centroid_is_energy_weighted() {
        let interactions = [
            DetInteraction {
                pos: Position::new(0.0, 0.0, 0.0),
                energy_deposited: 100.0,
                is_active: true,
            },
            DetInteraction {
                pos: Position::new(3.0, 0.0, 0.0),
                energy_deposited: 300.0,
                is_active: true,
            },
        ];

        let mean = centroid(&interactions);
        assert_approx_eq!(f64, mean.x, 2.25);
    }

    #[test]
    fn crystal_lookup_wraps_rings_and_azimuth() {
        let geometry = geometry();

        // ring 5 (z = 0.5), crystal 0 (azimuth 0)
        assert_eq!(geometry.crystal_index(&Position::new(31.0, 0.0, 0.5)), 5 * 64);
        // quarter turn lands a quarter of the way around the ring
        assert_eq!(
            geometry.crystal_index(&Position::new(0.0, 31.0, 0.5)),
            5 * 64 + 16
        );
        // outside the axial extent
        assert_eq!(geometry.crystal_index(&Position::new(31.0, 0.0, 9.0)), -1);
    }

    #[test]
    fn energy_blur_fwhm_at_reference() {
        let params = DetectorParams {
            energy_resolution_percentage: 10.0,
            reference_energy: 511.0,
            ..DetectorParams::default()
        };
        let materials = MaterialTable::basic();
        let detector = Detector::new(&params, geometry(), &materials);
        let mut sampler = Sampler::new(21);

        let count = 100_000;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for _ in 0..count {
            let mut photon = photon();
            detector.blur_energy(&mut photon, &mut sampler);
            sum += photon.energy;
            sum_sq += photon.energy * photon.energy;
        }

        let mean = sum / f64::from(count);
        let sigma = (sum_sq / f64::from(count) - mean * mean).sqrt();
        assert_approx_eq!(f64, mean, 511.0, epsilon = 0.5);
        // 10% FWHM at 511 keV
        assert_approx_eq!(f64, sigma * FWHM_TO_SIGMA, 51.1, epsilon = 1.0);
    }

    #[test]
    fn forced_interaction_always_records() {
        let params = DetectorParams {
            do_forced_interaction: true,
            ..DetectorParams::default()
        };
        let materials = MaterialTable::basic();
        let detector = Detector::new(&params, geometry(), &materials);
        let mut stats = DetectorStats::default();

        for seed in 0..100 {
            let mut sampler = Sampler::new(seed);
            let mut target = photon();
            let detected = detector.detect(&mut target, &mut stats, &mut sampler).unwrap();
            assert!(detected);
            assert!(target.current_weight < 1.0);
        }
        assert_eq!(stats.num_detected, 100);
        assert_eq!(stats.num_passed_through, 0);
    }

    #[test]
    fn time_blur_is_disabled_at_zero_fwhm() {
        let params = DetectorParams::default();
        let materials = MaterialTable::basic();
        let detector = Detector::new(&params, geometry(), &materials);
        let mut sampler = Sampler::new(5);

        assert_approx_eq!(f64, detector.blur_time(1e-9, &mut sampler), 1e-9);
    }
}
