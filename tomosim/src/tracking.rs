//! The object tracker: free-path stepping through the voxel grid, Compton
//! and coherent interactions, importance-sampling branch splitting, and
//! forced detection.

use crate::emission::PairPolarization;
use crate::error::{Error, Result};
use crate::geometry::{clamped, project, VoxelExit};
use crate::materials::MaterialTable;
use crate::object::ObjectGrid;
use crate::params::RunTimeParams;
use crate::photon::{PhotonFlags, TrackingPhoton, ELECTRON_REST_ENERGY_KEV};
use crate::prodtbl::{ProductivityKind, ProductivityTable};
use crate::sampling::Sampler;

/// Why a photon's trace through the object ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackAction {
    /// Reached the target cylinder.
    Detect,
    /// Absorbed, lost to low energy, or escaped out of acceptance.
    Discard,
    /// Interacted inside the object; tracking continues.
    Interact,
}

/// Counters the tracker accumulates over a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackingStats {
    /// Photons that reached the target cylinder.
    pub num_detected: u64,
    /// Photons absorbed in the object.
    pub num_absorbed: u64,
    /// Photons discarded below the minimum energy.
    pub num_low_energy: u64,
    /// Photons leaving through the object end caps or out of acceptance.
    pub num_out_of_acceptance: u64,
    /// Primary-only photons discarded at their first interaction.
    pub num_primary_only_scatter: u64,
    /// Photons killed by weight-window Russian roulette.
    pub num_rouletted: u64,
    /// Forced-detection copies emitted.
    pub num_forced_detections: u64,
}

/// Tracks photons through the voxelized object to the target cylinder.
pub struct ObjectTracker<'a> {
    object: &'a ObjectGrid,
    materials: &'a MaterialTable,
    params: &'a RunTimeParams,
}

impl<'a> ObjectTracker<'a> {
    /// Constructor.
    #[must_use]
    pub const fn new(
        object: &'a ObjectGrid,
        materials: &'a MaterialTable,
        params: &'a RunTimeParams,
    ) -> Self {
        Self {
            object,
            materials,
            params,
        }
    }

    /// Split the photon into its primary and scatter tracking branches using
    /// the productivities of its original cell. The branch with the higher
    /// productivity is always followed; the other is followed with
    /// probability equal to the productivity ratio, its weight divided by
    /// that probability to compensate.
    pub fn split_branches(
        &self,
        photon: &mut TrackingPhoton,
        prodtbl: &ProductivityTable,
        sampler: &mut Sampler,
    ) {
        let primary = prodtbl.primary(photon.orig_slice_index, photon.orig_angle_index);
        let scatter = prodtbl.scatter(photon.orig_slice_index, photon.orig_angle_index);
        if primary <= 0.0 || scatter <= 0.0 {
            return;
        }

        photon.flags |= PhotonFlags::TRACK_AS_PRIMARY | PhotonFlags::TRACK_AS_SCATTER;
        if scatter >= primary {
            let ratio = primary / scatter;
            if sampler.uniform() < ratio {
                photon.primary_weight /= ratio;
            } else {
                photon.flags.remove(PhotonFlags::TRACK_AS_PRIMARY);
            }
        } else {
            let ratio = scatter / primary;
            if sampler.uniform() < ratio {
                photon.scatter_weight /= ratio;
            } else {
                photon.flags.remove(PhotonFlags::TRACK_AS_SCATTER);
            }
        }
    }

    /// Track one photon to completion. Photons that reach the target (the
    /// Monte Carlo photon itself, plus any forced-detection copies) are
    /// appended to `detected`.
    ///
    /// # Errors
    ///
    /// [`Error::MaterialOutOfRange`] if a voxel references an undeclared
    /// material; [`Error::InvariantViolated`] on index corruption.
    pub fn track(
        &self,
        mut photon: TrackingPhoton,
        polarization: Option<&PairPolarization>,
        prodtbl: &mut ProductivityTable,
        stats: &mut TrackingStats,
        sampler: &mut Sampler,
        detected: &mut Vec<TrackingPhoton>,
    ) -> Result<()> {
        let forced_detection = self.params.is_forced_detection;

        // initial forced-detection copy for the primary branch
        if forced_detection && photon.is_track_as_primary() {
            self.attempt_forced_detection(&photon, stats, detected)?;
        }

        loop {
            if forced_detection && !photon.is_track_as_scatter() {
                // primary branch was fully handled by the forced copy
                return Ok(());
            }

            let free_paths = sampler.free_paths();
            let action = self.advance(&mut photon, free_paths)?;

            match action {
                TrackAction::Detect => {
                    // with forced detection on, the copies already account
                    // for every detection
                    if !forced_detection
                        && (photon.num_of_scatters > 0 || photon.is_track_as_primary())
                    {
                        self.record_detection(&mut photon, prodtbl, stats);
                        detected.push(photon);
                    }
                    return Ok(());
                }
                TrackAction::Discard => {
                    stats.num_out_of_acceptance += 1;
                    return Ok(());
                }
                TrackAction::Interact => {
                    if !photon.is_track_as_scatter() {
                        stats.num_primary_only_scatter += 1;
                        return Ok(());
                    }

                    if !self.interact(&mut photon, polarization, stats, sampler)? {
                        return Ok(());
                    }

                    photon.num_of_scatters += 1;
                    photon.push_start(photon.slice_index, photon.angle_index);
                    prodtbl.add_starting_productivity(
                        photon.slice_index,
                        photon.angle_index,
                        ProductivityKind::Scatter,
                    );

                    if !self.survives_weight_window(&mut photon, stats, sampler) {
                        return Ok(());
                    }

                    // scatter copies for forced detection
                    if forced_detection {
                        self.attempt_forced_detection(&photon, stats, detected)?;
                    }
                }
            }
        }
    }

    /// Advance the photon by `free_paths` worth of attenuation, stopping at
    /// an interaction point, the target cylinder, or an end-cap escape.
    fn advance(&self, photon: &mut TrackingPhoton, free_paths: f64) -> Result<TrackAction> {
        let mut remaining = free_paths;

        loop {
            if !self
                .object
                .in_bounds(photon.slice_index, photon.x_index, photon.y_index)
            {
                return Err(Error::InvariantViolated(format!(
                    "photon voxel indices ({}, {}, {}) left the object grid mid-track",
                    photon.slice_index, photon.x_index, photon.y_index
                )));
            }

            let material = self.object.material(
                photon.slice_index as usize,
                photon.x_index as usize,
                photon.y_index as usize,
            );
            let attenuation = self.materials.attenuation(material, photon.energy)?;

            let distances = self.object.boundary_distances(
                &photon.location,
                &photon.direction,
                photon.slice_index as usize,
                photon.x_index as usize,
                photon.y_index as usize,
            );
            let (exit, boundary_distance) = distances.nearest();

            // distance that would consume the remaining free paths here
            let interaction_distance = if attenuation > 0.0 {
                remaining / attenuation
            } else {
                f64::MAX
            };

            if interaction_distance < boundary_distance {
                photon.location = project(
                    &photon.location,
                    &clamped(&photon.direction),
                    interaction_distance,
                );
                photon.travel_distance += interaction_distance;
                return Ok(TrackAction::Interact);
            }

            photon.location = project(
                &photon.location,
                &clamped(&photon.direction),
                boundary_distance,
            );
            photon.travel_distance += boundary_distance;
            remaining -= boundary_distance * attenuation;

            match exit {
                VoxelExit::Cylinder => return Ok(self.escape(photon)),
                VoxelExit::ZFace => {
                    let new_slice =
                        photon.slice_index + if photon.direction.cz > 0.0 { 1 } else { -1 };
                    if new_slice < 0 || new_slice as usize >= self.object.slices.len() {
                        // out through an end cap
                        return Ok(TrackAction::Discard);
                    }
                    photon.slice_index = new_slice;
                }
                VoxelExit::XFace => {
                    photon.x_index += if photon.direction.cx > 0.0 { 1 } else { -1 };
                }
                VoxelExit::YFace => {
                    // y indices grow downward
                    photon.y_index += if photon.direction.cy > 0.0 { -1 } else { 1 };
                }
            }
        }
    }

    /// The photon left the object cylinder: project it to the target
    /// cylinder, or discard it when it cannot reach the target.
    fn escape(&self, photon: &mut TrackingPhoton) -> TrackAction {
        if photon.direction.cz.abs() > self.params.acceptance_angle_sine {
            return TrackAction::Discard;
        }

        let target = self.params.cylinders.target;
        let Some(distance) = target.distance_to_surface(&photon.location, &photon.direction)
        else {
            return TrackAction::Discard;
        };

        let landing = project(&photon.location, &photon.direction, distance);
        if landing.z < target.z_min || landing.z > target.z_max {
            return TrackAction::Discard;
        }

        photon.location = landing;
        photon.travel_distance += distance;
        TrackAction::Detect
    }

    /// Russian roulette against the weight window: a scatter weight that
    /// has dropped below `min_ww_ratio` of the decay weight survives with
    /// probability weight/threshold, its weight raised to the threshold so
    /// the expectation is preserved.
    fn survives_weight_window(
        &self,
        photon: &mut TrackingPhoton,
        stats: &mut TrackingStats,
        sampler: &mut Sampler,
    ) -> bool {
        if self.params.min_ww_ratio <= 0.0 {
            return true;
        }

        let threshold = self.params.min_ww_ratio * photon.decay_weight;
        if photon.scatter_weight >= threshold {
            return true;
        }

        if sampler.uniform() < photon.scatter_weight / threshold {
            photon.scatter_weight = threshold;
            true
        } else {
            stats.num_rouletted += 1;
            false
        }
    }

    /// Perform one interaction. Returns `Ok(false)` when the photon was
    /// terminated (absorption or low energy).
    fn interact(
        &self,
        photon: &mut TrackingPhoton,
        polarization: Option<&PairPolarization>,
        stats: &mut TrackingStats,
        sampler: &mut Sampler,
    ) -> Result<bool> {
        let material = self.object.material(
            photon.slice_index as usize,
            photon.x_index as usize,
            photon.y_index as usize,
        );
        let scatter_probability = self.materials.scatter_probability(material, photon.energy)?;
        let compton_to_scatter = self.materials.compton_to_scatter(material, photon.energy)?;
        let draw = sampler.uniform();

        if self.params.is_forced_non_absorption {
            // absorption is never sampled; the scatter branch carries the
            // survival probability in its weight instead
            photon.scatter_weight *= scatter_probability;

            if draw < compton_to_scatter {
                self.compton(photon, polarization, sampler);
            } else if self.params.is_model_coherent_in_obj {
                self.coherent(photon, material, sampler)?;
            }
        } else if draw > scatter_probability {
            stats.num_absorbed += 1;
            photon.energy = 0.0;
            return Ok(false);
        } else if draw > scatter_probability * compton_to_scatter {
            self.coherent(photon, material, sampler)?;
        } else {
            self.compton(photon, polarization, sampler);
        }

        if photon.energy < self.params.minimum_energy {
            stats.num_low_energy += 1;
            return Ok(false);
        }

        Ok(true)
    }

    /// Compton scatter via Kahn's sampling of the Klein-Nishina
    /// distribution.
    fn compton(
        &self,
        photon: &mut TrackingPhoton,
        polarization: Option<&PairPolarization>,
        sampler: &mut Sampler,
    ) {
        let energy_ratio_in = photon.energy / ELECTRON_REST_ENERGY_KEV;
        let (mu, energy_ratio) = sampler.klein_nishina(energy_ratio_in);
        let phi = sampler.uniform_to(2.0 * std::f64::consts::PI);

        photon.energy *= energy_ratio;
        photon.direction.rotate(mu, phi);

        if let Some(polarization) = polarization {
            if self.params.is_model_polarization && photon.num_of_scatters == 0 {
                polarization_adjust(photon, polarization, mu, phi);
            }
        }
    }

    /// Coherent scatter: direction changes, energy does not.
    fn coherent(
        &self,
        photon: &mut TrackingPhoton,
        material: usize,
        sampler: &mut Sampler,
    ) -> Result<()> {
        let mu = self
            .materials
            .coherent_cos_theta(material, photon.energy, sampler)?;
        let phi = sampler.uniform_to(2.0 * std::f64::consts::PI);
        photon.direction.rotate(mu, phi);
        Ok(())
    }

    fn record_detection(
        &self,
        photon: &mut TrackingPhoton,
        prodtbl: &mut ProductivityTable,
        stats: &mut TrackingStats,
    ) {
        photon.select_current_weight();
        stats.num_detected += 1;

        let kind = if photon.num_of_scatters == 0 {
            ProductivityKind::Primary
        } else {
            ProductivityKind::Scatter
        };
        prodtbl.add_detected_productivity(
            photon.orig_slice_index,
            photon.orig_angle_index,
            photon.current_weight * photon.decay_weight,
            kind,
        );
    }

    /// Emit a deterministic copy of `photon` projected to the target
    /// cylinder, weighted by the attenuation along the way.
    fn attempt_forced_detection(
        &self,
        photon: &TrackingPhoton,
        stats: &mut TrackingStats,
        detected: &mut Vec<TrackingPhoton>,
    ) -> Result<()> {
        let mut copy = photon.clone();
        if self.escape_path_blocked(&copy) {
            return Ok(());
        }

        let attenuation_integral = self.attenuation_to_cylinder(&copy)?;
        if self.escape(&mut copy) != TrackAction::Detect {
            return Ok(());
        }

        let survival = (-attenuation_integral).exp();
        if copy.num_of_scatters == 0 {
            copy.primary_weight *= survival;
        } else {
            copy.scatter_weight *= survival;
        }
        copy.select_current_weight();

        stats.num_forced_detections += 1;
        detected.push(copy);
        Ok(())
    }

    fn escape_path_blocked(&self, photon: &TrackingPhoton) -> bool {
        photon.direction.cz.abs() > self.params.acceptance_angle_sine
    }

    /// Integral of µ along the photon's straight path to the object
    /// cylinder surface.
    fn attenuation_to_cylinder(&self, photon: &TrackingPhoton) -> Result<f64> {
        let mut position = photon.location;
        let direction = clamped(&photon.direction);
        let mut indices = (photon.slice_index, photon.x_index, photon.y_index);
        let mut integral = 0.0;

        loop {
            let (slice_index, x_index, y_index) = indices;
            if !self.object.in_bounds(slice_index, x_index, y_index) {
                return Ok(integral);
            }

            let material =
                self.object
                    .material(slice_index as usize, x_index as usize, y_index as usize);
            let attenuation = self.materials.attenuation(material, photon.energy)?;

            let distances = self.object.boundary_distances(
                &position,
                &direction,
                slice_index as usize,
                x_index as usize,
                y_index as usize,
            );
            let (exit, boundary_distance) = distances.nearest();

            integral += boundary_distance * attenuation;
            position = project(&position, &direction, boundary_distance);

            match exit {
                VoxelExit::Cylinder => return Ok(integral),
                _ => crate::emission::advance_indices(&mut indices, exit, &direction),
            }

            if indices.0 < 0 || indices.0 as usize >= self.object.slices.len() {
                return Ok(integral);
            }
        }
    }
}

/// Multiply the scatter weight by the Klein-Nishina-with-polarization
/// factor for a first Compton scatter of a polarized annihilation photon.
fn polarization_adjust(
    photon: &mut TrackingPhoton,
    polarization: &PairPolarization,
    mu: f64,
    phi: f64,
) {
    let phi_polar = polarization.phi_for(photon.is_blue());
    let energy_out = photon.energy / ELECTRON_REST_ENERGY_KEV;
    let delta_phi = phi - phi_polar;

    let unpolarized = energy_out + 1.0 / energy_out - (1.0 - mu * mu);
    let polarized = energy_out + 1.0 / energy_out
        - 2.0 * (1.0 - mu * mu) * delta_phi.cos() * delta_phi.cos();

    photon.scatter_weight *= polarized / unpolarized;
}
