//! Decay generation: voxel and angle sampling, positron range, pair
//! non-collinearity, and polarization setup.

use crate::materials::MaterialTable;
use crate::object::ObjectGrid;
use crate::params::{Isotope, RunTimeParams};
use crate::photon::{Decay, DecayType, Direction, PhotonFlags, Position, TrackingPhoton};
use crate::prodtbl::ProductivityTable;
use crate::sampling::Sampler;

/// Standard deviation of the annihilation non-collinearity angle, radians.
pub const NON_COLLINEARITY_SIGMA: f64 = 0.0037059;

/// Number of bins in the cumulative positron-energy table.
pub const POSITRON_ENERGY_BINS: usize = 100;

/// Cumulative positron emission-energy table for one isotope: 100 keV
/// values, `table[i]` being the energy below which `(i + 1)%` of emissions
/// fall.
#[derive(Clone, Debug)]
pub struct PositronEnergyTable {
    cumulative_kev: [f64; POSITRON_ENERGY_BINS],
}

impl PositronEnergyTable {
    /// Build from a full cumulative table.
    #[must_use]
    pub const fn new(cumulative_kev: [f64; POSITRON_ENERGY_BINS]) -> Self {
        Self { cumulative_kev }
    }

    /// A linear ramp up to `max_kev`, adequate when no isotope data file is
    /// loaded.
    #[must_use]
    pub fn linear(max_kev: f64) -> Self {
        let mut cumulative_kev = [0.0; POSITRON_ENERGY_BINS];
        for (index, value) in cumulative_kev.iter_mut().enumerate() {
            *value = max_kev * (index + 1) as f64 / POSITRON_ENERGY_BINS as f64;
        }
        Self { cumulative_kev }
    }

    /// The table for `isotope`, keyed by its endpoint energy.
    #[must_use]
    pub fn for_isotope(isotope: Isotope) -> Self {
        let endpoint_kev = match isotope {
            Isotope::F18 => 633.5,
            Isotope::C11 => 960.2,
            Isotope::O15 => 1732.0,
            Isotope::Na22 => 545.7,
            Isotope::Tc99m | Isotope::None => 0.0,
        };
        Self::linear(endpoint_kev)
    }

    /// Sample an emission energy in keV by interpolating the cumulative
    /// table at a uniform draw.
    pub fn sample(&self, sampler: &mut Sampler) -> f64 {
        let draw = sampler.uniform_to(100.0);
        let index = (draw as usize).min(POSITRON_ENERGY_BINS - 1);

        if index == 0 {
            self.cumulative_kev[0] * draw
        } else {
            let below = self.cumulative_kev[index - 1];
            below + (self.cumulative_kev[index] - below) * (draw - index as f64)
        }
    }
}

/// Polarization state of an annihilation pair, fixed at emission and used on
/// each photon's first Compton scatter.
#[derive(Clone, Copy, Debug)]
pub struct PairPolarization {
    /// Blue photon's polarization azimuth, radians in `[0, pi)`.
    pub blue_phi: f64,
    /// Pink photon's polarization azimuth.
    pub pink_phi: f64,
    /// Blue polarization unit vector (perpendicular to the blue direction).
    pub blue_direction: Direction,
    /// Pink polarization unit vector.
    pub pink_direction: Direction,
}

impl PairPolarization {
    /// Sample the polarization for a freshly emitted pair.
    pub fn sample(blue: &Direction, pink: &Direction, sampler: &mut Sampler) -> Self {
        let phi = sampler.uniform_to(std::f64::consts::PI);
        let (sin_phi, cos_phi) = phi.sin_cos();

        let blue_pol = if (blue.cz.abs() - 1.0).abs() < 1e-7 {
            Direction::new(cos_phi, sin_phi, 0.0)
        } else {
            let scale = 1.0 / (1.0 - blue.cz * blue.cz).sqrt();
            Direction::new(
                scale * (blue.cx * blue.cz * cos_phi - blue.cy * sin_phi),
                scale * (blue.cy * blue.cz * cos_phi + blue.cx * sin_phi),
                -scale * (1.0 - blue.cz * blue.cz) * cos_phi,
            )
        };

        // pink polarization is perpendicular to both
        let pink_pol = Direction::new(
            blue_pol.cy * pink.cz - blue_pol.cz * pink.cy,
            blue_pol.cz * pink.cx - blue_pol.cx * pink.cz,
            blue_pol.cx * pink.cy - blue_pol.cy * pink.cx,
        );

        let mut pink_phi = phi + std::f64::consts::FRAC_PI_2;
        if pink_phi >= std::f64::consts::PI {
            pink_phi -= std::f64::consts::PI;
        }

        Self {
            blue_phi: phi,
            pink_phi,
            blue_direction: blue_pol,
            pink_direction: pink_pol,
        }
    }

    /// The polarization azimuth for `photon` (blue or pink).
    #[must_use]
    pub const fn phi_for(&self, is_blue: bool) -> f64 {
        if is_blue {
            self.blue_phi
        } else {
            self.pink_phi
        }
    }
}

/// A decay ready for tracking: the decay record, its photon(s), and the
/// pair polarization when modeled.
#[derive(Clone, Debug)]
pub struct GeneratedDecay {
    /// The decay record, written to the history file ahead of its photons.
    pub decay: Decay,
    /// The blue photon.
    pub blue: TrackingPhoton,
    /// The pink photon (PET only).
    pub pink: Option<TrackingPhoton>,
    /// Polarization of the pair, when modeled.
    pub polarization: Option<PairPolarization>,
}

/// Statistics the generator keeps.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeneratorStats {
    /// Decays emitted.
    pub num_generated: u64,
    /// Decays discarded because the positron left the object.
    pub num_positron_escapes: u64,
}

/// The decay generator. Samples decay voxels from the activity distribution,
/// assigns Poisson-process decay times over the scan length, and applies
/// positron range and non-collinearity adjustments.
pub struct DecayGenerator<'a> {
    object: &'a ObjectGrid,
    materials: &'a MaterialTable,
    params: &'a RunTimeParams,
    energy_table: PositronEnergyTable,
    /// Cumulative activity over (slice, x, y), for voxel sampling.
    cumulative_activity: Vec<(f64, usize, usize, usize)>,
    total_activity: f64,
    remaining: u64,
    current_time: f64,
    mean_interval: f64,
    stats: GeneratorStats,
}

impl<'a> DecayGenerator<'a> {
    /// Build a generator that will emit `params.num_to_simulate` decays.
    #[must_use]
    pub fn new(
        object: &'a ObjectGrid,
        materials: &'a MaterialTable,
        params: &'a RunTimeParams,
    ) -> Self {
        let mut cumulative_activity = Vec::new();
        let mut total = 0.0;
        for (slice_index, slice) in object.slices.iter().enumerate() {
            for ((y_index, x_index), activity) in slice.activity.indexed_iter() {
                if *activity > 0.0 {
                    total += *activity;
                    cumulative_activity.push((total, slice_index, x_index, y_index));
                }
            }
        }

        let mean_interval = if params.num_to_simulate > 0 {
            params.length_of_scan / params.num_to_simulate as f64
        } else {
            0.0
        };

        Self {
            object,
            materials,
            params,
            energy_table: PositronEnergyTable::for_isotope(params.isotope),
            cumulative_activity,
            total_activity: total,
            remaining: params.num_to_simulate,
            current_time: 0.0,
            mean_interval,
            stats: GeneratorStats::default(),
        }
    }

    /// Generator statistics so far.
    #[must_use]
    pub const fn stats(&self) -> GeneratorStats {
        self.stats
    }

    /// Produce the next decay, or `None` once the decay budget is spent.
    /// Decays whose positron walks out of the object are resampled
    /// internally. The productivity table supplies the stratification
    /// angle-cell indices.
    pub fn next_decay(
        &mut self,
        prodtbl: &ProductivityTable,
        sampler: &mut Sampler,
    ) -> Option<GeneratedDecay> {
        if self.cumulative_activity.is_empty() {
            return None;
        }

        loop {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            self.current_time += self.mean_interval * sampler.free_paths();

            if let Some(generated) = self.try_generate(prodtbl, sampler) {
                self.stats.num_generated += 1;
                return Some(generated);
            }
            self.stats.num_positron_escapes += 1;
        }
    }

    fn try_generate(
        &mut self,
        prodtbl: &ProductivityTable,
        sampler: &mut Sampler,
    ) -> Option<GeneratedDecay> {
        let (slice_index, x_index, y_index) = self.sample_voxel(sampler);
        let slice = &self.object.slices[slice_index];

        // uniform point inside the voxel
        let x_left = self.object.cylinder.center_x - slice.half_width
            + x_index as f64 * slice.voxel_width();
        let y_top =
            self.object.cylinder.center_y + slice.half_width - y_index as f64 * slice.voxel_height();
        let mut location = Position::new(
            x_left + sampler.uniform_to(slice.voxel_width()),
            y_top - sampler.uniform_to(slice.voxel_height()),
            slice.z_min + sampler.uniform_to(slice.voxel_depth()),
        );

        // isotropic emission direction
        let cos_z = 2.0 * sampler.uniform() - 1.0;
        let phi = sampler.uniform_to(2.0 * std::f64::consts::PI);
        let sin_z = (1.0 - cos_z * cos_z).sqrt();
        let emission = Direction::new(sin_z * phi.cos(), sin_z * phi.sin(), cos_z);

        let mut indices = (slice_index as i32, x_index as i32, y_index as i32);

        if self.params.is_pet() && self.params.is_adjust_for_positron_range {
            let energy_mev = self.energy_table.sample(sampler) / 1000.0;
            let (water_range, sigma_water, positron_dir) =
                self.sample_water_range(energy_mev, sampler);
            location = self.walk_positron(
                location,
                positron_dir,
                energy_mev,
                water_range,
                sigma_water,
                &mut indices,
            )?;
        }

        let decay_type = if self.params.is_pet() {
            DecayType::Positron
        } else {
            DecayType::SinglePhoton
        };
        let decay = Decay {
            location,
            start_weight: 1.0,
            time: self.current_time,
            decay_type,
        };

        let angle_index = prodtbl.angle_index(emission.cz);
        let mut blue = self.create_photon(
            PhotonFlags::BLUE | PhotonFlags::TRACK_AS_PRIMARY | PhotonFlags::TRACK_AS_SCATTER,
            &decay,
            emission,
            indices,
            angle_index,
        );

        let mut pink = None;
        if self.params.is_pet() {
            let pink_angle = prodtbl.opposite_angle_index(angle_index);
            let mut photon = self.create_photon(
                PhotonFlags::TRACK_AS_PRIMARY | PhotonFlags::TRACK_AS_SCATTER,
                &decay,
                emission.reversed(),
                indices,
                pink_angle,
            );

            if self.params.is_adjust_for_non_collinearity {
                let target = if sampler.uniform() < 0.5 {
                    &mut photon
                } else {
                    &mut blue
                };
                adjust_for_non_collinearity(target, sampler);
                target.angle_index = prodtbl.angle_index(target.direction.cz);
            }

            pink = Some(photon);
        }

        let polarization = if self.params.is_pet() && self.params.is_model_polarization {
            pink.as_ref()
                .map(|pink| PairPolarization::sample(&blue.direction, &pink.direction, sampler))
        } else {
            None
        };

        Some(GeneratedDecay {
            decay,
            blue,
            pink,
            polarization,
        })
    }

    fn sample_voxel(&self, sampler: &mut Sampler) -> (usize, usize, usize) {
        let draw = sampler.uniform_to(self.total_activity);
        let index = self
            .cumulative_activity
            .partition_point(|(cumulative, ..)| *cumulative < draw);
        let (_, slice, x, y) = self.cumulative_activity[index.min(self.cumulative_activity.len() - 1)];
        (slice, x, y)
    }

    fn create_photon(
        &self,
        flags: PhotonFlags,
        decay: &Decay,
        direction: Direction,
        (slice_index, x_index, y_index): (i32, i32, i32),
        angle_index: i32,
    ) -> TrackingPhoton {
        let mut photon = TrackingPhoton::new(flags, decay.location, direction, self.params.photon_energy_kev);
        photon.slice_index = slice_index;
        photon.orig_slice_index = slice_index;
        photon.x_index = x_index;
        photon.y_index = y_index;
        photon.angle_index = angle_index;
        photon.orig_angle_index = angle_index;
        photon.decay_weight = decay.start_weight;
        photon
    }

    /// Sample the positron's range in water and travel direction from a 3-D
    /// Gaussian, after Palmer and Brownell.
    fn sample_water_range(&self, energy_mev: f64, sampler: &mut Sampler) -> (f64, f64, Direction) {
        let water = self
            .materials
            .positron_constants(1)
            .unwrap_or(crate::materials::PositronRangeConstants {
                b1: 5.46,
                b2: 2.76,
                density: 1.0,
            });
        let sigma_water = water.sigma(energy_mev);

        let dx = sampler.gaussian(0.0, sigma_water);
        let dy = sampler.gaussian(0.0, sigma_water);
        let dz = sampler.gaussian(0.0, sigma_water);
        let range = (dx * dx + dy * dy + dz * dz).sqrt();

        let direction = if range > 0.0 {
            Direction::new(dx / range, dy / range, dz / range)
        } else {
            Direction::new(0.0, 0.0, 1.0)
        };

        (range, sigma_water, direction)
    }

    /// Walk the positron through heterogeneous voxels, spending its
    /// equivalent range-in-water. Returns the annihilation point, or `None`
    /// when the positron reaches the object surface (decay is discarded).
    fn walk_positron(
        &self,
        start: Position,
        direction: Direction,
        energy_mev: f64,
        water_range: f64,
        sigma_water: f64,
        indices: &mut (i32, i32, i32),
    ) -> Option<Position> {
        let direction = crate::geometry::clamped(&direction);
        let mut position = start;
        let mut remaining_water = water_range;

        loop {
            let (slice_index, x_index, y_index) = *indices;
            if !self.object.in_bounds(slice_index, x_index, y_index) {
                return None;
            }

            let material = self
                .object
                .material(slice_index as usize, x_index as usize, y_index as usize);
            let constants = self.materials.positron_constants(material).ok()?;
            let sigma = constants.sigma(energy_mev).max(1e-12);
            let water_per_cm = sigma_water / sigma;

            let distances = self.object.boundary_distances(
                &position,
                &direction,
                slice_index as usize,
                x_index as usize,
                y_index as usize,
            );
            let (exit, boundary_distance) = distances.nearest();

            let cell_water = boundary_distance * water_per_cm;
            if cell_water >= remaining_water {
                // annihilates inside this cell
                let distance = remaining_water / water_per_cm;
                return Some(crate::geometry::project(&position, &direction, distance));
            }

            if exit == crate::geometry::VoxelExit::Cylinder {
                return None;
            }

            remaining_water -= cell_water;
            position = crate::geometry::project(&position, &direction, boundary_distance);
            advance_indices(indices, exit, &direction);
        }
    }
}

/// Step voxel indices across the face identified by `exit`. The y index
/// grows downward.
pub fn advance_indices(
    indices: &mut (i32, i32, i32),
    exit: crate::geometry::VoxelExit,
    direction: &Direction,
) {
    use crate::geometry::VoxelExit;
    match exit {
        VoxelExit::XFace => indices.1 += if direction.cx > 0.0 { 1 } else { -1 },
        VoxelExit::YFace => indices.2 += if direction.cy > 0.0 { -1 } else { 1 },
        VoxelExit::ZFace => indices.0 += if direction.cz > 0.0 { 1 } else { -1 },
        VoxelExit::Cylinder => {}
    }
}

/// Rotate a photon's direction by a Gaussian-sampled deviation from exact
/// anti-parallelism.
pub fn adjust_for_non_collinearity(photon: &mut TrackingPhoton, sampler: &mut Sampler) {
    let theta = sampler.gaussian(0.0, NON_COLLINEARITY_SIGMA);
    let mu = theta.cos();
    let phi = sampler.uniform_to(2.0 * std::f64::consts::PI);
    photon.direction.rotate(mu, phi);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Cylinder;
    use crate::params::ScanMode;
    use float_cmp::assert_approx_eq;

    fn test_setup() -> (ObjectGrid, MaterialTable, ProductivityTable, RunTimeParams) {
        let object = ObjectGrid::uniform(
            Cylinder {
                radius: 10.0,
                z_min: -5.0,
                z_max: 5.0,
                center_x: 0.0,
                center_y: 0.0,
            },
            5,
            20,
            20,
            1,
        );
        let mut params = RunTimeParams::default();
        params.num_to_simulate = 100;
        params.length_of_scan = 60.0;
        params.scan_mode = ScanMode::PetCoincidencesPlusSingles;
        (object, MaterialTable::basic(), ProductivityTable::flat(5, 8), params)
    }

    #[test]
    fn pairs_are_anti_parallel_without_non_collinearity() {
        let (object, materials, prodtbl, params) = test_setup();
        let mut generator = DecayGenerator::new(&object, &materials, &params);
        let mut sampler = Sampler::new(1);

        let generated = generator.next_decay(&prodtbl, &mut sampler).unwrap();
        let pink = generated.pink.unwrap();

        assert_approx_eq!(
            f64,
            generated.blue.direction.dot(&pink.direction),
            -1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn decay_times_increase() {
        let (object, materials, prodtbl, params) = test_setup();
        let mut generator = DecayGenerator::new(&object, &materials, &params);
        let mut sampler = Sampler::new(2);

        let mut last = -1.0;
        while let Some(generated) = generator.next_decay(&prodtbl, &mut sampler) {
            assert!(generated.decay.time > last);
            last = generated.decay.time;
        }
        assert_eq!(generator.stats().num_generated, 100);
    }

    #[test]
    fn non_collinearity_deflects_one_photon() {
        let (object, materials, prodtbl, mut params) = test_setup();
        params.is_adjust_for_non_collinearity = true;
        let mut generator = DecayGenerator::new(&object, &materials, &params);
        let mut sampler = Sampler::new(3);

        let mut deflected = 0;
        for _ in 0..20 {
            let generated = generator.next_decay(&prodtbl, &mut sampler).unwrap();
            let pink = generated.pink.unwrap();
            let dot = generated.blue.direction.dot(&pink.direction);

            // deflection stays tiny
            assert!(dot <= -0.999);
            assert!(dot >= -1.0 - 1e-12);
            if dot > -0.999_999_9 {
                deflected += 1;
            }
        }
        assert!(deflected > 0);
    }

    #[test]
    fn polarization_is_perpendicular() {
        let (object, materials, prodtbl, mut params) = test_setup();
        params.is_model_polarization = true;
        let mut generator = DecayGenerator::new(&object, &materials, &params);
        let mut sampler = Sampler::new(4);

        let generated = generator.next_decay(&prodtbl, &mut sampler).unwrap();
        let polarization = generated.polarization.unwrap();

        assert_approx_eq!(
            f64,
            polarization.blue_direction.dot(&generated.blue.direction),
            0.0,
            epsilon = 1e-9
        );
        assert_approx_eq!(
            f64,
            polarization.blue_direction.dot(&polarization.blue_direction),
            1.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn positron_energy_sampling_is_bounded() {
        let table = PositronEnergyTable::for_isotope(Isotope::F18);
        let mut sampler = Sampler::new(5);

        for _ in 0..1000 {
            let energy = table.sample(&mut sampler);
            assert!(energy >= 0.0);
            assert!(energy <= 633.5 + 1e-9);
        }
    }
}
