//! Material attenuation and scatter tables.
//!
//! Materials are indexed densely from zero; index 0 conventionally denotes
//! void (vacuum or air gap). Every per-energy quantity is tabulated on the
//! material's own energy grid and linearly interpolated.

use crate::error::{Error, Result};
use crate::sampling::Sampler;
use serde::{Deserialize, Serialize};

/// One row of a per-energy table: `(energy_kev, value)`.
pub type EnergyRow = (f64, f64);

/// Linear interpolation into an energy-sorted table; clamps at the ends.
fn interpolate(table: &[EnergyRow], energy: f64) -> f64 {
    match table {
        [] => 0.0,
        [only] => only.1,
        _ => {
            let first = table[0];
            let last = table[table.len() - 1];
            if energy <= first.0 {
                return first.1;
            }
            if energy >= last.0 {
                return last.1;
            }

            let upper = table.partition_point(|row| row.0 < energy);
            let (e0, v0) = table[upper - 1];
            let (e1, v1) = table[upper];
            v0 + (v1 - v0) * (energy - e0) / (e1 - e0)
        }
    }
}

/// Positron-range constants of a material, after Palmer and Brownell.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PositronRangeConstants {
    /// The b1 constant.
    pub b1: f64,
    /// The b2 constant.
    pub b2: f64,
    /// Density in g/cm^3.
    pub density: f64,
}

impl PositronRangeConstants {
    /// Extrapolated range for a positron of `energy_mev`, cm.
    #[must_use]
    pub fn extrapolated_range(&self, energy_mev: f64) -> f64 {
        0.1 * self.b1 * energy_mev * energy_mev / (self.b2 + energy_mev)
    }

    /// Standard deviation of the annihilation-point displacement for a
    /// positron of `energy_mev`.
    #[must_use]
    pub fn sigma(&self, energy_mev: f64) -> f64 {
        self.extrapolated_range(energy_mev) / (2.0 * self.density)
    }
}

/// One material's tabulated properties.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Material {
    /// Display name.
    pub name: String,
    /// Total linear attenuation coefficient µ(E), 1/cm.
    pub attenuation: Vec<EnergyRow>,
    /// Probability that an interaction is a scatter (vs. absorption).
    pub scatter_probability: Vec<EnergyRow>,
    /// Probability that a scatter is Compton (vs. coherent).
    pub compton_to_scatter: Vec<EnergyRow>,
    /// Inverse CDF of the coherent scattering angle cosine, tabulated as
    /// `(cdf, cos_theta)` rows per reference energy. Sampling draws a
    /// uniform and interpolates. Empty when coherent data is unavailable.
    pub coherent_inverse_cdf: Vec<EnergyRow>,
    /// Positron range constants.
    pub positron: PositronRangeConstants,
}

impl Material {
    /// A void material: no attenuation, no interactions.
    #[must_use]
    pub fn void() -> Self {
        Self {
            name: "void".to_string(),
            attenuation: vec![(0.0, 0.0)],
            scatter_probability: vec![(0.0, 0.0)],
            compton_to_scatter: vec![(0.0, 1.0)],
            coherent_inverse_cdf: Vec::new(),
            positron: PositronRangeConstants {
                b1: 0.0,
                b2: 1.0,
                density: 1.0,
            },
        }
    }

    /// Water with a coarse attenuation table bracketing the emission
    /// energies of the supported isotopes.
    #[must_use]
    pub fn water() -> Self {
        Self {
            name: "water".to_string(),
            // NIST total attenuation for liquid water, 1/cm
            attenuation: vec![
                (50.0, 0.2269),
                (80.0, 0.1837),
                (100.0, 0.1707),
                (140.0, 0.1538),
                (200.0, 0.1370),
                (300.0, 0.1186),
                (400.0, 0.1061),
                (511.0, 0.0958),
                (600.0, 0.0896),
                (800.0, 0.0786),
                (1000.0, 0.0707),
            ],
            scatter_probability: vec![
                (50.0, 0.80),
                (100.0, 0.93),
                (140.0, 0.96),
                (300.0, 0.985),
                (511.0, 0.993),
                (1000.0, 0.997),
            ],
            compton_to_scatter: vec![
                (50.0, 0.84),
                (100.0, 0.94),
                (140.0, 0.96),
                (300.0, 0.99),
                (511.0, 0.995),
                (1000.0, 0.999),
            ],
            coherent_inverse_cdf: vec![
                (0.0, -1.0),
                (0.05, 0.0),
                (0.2, 0.7),
                (0.5, 0.9),
                (0.8, 0.97),
                (1.0, 1.0),
            ],
            positron: PositronRangeConstants {
                b1: 5.46,
                b2: 2.76,
                density: 1.0,
            },
        }
    }

    /// Lead, for collimator slats.
    #[must_use]
    pub fn lead() -> Self {
        Self {
            name: "lead".to_string(),
            attenuation: vec![
                (50.0, 91.68),
                (80.0, 26.59),
                (100.0, 62.98),
                (140.0, 24.74),
                (200.0, 11.31),
                (300.0, 4.58),
                (400.0, 2.64),
                (511.0, 1.83),
                (600.0, 1.43),
                (800.0, 1.04),
                (1000.0, 0.80),
            ],
            scatter_probability: vec![
                (50.0, 0.05),
                (100.0, 0.12),
                (140.0, 0.22),
                (300.0, 0.52),
                (511.0, 0.68),
                (1000.0, 0.82),
            ],
            compton_to_scatter: vec![
                (50.0, 0.25),
                (100.0, 0.45),
                (140.0, 0.60),
                (300.0, 0.83),
                (511.0, 0.91),
                (1000.0, 0.97),
            ],
            coherent_inverse_cdf: vec![
                (0.0, -1.0),
                (0.1, 0.3),
                (0.3, 0.8),
                (0.6, 0.95),
                (1.0, 1.0),
            ],
            positron: PositronRangeConstants {
                b1: 2.0,
                b2: 2.76,
                density: 11.35,
            },
        }
    }
}

/// The run's material table. Index 0 must be the void material.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MaterialTable {
    materials: Vec<Material>,
}

impl MaterialTable {
    /// Build a table from `materials`; index 0 is expected to be void.
    #[must_use]
    pub fn new(materials: Vec<Material>) -> Self {
        Self { materials }
    }

    /// A table with void, water, and lead, in that order. Sufficient for
    /// tests and simple phantoms.
    #[must_use]
    pub fn basic() -> Self {
        Self::new(vec![Material::void(), Material::water(), Material::lead()])
    }

    /// Number of declared materials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    /// Whether no materials are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// The material at `index`.
    ///
    /// # Errors
    ///
    /// [`Error::MaterialOutOfRange`] if `index` is not declared.
    pub fn get(&self, index: usize) -> Result<&Material> {
        self.materials
            .get(index)
            .ok_or(Error::MaterialOutOfRange(index))
    }

    /// Linear attenuation coefficient of material `index` at `energy` keV.
    ///
    /// # Errors
    ///
    /// [`Error::MaterialOutOfRange`] if `index` is not declared.
    pub fn attenuation(&self, index: usize, energy: f64) -> Result<f64> {
        Ok(interpolate(&self.get(index)?.attenuation, energy))
    }

    /// Probability that an interaction in material `index` scatters.
    ///
    /// # Errors
    ///
    /// [`Error::MaterialOutOfRange`] if `index` is not declared.
    pub fn scatter_probability(&self, index: usize, energy: f64) -> Result<f64> {
        Ok(interpolate(&self.get(index)?.scatter_probability, energy))
    }

    /// Probability that a scatter in material `index` is Compton.
    ///
    /// # Errors
    ///
    /// [`Error::MaterialOutOfRange`] if `index` is not declared.
    pub fn compton_to_scatter(&self, index: usize, energy: f64) -> Result<f64> {
        Ok(interpolate(&self.get(index)?.compton_to_scatter, energy))
    }

    /// Sample a coherent-scatter angle cosine for material `index`.
    ///
    /// # Errors
    ///
    /// [`Error::MaterialOutOfRange`] if `index` is not declared.
    pub fn coherent_cos_theta(
        &self,
        index: usize,
        _energy: f64,
        sampler: &mut Sampler,
    ) -> Result<f64> {
        let table = &self.get(index)?.coherent_inverse_cdf;
        if table.is_empty() {
            // no coherent data: forward scatter
            return Ok(1.0);
        }
        Ok(interpolate(table, sampler.uniform()).clamp(-1.0, 1.0))
    }

    /// Positron range constants of material `index`.
    ///
    /// # Errors
    ///
    /// [`Error::MaterialOutOfRange`] if `index` is not declared.
    pub fn positron_constants(&self, index: usize) -> Result<PositronRangeConstants> {
        Ok(self.get(index)?.positron)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn interpolation_between_and_beyond_rows() {
        let table = vec![(100.0, 1.0), (200.0, 3.0)];

        assert_approx_eq!(f64, interpolate(&table, 150.0), 2.0);
        assert_approx_eq!(f64, interpolate(&table, 50.0), 1.0);
        assert_approx_eq!(f64, interpolate(&table, 500.0), 3.0);
    }

    #[test]
    fn water_attenuation_at_annihilation_energy() {
        let table = MaterialTable::basic();

        assert_approx_eq!(f64, table.attenuation(1, 511.0).unwrap(), 0.0958, epsilon = 1e-6);
    }

    #[test]
    fn undeclared_material_is_an_error() {
        let table = MaterialTable::basic();

        assert!(matches!(
            table.attenuation(9, 511.0),
            Err(crate::error::Error::MaterialOutOfRange(9))
        ));
    }

    #[test]
    fn void_does_not_attenuate() {
        let table = MaterialTable::basic();

        assert_approx_eq!(f64, table.attenuation(0, 511.0).unwrap(), 0.0);
    }

    #[test]
    fn palmer_brownell_sigma() {
        let constants = PositronRangeConstants {
            b1: 5.46,
            b2: 2.76,
            density: 1.0,
        };

        // Rex = 0.1 * 5.46 * 0.25 / 3.26 at 0.5 MeV
        let expected_rex = 0.1 * 5.46 * 0.25 / 3.26;
        assert_approx_eq!(f64, constants.extrapolated_range(0.5), expected_rex, epsilon = 1e-12);
        assert_approx_eq!(f64, constants.sigma(0.5), expected_rex / 2.0, epsilon = 1e-12);
    }
}
