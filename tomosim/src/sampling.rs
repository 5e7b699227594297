//! Random sampling helpers shared by the tracking stages.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// The random sampler used throughout the simulation.
///
/// Wraps a PCG stream and provides the handful of distributions tracking
/// needs. Worker sub-streams for decay-parallel runs are derived with
/// [`Sampler::split`], so each worker draws from an independent stream.
#[derive(Clone, Debug)]
pub struct Sampler {
    rng: Pcg64Mcg,
}

impl Sampler {
    /// A sampler seeded with `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// An independent sub-stream for worker `index`.
    #[must_use]
    pub fn split(seed: u64, index: u64) -> Self {
        // distinct odd multiplier keeps sub-stream seeds from colliding
        Self::new(seed ^ (index.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1))
    }

    /// Uniform in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform in `[0, upper)`.
    pub fn uniform_to(&mut self, upper: f64) -> f64 {
        self.uniform() * upper
    }

    /// A sample from `Gauss(mean, std_dev)` via Box-Muller.
    pub fn gaussian(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1: f64 = loop {
            let candidate = self.uniform();
            if candidate > 0.0 {
                break candidate;
            }
        };
        let u2 = self.uniform();
        let radius = (-2.0 * u1.ln()).sqrt();

        mean + std_dev * radius * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Total free paths to travel, from Exp(1).
    pub fn free_paths(&mut self) -> f64 {
        -(1.0 - self.uniform()).ln()
    }

    /// Sample a Compton scatter from the Klein-Nishina distribution using
    /// Kahn's acceptance method.
    ///
    /// `energy` is the incoming photon energy in units of the electron rest
    /// energy (E/511 keV). Returns `(mu, energy_ratio)`: the cosine of the
    /// scatter angle, and the ratio of outgoing to incoming energy.
    pub fn klein_nishina(&mut self, energy: f64) -> (f64, f64) {
        loop {
            let r1 = self.uniform();
            let r2 = self.uniform();
            let r3 = self.uniform();

            if r1 <= (2.0 * energy + 1.0) / (2.0 * energy + 9.0) {
                let y = 1.0 + 2.0 * energy * r2;
                if r3 <= 4.0 * (1.0 / y - 1.0 / (y * y)) {
                    let mu = 1.0 - 2.0 * r2;
                    return (mu.clamp(-1.0, 1.0), 1.0 / y);
                }
            } else {
                let y = (2.0 * energy + 1.0) / (1.0 + 2.0 * energy * r2);
                let mu = 1.0 - (y - 1.0) / energy;
                if r3 <= 0.5 * (mu * mu + 1.0 / y) {
                    return (mu.clamp(-1.0, 1.0), 1.0 / y);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn uniform_stays_in_range() {
        let mut sampler = Sampler::new(42);

        for _ in 0..1000 {
            let value = sampler.uniform();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn gaussian_moments() {
        let mut sampler = Sampler::new(7);
        let count = 200_000;
        let samples: Vec<f64> = (0..count).map(|_| sampler.gaussian(2.0, 3.0)).collect();

        let mean = samples.iter().sum::<f64>() / f64::from(count);
        let variance =
            samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / f64::from(count);

        assert_approx_eq!(f64, mean, 2.0, epsilon = 0.05);
        assert_approx_eq!(f64, variance, 9.0, epsilon = 0.2);
    }

    #[test]
    fn free_paths_mean_is_one() {
        let mut sampler = Sampler::new(11);
        let count = 200_000;
        let sum: f64 = (0..count).map(|_| sampler.free_paths()).sum();

        assert_approx_eq!(f64, sum / f64::from(count), 1.0, epsilon = 0.02);
    }

    #[test]
    fn klein_nishina_energy_bounds() {
        let mut sampler = Sampler::new(3);
        let energy = 1.0; // 511 keV

        for _ in 0..10_000 {
            let (mu, ratio) = sampler.klein_nishina(energy);
            assert!((-1.0..=1.0).contains(&mu));
            // Compton kinematics: E' in [E/(1 + 2E), E], and the sampled
            // energy matches the sampled angle
            assert!(ratio <= 1.0 + 1e-12);
            assert!(ratio >= 1.0 / (1.0 + 2.0 * energy) - 1e-12);
            assert_approx_eq!(
                f64,
                ratio,
                1.0 / (1.0 + energy * (1.0 - mu)),
                epsilon = 1e-9
            );
        }

        // a 511 keV photon back-scattered at mu = -1 leaves with a third of
        // its energy
        let backscatter = 511.0 / (1.0 + 2.0 * energy);
        assert_approx_eq!(f64, backscatter, 170.333, epsilon = 1e-3);
    }

    #[test]
    fn split_streams_differ() {
        let mut a = Sampler::split(99, 0);
        let mut b = Sampler::split(99, 1);

        let draws_a: Vec<f64> = (0..8).map(|_| a.uniform()).collect();
        let draws_b: Vec<f64> = (0..8).map(|_| b.uniform()).collect();

        assert_ne!(draws_a, draws_b);
    }
}
