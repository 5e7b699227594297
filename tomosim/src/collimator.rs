//! Slat collimator tracking.
//!
//! The collimator is a stack of concentric layers. Each layer declares slat
//! segments along the axial direction; the runtime derives a dense segment
//! list in which adjacent segments abut and undeclared stretches become
//! material-0 gaps.

use crate::error::{Error, Result};
use crate::geometry::AXIAL_NUDGE;
use crate::materials::MaterialTable;
use crate::photon::{Direction, Position, TrackingPhoton};
use crate::sampling::Sampler;
use serde::{Deserialize, Serialize};

/// A declared slat within a layer.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Slat {
    /// Axial start of the slat.
    pub start: f64,
    /// Axial end of the slat.
    pub end: f64,
    /// Material index (0 = gap).
    pub material: usize,
}

/// One radial layer of the collimator.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Layer {
    /// Inner radius of the layer, cm.
    pub inner_radius: f64,
    /// Radial depth of the layer, cm.
    pub depth: f64,
    /// Declared slats; needs not cover the axial range.
    pub slats: Vec<Slat>,
}

/// A derived segment: part of the dense, gap-filled axial covering of a
/// layer. Invariant: `start < end`, and a layer's segments cover
/// `[z_min, z_max]` without overlap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    /// Axial start.
    pub start: f64,
    /// Axial end.
    pub end: f64,
    /// Material index (0 = gap).
    pub material: usize,
}

/// Why the collimator rejected a photon.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollimatorStats {
    /// Photons that reached the collimator face in bounds.
    pub num_reaching_collimator: u64,
    /// Photons that exited through the back of the last layer.
    pub num_collimated: u64,
    /// Total primary weight passed through unscattered in the collimator.
    pub primary_weight_passed: f64,
    /// Total scatter weight passed through unscattered in the collimator.
    pub scatter_weight_passed: f64,
}

/// The slat collimator with its derived segment lists.
#[derive(Clone, Debug)]
pub struct SlatCollimator {
    layers: Vec<Layer>,
    segments: Vec<Vec<Segment>>,
    z_min: f64,
    z_max: f64,
    trans_limit: f64,
}

impl SlatCollimator {
    /// Build the collimator and derive the dense segment lists.
    ///
    /// # Errors
    ///
    /// [`Error::InvariantViolated`] if a declared slat is degenerate or the
    /// layers are empty.
    pub fn new(layers: Vec<Layer>, z_min: f64, z_max: f64, trans_limit: f64) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::InvariantViolated(
                "slat collimator needs at least one layer".to_string(),
            ));
        }

        let segments = layers
            .iter()
            .map(|layer| derive_segments(layer, z_min, z_max))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            segments,
            z_min,
            z_max,
            trans_limit,
        })
    }

    /// The derived segments of `layer`.
    #[must_use]
    pub fn segments(&self, layer: usize) -> &[Segment] {
        &self.segments[layer]
    }

    /// Find the segment of `layer` enclosing `z` and whether it is a slat.
    /// `z` must be within the axial bounds.
    #[must_use]
    pub fn find_axial_segment(&self, z: f64, layer: usize) -> (usize, bool) {
        let segments = &self.segments[layer];
        let index = segments
            .partition_point(|segment| segment.end <= z)
            .min(segments.len() - 1);
        (index, segments[index].material != 0)
    }

    /// Track a photon through the collimator.
    ///
    /// The photon is first rotated into collimator-local coordinates using
    /// its detector angle and slid onto the collimator face. On success the
    /// photon's location (in local coordinates), transaxial and axial
    /// positions are updated and `true` is returned.
    ///
    /// # Errors
    ///
    /// [`Error::InvariantViolated`] if the face projection leaves the
    /// photon measurably off the face; material errors propagate.
    pub fn track(
        &self,
        photon: &mut TrackingPhoton,
        materials: &MaterialTable,
        minimum_energy: f64,
        model_coherent: bool,
        stats: &mut CollimatorStats,
        sampler: &mut Sampler,
    ) -> Result<bool> {
        let (sin_angle, cos_angle) = photon.detector_angle.sin_cos();

        // rotate into collimator coordinates; x measures depth into the
        // collimator from the first layer's face
        let mut pos = Position::new(
            photon.location.x * cos_angle + photon.location.y * sin_angle
                - self.layers[0].inner_radius,
            -photon.location.x * sin_angle + photon.location.y * cos_angle,
            photon.location.z,
        );
        let mut dir = Direction::new(
            photon.direction.cx * cos_angle + photon.direction.cy * sin_angle,
            -photon.direction.cx * sin_angle + photon.direction.cy * cos_angle,
            photon.direction.cz,
        );

        // photons heading away never enter
        if dir.cx < 0.0 {
            return Ok(false);
        }

        // slide onto the collimator face
        let to_face = -pos.x / dir.cx;
        pos.x += to_face * dir.cx;
        pos.y += to_face * dir.cy;
        pos.z += to_face * dir.cz;

        if pos.x.abs() > 1e-3 {
            return Err(Error::InvariantViolated(format!(
                "photon is {} cm off the collimator face after projection",
                pos.x
            )));
        }
        pos.x = 0.0;

        if pos.z < self.z_min || pos.z > self.z_max {
            return Ok(false);
        }
        if pos.y.abs() > self.trans_limit {
            return Ok(false);
        }

        stats.num_reaching_collimator += 1;

        let mut cur_layer = 0usize;
        let mut front_of_layer = 0.0;
        let mut back_of_layer = self.layers[0].depth;
        let (mut cur_seg, _) = self.find_axial_segment(pos.z, 0);
        let mut free_paths = sampler.free_paths();

        loop {
            let segment = self.segments[cur_layer][cur_seg];
            let attenuation = materials.attenuation(segment.material, photon.energy)?;
            let distance = if attenuation > 0.0 {
                free_paths / attenuation
            } else {
                f64::MAX
            };

            let (new_pos, traveled, exit) = project_within_layer(
                &pos,
                &dir,
                distance,
                front_of_layer,
                back_of_layer,
                self.trans_limit,
                segment.start,
                segment.end,
            );
            photon.travel_distance += traveled;

            match exit {
                LayerExit::Back => {
                    cur_layer += 1;
                    if cur_layer == self.layers.len() {
                        // out the back of the last layer: collimated
                        photon.location = new_pos;
                        photon.direction = dir;
                        photon.transaxial_position = new_pos.y;
                        photon.axial_position = new_pos.z;
                        stats.num_collimated += 1;
                        if photon.scatters_in_col == 0 {
                            if photon.num_of_scatters > 0 {
                                stats.scatter_weight_passed +=
                                    photon.current_weight * photon.decay_weight;
                            } else {
                                stats.primary_weight_passed +=
                                    photon.current_weight * photon.decay_weight;
                            }
                        }
                        return Ok(true);
                    }

                    let (segment, _) = self.find_axial_segment(new_pos.z, cur_layer);
                    cur_seg = segment;
                    front_of_layer = back_of_layer;
                    back_of_layer = front_of_layer + self.layers[cur_layer].depth;
                    pos = new_pos;
                    free_paths -= traveled * attenuation;
                    continue;
                }
                LayerExit::Front => {
                    if cur_layer == 0 {
                        return Ok(false);
                    }
                    cur_layer -= 1;
                    let (segment, _) = self.find_axial_segment(new_pos.z, cur_layer);
                    cur_seg = segment;
                    back_of_layer = front_of_layer;
                    front_of_layer = back_of_layer - self.layers[cur_layer].depth;
                    pos = new_pos;
                    free_paths -= traveled * attenuation;
                    continue;
                }
                LayerExit::Transaxial => return Ok(false),
                LayerExit::Axial => {
                    if new_pos.z <= self.z_min
                        || new_pos.z >= self.z_max
                        || (new_pos.z - self.z_min).abs() < 1e-5
                        || (new_pos.z - self.z_max).abs() < 1e-5
                    {
                        return Ok(false);
                    }

                    // crossed into the adjacent segment: nudge past the
                    // boundary so the lookup cannot land back here
                    pos = new_pos;
                    if dir.cz < 0.0 {
                        cur_seg -= 1;
                        pos.z -= AXIAL_NUDGE;
                    } else {
                        cur_seg += 1;
                        pos.z += AXIAL_NUDGE;
                    }
                    free_paths -= traveled * attenuation;
                    continue;
                }
                LayerExit::Interact => {}
            }

            // interaction
            let compton_to_scatter =
                materials.compton_to_scatter(segment.material, photon.energy)?;
            let scatter_probability =
                materials.scatter_probability(segment.material, photon.energy)?;
            let draw = sampler.uniform();

            if draw > scatter_probability {
                photon.energy = 0.0;
                return Ok(false);
            }

            photon.direction = dir;
            if draw > scatter_probability * compton_to_scatter {
                if model_coherent {
                    let mu = materials.coherent_cos_theta(
                        segment.material,
                        photon.energy,
                        sampler,
                    )?;
                    photon
                        .direction
                        .rotate(mu, sampler.uniform_to(2.0 * std::f64::consts::PI));
                }
            } else {
                let (mu, energy_ratio) =
                    sampler.klein_nishina(photon.energy / crate::photon::ELECTRON_REST_ENERGY_KEV);
                photon.energy *= energy_ratio;
                photon
                    .direction
                    .rotate(mu, sampler.uniform_to(2.0 * std::f64::consts::PI));
            }
            dir = photon.direction;
            photon.scatters_in_col += 1;

            if photon.energy < minimum_energy {
                return Ok(false);
            }

            pos = new_pos;
            free_paths = sampler.free_paths();
        }
    }
}

/// Which boundary a projection within a layer runs into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LayerExit {
    /// Through the back face (deeper).
    Back,
    /// Back out the front face.
    Front,
    /// Out the transaxial (y) limit.
    Transaxial,
    /// Across an axial segment boundary.
    Axial,
    /// The proposed distance fits inside; interact there.
    Interact,
}

/// Project a proposed travel distance, truncating to the nearest of the
/// layer faces, the transaxial limit, and the axial segment bounds.
#[allow(clippy::too_many_arguments)]
fn project_within_layer(
    pos: &Position,
    dir: &Direction,
    distance: f64,
    front_of_layer: f64,
    back_of_layer: f64,
    trans_limit: f64,
    ax_low: f64,
    ax_high: f64,
) -> (Position, f64, LayerExit) {
    let dist_y = if dir.cy > 0.0 {
        (trans_limit - pos.y) / dir.cy
    } else if dir.cy < 0.0 {
        (-trans_limit - pos.y) / dir.cy
    } else {
        f64::MAX
    };

    let dist_z = if dir.cz > 0.0 {
        (ax_high - pos.z) / dir.cz
    } else if dir.cz < 0.0 {
        (ax_low - pos.z) / dir.cz
    } else {
        f64::MAX
    };

    let (dist_x, x_exit) = if dir.cx > 0.0 {
        ((back_of_layer - pos.x) / dir.cx, LayerExit::Back)
    } else if dir.cx < 0.0 {
        ((front_of_layer - pos.x) / dir.cx, LayerExit::Front)
    } else {
        (f64::MAX, LayerExit::Front)
    };

    let (traveled, exit) = if dist_x < dist_y && dist_x < dist_z && dist_x < distance {
        (dist_x, x_exit)
    } else if dist_y < dist_z && dist_y < distance {
        (dist_y, LayerExit::Transaxial)
    } else if dist_z < distance {
        (dist_z, LayerExit::Axial)
    } else {
        (distance, LayerExit::Interact)
    };

    let new_pos = Position::new(
        pos.x + traveled * dir.cx,
        pos.y + traveled * dir.cy,
        pos.z + traveled * dir.cz,
    );
    (new_pos, traveled, exit)
}

/// Scan a layer's declared slats and build the dense segment covering of
/// `[z_min, z_max]`, materializing gaps as material-0 segments.
fn derive_segments(layer: &Layer, z_min: f64, z_max: f64) -> Result<Vec<Segment>> {
    let mut slats = layer.slats.clone();
    slats.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());

    let mut segments = Vec::new();
    let mut cursor = z_min;
    for slat in &slats {
        if slat.start >= slat.end {
            return Err(Error::InvariantViolated(format!(
                "slat segment [{}, {}] is empty or reversed",
                slat.start, slat.end
            )));
        }
        if slat.end <= z_min || slat.start >= z_max {
            continue;
        }

        let start = slat.start.max(z_min);
        if start < cursor {
            return Err(Error::InvariantViolated(format!(
                "slat segments overlap at z = {start}"
            )));
        }
        if start > cursor {
            segments.push(Segment {
                start: cursor,
                end: start,
                material: 0,
            });
        }

        let end = slat.end.min(z_max);
        segments.push(Segment {
            start,
            end,
            material: slat.material,
        });
        cursor = end;
    }

    if cursor < z_max {
        segments.push(Segment {
            start: cursor,
            end: z_max,
            material: 0,
        });
    }

    Ok(segments)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::photon::PhotonFlags;
    use float_cmp::assert_approx_eq;

    fn lead_slat_layer() -> Layer {
        Layer {
            inner_radius: 15.0,
            depth: 3.0,
            slats: vec![
                Slat {
                    start: -4.0,
                    end: -3.8,
                    material: 2,
                },
                Slat {
                    start: -0.1,
                    end: 0.1,
                    material: 2,
                },
                Slat {
                    start: 3.8,
                    end: 4.0,
                    material: 2,
                },
            ],
        }
    }

    fn collimator() -> SlatCollimator {
        SlatCollimator::new(vec![lead_slat_layer()], -5.0, 5.0, 20.0).unwrap()
    }

    fn photon_toward_collimator(z_dir: f64) -> TrackingPhoton {
        let mut direction = Direction::new(1.0, 0.0, z_dir);
        direction.normalize();
        TrackingPhoton::new(
            PhotonFlags::BLUE | PhotonFlags::TRACK_AS_PRIMARY,
            Position::new(10.0, 0.0, 1.0),
            direction,
            140.0,
        )
    }

    #[test]
    fn segments_cover_axial_range_with_gaps() {
        let collimator = collimator();
        let segments = collimator.segments(0);

        assert_eq!(segments.len(), 7);
        assert_approx_eq!(f64, segments[0].start, -5.0);
        assert_approx_eq!(f64, segments[segments.len() - 1].end, 5.0);
        for pair in segments.windows(2) {
            assert_approx_eq!(f64, pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
        // declared slats and derived gaps alternate
        assert_eq!(segments[0].material, 0);
        assert_eq!(segments[1].material, 2);
    }

    #[test]
    fn segment_lookup() {
        let collimator = collimator();

        let (seg, is_slat) = collimator.find_axial_segment(0.0, 0);
        assert!(is_slat);
        assert_eq!(seg, 3);

        let (_, is_slat) = collimator.find_axial_segment(2.0, 0);
        assert!(!is_slat);
    }

    #[test]
    fn photon_through_gap_is_collimated() {
        let collimator = collimator();
        let materials = MaterialTable::basic();
        let mut photon = photon_toward_collimator(0.0);
        photon.location.z = 2.0; // gap at z = 2
        let mut stats = CollimatorStats::default();
        let mut sampler = Sampler::new(1);

        let collimated = collimator
            .track(&mut photon, &materials, 50.0, false, &mut stats, &mut sampler)
            .unwrap();

        assert!(collimated);
        assert_eq!(stats.num_reaching_collimator, 1);
        assert_eq!(stats.num_collimated, 1);
        // landed on the back of the layer
        assert_approx_eq!(f64, photon.location.x, 3.0, epsilon = 1e-9);
        assert_approx_eq!(f64, photon.axial_position, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn backward_photon_cannot_enter() {
        let collimator = collimator();
        let materials = MaterialTable::basic();
        let mut photon = photon_toward_collimator(0.0);
        photon.direction = Direction::new(-1.0, 0.0, 0.0);
        let mut stats = CollimatorStats::default();
        let mut sampler = Sampler::new(2);

        let collimated = collimator
            .track(&mut photon, &materials, 50.0, false, &mut stats, &mut sampler)
            .unwrap();

        assert!(!collimated);
        assert_eq!(stats.num_reaching_collimator, 0);
    }

    #[test]
    fn out_of_axial_bounds_is_rejected() {
        let collimator = collimator();
        let materials = MaterialTable::basic();
        let mut photon = photon_toward_collimator(0.9);
        photon.location.z = 4.9;
        let mut stats = CollimatorStats::default();
        let mut sampler = Sampler::new(3);

        // projection to the face carries z past z_max
        let collimated = collimator
            .track(&mut photon, &materials, 50.0, false, &mut stats, &mut sampler)
            .unwrap();

        assert!(!collimated);
    }

    #[test]
    fn slats_attenuate_most_photons() {
        let collimator = collimator();
        let materials = MaterialTable::basic();
        let mut stats = CollimatorStats::default();
        let mut accepted = 0;

        for seed in 0..200 {
            let mut sampler = Sampler::new(seed);
            let mut photon = photon_toward_collimator(0.0);
            photon.location.z = 0.0; // aimed at a lead slat
            if collimator
                .track(&mut photon, &materials, 50.0, false, &mut stats, &mut sampler)
                .unwrap()
            {
                accepted += 1;
            }
        }

        // 3 cm of lead at 140 keV passes essentially nothing
        assert!(accepted < 10);
    }
}
