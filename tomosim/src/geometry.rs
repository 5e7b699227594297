//! Geometry primitives: cylinders, projections, and voxel boundary
//! distances.

use crate::photon::{Direction, Position};
use serde::{Deserialize, Serialize};

/// Direction cosines smaller than this magnitude are clamped (sign
/// preserved) to avoid division by zero in boundary projections.
pub const MIN_COSINE: f64 = 1e-7;

/// Nudge applied when sliding across an axial segment boundary so the photon
/// does not re-enter the segment it just left.
pub const AXIAL_NUDGE: f64 = 1e-6;

/// A right circular cylinder aligned with the z axis.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Cylinder {
    /// Radius, cm.
    pub radius: f64,
    /// Lower axial bound.
    pub z_min: f64,
    /// Upper axial bound.
    pub z_max: f64,
    /// X coordinate of the axis.
    pub center_x: f64,
    /// Y coordinate of the axis.
    pub center_y: f64,
}

impl Cylinder {
    /// Whether `pos` lies strictly inside the lateral surface (axial bounds
    /// are not checked).
    #[must_use]
    pub fn contains_laterally(&self, pos: &Position) -> bool {
        let dx = pos.x - self.center_x;
        let dy = pos.y - self.center_y;
        dx * dx + dy * dy < self.radius * self.radius
    }

    /// Distance along `dir` from `pos` to the lateral surface.
    ///
    /// For a position inside the cylinder this is the positive root of the
    /// quadratic; for a position outside with the cylinder ahead it is the
    /// nearer positive root. Returns `None` if the ray never reaches the
    /// surface.
    #[must_use]
    pub fn distance_to_surface(&self, pos: &Position, dir: &Direction) -> Option<f64> {
        let dx = pos.x - self.center_x;
        let dy = pos.y - self.center_y;
        let a = dir.cx * dir.cx + dir.cy * dir.cy;
        let b = 2.0 * (dx * dir.cx + dy * dir.cy);
        let c = dx * dx + dy * dy - self.radius * self.radius;

        if a < 1e-14 {
            // traveling parallel to the axis
            return None;
        }

        let discriminant = b * b - 4.0 * a * c;
        if discriminant < 0.0 {
            return None;
        }

        let sqrt_disc = discriminant.sqrt();
        let t_far = (-b + sqrt_disc) / (2.0 * a);
        if t_far < 0.0 {
            return None;
        }
        let t_near = (-b - sqrt_disc) / (2.0 * a);

        Some(if t_near > 0.0 { t_near } else { t_far })
    }

    /// Distance along `dir` from `pos` to whichever end cap the ray is
    /// heading toward, or `None` when traveling parallel to the caps.
    #[must_use]
    pub fn distance_to_end_cap(&self, pos: &Position, dir: &Direction) -> Option<f64> {
        if dir.cz > MIN_COSINE {
            Some((self.z_max - pos.z) / dir.cz)
        } else if dir.cz < -MIN_COSINE {
            Some((self.z_min - pos.z) / dir.cz)
        } else {
            None
        }
    }
}

/// Clamp a cosine away from zero, preserving its sign.
#[must_use]
pub fn clamp_cosine(cosine: f64) -> f64 {
    if cosine.abs() < MIN_COSINE {
        MIN_COSINE.copysign(cosine)
    } else {
        cosine
    }
}

/// A direction with every cosine clamped away from zero.
#[must_use]
pub fn clamped(dir: &Direction) -> Direction {
    Direction::new(clamp_cosine(dir.cx), clamp_cosine(dir.cy), clamp_cosine(dir.cz))
}

/// Advance `pos` a `distance` along `dir`.
#[must_use]
pub fn project(pos: &Position, dir: &Direction, distance: f64) -> Position {
    Position::new(
        pos.x + distance * dir.cx,
        pos.y + distance * dir.cy,
        pos.z + distance * dir.cz,
    )
}

/// Which boundary a voxel step runs into first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VoxelExit {
    /// The next x voxel face.
    XFace,
    /// The next y voxel face.
    YFace,
    /// The next z voxel face (slice boundary).
    ZFace,
    /// The lateral surface of the object cylinder.
    Cylinder,
}

/// Distances from a point inside a voxel to the next x/y/z voxel face and to
/// the object cylinder, all measured along the direction of travel. The
/// minimum decides the step.
#[derive(Clone, Copy, Debug)]
pub struct BoundaryDistances {
    /// Distance to the next x face.
    pub to_x: f64,
    /// Distance to the next y face.
    pub to_y: f64,
    /// Distance to the next z face.
    pub to_z: f64,
    /// Distance to the object cylinder surface.
    pub to_cylinder: f64,
}

impl BoundaryDistances {
    /// The nearest boundary and its distance.
    #[must_use]
    pub fn nearest(&self) -> (VoxelExit, f64) {
        let mut exit = (VoxelExit::XFace, self.to_x);
        if self.to_y < exit.1 {
            exit = (VoxelExit::YFace, self.to_y);
        }
        if self.to_z < exit.1 {
            exit = (VoxelExit::ZFace, self.to_z);
        }
        if self.to_cylinder <= exit.1 {
            exit = (VoxelExit::Cylinder, self.to_cylinder);
        }
        exit
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    const CYLINDER: Cylinder = Cylinder {
        radius: 10.0,
        z_min: -5.0,
        z_max: 5.0,
        center_x: 0.0,
        center_y: 0.0,
    };

    #[test]
    fn surface_distance_from_center() {
        let pos = Position::default();
        let dir = Direction::new(1.0, 0.0, 0.0);

        let dist = CYLINDER.distance_to_surface(&pos, &dir).unwrap();
        assert_approx_eq!(f64, dist, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn surface_distance_off_center() {
        let pos = Position::new(5.0, 0.0, 0.0);
        let toward = Direction::new(1.0, 0.0, 0.0);
        let away = Direction::new(-1.0, 0.0, 0.0);

        assert_approx_eq!(
            f64,
            CYLINDER.distance_to_surface(&pos, &toward).unwrap(),
            5.0,
            epsilon = 1e-12
        );
        assert_approx_eq!(
            f64,
            CYLINDER.distance_to_surface(&pos, &away).unwrap(),
            15.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn axial_ray_never_hits_surface() {
        let pos = Position::default();
        let dir = Direction::new(0.0, 0.0, 1.0);

        assert!(CYLINDER.distance_to_surface(&pos, &dir).is_none());
        assert_approx_eq!(
            f64,
            CYLINDER.distance_to_end_cap(&pos, &dir).unwrap(),
            5.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn cosine_clamping() {
        assert_approx_eq!(f64, clamp_cosine(0.0), MIN_COSINE);
        assert_approx_eq!(f64, clamp_cosine(-1e-9), -MIN_COSINE);
        assert_approx_eq!(f64, clamp_cosine(0.3), 0.3);
    }

    #[test]
    fn nearest_boundary_prefers_cylinder_on_tie() {
        let distances = BoundaryDistances {
            to_x: 2.0,
            to_y: 3.0,
            to_z: 4.0,
            to_cylinder: 2.0,
        };

        let (exit, dist) = distances.nearest();
        assert_eq!(exit, VoxelExit::Cylinder);
        assert_approx_eq!(f64, dist, 2.0);
    }
}
