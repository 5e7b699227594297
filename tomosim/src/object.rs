//! The voxelized object: activity and attenuation indexed by slice and
//! voxel.
//!
//! Slices stack along z. Within a slice, x indices grow with x and y indices
//! grow *downward* (toward smaller y), following the image-row convention of
//! the voxel files this grid is loaded from.

use crate::geometry::{clamped, BoundaryDistances, Cylinder};
use crate::photon::{Direction, Position};
use ndarray::Array2;

/// One axial slice of the object.
#[derive(Clone, Debug)]
pub struct Slice {
    /// Lower z bound of the slice.
    pub z_min: f64,
    /// Upper z bound of the slice.
    pub z_max: f64,
    /// Half-width of the voxel grid in x and y; the grid is centered on the
    /// object cylinder axis.
    pub half_width: f64,
    /// Per-voxel activity, in decays (row = y index, column = x index).
    pub activity: Array2<f64>,
    /// Per-voxel attenuation material index.
    pub attenuation: Array2<usize>,
}

impl Slice {
    /// Voxel width along x.
    #[must_use]
    pub fn voxel_width(&self) -> f64 {
        2.0 * self.half_width / self.attenuation.ncols() as f64
    }

    /// Voxel height along y.
    #[must_use]
    pub fn voxel_height(&self) -> f64 {
        2.0 * self.half_width / self.attenuation.nrows() as f64
    }

    /// Slice thickness along z.
    #[must_use]
    pub fn voxel_depth(&self) -> f64 {
        self.z_max - self.z_min
    }
}

/// The whole voxelized object plus its bounding cylinder.
#[derive(Clone, Debug)]
pub struct ObjectGrid {
    /// Slices ordered by increasing z.
    pub slices: Vec<Slice>,
    /// The object cylinder; voxels outside it are never entered.
    pub cylinder: Cylinder,
}

impl ObjectGrid {
    /// A uniform cylinder phantom: `num_slices` slices of `nx` by `ny`
    /// voxels, all filled with `material`, unit activity everywhere inside
    /// the cylinder.
    #[must_use]
    pub fn uniform(cylinder: Cylinder, num_slices: usize, nx: usize, ny: usize, material: usize) -> Self {
        let depth = (cylinder.z_max - cylinder.z_min) / num_slices as f64;
        let slices = (0..num_slices)
            .map(|index| {
                let z_min = cylinder.z_min + index as f64 * depth;
                Slice {
                    z_min,
                    z_max: z_min + depth,
                    half_width: cylinder.radius,
                    activity: Array2::ones((ny, nx)),
                    attenuation: Array2::from_elem((ny, nx), material),
                }
            })
            .collect();

        Self { slices, cylinder }
    }

    /// The slice index containing `z`, or `None` outside the object.
    #[must_use]
    pub fn slice_index(&self, z: f64) -> Option<usize> {
        self.slices
            .iter()
            .position(|slice| z >= slice.z_min && z < slice.z_max)
    }

    /// The (slice, x, y) voxel indices containing `pos`, or `None` when the
    /// position is outside the grid.
    #[must_use]
    pub fn position_indices(&self, pos: &Position) -> Option<(usize, usize, usize)> {
        let slice_index = self.slice_index(pos.z)?;
        let slice = &self.slices[slice_index];

        let x_offset = pos.x - (self.cylinder.center_x - slice.half_width);
        let y_offset = (self.cylinder.center_y + slice.half_width) - pos.y;
        if x_offset < 0.0 || y_offset < 0.0 {
            return None;
        }

        let x_index = (x_offset / slice.voxel_width()) as usize;
        let y_index = (y_offset / slice.voxel_height()) as usize;
        if x_index >= slice.attenuation.ncols() || y_index >= slice.attenuation.nrows() {
            return None;
        }

        Some((slice_index, x_index, y_index))
    }

    /// Attenuation material index of the voxel.
    #[must_use]
    pub fn material(&self, slice_index: usize, x_index: usize, y_index: usize) -> usize {
        self.slices[slice_index].attenuation[[y_index, x_index]]
    }

    /// Whether the voxel indices are inside the grid.
    #[must_use]
    pub fn in_bounds(&self, slice_index: i32, x_index: i32, y_index: i32) -> bool {
        if slice_index < 0 || x_index < 0 || y_index < 0 {
            return false;
        }
        let Some(slice) = self.slices.get(slice_index as usize) else {
            return false;
        };
        (x_index as usize) < slice.attenuation.ncols()
            && (y_index as usize) < slice.attenuation.nrows()
    }

    /// Distances from `pos` along `dir` to each voxel face of the voxel at
    /// the given indices, and to the object cylinder. Cosines are clamped so
    /// every distance is finite.
    #[must_use]
    pub fn boundary_distances(
        &self,
        pos: &Position,
        dir: &Direction,
        slice_index: usize,
        x_index: usize,
        y_index: usize,
    ) -> BoundaryDistances {
        let slice = &self.slices[slice_index];
        let dir = clamped(dir);

        let x_left = self.cylinder.center_x - slice.half_width + x_index as f64 * slice.voxel_width();
        let to_x = if dir.cx > 0.0 {
            (x_left + slice.voxel_width() - pos.x) / dir.cx
        } else {
            (x_left - pos.x) / dir.cx
        };

        // y indices grow downward
        let y_top = self.cylinder.center_y + slice.half_width - y_index as f64 * slice.voxel_height();
        let to_y = if dir.cy > 0.0 {
            (y_top - pos.y) / dir.cy
        } else {
            (y_top - slice.voxel_height() - pos.y) / dir.cy
        };

        let to_z = if dir.cz > 0.0 {
            (slice.z_max - pos.z) / dir.cz
        } else {
            (slice.z_min - pos.z) / dir.cz
        };

        let to_cylinder = self
            .cylinder
            .distance_to_surface(pos, &dir)
            .unwrap_or(f64::MAX);

        BoundaryDistances {
            to_x,
            to_y,
            to_z,
            to_cylinder,
        }
    }

    /// Total activity over all voxels.
    #[must_use]
    pub fn total_activity(&self) -> f64 {
        self.slices.iter().map(|slice| slice.activity.sum()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn grid() -> ObjectGrid {
        ObjectGrid::uniform(
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
        )
    }

    #[test]
    fn indices_roundtrip() {
        let grid = grid();

        // the center of the object lands mid-grid
        let (slice, x, y) = grid
            .position_indices(&Position::new(0.5, 0.5, 0.0))
            .unwrap();
        assert_eq!(slice, 2);
        assert_eq!(x, 10);
        assert_eq!(y, 9); // y grows downward: +0.5 is above center

        assert!(grid.position_indices(&Position::new(0.0, 0.0, 7.0)).is_none());
    }

    #[test]
    fn boundary_distance_along_x() {
        let grid = grid();
        let pos = Position::new(0.25, 0.5, 0.0);
        let dir = Direction::new(1.0, 0.0, 0.0);
        let (slice, x, y) = grid.position_indices(&pos).unwrap();

        let distances = grid.boundary_distances(&pos, &dir, slice, x, y);
        // voxel width is 1.0, voxel 10 spans [0, 1)
        assert_approx_eq!(f64, distances.to_x, 0.75, epsilon = 1e-9);
        // (0.25 + t)^2 + 0.5^2 = 10^2
        assert_approx_eq!(
            f64,
            distances.to_cylinder,
            (100.0_f64 - 0.25).sqrt() - 0.25,
            epsilon = 1e-9
        );
    }

    #[test]
    fn downward_y_convention() {
        let grid = grid();
        let pos = Position::new(0.5, 0.25, 0.0);
        let dir = Direction::new(0.0, -1.0, 0.0);
        let (slice, x, y) = grid.position_indices(&pos).unwrap();

        let distances = grid.boundary_distances(&pos, &dir, slice, x, y);
        // voxel row 9 spans y in (0, 1]; heading down exits at y = 0
        assert_approx_eq!(f64, distances.to_y, 0.25, epsilon = 1e-9);
    }
}
