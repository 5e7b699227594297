//! Productivity table: expected contribution of each (slice, angle) cell to
//! primary and scatter detections, used for importance-sampling splits.

use ndarray::Array2;

/// Which productivity branch a contribution belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProductivityKind {
    /// Photons that have not interacted.
    Primary,
    /// Photons that have scattered at least once.
    Scatter,
}

/// Per-(slice, angle) primary and scatter productivities.
///
/// The table is created once per run, either loaded from a previous run or
/// seeded flat, and is read-only during tracking. Contributions accumulated
/// during a run feed the table for the next run.
#[derive(Clone, Debug)]
pub struct ProductivityTable {
    num_angle_cells: usize,
    primary: Array2<f64>,
    scatter: Array2<f64>,
    primary_contrib: Array2<f64>,
    scatter_contrib: Array2<f64>,
    starts: Array2<f64>,
}

impl ProductivityTable {
    /// A flat table: every cell has productivity one in both branches.
    #[must_use]
    pub fn flat(num_slices: usize, num_angle_cells: usize) -> Self {
        Self {
            num_angle_cells,
            primary: Array2::ones((num_slices, num_angle_cells)),
            scatter: Array2::ones((num_slices, num_angle_cells)),
            primary_contrib: Array2::zeros((num_slices, num_angle_cells)),
            scatter_contrib: Array2::zeros((num_slices, num_angle_cells)),
            starts: Array2::zeros((num_slices, num_angle_cells)),
        }
    }

    /// A table with explicit per-cell productivities.
    ///
    /// # Panics
    ///
    /// Panics if the two arrays differ in shape.
    #[must_use]
    pub fn from_productivities(primary: Array2<f64>, scatter: Array2<f64>) -> Self {
        assert_eq!(primary.dim(), scatter.dim());
        let dim = primary.dim();
        Self {
            num_angle_cells: dim.1,
            primary,
            scatter,
            primary_contrib: Array2::zeros(dim),
            scatter_contrib: Array2::zeros(dim),
            starts: Array2::zeros(dim),
        }
    }

    /// Number of stratification angle cells.
    #[must_use]
    pub const fn num_angle_cells(&self) -> usize {
        self.num_angle_cells
    }

    /// The angle-cell index for a direction with axial cosine `cos_z`. Cells
    /// partition `[-1, 1]` evenly.
    #[must_use]
    pub fn angle_index(&self, cos_z: f64) -> i32 {
        let index = ((cos_z + 1.0) / 2.0 * self.num_angle_cells as f64) as i32;
        index.min(self.num_angle_cells as i32 - 1).max(0)
    }

    /// The angle-cell index of the direction exactly opposite to cell
    /// `angle_index`.
    #[must_use]
    pub fn opposite_angle_index(&self, angle_index: i32) -> i32 {
        self.num_angle_cells as i32 - 1 - angle_index
    }

    /// Primary productivity of a cell.
    #[must_use]
    pub fn primary(&self, slice_index: i32, angle_index: i32) -> f64 {
        self.cell(&self.primary, slice_index, angle_index)
    }

    /// Scatter productivity of a cell.
    #[must_use]
    pub fn scatter(&self, slice_index: i32, angle_index: i32) -> f64 {
        self.cell(&self.scatter, slice_index, angle_index)
    }

    fn cell(&self, table: &Array2<f64>, slice_index: i32, angle_index: i32) -> f64 {
        if slice_index < 0 || angle_index < 0 {
            return 1.0;
        }
        table
            .get((slice_index as usize, angle_index as usize))
            .copied()
            .unwrap_or(1.0)
    }

    /// Record that a photon started (or re-started after a scatter) in a
    /// cell.
    pub fn add_starting_productivity(
        &mut self,
        slice_index: i32,
        angle_index: i32,
        kind: ProductivityKind,
    ) {
        if slice_index < 0 || angle_index < 0 {
            return;
        }
        let index = (slice_index as usize, angle_index as usize);
        if let Some(cell) = self.starts.get_mut(index) {
            *cell += 1.0;
        }
        let _ = kind;
    }

    /// Record a detected contribution of `weight` from the photon's original
    /// cell.
    pub fn add_detected_productivity(
        &mut self,
        slice_index: i32,
        angle_index: i32,
        weight: f64,
        kind: ProductivityKind,
    ) {
        if slice_index < 0 || angle_index < 0 {
            return;
        }
        let index = (slice_index as usize, angle_index as usize);
        let table = match kind {
            ProductivityKind::Primary => &mut self.primary_contrib,
            ProductivityKind::Scatter => &mut self.scatter_contrib,
        };
        if let Some(cell) = table.get_mut(index) {
            *cell += weight;
        }
    }

    /// Fold the accumulated contributions into a fresh table for the next
    /// run: each cell's productivity becomes detected weight per start, and
    /// cells that saw no starts keep productivity one.
    #[must_use]
    pub fn computed(&self) -> Self {
        let mut primary = self.primary_contrib.clone();
        let mut scatter = self.scatter_contrib.clone();
        for ((index, cell), scatter_cell) in
            primary.indexed_iter_mut().zip(scatter.iter_mut())
        {
            let starts = self.starts[index];
            if starts > 0.0 {
                *cell /= starts;
                *scatter_cell /= starts;
            } else {
                *cell = 1.0;
                *scatter_cell = 1.0;
            }
        }

        Self::from_productivities(primary, scatter)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn angle_index_partitions_cosine_range() {
        let table = ProductivityTable::flat(4, 8);

        assert_eq!(table.angle_index(-1.0), 0);
        assert_eq!(table.angle_index(-0.99), 0);
        assert_eq!(table.angle_index(0.0), 4);
        assert_eq!(table.angle_index(1.0), 7);
    }

    #[test]
    fn opposite_angle_reflects() {
        let table = ProductivityTable::flat(4, 8);

        assert_eq!(table.opposite_angle_index(0), 7);
        assert_eq!(table.opposite_angle_index(3), 4);
    }

    #[test]
    fn computed_table_is_weight_per_start() {
        let mut table = ProductivityTable::flat(2, 2);
        table.add_starting_productivity(0, 0, ProductivityKind::Primary);
        table.add_starting_productivity(0, 0, ProductivityKind::Primary);
        table.add_detected_productivity(0, 0, 0.5, ProductivityKind::Primary);
        table.add_detected_productivity(0, 0, 0.3, ProductivityKind::Scatter);

        let computed = table.computed();
        assert_approx_eq!(f64, computed.primary(0, 0), 0.25);
        assert_approx_eq!(f64, computed.scatter(0, 0), 0.15);
        // untouched cells stay neutral
        assert_approx_eq!(f64, computed.primary(1, 1), 1.0);
    }

    #[test]
    fn out_of_range_cells_are_neutral() {
        let table = ProductivityTable::flat(2, 2);

        assert_approx_eq!(f64, table.primary(-1, 0), 1.0);
        assert_approx_eq!(f64, table.scatter(0, 11), 1.0);
    }
}
