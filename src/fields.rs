//! Field storage for patches and the mirror domain.
//!
//! Each grid node carries all field quantities in a single `Cell`, so a
//! ghost slab is one contiguous message whatever the dimensionality. E and
//! B live at their staggered Yee locations; J and rho on the primal grid.
//! Component `c` of E sits half a cell up along axis `c`; component `c` of
//! B is staggered along the two axes other than `c`.

use std::ops::Add;

use mpi::datatype::UserDatatype;
use mpi::traits::*;
use memoffset::offset_of;
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use num_traits::identities::Zero;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[repr(C)]
pub struct Cell {
    pub e: [f64; 3],
    pub b: [f64; 3],
    pub j: [f64; 3],
    pub rho: f64,
}

impl Cell {
    /// Ghost update from the owner: sources accumulate, fields are
    /// overwritten by the owning patch's values.
    fn overlay_ghost(&mut self, other: &Cell) {
        self.rho += other.rho;
        for c in 0..3 {
            self.j[c] += other.j[c];
        }
        self.e = other.e;
        self.b = other.b;
    }

    /// Owned-edge update from a neighbor's ghost deposits: sources only.
    fn overlay(&mut self, other: &Cell) {
        self.rho += other.rho;
        for c in 0..3 {
            self.j[c] += other.j[c];
        }
    }

    fn assign_fields(&mut self, other: &Cell) {
        self.e = other.e;
        self.b = other.b;
    }

    fn assign_all(&mut self, other: &Cell) {
        *self = *other;
    }
}

impl Add for Cell {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        let mut out = self;
        for c in 0..3 {
            out.e[c] += other.e[c];
            out.b[c] += other.b[c];
            out.j[c] += other.j[c];
        }
        out.rho += other.rho;
        out
    }
}

impl Zero for Cell {
    fn zero() -> Self {
        Cell::default()
    }

    fn is_zero(&self) -> bool {
        *self == Cell::default()
    }
}

unsafe impl Equivalence for Cell {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        let blocklengths = [3, 3, 3, 1];
        let displacements = [
            offset_of!(Cell, e) as mpi::Address,
            offset_of!(Cell, b) as mpi::Address,
            offset_of!(Cell, j) as mpi::Address,
            offset_of!(Cell, rho) as mpi::Address,
        ];
        let mpi_double = f64::equivalent_datatype();
        let types: [&dyn Datatype; 4] = [&mpi_double; 4];
        UserDatatype::structured(4, &blocklengths, &displacements, &types)
    }
}

/// Which quantities a ghost exchange carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Additive J and rho, both the owned edge and the ghost layer.
    Sources,
    /// E and B assigned into the ghost layer only.
    Fields,
    /// Every quantity assigned into the ghost layer only (mirror tiles,
    /// which never double-deposit).
    All,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Side {
    Min,
    Max,
}

impl Side {
    pub fn index(self) -> usize {
        match self {
            Side::Min => 0,
            Side::Max => 1,
        }
    }

    pub fn from_index(s: usize) -> Side {
        if s == 0 { Side::Min } else { Side::Max }
    }
}

/// A rectangular block of cells with a ghost ring.
pub struct FieldBlock {
    pub data: ArrayD<Cell>,
    pub ghost: usize,
    inner: Vec<usize>,
}

impl FieldBlock {
    pub fn new(inner: &[usize], ghost: usize) -> FieldBlock {
        let shape: Vec<usize> = inner.iter().map(|&n| n + 2 * ghost).collect();
        FieldBlock {
            data: ArrayD::from_elem(IxDyn(&shape), Cell::default()),
            ghost,
            inner: inner.to_vec(),
        }
    }

    pub fn inner(&self, axis: usize) -> usize {
        self.inner[axis]
    }

    /// Wipe all charges and currents, ghosts included.
    pub fn clear_sources(&mut self) {
        for c in self.data.iter_mut() {
            c.rho = 0.0;
            c.j = [0.0; 3];
        }
    }

    /// The 2g-deep boundary slab on a face, flattened in row-major order.
    pub fn slab(&self, axis: usize, side: Side) -> Vec<Cell> {
        let g = self.ghost as isize;
        let view = match side {
            Side::Min => self.data.slice_axis(Axis(axis), Slice::from(0..2 * g)),
            Side::Max => self.data.slice_axis(Axis(axis), Slice::from(-2 * g..)),
        };
        view.iter().cloned().collect()
    }

    /// Apply a neighbor's slab received on the given face.
    ///
    /// The incoming slab splits into the half aligned with this block's
    /// ghost layer (ghost update) and the half aligned with the first owned
    /// layers (additive deposits the neighbor made into its own ghosts).
    pub fn apply_slab(&mut self, axis: usize, side: Side, slab: &[Cell], mode: ExchangeMode) {
        let g = self.ghost as isize;
        let mut shape: Vec<usize> = self.data.shape().to_vec();
        shape[axis] = self.ghost;
        let n: usize = shape.iter().product();
        assert_eq!(slab.len(), 2 * n);

        let near = ArrayD::from_shape_vec(IxDyn(&shape), slab[..n].to_vec()).unwrap();
        let far = ArrayD::from_shape_vec(IxDyn(&shape), slab[n..].to_vec()).unwrap();

        // `near` is the half of the neighbor's slab closer to its own
        // interior when received on Max, and its owned edge when received
        // on Min; work out which sub-slab of ours each half lands on.
        let (ghost_part, owned_part) = match side {
            Side::Min => (&near, &far),
            Side::Max => (&far, &near),
        };
        let (ghost_range, owned_range) = match side {
            Side::Min => (Slice::from(0..g), Slice::from(g..2 * g)),
            Side::Max => (Slice::from(-g..), Slice::from(-2 * g..-g)),
        };

        match mode {
            ExchangeMode::Sources => {
                self.data
                    .slice_axis_mut(Axis(axis), ghost_range)
                    .zip_mut_with(ghost_part, Cell::overlay);
                self.data
                    .slice_axis_mut(Axis(axis), owned_range)
                    .zip_mut_with(owned_part, Cell::overlay);
            }
            ExchangeMode::Fields => {
                self.data
                    .slice_axis_mut(Axis(axis), ghost_range)
                    .zip_mut_with(ghost_part, Cell::assign_fields);
            }
            ExchangeMode::All => {
                self.data
                    .slice_axis_mut(Axis(axis), ghost_range)
                    .zip_mut_with(ghost_part, Cell::assign_all);
            }
        }
    }

    /// Wrap-around exchange within a single block spanning a whole periodic
    /// axis (used when a patch or tile is its own neighbor).
    pub fn wrap_periodic(&mut self, axis: usize, mode: ExchangeMode) {
        let min = self.slab(axis, Side::Min);
        let max = self.slab(axis, Side::Max);
        self.apply_slab(axis, Side::Min, &max, mode);
        self.apply_slab(axis, Side::Max, &min, mode);
    }

    /// View of the owned (non-ghost) region, flattened.
    pub fn owned(&self) -> ndarray::ArrayViewD<Cell> {
        let g = self.ghost as isize;
        self.data.slice_each_axis(|_| Slice::from(g..-g))
    }

    pub fn owned_mut(&mut self) -> ndarray::ArrayViewMutD<Cell> {
        let g = self.ghost as isize;
        self.data.slice_each_axis_mut(|_| Slice::from(g..-g))
    }

    /// Total charge on the owned region (times the cell volume).
    pub fn total_charge(&self, cell_volume: f64) -> f64 {
        let Cell { rho, .. } = self.owned().sum();
        rho * cell_volume
    }

    /// Electromagnetic field energy on the owned region.
    pub fn field_energy(&self, cell_volume: f64) -> [f64; 2] {
        let mut ue = 0.0;
        let mut ub = 0.0;
        for c in self.owned().iter() {
            ue += c.e.iter().map(|v| v * v).sum::<f64>();
            ub += c.b.iter().map(|v| v * v).sum::<f64>();
        }
        [0.5 * ue * cell_volume, 0.5 * ub * cell_volume]
    }

    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|c| {
            c.rho.is_nan()
                || c.e.iter().any(|v| v.is_nan())
                || c.b.iter().any(|v| v.is_nan())
                || c.j.iter().any(|v| v.is_nan())
        })
    }

    /// Owned region as a flat copy (checkpoint and mirror payloads).
    pub fn owned_cells(&self) -> Vec<Cell> {
        self.owned().iter().cloned().collect()
    }

    pub fn set_owned_cells(&mut self, cells: &[Cell]) {
        let mut owned = self.owned_mut();
        assert_eq!(owned.len(), cells.len());
        for (dst, src) in owned.iter_mut().zip(cells) {
            *dst = *src;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_block(inner: &[usize], ghost: usize, tag: f64) -> FieldBlock {
        let mut f = FieldBlock::new(inner, ghost);
        for (i, c) in f.data.iter_mut().enumerate() {
            c.rho = tag + i as f64;
            c.e = [tag; 3];
            c.b = [2.0 * tag; 3];
        }
        f
    }

    #[test]
    fn slab_shapes_match() {
        let f = FieldBlock::new(&[8, 4], 2);
        assert_eq!(f.data.shape(), &[12, 8]);
        assert_eq!(f.slab(0, Side::Min).len(), 4 * 8);
        assert_eq!(f.slab(1, Side::Max).len(), 12 * 4);
    }

    #[test]
    fn source_exchange_makes_ghosts_equal_owner() {
        // Two 1D blocks side by side; deposit a unit of charge in each
        // cell of both (including ghosts), then exchange. Afterwards each
        // ghost must equal the owner's total for that cell.
        let g = 2;
        let mut left = FieldBlock::new(&[4], g);
        let mut right = FieldBlock::new(&[4], g);
        for c in left.data.iter_mut() {
            c.rho = 1.0;
        }
        for c in right.data.iter_mut() {
            c.rho = 2.0;
        }
        let to_right = left.slab(0, Side::Max);
        let to_left = right.slab(0, Side::Min);
        right.apply_slab(0, Side::Min, &to_right, ExchangeMode::Sources);
        left.apply_slab(0, Side::Max, &to_left, ExchangeMode::Sources);

        // Right block's ghost cells and left block's matching owned edge
        // must agree exactly.
        for k in 0..g {
            let right_ghost = right.data[[k]].rho;
            let left_owned = left.data[[4 + k]].rho; // owned cells [g, g+4)
            assert_eq!(right_ghost, left_owned);
            assert_eq!(right_ghost, 3.0);
        }
        for k in 0..g {
            let left_ghost = left.data[[4 + g + k]].rho;
            let right_owned = right.data[[g + k]].rho;
            assert_eq!(left_ghost, right_owned);
        }
    }

    #[test]
    fn field_exchange_only_touches_ghosts() {
        let g = 2;
        let mut a = tagged_block(&[6], g, 1.0);
        let b = tagged_block(&[6], g, 5.0);
        let rho_before: Vec<f64> = a.data.iter().map(|c| c.rho).collect();
        let slab = b.slab(0, Side::Max);
        a.apply_slab(0, Side::Min, &slab, ExchangeMode::Fields);
        // Ghosts got b's fields; rho untouched everywhere.
        for k in 0..g {
            assert_eq!(a.data[[k]].e, [5.0; 3]);
        }
        assert_eq!(a.data[[g]].e, [1.0; 3]);
        let rho_after: Vec<f64> = a.data.iter().map(|c| c.rho).collect();
        assert_eq!(rho_before, rho_after);
    }

    #[test]
    fn wrap_periodic_is_consistent() {
        let g = 2;
        let mut f = FieldBlock::new(&[8], g);
        for (i, c) in f.data.iter_mut().enumerate() {
            c.rho = i as f64;
        }
        let owner_low = f.data[[g]].rho + f.data[[8 + g]].rho;
        f.wrap_periodic(0, ExchangeMode::Sources);
        // Ghost beyond the max face now equals the owner cell at the min
        // face (both accumulated the same pair of contributions).
        assert_eq!(f.data[[8 + g]].rho, f.data[[g]].rho);
        assert_eq!(f.data[[g]].rho, owner_low);
    }

    #[test]
    fn two_dimensional_slab_roundtrip() {
        let g = 1;
        let mut a = FieldBlock::new(&[3, 3], g);
        let mut b = FieldBlock::new(&[3, 3], g);
        for c in a.data.iter_mut() {
            c.j[1] = 1.0;
        }
        let slab = a.slab(1, Side::Max);
        b.apply_slab(1, Side::Min, &slab, ExchangeMode::Sources);
        // b's min-side ghost column along axis 1 picked up a's deposits.
        assert_eq!(b.data[[2, 0]].j[1], 1.0);
    }
}
