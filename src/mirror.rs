//! Cartesian mirror domain: the contiguous single-block host for the
//! Maxwell solve.
//!
//! Each rank is assigned a rectangular tile of the patch grid: a run of
//! whole x-columns, aligned to `global_factor` and sized in proportion to
//! the rank's patch count. Because a rank's owned run along the curve is
//! generally not that tile, two reconciliation lists are derived, both
//! deterministically from `patch_count[]` alone:
//!
//! * `additional` - patches this rank holds but that belong to a peer's
//!   tile (shipped out during the gather);
//! * `missing` - patches inside this rank's tile held by a peer
//!   (received during the gather).
//!
//! Gather, solve and scatter are separated by process-wide barriers in
//! the driver; the tile chain exchanges its own ghost slabs along x
//! before the solve, and wraps periodically along the other axes.

use mpi::topology::Communicator;

use crate::decomposition::DomainDecomposition;
use crate::fields::{Cell, ExchangeMode, FieldBlock, Side};
use crate::params::Params;
use crate::solver::MaxwellSolver;
use crate::sync::exchange_buffers;
use crate::vector_patch::VectorPatch;

/// Tile assignment: per rank, a [start, end) range of patch-grid columns
/// along x, aligned to global_factor[0].
#[derive(Clone, Debug, PartialEq)]
pub struct RectTiling {
    pub cols: Vec<(usize, usize)>,
}

impl RectTiling {
    /// Deterministic assignment from the current distribution: column
    /// boundaries at global-factor-aligned positions, proportional to the
    /// cumulative patch counts.
    pub fn derive(deco: &DomainDecomposition, params: &Params) -> RectTiling {
        let n_ranks = deco.n_ranks();
        let columns = params.n_patches_grid[0];
        let gf = params.global_factor[0];
        let units = columns / gf;
        let total = deco.total() as f64;

        let mut cols = Vec::with_capacity(n_ranks);
        let mut cum = 0usize;
        let mut prev_unit = 0usize;
        for r in 0..n_ranks {
            cum += deco.patch_count[r];
            let unit = ((units as f64 * cum as f64 / total).round() as usize).min(units);
            let unit = if r + 1 == n_ranks { units } else { unit };
            cols.push((prev_unit * gf, unit * gf));
            prev_unit = unit;
        }
        RectTiling { cols }
    }

    /// Rank whose tile contains the given patch-grid column.
    pub fn owner_of_column(&self, col: usize) -> i32 {
        for (r, &(lo, hi)) in self.cols.iter().enumerate() {
            if col >= lo && col < hi {
                return r as i32;
            }
        }
        unreachable!("column {} outside every tile", col)
    }

    /// Patches this rank holds that belong to another rank's tile,
    /// paired with that peer, in curve-index order.
    pub fn additional_patches(&self, deco: &DomainDecomposition, rank: usize) -> Vec<(usize, i32)> {
        let (lo, hi) = self.cols[rank];
        let mut out: Vec<(usize, i32)> = deco
            .owned_range(rank)
            .filter_map(|p| {
                let col = deco.curve.coords_of(p)[0];
                if col >= lo && col < hi {
                    None
                } else {
                    Some((p, self.owner_of_column(col)))
                }
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Patches inside this rank's tile that another rank holds, paired
    /// with the holder, in curve-index order.
    pub fn missing_patches(&self, deco: &DomainDecomposition, rank: usize, params: &Params) -> Vec<(usize, i32)> {
        let (lo, hi) = self.cols[rank];
        let owned = deco.owned_range(rank);
        let mut out = Vec::new();
        for col in lo..hi {
            for y in 0..params.n_patches_grid[1].max(1) {
                for z in 0..params.n_patches_grid[2].max(1) {
                    let mut coords = [col, 0, 0];
                    if params.ndim_field > 1 {
                        coords[1] = y;
                    } else if y > 0 {
                        continue;
                    }
                    if params.ndim_field > 2 {
                        coords[2] = z;
                    } else if z > 0 {
                        continue;
                    }
                    let p = deco.curve.index_of(coords);
                    if !owned.contains(&p) {
                        out.push((p, deco.rank_of(p)));
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }
}

pub struct CartesianMirror {
    pub tiling: RectTiling,
    pub additional: Vec<(usize, i32)>,
    pub missing: Vec<(usize, i32)>,
    pub block: FieldBlock,
    col_range: (usize, usize),
}

impl CartesianMirror {
    pub fn build(deco: &DomainDecomposition, params: &Params, rank: usize) -> CartesianMirror {
        let tiling = RectTiling::derive(deco, params);
        let additional = tiling.additional_patches(deco, rank);
        let missing = tiling.missing_patches(deco, rank, params);
        let (lo, hi) = tiling.cols[rank];
        let ndim = params.ndim_field;
        let mut inner = vec![(hi - lo).max(0) * params.n_per_patch[0]];
        for d in 1..ndim {
            inner.push(params.n_global[d]);
        }
        // Degenerate (empty) tiles still need a well-formed block.
        if inner[0] == 0 {
            inner[0] = params.n_per_patch[0];
        }
        CartesianMirror {
            tiling,
            additional,
            missing,
            block: FieldBlock::new(&inner, params.ghost),
            col_range: (lo, hi),
        }
    }

    fn is_empty(&self) -> bool {
        self.col_range.1 == self.col_range.0
    }

    /// Copy one patch's owned cells into the tile block.
    fn install(&mut self, coords: [usize; 3], cells: &[Cell], params: &Params) {
        let ndim = params.ndim_field;
        let g = self.block.ghost;
        let mut offset = [0usize; 3];
        offset[0] = (coords[0] - self.col_range.0) * params.n_per_patch[0];
        for d in 1..ndim {
            offset[d] = coords[d] * params.n_per_patch[d];
        }
        let dims = [
            params.n_per_patch[0],
            if ndim > 1 { params.n_per_patch[1] } else { 1 },
            if ndim > 2 { params.n_per_patch[2] } else { 1 },
        ];
        let mut k = 0;
        for i0 in 0..dims[0] {
            for i1 in 0..dims[1] {
                for i2 in 0..dims[2] {
                    let iv = [i0, i1, i2];
                    let mut idx = vec![0usize; ndim];
                    for d in 0..ndim {
                        idx[d] = g + offset[d] + iv[d];
                    }
                    self.block.data[ndarray::IxDyn(&idx)] = cells[k];
                    k += 1;
                }
            }
        }
    }

    /// Copy the region of one patch back out of the tile block.
    fn extract(&self, coords: [usize; 3], params: &Params) -> Vec<Cell> {
        let ndim = params.ndim_field;
        let g = self.block.ghost;
        let mut offset = [0usize; 3];
        offset[0] = (coords[0] - self.col_range.0) * params.n_per_patch[0];
        for d in 1..ndim {
            offset[d] = coords[d] * params.n_per_patch[d];
        }
        let dims = [
            params.n_per_patch[0],
            if ndim > 1 { params.n_per_patch[1] } else { 1 },
            if ndim > 2 { params.n_per_patch[2] } else { 1 },
        ];
        let mut out = Vec::with_capacity(dims.iter().product());
        for i0 in 0..dims[0] {
            for i1 in 0..dims[1] {
                for i2 in 0..dims[2] {
                    let iv = [i0, i1, i2];
                    let mut idx = vec![0usize; ndim];
                    for d in 0..ndim {
                        idx[d] = g + offset[d] + iv[d];
                    }
                    out.push(self.block.data[ndarray::IxDyn(&idx)]);
                }
            }
        }
        out
    }

    /// Assemble the tile from the patches (the gather half of the mirror
    /// protocol).
    pub fn patched_to_cartesian<C: Communicator>(
        &mut self,
        comm: &C,
        vp: &VectorPatch,
        deco: &DomainDecomposition,
        params: &Params,
    ) {
        let my_rank = comm.rank();
        let my_range = deco.owned_range(my_rank as usize);

        // Local installs: owned patches inside our own tile.
        for patch in &vp.patches {
            let col = patch.coords[0];
            if col >= self.col_range.0 && col < self.col_range.1 {
                let cells = patch.fields.owned_cells();
                self.install(patch.coords, &cells, params);
            }
        }

        // Ship additional patches to their tile owners, batched per rank
        // in curve order.
        let mut sends: Vec<(i32, Vec<Cell>)> = Vec::new();
        for &(p, peer) in &self.additional {
            let cells = vp.patches[p - my_range.start].fields.owned_cells();
            match sends.iter_mut().find(|(r, _)| *r == peer) {
                Some((_, batch)) => batch.extend(cells),
                None => sends.push((peer, cells)),
            }
        }
        sends.sort_by_key(|(r, _)| *r);

        let mut recv_ranks: Vec<i32> = self.missing.iter().map(|&(_, r)| r).collect();
        recv_ranks.sort_unstable();
        recv_ranks.dedup();

        let received = exchange_buffers(comm, &sends, &recv_ranks);
        let patch_cells: usize = params.n_per_patch[..params.ndim_field].iter().product();
        for (&rank, batch) in recv_ranks.iter().zip(&received) {
            let expected: Vec<usize> = self
                .missing
                .iter()
                .filter(|&&(_, holder)| holder == rank)
                .map(|&(p, _)| p)
                .collect();
            let mut offset = 0;
            for p in expected {
                let cells = batch[offset..offset + patch_cells].to_vec();
                offset += patch_cells;
                self.install(deco.curve.coords_of(p), &cells, params);
            }
            assert_eq!(offset, batch.len(), "mirror gather mismatch from rank {}", rank);
        }

        self.exchange_tile_ghosts(comm, params);
    }

    /// Run the Maxwell solve on the assembled tile.
    pub fn solve_maxwell(&mut self, solver: &dyn MaxwellSolver, params: &Params) {
        if self.is_empty() {
            return;
        }
        solver.solve(&mut self.block, params.timestep, &params.cell_length, params.ndim_field);
    }

    /// Scatter the solved fields back onto the patches.
    pub fn cartesian_to_patches<C: Communicator>(
        &self,
        comm: &C,
        vp: &mut VectorPatch,
        deco: &DomainDecomposition,
        params: &Params,
    ) {
        let my_rank = comm.rank();
        let my_range = deco.owned_range(my_rank as usize);

        for patch in vp.patches.iter_mut() {
            let col = patch.coords[0];
            if col >= self.col_range.0 && col < self.col_range.1 {
                let cells = self.extract(patch.coords, params);
                patch.fields.set_owned_cells(&cells);
            }
        }

        // Reverse routing: tile owners return the missing patches to their
        // holders; we get our additional patches back from tile owners.
        let mut sends: Vec<(i32, Vec<Cell>)> = Vec::new();
        for &(p, holder) in &self.missing {
            let cells = self.extract(deco.curve.coords_of(p), params);
            match sends.iter_mut().find(|(r, _)| *r == holder) {
                Some((_, batch)) => batch.extend(cells),
                None => sends.push((holder, cells)),
            }
        }
        sends.sort_by_key(|(r, _)| *r);

        let mut recv_ranks: Vec<i32> = self.additional.iter().map(|&(_, r)| r).collect();
        recv_ranks.sort_unstable();
        recv_ranks.dedup();

        let received = exchange_buffers(comm, &sends, &recv_ranks);
        let patch_cells: usize = params.n_per_patch[..params.ndim_field].iter().product();
        for (&rank, batch) in recv_ranks.iter().zip(&received) {
            let mut offset = 0;
            for &(p, peer) in &self.additional {
                if peer != rank {
                    continue;
                }
                let cells = &batch[offset..offset + patch_cells];
                offset += patch_cells;
                vp.patches[p - my_range.start].fields.set_owned_cells(cells);
            }
            assert_eq!(offset, batch.len(), "mirror scatter mismatch from rank {}", rank);
        }
    }

    /// Ghost exchange along the tile chain in x, periodic wraps along the
    /// other axes (each tile spans them entirely).
    fn exchange_tile_ghosts<C: Communicator>(&mut self, comm: &C, params: &Params) {
        let my_rank = comm.rank() as usize;
        let n_ranks = self.tiling.cols.len();

        // Non-empty tiles in column order are already in rank order.
        let occupied: Vec<usize> = (0..n_ranks)
            .filter(|&r| self.tiling.cols[r].1 > self.tiling.cols[r].0)
            .collect();
        if let Some(pos) = occupied.iter().position(|&r| r == my_rank) {
            let periodic_x = params.is_periodic(0);
            let prev = if pos > 0 {
                Some(occupied[pos - 1])
            } else if periodic_x {
                Some(occupied[occupied.len() - 1])
            } else {
                None
            };
            let next = if pos + 1 < occupied.len() {
                Some(occupied[pos + 1])
            } else if periodic_x {
                Some(occupied[0])
            } else {
                None
            };

            if occupied.len() == 1 {
                if periodic_x {
                    self.block.wrap_periodic(0, ExchangeMode::All);
                }
            } else {
                // Everyone posts [min slab to prev, max slab to next] in
                // that order. With two tiles on a periodic axis, prev and
                // next are the same peer and the pairing is fixed by the
                // message order: the peer's min slab serves our max face.
                let mut sends: Vec<(i32, Vec<Cell>)> = Vec::new();
                if let Some(p) = prev {
                    sends.push((p as i32, self.block.slab(0, Side::Min)));
                }
                if let Some(n) = next {
                    sends.push((n as i32, self.block.slab(0, Side::Max)));
                }
                if prev.is_some() && prev == next {
                    let peer = prev.unwrap() as i32;
                    let received = exchange_buffers(comm, &sends, &[peer, peer]);
                    self.block.apply_slab(0, Side::Max, &received[0], ExchangeMode::All);
                    self.block.apply_slab(0, Side::Min, &received[1], ExchangeMode::All);
                } else {
                    let mut recv_ranks: Vec<i32> = Vec::new();
                    if let Some(p) = prev {
                        recv_ranks.push(p as i32);
                    }
                    if let Some(n) = next {
                        recv_ranks.push(n as i32);
                    }
                    let received = exchange_buffers(comm, &sends, &recv_ranks);
                    let mut it = received.into_iter();
                    if prev.is_some() {
                        // The prev tile sent its max slab for our min face.
                        let slab = it.next().unwrap();
                        self.block.apply_slab(0, Side::Min, &slab, ExchangeMode::All);
                    }
                    if next.is_some() {
                        let slab = it.next().unwrap();
                        self.block.apply_slab(0, Side::Max, &slab, ExchangeMode::All);
                    }
                }
            }
        }

        for d in 1..params.ndim_field {
            if params.is_periodic(d) {
                self.block.wrap_periodic(d, ExchangeMode::All);
            }
        }
    }
}
