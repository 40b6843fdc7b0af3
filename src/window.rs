//! Moving window: a computational frame sliding along x.
//!
//! `n_moved` grows by one cell on every trigger and never decreases. Once
//! a whole patch width has accumulated, contents are re-keyed one patch
//! column down in x: the trailing column's particles are discarded into
//! the lost-particle accounting, every other patch adopts the content of
//! its +x neighbor (a payload migration when that neighbor lives on
//! another rank), and the leading column is built fresh from the species
//! injection profiles with zeroed fields.

use mpi::topology::Communicator;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::boundary::{FaceTallies, FaceTally};
use crate::decomposition::DomainDecomposition;
use crate::params::Params;
use crate::patch::PatchPayload;
use crate::sync::exchange_buffers;
use crate::vector_patch::VectorPatch;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MovingWindow {
    pub active: bool,
    pub t_start: f64,
    pub every: usize,
    /// Total cells moved; monotonically non-decreasing.
    pub n_moved: usize,
    /// Cells already folded into patch re-keying (a multiple of the patch
    /// width in x).
    pub n_shifted: usize,
    /// Particles retired at the trailing edge, per species.
    pub lost: Vec<FaceTally>,
    /// Boundary tallies of retired patches, folded in so removal
    /// accounting survives the shift.
    pub retired_tallies: Vec<FaceTallies>,
}

impl MovingWindow {
    pub fn new(params: &Params) -> MovingWindow {
        let n_species = params.species.len();
        MovingWindow {
            active: params.window.is_some(),
            t_start: params.window.as_ref().map(|w| w.t_start).unwrap_or(0.0),
            every: params.window.as_ref().map(|w| w.every).unwrap_or(1),
            n_moved: 0,
            n_shifted: 0,
            lost: vec![FaceTally::default(); n_species],
            retired_tallies: vec![FaceTallies::default(); n_species],
        }
    }

    /// Cells folded into patch origins so far; the patch map starts at
    /// x = n_shifted * dx.
    pub fn shift_cells(&self) -> usize {
        self.n_shifted
    }

    /// Advance the window if the schedule says so; re-key patches when a
    /// full patch width has accumulated.
    pub fn operate<C: Communicator, R: Rng>(
        &mut self,
        comm: &C,
        vp: &mut VectorPatch,
        deco: &DomainDecomposition,
        params: &Params,
        step: usize,
        t: f64,
        rng: &mut R,
    ) {
        if !self.active || t <= self.t_start {
            return;
        }
        if self.every == 0 || step % self.every != 0 {
            return;
        }
        self.n_moved += 1;

        let width = params.n_per_patch[0];
        if self.n_moved - self.n_shifted < width {
            return;
        }
        self.shift_patches(comm, vp, deco, params, rng);
        self.n_shifted += width;
    }

    fn shift_patches<C: Communicator, R: Rng>(
        &mut self,
        comm: &C,
        vp: &mut VectorPatch,
        deco: &DomainDecomposition,
        params: &Params,
        rng: &mut R,
    ) {
        let my_rank = comm.rank();
        let my_range = deco.owned_range(my_rank as usize);
        let max_x = params.n_patches_grid[0] - 1;

        // Retire the trailing column.
        for patch in vp.patches.iter_mut() {
            if patch.coords[0] != 0 {
                continue;
            }
            for (s, spec) in params.species.iter().enumerate() {
                let tally = &mut self.lost[s];
                for pt in &patch.species[s].store {
                    tally.count += 1;
                    tally.weight += pt.weight;
                    tally.energy += pt.kinetic_energy(spec.mass);
                }
                self.retired_tallies[s].absorb(&patch.tallies[s]);
            }
        }

        // Source patches (x > 0) ship their payload one column down.
        let mut local_moves: Vec<(usize, PatchPayload)> = Vec::new();
        let mut sends: Vec<(i32, Vec<(u64, PatchPayload)>)> = Vec::new();
        for patch in vp.patches.iter() {
            if patch.coords[0] == 0 {
                continue;
            }
            let target_coords = [patch.coords[0] - 1, patch.coords[1], patch.coords[2]];
            let target = deco.curve.index_of(target_coords);
            let owner = deco.rank_of(target);
            let mut payload = patch.payload();
            payload.index = target as u64;
            if owner == my_rank {
                local_moves.push((target, payload));
            } else {
                match sends.iter_mut().find(|(r, _)| *r == owner) {
                    Some((_, batch)) => batch.push((target as u64, payload)),
                    None => sends.push((owner, vec![(target as u64, payload)])),
                }
            }
        }
        sends.sort_by_key(|(r, _)| *r);

        // Ranks that will send to us: owners of the +x sources of our
        // non-leading target slots.
        let mut recv_ranks: Vec<i32> = Vec::new();
        for patch in vp.patches.iter() {
            if patch.coords[0] == max_x {
                continue;
            }
            let source_coords = [patch.coords[0] + 1, patch.coords[1], patch.coords[2]];
            let source = deco.curve.index_of(source_coords);
            let owner = deco.rank_of(source);
            if owner != my_rank && !recv_ranks.contains(&owner) {
                recv_ranks.push(owner);
            }
        }
        recv_ranks.sort_unstable();

        let byte_sends: Vec<(i32, Vec<u8>)> = sends
            .iter()
            .map(|(r, batch)| (*r, bincode::serialize(batch).expect("window payload serialization")))
            .collect();
        let received = exchange_buffers(comm, &byte_sends, &recv_ranks);

        // Install migrated content.
        for (target, payload) in local_moves {
            let slot = target - my_range.start;
            vp.patches[slot].adopt(payload);
        }
        for bytes in received {
            let batch: Vec<(u64, PatchPayload)> =
                bincode::deserialize(&bytes).expect("window payload deserialization");
            for (target, payload) in batch {
                let slot = target as usize - my_range.start;
                vp.patches[slot].adopt(payload);
            }
        }

        // New origins: the whole patch map slides one patch width in x.
        let width = params.n_per_patch[0];
        for patch in vp.patches.iter_mut() {
            patch.origin[0] =
                (patch.coords[0] * width + self.n_shifted + width) as f64 * params.cell_length[0];
        }

        // Fresh leading column: zero fields, injected particles.
        vp.id_epoch += 1;
        for patch in vp.patches.iter_mut() {
            if patch.coords[0] != max_x {
                continue;
            }
            for cell in patch.fields.data.iter_mut() {
                *cell = Default::default();
            }
            patch.tallies = params.species.iter().map(|_| FaceTallies::default()).collect();
            patch.populate(params, rng, vp.id_epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Configuration;

    fn window_params() -> Params {
        let deck = "control:\n\
             \x20 geometry: 1d3v\n\
             \x20 cell_length: [1.0]\n\
             \x20 n_space_global: [32]\n\
             \x20 n_space_per_patch: [8]\n\
             \x20 timestep: 0.5\n\
             \x20 n_time: 100\n\
             em:\n\
             \x20 boundary_conditions: [[absorbing, absorbing]]\n\
             window:\n\
             \x20 active: true\n\
             \x20 t_start: 0.0\n\
             \x20 every: 2\n\
             species:\n\
             \x20 - name: electrons\n\
             \x20   mass: 1.0\n\
             \x20   charge: -1.0\n\
             \x20   n_part_per_cell: 2\n\
             \x20   density: 1.0\n\
             \x20   boundary_conditions: [[remove, remove]]\n";
        Params::read(&Configuration::from_str(deck).unwrap()).unwrap()
    }

    #[test]
    fn n_moved_is_monotone_and_integer() {
        let params = window_params();
        let mut window = MovingWindow::new(&params);
        assert!(window.active);
        let mut last = 0;
        for step in 1..=20 {
            // Emulate the trigger logic without the patch machinery.
            if step % window.every == 0 {
                window.n_moved += 1;
            }
            assert!(window.n_moved >= last);
            last = window.n_moved;
        }
        assert_eq!(window.n_moved, 10);
    }

    #[test]
    fn shift_threshold_is_one_patch_width() {
        let params = window_params();
        let window = MovingWindow::new(&params);
        // 8 cells per patch in x: re-key only once 8 cells have built up.
        assert_eq!(params.n_per_patch[0], 8);
        assert_eq!(window.n_shifted, 0);
    }
}
