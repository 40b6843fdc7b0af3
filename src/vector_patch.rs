//! The process-local patch collection and its per-step operations.
//!
//! `VectorPatch` owns a contiguous run of patches along the space-filling
//! curve and sequences every phase of the PIC step across them: particle
//! dynamics, additive source synchronization, particle migration and
//! re-sorting, field synchronization plus boundary conditions, antennas,
//! collisions, the initial Poisson solve and diagnostics hooks.

use mpi::collective::SystemOperation;
use mpi::topology::Communicator;
use mpi::traits::*;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_xoshiro::Xoshiro256StarStar;
use rayon::prelude::*;

use crate::boundary;
use crate::collisions;
use crate::decomposition::DomainDecomposition;
use crate::fields::ExchangeMode;
use crate::params::{Params, ParticlePolicy};
use crate::particle::MacroParticle;
use crate::patch::Patch;
use crate::sync::{exchange_buffers, GhostPlan};

pub struct VectorPatch {
    pub patches: Vec<Patch>,
    pub plan: GhostPlan,
    /// Ranks owning any patch adjacent (faces and corners) to ours;
    /// particle migration posts one message pair per entry.
    pub neighbor_ranks: Vec<i32>,
    /// Tracking-id epoch, bumped by every moving-window injection.
    pub id_epoch: u64,
}

impl VectorPatch {
    pub fn new(deco: &DomainDecomposition, params: &Params, rank: usize) -> VectorPatch {
        let patches: Vec<Patch> = deco
            .owned_range(rank)
            .map(|i| Patch::create(i, deco, params, 0))
            .collect();
        let plan = GhostPlan::build(&patches, deco, params);
        let neighbor_ranks = adjacent_ranks(&patches, deco, params, rank as i32);
        VectorPatch { patches, plan, neighbor_ranks, id_epoch: 0 }
    }

    pub fn populate<R: Rng>(&mut self, params: &Params, rng: &mut R) {
        for patch in self.patches.iter_mut() {
            patch.populate(params, rng, self.id_epoch);
        }
    }

    /// Rebuild the exchange plan after any event that changed the patch
    /// set or the distribution (load balance, window shift, restart).
    pub fn rebuild_plan(&mut self, deco: &DomainDecomposition, params: &Params, rank: i32) {
        self.plan = GhostPlan::build(&self.patches, deco, params);
        self.neighbor_ranks = adjacent_ranks(&self.patches, deco, params, rank);
    }

    pub fn total_particles(&self) -> usize {
        self.patches.iter().map(|p| p.particle_count()).sum()
    }

    /// Interpolate-push-deposit over all patches, one rayon worker per
    /// patch. Per-patch RNG streams are split with `jump`, keyed on the
    /// *global* patch index, so results depend neither on the worker
    /// schedule nor on the current distribution. Returns the number of
    /// particles that left their patch.
    pub fn dynamics(&mut self, params: &Params, t: f64, rng: &mut Xoshiro256StarStar, with_charge: bool) -> usize {
        let base = rng.clone();
        rng.long_jump();
        let left: usize = self
            .patches
            .par_iter_mut()
            .map(|patch| {
                let mut stream = base.clone();
                for _ in 0..patch.index {
                    stream.jump();
                }
                patch.fields.clear_sources();
                let left = patch.advance(params, t, &mut stream);
                if with_charge {
                    patch.deposit_charge(params);
                }
                left
            })
            .sum();
        left
    }

    /// Additive exchange of J and rho over the patch ghost layers.
    pub fn sum_densities<C: Communicator>(&mut self, comm: &C, deco: &DomainDecomposition) {
        self.plan.exchange(comm, &mut self.patches, deco, ExchangeMode::Sources);
    }

    /// Finish the E/B ghost exchange, then enforce the electromagnetic
    /// boundary conditions on global faces.
    pub fn finalize_sync_and_bc_fields<C: Communicator>(
        &mut self,
        comm: &C,
        deco: &DomainDecomposition,
        params: &Params,
        t: f64,
    ) {
        self.plan.exchange(comm, &mut self.patches, deco, ExchangeMode::Fields);
        self.apply_field_bcs(params, t);
    }

    pub fn apply_field_bcs(&mut self, params: &Params, t: f64) {
        let laser = params.laser.as_ref();
        for patch in self.patches.iter_mut() {
            for d in 0..params.ndim_field {
                for s in 0..2 {
                    let on_boundary = if s == 0 { patch.is_min[d] } else { patch.is_max[d] };
                    if !on_boundary {
                        continue;
                    }
                    boundary::apply_em_bc(
                        &mut patch.fields,
                        d,
                        s,
                        params.em_bcs[d][s],
                        laser,
                        t,
                        &patch.origin,
                        &params.cell_length,
                        params.ndim_field,
                    );
                }
            }
        }
    }

    /// Prescribed currents, added after the source synchronization so the
    /// analytic profile lands identically on owners and ghosts.
    pub fn apply_antennas(&mut self, params: &Params, t: f64) {
        if params.antennas.is_empty() {
            return;
        }
        let ndim = params.ndim_field;
        for patch in self.patches.iter_mut() {
            let g = patch.fields.ghost as isize;
            let origin = patch.origin;
            for antenna in &params.antennas {
                let shape: Vec<usize> = patch.fields.data.shape().to_vec();
                for idx in ndarray::indices(IxDyn(&shape)) {
                    let idx = idx.slice().to_vec();
                    let mut pos = [0.0; 3];
                    for d in 0..ndim {
                        pos[d] = origin[d] + (idx[d] as isize - g) as f64 * params.cell_length[d];
                    }
                    let j = antenna.profile.at_time(pos, t);
                    if j != 0.0 {
                        patch.fields.data[IxDyn(&idx)].j[antenna.component] += j;
                    }
                }
            }
        }
    }

    /// Superpose configured external fields, once, at t = 0.
    pub fn apply_external_fields(&mut self, params: &Params) {
        if params.external_fields.is_empty() {
            return;
        }
        let ndim = params.ndim_field;
        for patch in self.patches.iter_mut() {
            let g = patch.fields.ghost as isize;
            let origin = patch.origin;
            for ext in &params.external_fields {
                let shape: Vec<usize> = patch.fields.data.shape().to_vec();
                for idx in ndarray::indices(IxDyn(&shape)) {
                    let idx = idx.slice().to_vec();
                    let mut pos = [0.0; 3];
                    for d in 0..ndim {
                        pos[d] = origin[d] + (idx[d] as isize - g) as f64 * params.cell_length[d];
                    }
                    let value = ext.profile.at(pos);
                    let cell = &mut patch.fields.data[IxDyn(&idx)];
                    if ext.electric {
                        cell.e[ext.component] += value;
                    } else {
                        cell.b[ext.component] += value;
                    }
                }
            }
        }
    }

    pub fn apply_collisions<R: Rng>(&mut self, params: &Params, step: usize, rng: &mut R) {
        for cp in &params.collisions {
            if !cp.every.the_time_is_now(step) {
                continue;
            }
            for patch in self.patches.iter_mut() {
                collisions::collide_patch(patch, params, cp, rng);
            }
        }
    }

    /// Wipe and re-deposit the charge density of all species.
    pub fn compute_charge(&mut self, params: &Params) {
        for patch in self.patches.iter_mut() {
            patch.fields.clear_sources();
            patch.deposit_charge(params);
        }
    }

    /// Resolve particles that left their patch: boundary policies on
    /// global faces, local transfers, batched point-to-point messages for
    /// cross-rank moves, then a cache-friendly re-sort.
    pub fn finalize_and_sort_parts<C: Communicator, R: Rng>(
        &mut self,
        comm: &C,
        deco: &DomainDecomposition,
        params: &Params,
        n_shifted: usize,
        rng: &mut R,
    ) {
        let my_rank = comm.rank();
        let my_range = deco.owned_range(my_rank as usize);
        let n_species = params.species.len();

        // Outbound: rank -> species -> particles.
        let mut outbound: Vec<Vec<Vec<MacroParticle>>> = self
            .neighbor_ranks
            .iter()
            .map(|_| vec![Vec::new(); n_species])
            .collect();

        for p in 0..self.patches.len() {
            let src_index = self.patches[p].index;
            let src_coords = self.patches[p].coords;
            let leaving = self.patches[p].drain_leaving(params);
            for (s, mut pt) in leaving {
                if !apply_global_bcs(&mut pt, params, n_shifted, s, rng, &mut self.patches[p]) {
                    continue;
                }
                let dest = match patch_of_position(deco, params, &pt.pos, n_shifted) {
                    Some(d) => d,
                    None => {
                        log::error!(
                            "rank {}: particle at {:?} escaped the global domain",
                            my_rank,
                            pt.pos
                        );
                        comm.abort(2);
                    }
                };
                if !patches_adjacent(deco, src_coords, dest, params) {
                    log::error!(
                        "rank {}: particle jumped from patch {} to non-adjacent patch {}",
                        my_rank,
                        src_index,
                        dest
                    );
                    comm.abort(2);
                }
                if my_range.contains(&dest) {
                    self.patches[dest - my_range.start].species[s].store.push(pt);
                } else {
                    let rank = deco.rank_of(dest);
                    let slot = self
                        .neighbor_ranks
                        .iter()
                        .position(|&r| r == rank)
                        .expect("destination rank is not a registered neighbor");
                    outbound[slot][s].push(pt);
                }
            }
        }

        // One message per neighbor rank per species, in species order; the
        // receive side mirrors the ordering exactly.
        if !self.neighbor_ranks.is_empty() {
            let mut sends: Vec<(i32, Vec<MacroParticle>)> = Vec::new();
            let mut recv_ranks: Vec<i32> = Vec::new();
            for (slot, &rank) in self.neighbor_ranks.iter().enumerate() {
                for s in 0..n_species {
                    sends.push((rank, std::mem::take(&mut outbound[slot][s])));
                    recv_ranks.push(rank);
                }
            }
            let received = exchange_buffers(comm, &sends, &recv_ranks);
            for (k, batch) in received.into_iter().enumerate() {
                let s = k % n_species;
                for pt in batch {
                    let dest = patch_of_position(deco, params, &pt.pos, n_shifted)
                        .expect("received particle outside the global domain");
                    assert!(
                        my_range.contains(&dest),
                        "received a particle for patch {} not owned here",
                        dest
                    );
                    self.patches[dest - my_range.start].species[s].store.push(pt);
                }
            }
        }

        for patch in self.patches.iter_mut() {
            patch.sort_particles(params);
        }

        #[cfg(debug_assertions)]
        for patch in &self.patches {
            for bin in &patch.species {
                for pt in &bin.store {
                    debug_assert!(patch.contains(params, &pt.pos), "residency violated");
                }
            }
        }
    }

    /// Initial electrostatic solve: conjugate gradient on -lap(phi) = rho
    /// over the patched domain, then E -= grad(phi) on the dual nodes.
    pub fn solve_poisson<C: Communicator>(&mut self, comm: &C, deco: &DomainDecomposition, params: &Params) {
        let ndim = params.ndim_field;
        let n = self.patches.len();
        if n == 0 {
            return;
        }
        let shape: Vec<usize> = self.patches[0].fields.data.shape().to_vec();
        let g = params.ghost;

        let zeros = || -> Vec<ArrayD<f64>> {
            (0..n).map(|_| ArrayD::zeros(IxDyn(&shape))).collect()
        };
        let mut phi = zeros();
        let mut r = zeros();
        let mut p = zeros();
        let mut ap = zeros();

        // b = rho, projected to zero mean so the all-periodic operator is
        // solvable.
        let mut b = zeros();
        for (i, patch) in self.patches.iter().enumerate() {
            for (dst, cell) in b[i].iter_mut().zip(patch.fields.data.iter()) {
                *dst = cell.rho;
            }
        }
        let all_periodic = (0..ndim).all(|d| params.is_periodic(d));
        if all_periodic {
            let local: f64 = (0..n).map(|i| owned_sum(&b[i], g, ndim)).sum();
            let count = (params.total_patches * params.n_per_patch[..ndim].iter().product::<usize>()) as f64;
            let mean = global_sum(comm, local) / count;
            for bi in b.iter_mut() {
                for v in bi.iter_mut() {
                    *v -= mean;
                }
            }
        }

        // r = b - A phi = b (phi starts at zero); p = r.
        for i in 0..n {
            r[i].assign(&b[i]);
            p[i].assign(&b[i]);
        }
        let mut rr = {
            let local: f64 = (0..n).map(|i| owned_dot(&r[i], &r[i], g, ndim)).sum();
            global_sum(comm, local)
        };
        let rr0 = rr.max(f64::MIN_POSITIVE);

        for _iter in 0..params.poisson_max_iteration {
            if rr / rr0 < params.poisson_tolerance {
                break;
            }
            // A p, with p's ghosts refreshed first.
            self.exchange_scalar(comm, deco, &mut p, params);
            for i in 0..n {
                let mut out = ArrayD::zeros(IxDyn(&shape));
                crate::solver::laplacian(&p[i], &mut out, &params.cell_length, ndim);
                for v in out.iter_mut() {
                    *v = -*v;
                }
                ap[i] = out;
            }
            let pap = {
                let local: f64 = (0..n).map(|i| owned_dot(&p[i], &ap[i], g, ndim)).sum();
                global_sum(comm, local)
            };
            if pap.abs() < f64::MIN_POSITIVE {
                break;
            }
            let alpha = rr / pap;
            for i in 0..n {
                phi[i].scaled_add(alpha, &p[i]);
                r[i].scaled_add(-alpha, &ap[i]);
            }
            let rr_new = {
                let local: f64 = (0..n).map(|i| owned_dot(&r[i], &r[i], g, ndim)).sum();
                global_sum(comm, local)
            };
            let beta = rr_new / rr;
            rr = rr_new;
            for i in 0..n {
                let mut next = r[i].clone();
                next.scaled_add(beta, &p[i]);
                p[i] = next;
            }
        }

        // E_d -= forward difference of phi (dual node d+1/2).
        self.exchange_scalar(comm, deco, &mut phi, params);
        for (i, patch) in self.patches.iter_mut().enumerate() {
            for idx in ndarray::indices(IxDyn(&shape)) {
                let idx = idx.slice().to_vec();
                for d in 0..ndim {
                    if idx[d] + 1 >= shape[d] {
                        continue;
                    }
                    let mut up = idx.clone();
                    up[d] += 1;
                    let grad = (phi[i][IxDyn(&up)] - phi[i][IxDyn(&idx)]) / params.cell_length[d];
                    patch.fields.data[IxDyn(&idx)].e[d] -= grad;
                }
            }
        }
    }

    /// One-layer assign-mode ghost refresh for per-patch scalar arrays,
    /// following the same deterministic plan as the field exchange.
    fn exchange_scalar<C: Communicator>(
        &self,
        comm: &C,
        deco: &DomainDecomposition,
        arrays: &mut [ArrayD<f64>],
        params: &Params,
    ) {
        crate::sync::exchange_scalar_ghosts(&self.plan, comm, deco, arrays, params.ghost);
    }

    /// Fatal invariant checks: NaN in any field array, or a particle
    /// with negative weight. Run on the status-print cadence.
    pub fn check_finite<C: Communicator>(&self, comm: &C) {
        for patch in &self.patches {
            if patch.fields.has_nan() {
                log::error!("NaN detected in fields of patch {}", patch.index);
                comm.abort(2);
            }
            for bin in &patch.species {
                if bin.store.iter().any(|pt| pt.weight < 0.0) {
                    log::error!("negative-weight particle in patch {}", patch.index);
                    comm.abort(2);
                }
            }
        }
    }

    /// Field energy over the local patches, [electric, magnetic].
    pub fn field_energy(&self, params: &Params) -> [f64; 2] {
        let volume = params.cell_volume();
        let mut out = [0.0; 2];
        for patch in &self.patches {
            let e = patch.fields.field_energy(volume);
            out[0] += e[0];
            out[1] += e[1];
        }
        out
    }

    pub fn kinetic_energy(&self, params: &Params) -> Vec<f64> {
        params
            .species
            .iter()
            .enumerate()
            .map(|(s, spec)| {
                self.patches
                    .iter()
                    .map(|p| p.species[s].kinetic_energy(spec.mass))
                    .sum()
            })
            .collect()
    }
}

/// Apply global-boundary particle policies to one leaving particle.
/// Returns false if the particle was removed. Positions on periodic axes
/// are wrapped into the global domain here, which is how the `periodic`
/// policy is realized.
fn apply_global_bcs<R: Rng>(
    pt: &mut MacroParticle,
    params: &Params,
    n_shifted: usize,
    species: usize,
    rng: &mut R,
    patch: &mut Patch,
) -> bool {
    let ndim = params.ndim_field;
    if params.geometry == crate::params::GeometryKind::AxiSym {
        boundary::reflect_across_axis(pt);
    }
    for d in 0..ndim {
        let shift = if d == 0 { n_shifted as f64 * params.cell_length[0] } else { 0.0 };
        let lo = shift;
        let hi = shift + params.n_global[d] as f64 * params.cell_length[d];
        let length = hi - lo;

        if pt.pos[d] < lo {
            if params.is_periodic(d) {
                pt.pos[d] += length;
                pt.prev[d] += length;
            } else {
                let spec = &params.species[species];
                if spec.bcs[d][0] == ParticlePolicy::None {
                    // Axisymmetric inner face: already folded.
                } else if !boundary::apply_particle_bc(pt, spec, d, 0, lo, rng, &mut patch.tallies[species]) {
                    return false;
                }
            }
        } else if pt.pos[d] >= hi {
            if params.is_periodic(d) {
                pt.pos[d] -= length;
                pt.prev[d] -= length;
            } else {
                let spec = &params.species[species];
                if !boundary::apply_particle_bc(pt, spec, d, 1, hi, rng, &mut patch.tallies[species]) {
                    return false;
                }
                // Policies clamp onto the face; nudge strictly inside.
                if pt.pos[d] >= hi {
                    pt.pos[d] = f64::from_bits(hi.to_bits() - 1);
                }
            }
        }
    }
    true
}

/// Patch hosting a position, or None outside the global domain.
pub fn patch_of_position(
    deco: &DomainDecomposition,
    params: &Params,
    pos: &[f64; 3],
    n_shifted: usize,
) -> Option<usize> {
    let mut coords = [0usize; 3];
    for d in 0..params.ndim_field {
        let shift = if d == 0 { n_shifted as f64 * params.cell_length[0] } else { 0.0 };
        let c = ((pos[d] - shift) / params.patch_length(d)).floor();
        if c < 0.0 || c >= params.n_patches_grid[d] as f64 {
            return None;
        }
        coords[d] = c as usize;
    }
    Some(deco.curve.index_of(coords))
}

/// A particle may only move to a patch adjacent to its source (faces and
/// corners, wrapped on periodic axes); anything farther means it crossed
/// more than a patch in one step and the run is unsound.
fn patches_adjacent(deco: &DomainDecomposition, src: [usize; 3], dest: usize, params: &Params) -> bool {
    let dc = deco.curve.coords_of(dest);
    for d in 0..params.ndim_field {
        let n = params.n_patches_grid[d];
        let diff = src[d].abs_diff(dc[d]);
        let wrapped = n - diff.min(n);
        if diff.min(wrapped) > 1 {
            return false;
        }
    }
    true
}

/// Ranks owning any patch adjacent to ours, corners included.
fn adjacent_ranks(patches: &[Patch], deco: &DomainDecomposition, params: &Params, my_rank: i32) -> Vec<i32> {
    let ndim = params.ndim_field;
    let mut ranks = Vec::new();
    for patch in patches {
        let c = patch.coords;
        let deltas = [-1isize, 0, 1];
        for &dx in &deltas {
            for &dy in deltas.iter().take(if ndim > 1 { 3 } else { 1 }) {
                for &dz in deltas.iter().take(if ndim > 2 { 3 } else { 1 }) {
                    let d3 = [dx, dy, dz];
                    if d3.iter().all(|&v| v == 0) {
                        continue;
                    }
                    let mut nc = [0usize; 3];
                    let mut ok = true;
                    for d in 0..ndim {
                        let n = params.n_patches_grid[d] as isize;
                        let mut v = c[d] as isize + d3[d];
                        if v < 0 || v >= n {
                            if params.is_periodic(d) {
                                v = (v + n) % n;
                            } else {
                                ok = false;
                                break;
                            }
                        }
                        nc[d] = v as usize;
                    }
                    if !ok {
                        continue;
                    }
                    let neighbor = deco.curve.index_of(nc);
                    let rank = deco.rank_of(neighbor);
                    if rank != my_rank && !ranks.contains(&rank) {
                        ranks.push(rank);
                    }
                }
            }
        }
    }
    ranks.sort_unstable();
    ranks
}

fn owned_sum(a: &ArrayD<f64>, g: usize, ndim: usize) -> f64 {
    let g = g as isize;
    let _ = ndim;
    a.slice_each_axis(|_| ndarray::Slice::from(g..-g)).iter().sum()
}

fn owned_dot(a: &ArrayD<f64>, b: &ArrayD<f64>, g: usize, ndim: usize) -> f64 {
    let g = g as isize;
    let _ = ndim;
    let av = a.slice_each_axis(|_| ndarray::Slice::from(g..-g));
    let bv = b.slice_each_axis(|_| ndarray::Slice::from(g..-g));
    av.iter().zip(bv.iter()).map(|(x, y)| x * y).sum()
}

pub fn global_sum<C: Communicator>(comm: &C, local: f64) -> f64 {
    if comm.size() == 1 {
        return local;
    }
    let mut out = 0.0;
    comm.all_reduce_into(&local, &mut out, SystemOperation::sum());
    out
}

pub fn global_sum_usize<C: Communicator>(comm: &C, local: usize) -> usize {
    if comm.size() == 1 {
        return local;
    }
    let local = local as u64;
    let mut out = 0u64;
    comm.all_reduce_into(&local, &mut out, SystemOperation::sum());
    out as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Configuration;

    fn params_2d() -> Params {
        let deck = "control:\n\
             \x20 geometry: 2d3v\n\
             \x20 cell_length: [1.0, 1.0]\n\
             \x20 n_space_global: [32, 32]\n\
             \x20 n_space_per_patch: [8, 8]\n\
             \x20 timestep: 0.5\n\
             \x20 n_time: 1\n\
             em:\n\
             \x20 boundary_conditions: [[periodic, periodic], [periodic, periodic]]\n";
        Params::read(&Configuration::from_str(deck).unwrap()).unwrap()
    }

    #[test]
    fn position_maps_to_the_right_patch() {
        let params = params_2d();
        let deco = DomainDecomposition::new(&params, 1);
        let p = patch_of_position(&deco, &params, &[0.5, 0.5, 0.0], 0).unwrap();
        assert_eq!(deco.curve.coords_of(p), [0, 0, 0]);
        let p = patch_of_position(&deco, &params, &[31.9, 8.0, 0.0], 0).unwrap();
        assert_eq!(deco.curve.coords_of(p), [3, 1, 0]);
        assert!(patch_of_position(&deco, &params, &[32.0, 0.0, 0.0], 0).is_none());
    }

    #[test]
    fn window_shift_moves_the_patch_map() {
        let params = params_2d();
        let deco = DomainDecomposition::new(&params, 1);
        // After an 8-cell shift the domain starts at x = 8.
        assert!(patch_of_position(&deco, &params, &[4.0, 4.0, 0.0], 8).is_none());
        let p = patch_of_position(&deco, &params, &[9.0, 4.0, 0.0], 8).unwrap();
        assert_eq!(deco.curve.coords_of(p), [0, 0, 0]);
    }

    #[test]
    fn adjacency_respects_periodic_wrap() {
        let params = params_2d();
        let deco = DomainDecomposition::new(&params, 1);
        let corner = deco.curve.index_of([0, 0, 0]);
        let far_corner = deco.curve.index_of([3, 3, 0]);
        assert!(patches_adjacent(&deco, [0, 0, 0], far_corner, &params));
        let middle = deco.curve.index_of([2, 2, 0]);
        assert!(!patches_adjacent(&deco, [0, 0, 0], middle, &params));
        assert!(patches_adjacent(&deco, deco.curve.coords_of(corner), corner, &params));
    }

    #[test]
    fn all_ranks_of_a_small_grid_are_neighbors() {
        let params = params_2d();
        let deco = DomainDecomposition::new(&params, 4);
        let patches: Vec<Patch> = deco
            .owned_range(0)
            .map(|i| Patch::create(i, &deco, &params, 0))
            .collect();
        let ranks = adjacent_ranks(&patches, &deco, &params, 0);
        assert!(!ranks.contains(&0));
        assert!(!ranks.is_empty());
        for &r in &ranks {
            assert!(r > 0 && r < 4);
        }
    }
}
