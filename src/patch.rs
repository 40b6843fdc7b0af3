//! A patch: the unit of parallel work and migration.
//!
//! Each patch owns a rectangular block of the grid (field slabs with a
//! ghost ring) and one particle bin per species. Patches know their face
//! neighbors only as global curve indices; ownership is resolved through
//! the decomposition, never through pointers.

use rand::Rng;
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};

use crate::boundary::FaceTallies;
use crate::decomposition::DomainDecomposition;
use crate::fields::{Cell, FieldBlock};
use crate::params::{Params, PusherKind};
use crate::particle::shape;
use crate::ionization;
use crate::particle::{load_species, pusher, MacroParticle, ParticleBin};
use crate::radiation;

pub struct Patch {
    /// Global index along the space-filling curve.
    pub index: usize,
    pub coords: [usize; 3],
    /// Physical coordinate of the first owned cell corner per axis
    /// (includes the moving-window offset).
    pub origin: [f64; 3],
    pub fields: FieldBlock,
    pub species: Vec<ParticleBin>,
    pub tallies: Vec<FaceTallies>,
    pub is_min: [bool; 3],
    pub is_max: [bool; 3],
    /// Face neighbors as curve indices, wrapped on periodic axes.
    pub neighbors: [[Option<usize>; 2]; 3],
}

/// Serialized patch state: checkpoints, migration, window re-keying.
#[derive(Serialize, Deserialize)]
pub struct PatchPayload {
    pub index: u64,
    pub cells: Vec<Cell>,
    pub species: Vec<ParticleBin>,
    pub tallies: Vec<FaceTallies>,
}

impl Patch {
    pub fn create(index: usize, deco: &DomainDecomposition, params: &Params, n_shifted: usize) -> Patch {
        let coords = deco.curve.coords_of(index);
        let ndim = params.ndim_field;
        let mut origin = [0.0; 3];
        let mut is_min = [false; 3];
        let mut is_max = [false; 3];
        let mut neighbors = [[None; 2]; 3];
        for d in 0..ndim {
            let shift = if d == 0 { n_shifted } else { 0 };
            origin[d] = (coords[d] * params.n_per_patch[d] + shift) as f64 * params.cell_length[d];
            is_min[d] = coords[d] == 0;
            is_max[d] = coords[d] + 1 == params.n_patches_grid[d];
            for s in 0..2 {
                neighbors[d][s] = deco.neighbor(index, d, s, params.is_periodic(d));
            }
        }

        let inner: Vec<usize> = params.n_per_patch[..ndim].to_vec();
        Patch {
            index,
            coords,
            origin,
            fields: FieldBlock::new(&inner, params.ghost),
            species: params.species.iter().map(|_| ParticleBin::new()).collect(),
            tallies: params.species.iter().map(|_| FaceTallies::default()).collect(),
            is_min,
            is_max,
            neighbors,
        }
    }

    /// Fill the particle bins from the species profiles. `id_epoch`
    /// salts tracking ids so window-injected generations stay unique.
    pub fn populate<R: Rng>(&mut self, params: &Params, rng: &mut R, id_epoch: u64) {
        for (s, spec) in params.species.iter().enumerate() {
            let id_base = (id_epoch << 48) | ((s as u64) << 40) | ((self.index as u64) << 20);
            let (particles, _) = load_species(
                spec,
                &self.origin,
                &params.n_per_patch,
                &params.cell_length,
                params.ndim_field,
                params.timestep,
                rng,
                id_base,
            );
            self.species[s].store = particles;
        }
    }

    pub fn create_from_snapshot(
        index: usize,
        deco: &DomainDecomposition,
        params: &Params,
        n_shifted: usize,
        payload: PatchPayload,
    ) -> Patch {
        let mut patch = Patch::create(index, deco, params, n_shifted);
        patch.adopt(payload);
        patch
    }

    /// Install migrated or restored state into this patch slot.
    pub fn adopt(&mut self, payload: PatchPayload) {
        assert_eq!(payload.index as usize, self.index);
        self.fields.set_owned_cells(&payload.cells);
        self.species = payload.species;
        self.tallies = payload.tallies;
    }

    pub fn payload(&self) -> PatchPayload {
        PatchPayload {
            index: self.index as u64,
            cells: self.fields.owned_cells(),
            species: self.species.clone(),
            tallies: self.tallies.clone(),
        }
    }

    /// Physical extent along an axis.
    pub fn extent(&self, params: &Params, d: usize) -> f64 {
        params.n_per_patch[d] as f64 * params.cell_length[d]
    }

    pub fn contains(&self, params: &Params, pos: &[f64; 3]) -> bool {
        for d in 0..params.ndim_field {
            if pos[d] < self.origin[d] || pos[d] >= self.origin[d] + self.extent(params, d) {
                return false;
            }
        }
        true
    }

    fn local(&self, params: &Params, pos: &[f64; 3]) -> [f64; 3] {
        let mut xi = [0.0; 3];
        for d in 0..params.ndim_field {
            xi[d] = (pos[d] - self.origin[d]) / params.cell_length[d];
        }
        xi
    }

    /// Interpolated (E, B) at a particle position.
    pub fn interpolate_fields(&self, params: &Params, pos: &[f64; 3]) -> ([f64; 3], [f64; 3]) {
        let xi = self.local(params, pos);
        shape::fields_at(&self.fields, &xi, params.ndim_field)
    }

    /// Interpolate, push and deposit every species of this patch, emitting
    /// QED photons and freed ionization electrons where configured. The
    /// returned count is the number of particles that ended up outside the
    /// patch (to be resolved by the exchange).
    pub fn advance<R: Rng>(&mut self, params: &Params, t: f64, rng: &mut R) -> usize {
        let dt = params.timestep;
        let ndim = params.ndim_field;
        let chi_factor = radiation::chi_factor(params);
        let origin = self.origin;
        let mut hi = [0.0; 3];
        for d in 0..ndim {
            hi[d] = origin[d] + params.n_per_patch[d] as f64 * params.cell_length[d];
        }
        let mut emitted: Vec<MacroParticle> = Vec::new();
        let mut freed: Vec<(usize, MacroParticle)> = Vec::new();
        let mut left = 0usize;

        for (s, spec) in params.species.iter().enumerate() {
            if spec.n_part_per_cell == 0 && self.species[s].is_empty() {
                continue;
            }
            let ionizable = spec.ionizable();
            if t < spec.time_frozen && !spec.is_photon() {
                // Frozen species keep their charge on the grid and do not
                // move or carry current, but the field still ionizes them.
                if ionizable {
                    let target = spec.ionization_electrons.unwrap();
                    let bin = &mut self.species[s];
                    for pt in bin.store.iter_mut() {
                        let mut xi = [0.0; 3];
                        for d in 0..ndim {
                            xi[d] = (pt.pos[d] - origin[d]) / params.cell_length[d];
                        }
                        let (e, _b) = shape::fields_at(&self.fields, &xi, ndim);
                        for electron in ionization::try_ionize(pt, spec, &e, params, dt, rng) {
                            freed.push((target, electron));
                        }
                    }
                }
                continue;
            }
            let radiating = spec.radiating && params.photon_species.is_some();

            // Split borrow so emission can run against this bin while the
            // receiving bins are only extended afterwards.
            let bin = &mut self.species[s];
            for pt in bin.store.iter_mut() {
                let xi_old = {
                    let mut xi = [0.0; 3];
                    for d in 0..ndim {
                        xi[d] = (pt.pos[d] - origin[d]) / params.cell_length[d];
                    }
                    xi
                };
                let (e, b) = shape::fields_at(&self.fields, &xi_old, ndim);

                if ionizable {
                    let target = spec.ionization_electrons.unwrap();
                    for electron in ionization::try_ionize(pt, spec, &e, params, dt, rng) {
                        freed.push((target, electron));
                    }
                }

                if spec.is_photon() {
                    pusher::push_photon(pt, dt);
                } else {
                    // Charge-to-mass per particle: ionization moves the
                    // charge state over the run.
                    let r = pt.charge / spec.mass;
                    let cf = if radiating { chi_factor } else { 0.0 };
                    match spec.pusher {
                        PusherKind::Boris => pusher::push_boris(pt, &e, &b, r, dt, cf),
                        PusherKind::Vay => pusher::push_vay(pt, &e, &b, r, dt, cf),
                    }
                }

                if radiating {
                    if let Some(photon) = radiation::try_emit(pt, params, dt, rng) {
                        emitted.push(photon);
                    }
                }

                // Current deposition, charge conserving along each axis.
                if pt.charge != 0.0 {
                    let xi_new = {
                        let mut xi = [0.0; 3];
                        for d in 0..ndim {
                            xi[d] = (pt.pos[d] - origin[d]) / params.cell_length[d];
                        }
                        xi
                    };
                    let xi_prev = {
                        let mut xi = [0.0; 3];
                        for d in 0..ndim {
                            xi[d] = (pt.prev[d] - origin[d]) / params.cell_length[d];
                        }
                        xi
                    };
                    let v = pt.velocity(spec.mass);
                    shape::deposit_current(
                        &mut self.fields,
                        &xi_prev,
                        &xi_new,
                        &v,
                        pt.weight * pt.charge,
                        dt,
                        &params.cell_length,
                        ndim,
                    );
                }

                if (0..ndim).any(|d| pt.pos[d] < origin[d] || pt.pos[d] >= hi[d]) {
                    left += 1;
                }
            }
        }

        if let Some(ph) = params.photon_species {
            for mut photon in emitted.drain(..) {
                photon.tau = rng.sample(Exp1);
                self.species[ph].store.push(photon);
            }
        }
        for (target, electron) in freed {
            self.species[target].store.push(electron);
        }
        left
    }

    /// Deposit the charge density of every species (used at setup and for
    /// diagnostics; `advance` handles the in-loop current deposition).
    pub fn deposit_charge(&mut self, params: &Params) {
        let ndim = params.ndim_field;
        let volume = params.cell_volume();
        for (s, spec) in params.species.iter().enumerate() {
            if spec.charge == 0.0 && !spec.ionizable() {
                continue;
            }
            let origin = self.origin;
            for pt in &self.species[s].store {
                if pt.charge == 0.0 {
                    continue;
                }
                let mut xi = [0.0; 3];
                for d in 0..ndim {
                    xi[d] = (pt.pos[d] - origin[d]) / params.cell_length[d];
                }
                shape::deposit_charge(&mut self.fields, &xi, pt.weight * pt.charge, volume, ndim);
            }
        }
    }

    /// Drain every particle that is no longer inside the patch.
    pub fn drain_leaving(&mut self, params: &Params) -> Vec<(usize, MacroParticle)> {
        let mut leaving = Vec::new();
        for s in 0..self.species.len() {
            let origin = self.origin;
            let mut kept = Vec::with_capacity(self.species[s].store.len());
            for pt in self.species[s].store.drain(..) {
                let mut inside = true;
                for d in 0..params.ndim_field {
                    let lo = origin[d];
                    let hi = origin[d] + params.n_per_patch[d] as f64 * params.cell_length[d];
                    if pt.pos[d] < lo || pt.pos[d] >= hi {
                        inside = false;
                        break;
                    }
                }
                if inside {
                    kept.push(pt);
                } else {
                    leaving.push((s, pt));
                }
            }
            self.species[s].store = kept;
        }
        leaving
    }

    pub fn sort_particles(&mut self, params: &Params) {
        for bin in self.species.iter_mut() {
            bin.sort_by_cell(&self.origin, &params.cell_length, &params.n_per_patch, params.ndim_field);
        }
    }

    pub fn particle_count(&self) -> usize {
        self.species.iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Configuration;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn test_params() -> Params {
        let deck = "control:\n\
             \x20 geometry: 1d3v\n\
             \x20 cell_length: [0.5]\n\
             \x20 n_space_global: [32]\n\
             \x20 n_space_per_patch: [8]\n\
             \x20 timestep: 0.4\n\
             \x20 n_time: 4\n\
             em:\n\
             \x20 boundary_conditions: [[periodic, periodic]]\n\
             species:\n\
             \x20 - name: electrons\n\
             \x20   mass: 1.0\n\
             \x20   charge: -1.0\n\
             \x20   n_part_per_cell: 2\n\
             \x20   density: 1.0\n\
             \x20   boundary_conditions: [[periodic, periodic]]\n";
        Params::read(&Configuration::from_str(deck).unwrap()).unwrap()
    }

    #[test]
    fn creation_sets_geometry_flags() {
        let params = test_params();
        let deco = DomainDecomposition::new(&params, 1);
        let first = Patch::create(0, &deco, &params, 0);
        assert!(first.is_min[0]);
        assert!(!first.is_max[0]);
        assert_eq!(first.origin[0], 0.0);
        // Periodic: even the first patch has a min-side neighbor.
        assert_eq!(first.neighbors[0][0], Some(3));
        let last = Patch::create(3, &deco, &params, 0);
        assert!(last.is_max[0]);
        assert_eq!(last.origin[0], 24.0 * 0.5);
    }

    #[test]
    fn charge_deposition_conserves_total_charge() {
        let params = test_params();
        let deco = DomainDecomposition::new(&params, 1);
        let mut patch = Patch::create(1, &deco, &params, 0);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        patch.populate(&params, &mut rng, 0);
        let expected = -1.0 * patch.species[0].total_weight();
        patch.deposit_charge(&params);
        // Shape spill lands in the ghost layer, so integrate over the
        // whole block.
        let total: f64 =
            patch.fields.data.iter().map(|c| c.rho).sum::<f64>() * params.cell_volume();
        assert!((total - expected).abs() < 1.0e-10);
    }

    #[test]
    fn drain_leaving_respects_the_open_interval() {
        let params = test_params();
        let deco = DomainDecomposition::new(&params, 1);
        let mut patch = Patch::create(1, &deco, &params, 0);
        // Patch 1 covers [4, 8).
        let make = |x: f64| MacroParticle {
            pos: [x, 0.0, 0.0],
            prev: [x, 0.0, 0.0],
            mom: [0.0; 3],
            weight: 1.0,
            charge: -1.0,
            chi: 0.0,
            tau: 1.0,
            id: 0,
        };
        patch.species[0].store = vec![make(4.0), make(5.5), make(8.0), make(3.9)];
        let leaving = patch.drain_leaving(&params);
        assert_eq!(leaving.len(), 2);
        assert_eq!(patch.species[0].len(), 2);
        for pt in &patch.species[0].store {
            assert!(patch.contains(&params, &pt.pos));
        }
    }

    #[test]
    fn interpolation_sees_uniform_fields() {
        let params = test_params();
        let deco = DomainDecomposition::new(&params, 1);
        let mut patch = Patch::create(2, &deco, &params, 0);
        for cell in patch.fields.data.iter_mut() {
            cell.e = [0.5, -1.0, 2.0];
            cell.b = [0.0, 0.25, -0.75];
        }
        // Patch 2 covers [8, 12).
        let (e, b) = patch.interpolate_fields(&params, &[9.3, 0.0, 0.0]);
        for c in 0..3 {
            assert!((e[c] - patch.fields.data[[0]].e[c]).abs() < 1.0e-12);
            assert!((b[c] - patch.fields.data[[0]].b[c]).abs() < 1.0e-12);
        }
    }

    #[test]
    fn payload_roundtrip_is_lossless() {
        let params = test_params();
        let deco = DomainDecomposition::new(&params, 1);
        let mut patch = Patch::create(2, &deco, &params, 0);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        patch.populate(&params, &mut rng, 0);
        patch.deposit_charge(&params);
        let payload = patch.payload();
        let bytes = bincode::serialize(&payload).unwrap();
        let back: PatchPayload = bincode::deserialize(&bytes).unwrap();
        let mut restored = Patch::create(2, &deco, &params, 0);
        restored.adopt(back);
        assert_eq!(restored.species[0].store, patch.species[0].store);
        assert_eq!(
            restored.fields.owned_cells(),
            patch.fields.owned_cells()
        );
    }
}
