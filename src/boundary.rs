//! Boundary conditions at the edge of the global domain.
//!
//! Particle policies are dispatched per (species, axis, side) from the
//! table configured at setup; they run only on patches whose face lies on
//! the global boundary. Interior faces are never boundary events; those
//! particles travel through the inter-patch exchange, as does the
//! `periodic` policy (a position wrap during the exchange itself).

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::fields::FieldBlock;
use crate::input::Profile;
use crate::params::{EmBoundary, ParticlePolicy, SpeciesSpec};
use crate::particle::{maxwell_juttner, MacroParticle};

/// Thickness, in owned cells, of the damping region used by absorbing
/// field boundaries.
pub const DAMPING_CELLS: usize = 8;

/// Removed-particle accounting, per face of the global domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceTally {
    pub count: u64,
    pub weight: f64,
    pub energy: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FaceTallies {
    pub faces: [[FaceTally; 2]; 3],
}

impl FaceTallies {
    pub fn absorb(&mut self, other: &FaceTallies) {
        for d in 0..3 {
            for s in 0..2 {
                self.faces[d][s].count += other.faces[d][s].count;
                self.faces[d][s].weight += other.faces[d][s].weight;
                self.faces[d][s].energy += other.faces[d][s].energy;
            }
        }
    }

    pub fn total_energy(&self) -> f64 {
        self.faces.iter().flatten().map(|t| t.energy).sum()
    }

    pub fn total_count(&self) -> u64 {
        self.faces.iter().flatten().map(|t| t.count).sum()
    }
}

/// Apply the configured policy to a particle that crossed a global face.
/// Returns false if the particle was removed.
pub fn apply_particle_bc<R: Rng>(
    pt: &mut MacroParticle,
    spec: &SpeciesSpec,
    axis: usize,
    side: usize,
    face: f64,
    rng: &mut R,
    tallies: &mut FaceTallies,
) -> bool {
    match spec.bcs[axis][side] {
        ParticlePolicy::Reflective => {
            pt.pos[axis] = 2.0 * face - pt.pos[axis];
            pt.prev[axis] = 2.0 * face - pt.prev[axis];
            pt.mom[axis] = -pt.mom[axis];
            true
        }
        ParticlePolicy::Remove => {
            let tally = &mut tallies.faces[axis][side];
            tally.count += 1;
            tally.weight += pt.weight;
            tally.energy += pt.kinetic_energy(spec.mass);
            false
        }
        ParticlePolicy::Stop => {
            pt.pos[axis] = face;
            pt.prev = pt.pos;
            pt.mom = [0.0; 3];
            true
        }
        ParticlePolicy::Thermalize => {
            pt.pos[axis] = face;
            pt.prev = pt.pos;
            pt.mom = maxwell_juttner(spec.thermal_momentum, rng);
            // Re-emitted back into the domain.
            if side == 0 {
                pt.mom[axis] = pt.mom[axis].abs();
            } else {
                pt.mom[axis] = -pt.mom[axis].abs();
            }
            true
        }
        // Wrapped by the exchange, not here.
        ParticlePolicy::Periodic => true,
        ParticlePolicy::None => true,
    }
}

/// Axisymmetric runs fold particles that crossed r = 0 back onto positive
/// radii before any boundary dispatch happens.
pub fn reflect_across_axis(pt: &mut MacroParticle) {
    if pt.pos[1] < 0.0 {
        pt.pos[1] = -pt.pos[1];
        pt.prev[1] = -pt.prev[1];
        pt.mom[1] = -pt.mom[1];
        pt.mom[2] = -pt.mom[2];
    }
}

/// Electromagnetic boundary condition on one global face of a patch.
///
/// `origin` is the physical coordinate of the patch's first owned cell
/// corner, used to evaluate the laser profile over the face.
#[allow(clippy::too_many_arguments)]
pub fn apply_em_bc(
    block: &mut FieldBlock,
    axis: usize,
    side: usize,
    bc: EmBoundary,
    laser: Option<&Profile>,
    t: f64,
    origin: &[f64; 3],
    cell_length: &[f64; 3],
    ndim: usize,
) {
    match bc {
        // Handled entirely by the ghost exchange.
        EmBoundary::Periodic => {}
        EmBoundary::Reflective => reflective_face(block, axis, side),
        EmBoundary::Absorbing => damping_face(block, axis, side),
        EmBoundary::Laser => {
            damping_face(block, axis, side);
            if let Some(profile) = laser {
                laser_face(block, profile, t, origin, cell_length, ndim);
            }
        }
    }
}

/// Perfect conductor: tangential E and normal B vanish in the ghost
/// layers beyond the face.
fn reflective_face(block: &mut FieldBlock, axis: usize, side: usize) {
    let g = block.ghost as isize;
    let range = if side == 0 {
        ndarray::Slice::from(0..g)
    } else {
        ndarray::Slice::from(-g..)
    };
    for cell in block.data.slice_axis_mut(ndarray::Axis(axis), range).iter_mut() {
        for c in 0..3 {
            if c != axis {
                cell.e[c] = 0.0;
            }
        }
        cell.b[axis] = 0.0;
    }
}

/// Graded damping over the outermost owned cells, with the ghost layers
/// zeroed outright.
fn damping_face(block: &mut FieldBlock, axis: usize, side: usize) {
    let g = block.ghost as isize;
    let n = block.inner(axis);
    let width = DAMPING_CELLS.min(n);
    let sigma_max = (10.0 / width.max(1) as f64).min(0.5);

    for k in 0..width {
        // k = 0 is the cell adjacent to the face.
        let layer = if side == 0 {
            g + k as isize
        } else {
            g + (n - 1 - k) as isize
        };
        let sigma = sigma_max * (width - k) as f64 / width as f64;
        let factor = 1.0 - sigma;
        for cell in block
            .data
            .slice_axis_mut(ndarray::Axis(axis), ndarray::Slice::from(layer..layer + 1))
            .iter_mut()
        {
            for c in 0..3 {
                cell.e[c] *= factor;
                cell.b[c] *= factor;
            }
        }
    }

    let ghost_range = if side == 0 {
        ndarray::Slice::from(0..g)
    } else {
        ndarray::Slice::from(-g..)
    };
    for cell in block.data.slice_axis_mut(ndarray::Axis(axis), ghost_range).iter_mut() {
        cell.e = [0.0; 3];
        cell.b = [0.0; 3];
    }
}

/// Drive Ey/Bz over the x-min ghost layers from the laser profile.
fn laser_face(
    block: &mut FieldBlock,
    profile: &Profile,
    t: f64,
    origin: &[f64; 3],
    cell_length: &[f64; 3],
    ndim: usize,
) {
    let g = block.ghost;
    let shape: Vec<usize> = block.data.shape().to_vec();
    let mut idx = vec![0usize; shape.len()];
    // Iterate the ghost slab on x-min.
    let counts = [
        g,
        if ndim > 1 { shape[1] } else { 1 },
        if ndim > 2 { shape[2] } else { 1 },
    ];
    for i0 in 0..counts[0] {
        for i1 in 0..counts[1] {
            for i2 in 0..counts[2] {
                let iv = [i0, i1, i2];
                let mut pos = [0.0; 3];
                pos[0] = origin[0] + (i0 as f64 - g as f64) * cell_length[0];
                for d in 1..ndim {
                    pos[d] = origin[d] + (iv[d] as f64 - g as f64) * cell_length[d];
                }
                idx[0] = i0;
                for d in 1..ndim {
                    idx[d] = iv[d];
                }
                let cell = &mut block.data[ndarray::IxDyn(&idx[..ndim])];
                cell.e[1] = profile.at_time(pos, t);
                let mut half = pos;
                half[0] += 0.5 * cell_length[0];
                cell.b[2] = profile.at_time(half, t);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Profile;
    use crate::params::{ParticlePolicy, PusherKind};
    use rand_chacha::ChaCha8Rng;
    use rand::SeedableRng;

    fn species_with(policy: ParticlePolicy) -> SpeciesSpec {
        SpeciesSpec {
            name: "test".to_owned(),
            mass: 1.0,
            charge: -1.0,
            n_part_per_cell: 1,
            density: Profile::constant(1.0),
            momentum: [
                Profile::constant(0.0),
                Profile::constant(0.0),
                Profile::constant(0.0),
            ],
            bcs: [[policy; 2]; 3],
            thermal_momentum: 0.05,
            pusher: PusherKind::Boris,
            tracked: false,
            radiating: false,
            time_frozen: 0.0,
            atomic_number: 0,
            ionization_electrons: None,
        }
    }

    fn particle(x: f64, ux: f64) -> MacroParticle {
        MacroParticle {
            pos: [x, 0.0, 0.0],
            prev: [x - 0.1, 0.0, 0.0],
            mom: [ux, 0.2, -0.1],
            weight: 1.5,
            charge: -1.0,
            chi: 0.0,
            tau: 1.0,
            id: 0,
        }
    }

    #[test]
    fn reflective_is_an_involution() {
        let spec = species_with(ParticlePolicy::Reflective);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut tallies = FaceTallies::default();
        let mut pt = particle(10.3, 0.7);
        let original = pt;
        let kept = apply_particle_bc(&mut pt, &spec, 0, 1, 10.0, &mut rng, &mut tallies);
        assert!(kept);
        assert!((pt.pos[0] - 9.7).abs() < 1.0e-12);
        assert_eq!(pt.mom[0], -0.7);
        // Applying the mirror again restores the original state exactly.
        apply_particle_bc(&mut pt, &spec, 0, 1, 10.0, &mut rng, &mut tallies);
        assert_eq!(pt, original);
    }

    #[test]
    fn remove_tallies_energy_and_charge() {
        let spec = species_with(ParticlePolicy::Remove);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut tallies = FaceTallies::default();
        let mut pt = particle(10.3, 0.7);
        let expected_energy = pt.kinetic_energy(1.0);
        let kept = apply_particle_bc(&mut pt, &spec, 0, 1, 10.0, &mut rng, &mut tallies);
        assert!(!kept);
        assert_eq!(tallies.total_count(), 1);
        assert_eq!(tallies.faces[0][1].count, 1);
        assert_eq!(tallies.faces[0][1].weight, 1.5);
        assert!((tallies.total_energy() - expected_energy).abs() < 1.0e-12);
        assert_eq!(tallies.faces[0][0].count, 0);
    }

    #[test]
    fn stop_clamps_to_face_and_freezes() {
        let spec = species_with(ParticlePolicy::Stop);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut tallies = FaceTallies::default();
        let mut pt = particle(10.3, 0.7);
        let kept = apply_particle_bc(&mut pt, &spec, 0, 1, 10.0, &mut rng, &mut tallies);
        assert!(kept);
        assert_eq!(pt.pos[0], 10.0);
        assert_eq!(pt.mom, [0.0; 3]);
    }

    #[test]
    fn thermalize_sends_particles_back_inside() {
        let spec = species_with(ParticlePolicy::Thermalize);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut tallies = FaceTallies::default();
        for _ in 0..32 {
            let mut pt = particle(10.3, 0.7);
            apply_particle_bc(&mut pt, &spec, 0, 1, 10.0, &mut rng, &mut tallies);
            assert_eq!(pt.pos[0], 10.0);
            assert!(pt.mom[0] <= 0.0);
        }
        for _ in 0..32 {
            let mut pt = particle(-0.2, -0.7);
            apply_particle_bc(&mut pt, &spec, 0, 0, 0.0, &mut rng, &mut tallies);
            assert!(pt.mom[0] >= 0.0);
        }
    }

    #[test]
    fn axis_reflection_folds_radius() {
        let mut pt = particle(1.0, 0.1);
        pt.pos[1] = -0.3;
        pt.prev[1] = -0.1;
        pt.mom[1] = -0.4;
        pt.mom[2] = 0.2;
        reflect_across_axis(&mut pt);
        assert_eq!(pt.pos[1], 0.3);
        assert_eq!(pt.mom[1], 0.4);
        assert_eq!(pt.mom[2], -0.2);
    }

    #[test]
    fn damping_attenuates_fields() {
        let mut block = FieldBlock::new(&[16], 3);
        for c in block.data.iter_mut() {
            c.e = [1.0; 3];
            c.b = [1.0; 3];
        }
        damping_face(&mut block, 0, 1);
        // Ghosts zeroed, near-face owned cells attenuated, far cells kept.
        assert_eq!(block.data[[16 + 3]].e[1], 0.0);
        assert!(block.data[[16 + 2]].e[1] < 1.0);
        assert_eq!(block.data[[3]].e[1], 1.0);
    }
}
