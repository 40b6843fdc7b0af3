//! Macro-particles and per-patch particle containers.

use std::fmt;

use memoffset::offset_of;
use mpi::datatype::UserDatatype;
use mpi::traits::*;
use rand::prelude::*;
use rand_distr::{Exp1, StandardNormal};
use serde::{Deserialize, Serialize};

pub mod pusher;
pub mod shape;
pub mod vec3;

use crate::params::SpeciesSpec;

/// One macro-particle. Positions are physical coordinates in the global
/// (window) frame; momenta are in units of m_s c (of m_e c for photons).
/// `charge` is the particle's own charge state in units of e, which field
/// ionization raises over the run; it starts at the species charge.
/// `tau` is the optical depth against photon emission and `chi` the
/// quantum parameter, both refreshed by the pusher/radiation machinery.
/// `id` is zero for untracked species.
#[derive(Copy, Clone, Serialize, Deserialize, PartialEq)]
#[repr(C)]
pub struct MacroParticle {
    pub pos: [f64; 3],
    pub prev: [f64; 3],
    pub mom: [f64; 3],
    pub weight: f64,
    pub charge: f64,
    pub chi: f64,
    pub tau: f64,
    pub id: u64,
}

impl fmt::Debug for MacroParticle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[pt: x = {:?}, u = {:?}, w = {}]", self.pos, self.mom, self.weight)
    }
}

unsafe impl Equivalence for MacroParticle {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        let blocklengths = [3, 3, 3, 1, 1, 1, 1, 1];
        let displacements = [
            offset_of!(MacroParticle, pos) as mpi::Address,
            offset_of!(MacroParticle, prev) as mpi::Address,
            offset_of!(MacroParticle, mom) as mpi::Address,
            offset_of!(MacroParticle, weight) as mpi::Address,
            offset_of!(MacroParticle, charge) as mpi::Address,
            offset_of!(MacroParticle, chi) as mpi::Address,
            offset_of!(MacroParticle, tau) as mpi::Address,
            offset_of!(MacroParticle, id) as mpi::Address,
        ];
        let mpi_double = f64::equivalent_datatype();
        let mpi_u64 = u64::equivalent_datatype();
        let types: [&dyn Datatype; 8] = [
            &mpi_double,
            &mpi_double,
            &mpi_double,
            &mpi_double,
            &mpi_double,
            &mpi_double,
            &mpi_double,
            &mpi_u64,
        ];
        UserDatatype::structured(8, &blocklengths, &displacements, &types)
    }
}

impl MacroParticle {
    pub fn gamma(&self, mass: f64) -> f64 {
        let u_sqr: f64 = self.mom.iter().map(|u| u * u).sum();
        if mass == 0.0 {
            u_sqr.sqrt()
        } else {
            (1.0 + u_sqr).sqrt()
        }
    }

    pub fn velocity(&self, mass: f64) -> [f64; 3] {
        let g = self.gamma(mass);
        if g == 0.0 {
            return [0.0; 3];
        }
        [self.mom[0] / g, self.mom[1] / g, self.mom[2] / g]
    }

    /// Kinetic energy of the whole macro-particle, in m_e c^2 units.
    pub fn kinetic_energy(&self, mass: f64) -> f64 {
        if mass == 0.0 {
            self.weight * self.gamma(0.0)
        } else {
            let u_sqr: f64 = self.mom.iter().map(|u| u * u).sum();
            // gamma - 1 = u^2 / (gamma + 1), stable for cold particles
            self.weight * mass * u_sqr / (self.gamma(mass) + 1.0)
        }
    }
}

/// Per-patch container for one species.
#[derive(Default, Serialize, Deserialize, Clone)]
pub struct ParticleBin {
    pub store: Vec<MacroParticle>,
}

impl ParticleBin {
    pub fn new() -> ParticleBin {
        ParticleBin { store: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.store.iter().map(|p| p.weight).sum()
    }

    pub fn kinetic_energy(&self, mass: f64) -> f64 {
        self.store.iter().map(|p| p.kinetic_energy(mass)).sum()
    }

    /// Re-sort by linearized cell index to keep deposition cache-friendly.
    pub fn sort_by_cell(&mut self, origin: &[f64; 3], cell_length: &[f64; 3], n_cells: &[usize; 3], ndim: usize) {
        let key = |p: &MacroParticle| -> usize {
            let mut k = 0usize;
            for d in 0..ndim {
                let c = ((p.pos[d] - origin[d]) / cell_length[d]).floor();
                let c = (c.max(0.0) as usize).min(n_cells[d] - 1);
                k = k * n_cells[d] + c;
            }
            k
        };
        self.store.sort_unstable_by_key(key);
    }
}

/// Isotropic Maxwell-Juttner momentum draw used by particle loading and
/// the `thermalize` boundary policy. `u_th` is the thermal spread in m_s c,
/// so theta = T / (m_s c^2) = u_th^2.
///
/// The Lorentz factor is drawn by rejection: with x = (gamma - 1)/theta the
/// target density is
///
///     f(x) ~ sqrt(x) sqrt(theta x + 2) (1 + theta x) exp(-x),
///
/// proposed from Gamma(3/2, s), s = 1 + theta, itself assembled from one
/// `StandardNormal` and one `Exp1` draw (n^2/2 + e). The acceptance ratio
/// is bounded and tends to one as theta -> 0, so cold species stay cheap.
/// The direction is an isotropic unit vector.
pub fn maxwell_juttner<R: Rng>(u_th: f64, rng: &mut R) -> [f64; 3] {
    if u_th == 0.0 {
        return [0.0; 3];
    }
    let theta = u_th * u_th;
    let x = sample_gamma_excess(theta, rng);
    let gamma = 1.0 + theta * x;
    let u = (gamma * gamma - 1.0).sqrt();

    // Isotropic direction from three normals.
    loop {
        let n = [
            rng.sample::<f64, _>(StandardNormal),
            rng.sample::<f64, _>(StandardNormal),
            rng.sample::<f64, _>(StandardNormal),
        ];
        let norm = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
        if norm > 0.0 {
            return [u * n[0] / norm, u * n[1] / norm, u * n[2] / norm];
        }
    }
}

/// Sample x = (gamma - 1)/theta for the Maxwell-Juttner distribution.
fn sample_gamma_excess<R: Rng>(theta: f64, rng: &mut R) -> f64 {
    if theta <= 0.0 {
        // theta underflowed: the target degenerates to the proposal.
        let n: f64 = rng.sample(StandardNormal);
        let e: f64 = rng.sample(Exp1);
        return 0.5 * n * n + e;
    }
    let s = 1.0 + theta;
    let lambda = theta / s; // 1 - 1/s
    let log_ratio =
        |x: f64| 0.5 * (2.0 + theta * x).ln() + (1.0 + theta * x).ln() - lambda * x - 0.5 * 2.0f64.ln();

    // The log-ratio is unimodal; its stationary point solves
    // 2 lambda a^2 + (6 lambda - 3 theta) a + (4 lambda - 5 theta) = 0
    // with a = theta x.
    let aa = 2.0 * lambda;
    let bb = 6.0 * lambda - 3.0 * theta;
    let cc = 4.0 * lambda - 5.0 * theta;
    let disc = bb * bb - 4.0 * aa * cc;
    let x_star = if disc > 0.0 {
        ((-bb + disc.sqrt()) / (2.0 * aa) / theta).max(0.0)
    } else {
        0.0
    };
    let log_bound = log_ratio(x_star).max(log_ratio(0.0));

    loop {
        let n: f64 = rng.sample(StandardNormal);
        let e: f64 = rng.sample(Exp1);
        let x = s * (0.5 * n * n + e);
        if rng.gen::<f64>().ln() < log_ratio(x) - log_bound {
            return x;
        }
    }
}

/// Populate one patch-extent worth of particles from the species profiles.
///
/// Returns the particles and the number of tracking ids consumed.
#[allow(clippy::too_many_arguments)]
pub fn load_species<R: Rng>(
    spec: &SpeciesSpec,
    origin: &[f64; 3],
    n_cells: &[usize; 3],
    cell_length: &[f64; 3],
    ndim_field: usize,
    dt: f64,
    rng: &mut R,
    id_base: u64,
) -> (Vec<MacroParticle>, u64) {
    let npc = spec.n_part_per_cell;
    let mut out = Vec::new();
    if npc == 0 {
        return (out, 0);
    }
    let cell_volume: f64 = cell_length[..ndim_field].iter().product();
    let mut next_id = 0u64;

    let counts = [
        n_cells[0],
        if ndim_field > 1 { n_cells[1] } else { 1 },
        if ndim_field > 2 { n_cells[2] } else { 1 },
    ];
    for c0 in 0..counts[0] {
        for c1 in 0..counts[1] {
            for c2 in 0..counts[2] {
                let cell = [c0, c1, c2];
                let mut centre = [0.0; 3];
                for d in 0..ndim_field {
                    centre[d] = origin[d] + (cell[d] as f64 + 0.5) * cell_length[d];
                }
                let nreal = spec.density.at(centre) * cell_volume;
                if nreal <= 0.0 {
                    continue;
                }
                let weight = nreal / npc as f64;

                for _ in 0..npc {
                    let mut pos = [0.0; 3];
                    for d in 0..ndim_field {
                        pos[d] = origin[d] + (cell[d] as f64 + rng.gen::<f64>()) * cell_length[d];
                    }
                    let mut mom = [0.0; 3];
                    for c in 0..3 {
                        mom[c] = spec.momentum[c].at_random(
                            pos,
                            rng.gen::<f64>(),
                            rng.sample::<f64, _>(StandardNormal),
                        );
                    }
                    let th = maxwell_juttner(spec.thermal_momentum, rng);
                    for c in 0..3 {
                        mom[c] += th[c];
                    }

                    let mut pt = MacroParticle {
                        pos,
                        prev: pos,
                        mom,
                        weight,
                        charge: spec.charge,
                        chi: 0.0,
                        tau: rng.sample(Exp1),
                        id: 0,
                    };
                    let v = pt.velocity(spec.mass);
                    for d in 0..3 {
                        pt.prev[d] = pt.pos[d] - v[d] * dt;
                    }
                    if spec.tracked {
                        pt.id = id_base + next_id;
                    }
                    next_id += 1;
                    out.push(pt);
                }
            }
        }
    }
    (out, next_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Profile;
    use crate::params::{ParticlePolicy, PusherKind, SpeciesSpec};
    use rand_chacha::ChaCha8Rng;

    fn uniform_species(npc: usize) -> SpeciesSpec {
        SpeciesSpec {
            name: "electrons".to_owned(),
            mass: 1.0,
            charge: -1.0,
            n_part_per_cell: npc,
            density: Profile::constant(1.0),
            momentum: [
                Profile::constant(0.0),
                Profile::constant(0.0),
                Profile::constant(0.0),
            ],
            bcs: [[ParticlePolicy::Periodic; 2]; 3],
            thermal_momentum: 0.0,
            pusher: PusherKind::Boris,
            tracked: true,
            radiating: false,
            time_frozen: 0.0,
            atomic_number: 0,
            ionization_electrons: None,
        }
    }

    #[test]
    fn loading_matches_density() {
        let spec = uniform_species(4);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let (pts, used) = load_species(
            &spec,
            &[0.0; 3],
            &[8, 4, 1],
            &[0.5, 0.5, 1.0],
            2,
            0.01,
            &mut rng,
            100,
        );
        assert_eq!(pts.len(), 8 * 4 * 4);
        assert_eq!(used, pts.len() as u64);
        // Total physical particle number = density * volume.
        let total: f64 = pts.iter().map(|p| p.weight).sum();
        assert!((total - 8.0 * 4.0 * 0.25).abs() < 1.0e-12);
        // Tracking ids are unique and offset by the base.
        assert_eq!(pts[0].id, 100);
        let mut ids: Vec<u64> = pts.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), pts.len());
        // Everyone lies inside the loaded box.
        for p in &pts {
            assert!(p.pos[0] >= 0.0 && p.pos[0] < 4.0);
            assert!(p.pos[1] >= 0.0 && p.pos[1] < 2.0);
        }
    }

    #[test]
    fn cold_particles_have_no_kinetic_energy() {
        let spec = uniform_species(1);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let (pts, _) = load_species(&spec, &[0.0; 3], &[4, 1, 1], &[1.0; 3], 1, 0.1, &mut rng, 0);
        for p in &pts {
            assert_eq!(p.kinetic_energy(1.0), 0.0);
        }
    }

    #[test]
    fn sort_by_cell_orders_particles() {
        let mut bin = ParticleBin::new();
        for &x in &[3.2, 0.4, 1.9, 0.1] {
            let mut p = MacroParticle {
                pos: [x, 0.0, 0.0],
                prev: [x, 0.0, 0.0],
                mom: [0.0; 3],
                weight: 1.0,
                charge: -1.0,
                chi: 0.0,
                tau: 1.0,
                id: 0,
            };
            p.pos[0] = x;
            bin.store.push(p);
        }
        bin.sort_by_cell(&[0.0; 3], &[1.0; 3], &[4, 1, 1], 1);
        let xs: Vec<f64> = bin.store.iter().map(|p| p.pos[0]).collect();
        assert_eq!(xs, vec![0.1, 0.4, 1.9, 3.2]);
    }

    #[test]
    fn photon_energy_is_momentum_magnitude() {
        let p = MacroParticle {
            pos: [0.0; 3],
            prev: [0.0; 3],
            mom: [3.0, 0.0, 4.0],
            weight: 2.0,
            charge: 0.0,
            chi: 0.0,
            tau: 1.0,
            id: 0,
        };
        assert!((p.kinetic_energy(0.0) - 10.0).abs() < 1.0e-12);
    }

    #[test]
    fn maxwell_juttner_is_cold_at_zero_spread() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(maxwell_juttner(0.0, &mut rng), [0.0; 3]);
    }

    /// <gamma> = 1 + 3 theta / 2 to leading order for a cold plasma.
    #[test]
    fn maxwell_juttner_mean_gamma_small_temperature() {
        let u_th = 0.05;
        let theta = u_th * u_th;
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let n = 20_000;
        let mut mean_gamma = 0.0;
        let mut mean_usqr = 0.0;
        for _ in 0..n {
            let u = maxwell_juttner(u_th, &mut rng);
            let u_sqr: f64 = u.iter().map(|v| v * v).sum();
            mean_gamma += (1.0 + u_sqr).sqrt();
            mean_usqr += u_sqr;
        }
        mean_gamma /= n as f64;
        mean_usqr /= n as f64;
        let expected = 1.0 + 1.5 * theta;
        assert!(
            (mean_gamma - expected).abs() < 0.05 * 1.5 * theta,
            "<gamma> = {}, expected {}",
            mean_gamma,
            expected
        );
        // Per-component spread matches u_th in the same limit.
        assert!((mean_usqr - 3.0 * theta).abs() < 0.1 * theta);
    }

    /// At theta = 1 the exact mean is K1(1)/K2(1) + 3 theta = 3.3704...
    /// (ratio of modified Bessel functions); the sampler must land on it.
    #[test]
    fn maxwell_juttner_mean_gamma_relativistic() {
        let u_th = 1.0;
        let mut rng = ChaCha8Rng::seed_from_u64(34);
        let n = 40_000;
        let mut mean_gamma = 0.0;
        for _ in 0..n {
            let u = maxwell_juttner(u_th, &mut rng);
            let u_sqr: f64 = u.iter().map(|v| v * v).sum();
            mean_gamma += (1.0 + u_sqr).sqrt();
        }
        mean_gamma /= n as f64;
        let expected = 3.3704;
        assert!(
            (mean_gamma - expected).abs() / expected < 0.02,
            "<gamma> = {}, expected {}",
            mean_gamma,
            expected
        );
    }

    /// No preferred direction in the draws.
    #[test]
    fn maxwell_juttner_is_isotropic() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 10_000;
        let mut mean = [0.0f64; 3];
        for _ in 0..n {
            let u = maxwell_juttner(0.5, &mut rng);
            for c in 0..3 {
                mean[c] += u[c];
            }
        }
        for c in 0..3 {
            assert!((mean[c] / n as f64).abs() < 0.02, "component {}", c);
        }
    }
}
