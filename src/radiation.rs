//! Nonlinear Compton photon emission (radiation reaction).
//!
//! Each radiating particle carries an optical depth against emission,
//! decremented at the quantum-corrected synchrotron rate; when it crosses
//! zero a photon macro-particle is emitted along the electron momentum and
//! the electron recoils. Rates use the closed-form Erber-type suppression
//! factor rather than externally generated tables.

use rand::Rng;
use rand_distr::Exp1;

use crate::constants::*;
use crate::params::Params;
use crate::particle::vec3::Vec3;
use crate::particle::MacroParticle;

/// hbar omega_ref / (m_e c^2): converts normalized field strength times
/// gamma into the quantum parameter chi.
pub fn chi_factor(params: &Params) -> f64 {
    if params.reference_frequency <= 0.0 {
        return 0.0;
    }
    PLANCK_REDUCED * params.reference_frequency / (ELECTRON_MASS * SPEED_OF_LIGHT_SQD)
}

/// Quantum suppression of the radiated power, g(chi) -> 1 classically.
/// Erber-type interpolation, accurate to a few percent over all chi.
fn suppression(chi: f64) -> f64 {
    (1.0 + 4.8 * (1.0 + chi) * (1.0 + 1.7 * chi).ln() + 2.44 * chi * chi).powf(-2.0 / 3.0)
}

/// Photon emission rate for a particle of quantum parameter `chi` and
/// Lorentz factor `gamma`, per unit normalized time (1/omega_ref).
pub fn emission_rate(chi: f64, gamma: f64, params: &Params) -> f64 {
    if chi <= 0.0 || gamma <= 1.0 {
        return 0.0;
    }
    let h = 5.0 * std::f64::consts::FRAC_PI_3 * suppression(chi);
    let per_second = 3.0f64.sqrt() * ALPHA_FINE * chi * h
        / (2.0 * std::f64::consts::PI * gamma * COMPTON_TIME);
    per_second / params.reference_frequency
}

/// Decrement the particle's optical depth; on crossing zero, reset it,
/// apply the recoil and return the emitted photon.
pub fn try_emit<R: Rng>(
    pt: &mut MacroParticle,
    params: &Params,
    dt: f64,
    rng: &mut R,
) -> Option<MacroParticle> {
    let u = Vec3::from(pt.mom);
    let gamma = (1.0 + u.norm_sqr()).sqrt();
    pt.tau -= emission_rate(pt.chi, gamma, params) * dt;
    if pt.tau >= 0.0 {
        return None;
    }
    pt.tau = rng.sample(Exp1);

    // Photon energy: soft power-law sample with the Erber-type mean
    // 0.46 chi gamma, capped below the electron energy.
    let y: f64 = rng.gen::<f64>().powi(3);
    let scaled = 1.84 * pt.chi * y;
    let energy = gamma * scaled / (1.0 + scaled);
    if energy <= 0.0 {
        return None;
    }

    // Emission is beamed along the electron momentum.
    let direction = u.normalize();
    let k = direction * energy;

    // Electron recoil.
    let u_new = u - k;
    pt.mom = u_new.to_array();
    let gamma_new = (1.0 + u_new.norm_sqr()).sqrt();
    pt.chi *= gamma_new / gamma;

    Some(MacroParticle {
        pos: pt.pos,
        prev: pt.pos,
        mom: k.to_array(),
        weight: pt.weight,
        charge: 0.0,
        chi: 0.0,
        tau: f64::INFINITY,
        id: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Configuration;
    use crate::params::Params;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn radiating_params() -> Params {
        let deck = "control:\n\
             \x20 geometry: 1d3v\n\
             \x20 cell_length: [0.1]\n\
             \x20 n_space_global: [16]\n\
             \x20 timestep: 0.05\n\
             \x20 n_time: 1\n\
             \x20 reference_frequency: 2.354e15\n\
             em:\n\
             \x20 boundary_conditions: [[periodic, periodic]]\n";
        Params::read(&Configuration::from_str(deck).unwrap()).unwrap()
    }

    #[test]
    fn suppression_is_classical_at_small_chi() {
        assert!((suppression(0.0) - 1.0).abs() < 1.0e-12);
        assert!(suppression(1.0) < 0.3);
        assert!(suppression(10.0) < suppression(1.0));
    }

    #[test]
    fn no_emission_at_zero_chi() {
        let params = radiating_params();
        assert_eq!(emission_rate(0.0, 100.0, &params), 0.0);
        let mut rng = Xoshiro256StarStar::seed_from_u64(1);
        let mut pt = MacroParticle {
            pos: [0.0; 3],
            prev: [0.0; 3],
            mom: [100.0, 0.0, 0.0],
            weight: 1.0,
            charge: -1.0,
            chi: 0.0,
            tau: 0.5,
            id: 0,
        };
        assert!(try_emit(&mut pt, &params, 0.05, &mut rng).is_none());
        assert_eq!(pt.tau, 0.5);
    }

    #[test]
    fn emission_conserves_momentum_and_energy() {
        let params = radiating_params();
        let mut rng = Xoshiro256StarStar::seed_from_u64(2);
        let mut pt = MacroParticle {
            pos: [1.0, 0.0, 0.0],
            prev: [1.0, 0.0, 0.0],
            mom: [1000.0, 0.0, 0.0],
            weight: 2.0,
            charge: -1.0,
            chi: 0.5,
            tau: 1.0e-12,
            id: 0,
        };
        let before = Vec3::from(pt.mom);
        let photon = loop {
            if let Some(ph) = try_emit(&mut pt, &params, 0.05, &mut rng) {
                break ph;
            }
        };
        let after = Vec3::from(pt.mom) + Vec3::from(photon.mom);
        assert!((after - before).norm_sqr().sqrt() < 1.0e-9);
        assert_eq!(photon.weight, 2.0);
        // Photon flies forward and costs the electron energy.
        assert!(photon.mom[0] > 0.0);
        assert!(pt.mom[0] < 1000.0);
        // Fresh optical depth drawn for the electron.
        assert!(pt.tau > 0.0);
    }
}
