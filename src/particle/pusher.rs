//! Relativistic particle pushers, normalized units (momenta in m_s c,
//! fields in m_e c omega_ref / e, velocities in c).

use crate::particle::vec3::Vec3;
use crate::particle::MacroParticle;

/// Advance momentum and position with the Boris rotation.
///
/// `r` is the charge-to-mass ratio in units of e/m_e. The quantum
/// parameter is refreshed as a by-product when `chi_factor` is non-zero.
#[allow(non_snake_case)]
pub fn push_boris(pt: &mut MacroParticle, E: &[f64; 3], B: &[f64; 3], r: f64, dt: f64, chi_factor: f64) {
    let E = Vec3::from(*E);
    let B = Vec3::from(*B);
    let alpha = 0.5 * r * dt;

    // half the electric field acceleration:
    // u_ = u + alpha E
    let u_minus = Vec3::from(pt.mom) + alpha * E;

    // magnetic field rotation:
    // u' = u_ + t (u_ x B)
    let gamma = (1.0 + u_minus.norm_sqr()).sqrt();
    let t = (alpha / gamma) * B;
    let u_prime = u_minus + u_minus.cross(t);

    // u+ = u_ + t' (u' x B)
    let t_prime = 2.0 / (1.0 + t.norm_sqr()) * t;
    let u_plus = u_minus + u_prime.cross(t_prime);

    // remaining electric field acceleration
    let u_new = u_plus + alpha * E;
    let gamma_new = (1.0 + u_new.norm_sqr()).sqrt();

    if chi_factor != 0.0 {
        pt.chi = quantum_parameter(u_new, gamma_new, E, B, chi_factor);
    }

    pt.mom = u_new.to_array();
    advance_position(pt, gamma_new, dt);
}

/// Advance momentum and position with the leapfrog pusher of Vay et al.,
/// see https://doi.org/10.1063/1.2837054.
#[allow(non_snake_case)]
pub fn push_vay(pt: &mut MacroParticle, E: &[f64; 3], B: &[f64; 3], r: f64, dt: f64, chi_factor: f64) {
    let E = Vec3::from(*E);
    let B = Vec3::from(*B);
    let alpha = 0.5 * r * dt;

    let u = Vec3::from(pt.mom);
    let gamma = (1.0 + u.norm_sqr()).sqrt();
    let v = u / gamma;

    // u_i = u_{i-1/2} + (r dt/2) (E + v_{i-1/2} x B)
    let u_half = u + alpha * (E + v.cross(B));

    // u' = u_i + (r dt/2) E
    let u_prime = u_half + alpha * E;
    let gamma_prime_sqd = 1.0 + u_prime.norm_sqr();

    let tau = alpha * B;
    let u_star = u_prime * tau;
    let sigma = gamma_prime_sqd - tau.norm_sqr();

    let gamma_new = (0.5 * (sigma + (sigma.powi(2) + 4.0 * (tau.norm_sqr() + u_star.powi(2))).sqrt())).sqrt();

    let t = tau / gamma_new;
    let s = 1.0 / (1.0 + t.norm_sqr());
    let u_new = s * (u_prime + (u_prime * t) * t + u_prime.cross(t));
    let gamma_new = (1.0 + u_new.norm_sqr()).sqrt();

    if chi_factor != 0.0 {
        pt.chi = quantum_parameter(u_new, gamma_new, E, B, chi_factor);
    }

    pt.mom = u_new.to_array();
    advance_position(pt, gamma_new, dt);
}

/// Photons move ballistically at c along their wavevector.
pub fn push_photon(pt: &mut MacroParticle, dt: f64) {
    let k = Vec3::from(pt.mom);
    let k0 = k.norm_sqr().sqrt();
    pt.prev = pt.pos;
    if k0 > 0.0 {
        let v = k / k0;
        pt.pos[0] += v.x * dt;
        pt.pos[1] += v.y * dt;
        pt.pos[2] += v.z * dt;
    }
}

fn advance_position(pt: &mut MacroParticle, gamma: f64, dt: f64) {
    pt.prev = pt.pos;
    let scale = dt / gamma;
    pt.pos[0] += pt.mom[0] * scale;
    pt.pos[1] += pt.mom[1] * scale;
    pt.pos[2] += pt.mom[2] * scale;
}

/// chi = (hbar omega_ref / m c^2) sqrt((gamma E + u x B)^2 - (E.u)^2),
/// the prefactor being supplied by the caller.
#[allow(non_snake_case)]
fn quantum_parameter(u: Vec3, gamma: f64, E: Vec3, B: Vec3, chi_factor: f64) -> f64 {
    let f = gamma * E + u.cross(B);
    (f.norm_sqr() - (E * u).powi(2)).max(0.0).sqrt() * chi_factor
}
