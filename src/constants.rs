//! Physical constants, SI units.
//!
//! The simulation itself runs in normalized units (lengths in c/ω_ref,
//! times in 1/ω_ref, momenta in m_e c, densities in the critical density,
//! fields in m_e c ω_ref / e). SI values are needed only to convert deck
//! input and to normalize the QED emission rates.

pub const SPEED_OF_LIGHT: f64 = 299792458.0;
pub const SPEED_OF_LIGHT_SQD: f64 = SPEED_OF_LIGHT * SPEED_OF_LIGHT;

pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;
pub const ELECTRON_MASS: f64 = 9.1093837015e-31;
pub const PROTON_MASS: f64 = 1.67262192369e-27;

pub const VACUUM_PERMITTIVITY: f64 = 8.8541878128e-12;

pub const PLANCK_REDUCED: f64 = 1.054571817e-34;
pub const ALPHA_FINE: f64 = 7.2973525693e-3;

/// hbar / (m_e c^2), s.
pub const COMPTON_TIME: f64 = 1.28808867e-21;
