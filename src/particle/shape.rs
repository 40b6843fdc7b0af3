//! Shape functions, field interpolation and current deposition.
//!
//! Grid points carry a top-hat (order-0 b-spline) shape, particles a
//! triangle (order-1), so the interpolation function is the order-2
//! b-spline `weight`, non-zero for |xhat| < 3/2. `flux` measures the
//! amount of particle that crossed a cell face during one step and
//! exactly conserves particle weight:
//!
//!     delta W(x) = -flux(x - 1/2) + flux(x + 1/2)
//!
//! Positions here are in owned-cell units of the hosting block: a particle
//! at `xi = 2.25` along an axis sits a quarter-cell past the left face of
//! that block's third owned cell.

use ndarray::IxDyn;

use crate::fields::FieldBlock;

pub fn weight(xi: f64) -> f64 {
    let xhat = xi.abs();
    if xhat > 1.5 {
        0.0
    } else if xhat < 0.5 {
        0.75 - xhat.powi(2)
    } else {
        1.125 - 1.5 * xhat + 0.5 * xhat.powi(2)
    }
}

/// Signed fraction of a particle that flowed through a boundary whose
/// displacement from the particle centre was initially `x_i` and finally
/// `x_f` (x measured boundary minus particle, positive flux for motion
/// from left to right). Assumes the relative motion is less than one cell.
pub fn flux(x_i: f64, x_f: f64) -> f64 {
    if x_i.abs() < 1.0 {
        if x_f.abs() >= 1.0 {
            let v = 0.5 * (1.0 - x_i.abs()).powi(2);
            v.copysign(-x_i)
        } else if x_i * x_f >= 0.0 {
            let v = 0.5 * (1.0 - x_f.abs()).powi(2) - 0.5 * (1.0 - x_i.abs()).powi(2);
            v.copysign(x_i - x_f)
        } else {
            let v = x_i.abs() * (1.0 - 0.5 * x_i.abs()) + x_f.abs() * (1.0 - 0.5 * x_f.abs());
            v.copysign(x_i)
        }
    } else if x_f.abs() < 1.0 {
        let v = 0.5 * (1.0 - x_f.abs()).powi(2);
        v.copysign(x_f)
    } else {
        0.0
    }
}

/// Base node and the three order-2 weights along one axis. `dual` shifts
/// the node locations up by half a cell (Yee staggering).
pub fn weights_1d(p: f64, dual: bool) -> (isize, [f64; 3]) {
    let s = if dual { p - 0.5 } else { p };
    let m = s.round() as isize;
    let base = m - 1;
    (
        base,
        [
            weight(s - base as f64),
            weight(s - (base + 1) as f64),
            weight(s - (base + 2) as f64),
        ],
    )
}

/// Yee staggering of component `c`: E_c is dual along axis `c`,
/// B_c is dual along every axis other than `c`.
fn e_is_dual(c: usize, d: usize) -> bool {
    d == c
}

fn b_is_dual(c: usize, d: usize) -> bool {
    d != c
}

fn gather<F: Fn(&crate::fields::Cell) -> f64>(
    block: &FieldBlock,
    base: &[isize; 3],
    w: &[[f64; 3]; 3],
    ndim: usize,
    get: F,
) -> f64 {
    let g = block.ghost as isize;
    let mut total = 0.0;
    let kmax = [
        3,
        if ndim > 1 { 3 } else { 1 },
        if ndim > 2 { 3 } else { 1 },
    ];
    let mut idx = vec![0usize; ndim];
    for k0 in 0..kmax[0] {
        for k1 in 0..kmax[1] {
            for k2 in 0..kmax[2] {
                let k = [k0, k1, k2];
                let mut wt = 1.0;
                for d in 0..ndim {
                    idx[d] = (g + base[d] + k[d] as isize) as usize;
                    wt *= w[d][k[d]];
                }
                if wt != 0.0 {
                    total += wt * get(&block.data[IxDyn(&idx)]);
                }
            }
        }
    }
    total
}

/// Interpolate E and B at a position given in owned-cell units.
pub fn fields_at(block: &FieldBlock, xi: &[f64; 3], ndim: usize) -> ([f64; 3], [f64; 3]) {
    let mut e = [0.0; 3];
    let mut b = [0.0; 3];
    let mut base = [0isize; 3];
    let mut w = [[0.0; 3]; 3];

    for c in 0..3 {
        for d in 0..ndim {
            let (bd, wd) = weights_1d(xi[d], e_is_dual(c, d));
            base[d] = bd;
            w[d] = wd;
        }
        e[c] = gather(block, &base, &w, ndim, |cell| cell.e[c]);

        for d in 0..ndim {
            let (bd, wd) = weights_1d(xi[d], b_is_dual(c, d));
            base[d] = bd;
            w[d] = wd;
        }
        b[c] = gather(block, &base, &w, ndim, |cell| cell.b[c]);
    }
    (e, b)
}

/// Deposit the charge density of one particle at `xi` (primal, order-2).
pub fn deposit_charge(block: &mut FieldBlock, xi: &[f64; 3], macro_charge: f64, cell_volume: f64, ndim: usize) {
    let g = block.ghost as isize;
    let mut base = [0isize; 3];
    let mut w = [[0.0; 3]; 3];
    for d in 0..ndim {
        let (bd, wd) = weights_1d(xi[d], false);
        base[d] = bd;
        w[d] = wd;
    }
    let kmax = [
        3,
        if ndim > 1 { 3 } else { 1 },
        if ndim > 2 { 3 } else { 1 },
    ];
    let mut idx = vec![0usize; ndim];
    for k0 in 0..kmax[0] {
        for k1 in 0..kmax[1] {
            for k2 in 0..kmax[2] {
                let k = [k0, k1, k2];
                let mut wt = 1.0;
                for d in 0..ndim {
                    idx[d] = (g + base[d] + k[d] as isize) as usize;
                    wt *= w[d][k[d]];
                }
                if wt != 0.0 {
                    block.data[IxDyn(&idx)].rho += macro_charge * wt / cell_volume;
                }
            }
        }
    }
}

/// Charge-conserving current deposition for one particle step.
///
/// Along each resolved axis the current through the dual faces is the
/// weight flux, with order-2 transverse weights evaluated at the midpoint
/// of the step. Unresolved axes (1D/2D runs, and the azimuthal direction
/// in axisymmetric mode) get the velocity-weighted current instead.
#[allow(clippy::too_many_arguments)]
pub fn deposit_current(
    block: &mut FieldBlock,
    xi_old: &[f64; 3],
    xi_new: &[f64; 3],
    velocity: &[f64; 3],
    macro_charge: f64,
    dt: f64,
    cell_length: &[f64; 3],
    ndim: usize,
) {
    let g = block.ghost as isize;
    let cell_volume: f64 = cell_length[..ndim].iter().product();
    let mid = [
        0.5 * (xi_old[0] + xi_new[0]),
        0.5 * (xi_old[1] + xi_new[1]),
        0.5 * (xi_old[2] + xi_new[2]),
    ];

    let mut tbase = [0isize; 3];
    let mut tw = [[0.0; 3]; 3];
    for d in 0..ndim {
        let (bd, wd) = weights_1d(mid[d], false);
        tbase[d] = bd;
        tw[d] = wd;
    }

    // Flux-based components on the resolved axes.
    for a in 0..ndim {
        let plane0 = (0.5 * (xi_old[a] + xi_new[a])).floor() as isize - 2;
        let scale = macro_charge * cell_length[a] / (dt * cell_volume);
        for i in plane0..plane0 + 5 {
            let plane = i as f64 + 0.5;
            let f = flux(plane - xi_old[a], plane - xi_new[a]);
            if f == 0.0 {
                continue;
            }
            // Transverse weights over the other resolved axes.
            deposit_axis_current(block, a, i, &tbase, &tw, ndim, g, scale * f);
        }
    }

    // Velocity-weighted components on the unresolved axes.
    let kmax = [
        3,
        if ndim > 1 { 3 } else { 1 },
        if ndim > 2 { 3 } else { 1 },
    ];
    let mut idx = vec![0usize; ndim];
    for a in ndim..3 {
        if velocity[a] == 0.0 {
            continue;
        }
        let jperp = macro_charge * velocity[a] / cell_volume;
        for k0 in 0..kmax[0] {
            for k1 in 0..kmax[1] {
                for k2 in 0..kmax[2] {
                    let k = [k0, k1, k2];
                    let mut wt = 1.0;
                    for d in 0..ndim {
                        idx[d] = (g + tbase[d] + k[d] as isize) as usize;
                        wt *= tw[d][k[d]];
                    }
                    if wt != 0.0 {
                        block.data[IxDyn(&idx)].j[a] += jperp * wt;
                    }
                }
            }
        }
    }
}

fn deposit_axis_current(
    block: &mut FieldBlock,
    axis: usize,
    plane: isize,
    tbase: &[isize; 3],
    tw: &[[f64; 3]; 3],
    ndim: usize,
    g: isize,
    amount: f64,
) {
    let kmax = [
        if ndim > 0 { 3 } else { 1 },
        if ndim > 1 { 3 } else { 1 },
        if ndim > 2 { 3 } else { 1 },
    ];
    let mut idx = vec![0usize; ndim];
    for k0 in 0..kmax[0] {
        for k1 in 0..kmax[1] {
            for k2 in 0..kmax[2] {
                let k = [k0, k1, k2];
                let mut wt = 1.0;
                for d in 0..ndim {
                    if d == axis {
                        // Only the face plane itself along this axis.
                        if k[d] != 0 {
                            wt = 0.0;
                            break;
                        }
                        idx[d] = (g + plane) as usize;
                    } else {
                        idx[d] = (g + tbase[d] + k[d] as isize) as usize;
                        wt *= tw[d][k[d]];
                    }
                }
                if wt != 0.0 {
                    block.data[IxDyn(&idx)].j[axis] += amount * wt;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        for &p in &[0.0, 0.1, 0.49, 0.5, 0.77, 1.3, 4.25] {
            let (_, w) = weights_1d(p, false);
            assert!((w.iter().sum::<f64>() - 1.0).abs() < 1.0e-12, "p = {}", p);
            let (_, w) = weights_1d(p, true);
            assert!((w.iter().sum::<f64>() - 1.0).abs() < 1.0e-12, "p = {} (dual)", p);
        }
    }

    #[test]
    fn flux_conserves_weight() {
        // delta W = -flux(x - 1/2) + flux(x + 1/2) for a small displacement.
        let x0: f64 = 0.3;
        let x1: f64 = 0.55;
        for node in -2..3 {
            let n = node as f64;
            let dw = weight(x1 - n) - weight(x0 - n);
            let f_left = flux((n - 0.5) - x0, (n - 0.5) - x1);
            let f_right = flux((n + 0.5) - x0, (n + 0.5) - x1);
            assert!((dw - (f_left - f_right)).abs() < 1.0e-12, "node {}", node);
        }
    }

    #[test]
    fn interpolates_uniform_field_exactly() {
        let mut block = FieldBlock::new(&[8, 8], 3);
        for c in block.data.iter_mut() {
            c.e = [1.5, -0.5, 2.0];
            c.b = [0.25, 1.0, -1.0];
        }
        for &pos in &[[0.1, 3.7, 0.0], [4.5, 0.2, 0.0], [7.9, 7.9, 0.0]] {
            let (e, b) = fields_at(&block, &pos, 2);
            for c in 0..3 {
                assert!((e[c] - block.data[[3, 3]].e[c]).abs() < 1.0e-12);
                assert!((b[c] - block.data[[3, 3]].b[c]).abs() < 1.0e-12);
            }
        }
    }

    #[test]
    fn charge_deposit_integrates_to_macro_charge() {
        let mut block = FieldBlock::new(&[8, 4], 3);
        let dv = 0.1 * 0.2;
        deposit_charge(&mut block, &[3.3, 1.8, 0.0], -2.0, dv, 2);
        let total: f64 = block.data.iter().map(|c| c.rho).sum::<f64>() * dv;
        assert!((total - (-2.0)).abs() < 1.0e-12);
    }

    #[test]
    fn current_matches_flux_in_1d() {
        // A particle crossing a cell face deposits exactly its weight flux.
        let mut block = FieldBlock::new(&[8], 3);
        let dt = 0.1;
        let (old, new) = ([3.8, 0.0, 0.0], [4.1, 0.0, 0.0]);
        deposit_current(&mut block, &old, &new, &[3.0, 0.0, 0.0], 1.0, dt, &[1.0, 1.0, 1.0], 1);
        // Total Jx integrated over the grid equals q <v> (continuity).
        let total: f64 = block.data.iter().map(|c| c.j[0]).sum::<f64>();
        assert!((total - (new[0] - old[0]) / dt).abs() < 1.0e-12);
    }

    #[test]
    fn transverse_current_uses_velocity() {
        let mut block = FieldBlock::new(&[8], 3);
        deposit_current(
            &mut block,
            &[2.0, 0.0, 0.0],
            &[2.0, 0.0, 0.0],
            &[0.0, 0.5, -0.25],
            2.0,
            0.1,
            &[0.5, 1.0, 1.0],
            1,
        );
        let jy: f64 = block.data.iter().map(|c| c.j[1]).sum::<f64>();
        let jz: f64 = block.data.iter().map(|c| c.j[2]).sum::<f64>();
        assert!((jy - 2.0 * 0.5 / 0.5).abs() < 1.0e-12);
        assert!((jz + 2.0 * 0.25 / 0.5).abs() < 1.0e-12);
    }
}
