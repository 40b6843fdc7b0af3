//! Field solvers: Yee FDTD for the Maxwell advance, and the conjugate
//! gradient operator pieces used by the initial Poisson solve.
//!
//! The Maxwell solver runs on the mirror domain's contiguous block, with
//! ghost layers already synchronized by the caller. Sub-stepping is
//! half-B, full-E, half-B; E components are dual
//! along their own axis, B components dual along the two other axes, so
//! curl(E) uses forward differences and curl(B) backward ones.

use ndarray::IxDyn;

use crate::fields::FieldBlock;

pub trait MaxwellSolver: Send + Sync {
    fn solve(&self, block: &mut FieldBlock, dt: f64, cell_length: &[f64; 3], ndim: usize);
}

pub struct YeeSolver;

impl MaxwellSolver for YeeSolver {
    fn solve(&self, block: &mut FieldBlock, dt: f64, cell_length: &[f64; 3], ndim: usize) {
        advance_b(block, 0.5 * dt, cell_length, ndim);
        advance_e(block, dt, cell_length, ndim);
        advance_b(block, 0.5 * dt, cell_length, ndim);
    }
}

/// The two axes completing a right-handed triple with `c`.
fn cyclic(c: usize) -> (usize, usize) {
    ((c + 1) % 3, (c + 2) % 3)
}

/// dB/dt = -curl E, forward differences.
pub fn advance_b(block: &mut FieldBlock, dt: f64, cell_length: &[f64; 3], ndim: usize) {
    let shape: Vec<usize> = block.data.shape().to_vec();
    for c in 0..3 {
        let (a, b) = cyclic(c);
        // (curl E)_c = dE_b/da - dE_a/db; absent axes contribute nothing.
        for idx in ndarray::indices(IxDyn(&shape)) {
            let idx = idx.slice().to_vec();
            let mut curl = 0.0;
            if a < ndim {
                if idx[a] + 1 >= shape[a] {
                    continue;
                }
                let mut up = idx.clone();
                up[a] += 1;
                let d = (block.data[IxDyn(&up)].e[b] - block.data[IxDyn(&idx)].e[b]) / cell_length[a];
                curl += d;
            }
            if b < ndim {
                if idx[b] + 1 >= shape[b] {
                    continue;
                }
                let mut up = idx.clone();
                up[b] += 1;
                let d = (block.data[IxDyn(&up)].e[a] - block.data[IxDyn(&idx)].e[a]) / cell_length[b];
                curl -= d;
            }
            block.data[IxDyn(&idx)].b[c] -= dt * curl;
        }
    }
}

/// dE/dt = curl B - J, backward differences.
pub fn advance_e(block: &mut FieldBlock, dt: f64, cell_length: &[f64; 3], ndim: usize) {
    let shape: Vec<usize> = block.data.shape().to_vec();
    for c in 0..3 {
        let (a, b) = cyclic(c);
        for idx in ndarray::indices(IxDyn(&shape)) {
            let idx = idx.slice().to_vec();
            let mut curl = 0.0;
            if a < ndim {
                if idx[a] == 0 {
                    continue;
                }
                let mut down = idx.clone();
                down[a] -= 1;
                let d = (block.data[IxDyn(&idx)].b[b] - block.data[IxDyn(&down)].b[b]) / cell_length[a];
                curl += d;
            }
            if b < ndim {
                if idx[b] == 0 {
                    continue;
                }
                let mut down = idx.clone();
                down[b] -= 1;
                let d = (block.data[IxDyn(&idx)].b[a] - block.data[IxDyn(&down)].b[a]) / cell_length[b];
                curl -= d;
            }
            let j = block.data[IxDyn(&idx)].j[c];
            block.data[IxDyn(&idx)].e[c] += dt * (curl - j);
        }
    }
}

/// Seven-point Laplacian of a scalar array with a one-deep valid ghost
/// ring, written into `out` over the interior.
pub fn laplacian(
    phi: &ndarray::ArrayD<f64>,
    out: &mut ndarray::ArrayD<f64>,
    cell_length: &[f64; 3],
    ndim: usize,
) {
    let shape: Vec<usize> = phi.shape().to_vec();
    for idx in ndarray::indices(IxDyn(&shape)) {
        let idx = idx.slice().to_vec();
        if (0..ndim).any(|d| idx[d] == 0 || idx[d] + 1 >= shape[d]) {
            continue;
        }
        let mut acc = 0.0;
        for d in 0..ndim {
            let mut up = idx.clone();
            up[d] += 1;
            let mut down = idx.clone();
            down[d] -= 1;
            acc += (phi[IxDyn(&up)] - 2.0 * phi[IxDyn(&idx)] + phi[IxDyn(&down)])
                / (cell_length[d] * cell_length[d]);
        }
        out[IxDyn(&idx)] = acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::ExchangeMode;

    /// A y-polarized pulse advects in +x at the speed of light on a 1D
    /// periodic grid.
    #[test]
    fn vacuum_pulse_advects() {
        let n = 128;
        let dx = 1.0;
        let dt = 0.95 * dx;
        let mut block = FieldBlock::new(&[n], 3);
        let g = 3.0;
        let centre = 32.0;
        for (i, cell) in block.data.iter_mut().enumerate() {
            let x = i as f64 - g;
            let envelope = |x: f64| (-(x - centre).powi(2) / 50.0).exp();
            cell.e[1] = envelope(x);
            cell.b[2] = envelope(x + 0.5 * dx);
        }
        let solver = YeeSolver;
        let steps = 40;
        for _ in 0..steps {
            block.wrap_periodic(0, ExchangeMode::Fields);
            solver.solve(&mut block, dt, &[dx, dx, dx], 1);
        }
        // Locate the peak of Ey over the owned region.
        let mut best = (0usize, 0.0f64);
        for i in 0..n {
            let v = block.data[[i + 3]].e[1].abs();
            if v > best.1 {
                best = (i, v);
            }
        }
        let expected = centre + steps as f64 * dt;
        assert!(
            (best.0 as f64 - expected).abs() < 2.0,
            "peak at {}, expected {}",
            best.0,
            expected
        );
        // Amplitude survives the trip.
        assert!(best.1 > 0.9);
    }

    /// With no sources and no gradients, nothing moves.
    #[test]
    fn uniform_fields_are_static() {
        let mut block = FieldBlock::new(&[8, 8], 2);
        for cell in block.data.iter_mut() {
            cell.e = [0.3, -1.0, 0.5];
            cell.b = [0.1, 0.2, -0.4];
        }
        let solver = YeeSolver;
        solver.solve(&mut block, 0.5, &[1.0, 1.0, 1.0], 2);
        for cell in block.owned().iter() {
            assert_eq!(cell.e, [0.3, -1.0, 0.5]);
            assert_eq!(cell.b, [0.1, 0.2, -0.4]);
        }
    }

    /// A uniform current drives dE/dt = -J.
    #[test]
    fn current_drives_electric_field() {
        let mut block = FieldBlock::new(&[8], 3);
        for cell in block.data.iter_mut() {
            cell.j = [0.0, 2.0, 0.0];
        }
        advance_e(&mut block, 0.1, &[1.0, 1.0, 1.0], 1);
        for i in 1..block.data.len() {
            assert!((block.data[[i]].e[1] + 0.2).abs() < 1.0e-12);
        }
    }

    #[test]
    fn laplacian_of_quadratic_is_constant() {
        let shape = [16usize];
        let mut phi = ndarray::ArrayD::zeros(IxDyn(&shape));
        for (i, v) in phi.iter_mut().enumerate() {
            let x = i as f64;
            *v = x * x;
        }
        let mut out = ndarray::ArrayD::zeros(IxDyn(&shape));
        laplacian(&phi, &mut out, &[1.0, 1.0, 1.0], 1);
        for i in 1..15 {
            assert!((out[[i]] - 2.0).abs() < 1.0e-12);
        }
    }
}
