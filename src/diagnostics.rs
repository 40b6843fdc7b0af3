//! Diagnostics: scalar balance sheet, gathered field dumps, and particle
//! binning.
//!
//! Output formats are deliberately plain (text scalars, a small
//! self-describing binary field dump, text histograms); standards-grade
//! writers are a downstream concern. All files are written by the master
//! rank only.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use mpi::collective::SystemOperation;
use mpi::topology::Communicator;
use mpi::traits::*;
use ndarray::IxDyn;

use crate::decomposition::DomainDecomposition;
use crate::fields::Cell;
use crate::params::Params;
use crate::particle::MacroParticle;
use crate::vector_patch::{global_sum, global_sum_usize, VectorPatch};
use crate::window::MovingWindow;

pub struct Diagnostics {
    directory: PathBuf,
    scalars_header_written: bool,
}

impl Diagnostics {
    pub fn new(params: &Params) -> Diagnostics {
        Diagnostics {
            directory: PathBuf::from(&params.diags.directory),
            scalars_header_written: false,
        }
    }

    pub fn run_all<C: Communicator>(
        &mut self,
        comm: &C,
        vp: &VectorPatch,
        deco: &DomainDecomposition,
        params: &Params,
        window: &MovingWindow,
        step: usize,
        t: f64,
    ) -> std::io::Result<()> {
        if params.diags.scalars_every.the_time_is_now(step) || step == 0 {
            self.write_scalars(comm, vp, params, window, step, t)?;
        }
        if params.diags.fields_every.the_time_is_now(step) || step == 0 {
            self.write_fields(comm, vp, deco, params, step)?;
        }
        for spec in &params.diags.binning {
            if spec.every.the_time_is_now(step) {
                self.write_binning(comm, vp, params, spec, step)?;
            }
        }
        Ok(())
    }

    /// One line per entry: counts, kinetic and field energies, removal
    /// and window losses, and the total energy balance.
    fn write_scalars<C: Communicator>(
        &mut self,
        comm: &C,
        vp: &VectorPatch,
        params: &Params,
        window: &MovingWindow,
        step: usize,
        t: f64,
    ) -> std::io::Result<()> {
        let kinetic = vp.kinetic_energy(params);
        let field = vp.field_energy(params);

        let mut counts: Vec<usize> = Vec::new();
        let mut kin_global: Vec<f64> = Vec::new();
        for (s, _) in params.species.iter().enumerate() {
            let local: usize = vp.patches.iter().map(|p| p.species[s].len()).sum();
            counts.push(global_sum_usize(comm, local));
            kin_global.push(global_sum(comm, kinetic[s]));
        }
        let ue = global_sum(comm, field[0]);
        let ub = global_sum(comm, field[1]);
        let charge_local: f64 = vp
            .patches
            .iter()
            .map(|p| p.fields.total_charge(params.cell_volume()))
            .sum();
        let charge = global_sum(comm, charge_local);

        // Removal accounting: per-species boundary tallies plus the
        // window's trailing-edge losses.
        let mut lost_energy: Vec<f64> = Vec::new();
        for (s, _) in params.species.iter().enumerate() {
            let local: f64 = vp.patches.iter().map(|p| p.tallies[s].total_energy()).sum();
            let mut total = global_sum(comm, local);
            if comm.rank() == 0 {
                total += window.retired_tallies[s].total_energy() + window.lost[s].energy;
            }
            lost_energy.push(total);
        }

        if comm.rank() != 0 {
            return Ok(());
        }

        let total_energy: f64 =
            kin_global.iter().sum::<f64>() + ue + ub + lost_energy.iter().sum::<f64>();

        let path = self.directory.join("scalars.txt");
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if !self.scalars_header_written {
            write!(file, "# step time")?;
            for spec in &params.species {
                write!(file, " N_{0} Ekin_{0} Elost_{0}", spec.name)?;
            }
            writeln!(file, " Uelm_E Uelm_B Utot Qtot n_moved")?;
            self.scalars_header_written = true;
        }
        write!(file, "{} {:.9e}", step, t)?;
        for s in 0..params.species.len() {
            write!(file, " {} {:.12e} {:.12e}", counts[s], kin_global[s], lost_energy[s])?;
        }
        writeln!(
            file,
            " {:.12e} {:.12e} {:.12e} {:.12e} {}",
            ue, ub, total_energy, charge, window.n_moved
        )?;
        Ok(())
    }

    /// Gather all owned patch regions on the master and dump the global
    /// grid: a binary file with a short header followed by each component
    /// as a row-major f64 array.
    fn write_fields<C: Communicator>(
        &self,
        comm: &C,
        vp: &VectorPatch,
        deco: &DomainDecomposition,
        params: &Params,
        step: usize,
    ) -> std::io::Result<()> {
        let rank = comm.rank();
        let ndim = params.ndim_field;

        let mut meta: Vec<u64> = Vec::new();
        let mut cells: Vec<Cell> = Vec::new();
        for patch in &vp.patches {
            meta.push(patch.index as u64);
            cells.extend(patch.fields.owned_cells());
        }

        if rank != 0 {
            comm.process_at_rank(0).synchronous_send(&meta[..]);
            comm.process_at_rank(0).synchronous_send(&cells[..]);
            return Ok(());
        }

        let dims: Vec<usize> = params.n_global[..ndim].to_vec();
        let mut global = ndarray::ArrayD::from_elem(IxDyn(&dims), Cell::default());
        let patch_cells: usize = params.n_per_patch[..ndim].iter().product();

        let install = |meta: &[u64], cells: &[Cell], global: &mut ndarray::ArrayD<Cell>| {
            for (k, &patch_index) in meta.iter().enumerate() {
                let coords = deco.curve.coords_of(patch_index as usize);
                let chunk = &cells[k * patch_cells..(k + 1) * patch_cells];
                let mut c = 0;
                let counts = [
                    params.n_per_patch[0],
                    if ndim > 1 { params.n_per_patch[1] } else { 1 },
                    if ndim > 2 { params.n_per_patch[2] } else { 1 },
                ];
                for i0 in 0..counts[0] {
                    for i1 in 0..counts[1] {
                        for i2 in 0..counts[2] {
                            let iv = [i0, i1, i2];
                            let mut idx = vec![0usize; ndim];
                            for d in 0..ndim {
                                idx[d] = coords[d] * params.n_per_patch[d] + iv[d];
                            }
                            global[IxDyn(&idx)] = chunk[c];
                            c += 1;
                        }
                    }
                }
            }
        };
        install(&meta, &cells, &mut global);
        for r in 1..comm.size() {
            let (rmeta, _) = comm.process_at_rank(r).receive_vec::<u64>();
            let (rcells, _) = comm.process_at_rank(r).receive_vec::<Cell>();
            install(&rmeta, &rcells, &mut global);
        }

        let path = self.directory.join(format!("fields_{:08}.dat", step));
        let mut file = std::fs::File::create(path)?;
        file.write_all(b"BERYLF01")?;
        file.write_all(&(ndim as u32).to_le_bytes())?;
        for &d in &dims {
            file.write_all(&(d as u64).to_le_bytes())?;
        }
        let dump = |get: &dyn Fn(&Cell) -> f64, file: &mut std::fs::File| -> std::io::Result<()> {
            for cell in global.iter() {
                file.write_all(&get(cell).to_le_bytes())?;
            }
            Ok(())
        };
        dump(&|c| c.rho, &mut file)?;
        for comp in 0..3 {
            dump(&move |c: &Cell| c.j[comp], &mut file)?;
        }
        for comp in 0..3 {
            dump(&move |c: &Cell| c.e[comp], &mut file)?;
        }
        for comp in 0..3 {
            dump(&move |c: &Cell| c.b[comp], &mut file)?;
        }
        Ok(())
    }

    /// 1D/2D weighted histograms of particle quantities, ranges reduced
    /// across ranks, written as plain text.
    fn write_binning<C: Communicator>(
        &self,
        comm: &C,
        vp: &VectorPatch,
        params: &Params,
        bspec: &crate::params::BinningSpec,
        step: usize,
    ) -> std::io::Result<()> {
        let names: Vec<&str> = bspec.spec.split(':').collect();
        if names.is_empty() || names.len() > 2 {
            log::warn!("binning spec '{}' must have one or two quantities", bspec.spec);
            return Ok(());
        }
        let mass = params.species[bspec.species].mass;
        let funcs: Option<Vec<Quantity>> = names.iter().map(|&n| quantity(n)).collect();
        let funcs = match funcs {
            Some(f) => f,
            None => {
                log::warn!("binning spec '{}' has an unknown quantity", bspec.spec);
                return Ok(());
            }
        };

        let particles: Vec<&MacroParticle> = vp
            .patches
            .iter()
            .flat_map(|p| p.species[bspec.species].store.iter())
            .collect();

        const NBINS: usize = 128;
        let dim = funcs.len();

        // Global range per axis.
        let mut lo = [f64::INFINITY; 2];
        let mut hi = [f64::NEG_INFINITY; 2];
        for (a, f) in funcs.iter().enumerate() {
            for pt in &particles {
                let v = f(pt, mass);
                if v.is_finite() {
                    lo[a] = lo[a].min(v);
                    hi[a] = hi[a].max(v);
                }
            }
            if comm.size() > 1 {
                let (l, h) = (lo[a], hi[a]);
                comm.all_reduce_into(&l, &mut lo[a], SystemOperation::min());
                comm.all_reduce_into(&h, &mut hi[a], SystemOperation::max());
            }
            if !lo[a].is_finite() || lo[a] == hi[a] {
                hi[a] = lo[a] + 1.0;
            }
        }

        let total_bins = if dim == 1 { NBINS } else { NBINS * NBINS };
        let mut counts = vec![0.0f64; total_bins];
        for pt in &particles {
            let mut flat = 0usize;
            let mut keep = true;
            for (a, f) in funcs.iter().enumerate() {
                let v = f(pt, mass);
                if !v.is_finite() {
                    keep = false;
                    break;
                }
                let b = (((v - lo[a]) / (hi[a] - lo[a])) * NBINS as f64) as usize;
                flat = flat * NBINS + b.min(NBINS - 1);
            }
            if keep {
                counts[flat] += pt.weight;
            }
        }
        let mut global_counts = counts.clone();
        if comm.size() > 1 {
            comm.all_reduce_into(&counts[..], &mut global_counts[..], SystemOperation::sum());
        }

        if comm.rank() != 0 {
            return Ok(());
        }
        let path = self.directory.join(format!(
            "{}_{}_{:08}.txt",
            params.species[bspec.species].name,
            names.join("-"),
            step
        ));
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "# axes: {}", bspec.spec)?;
        for a in 0..dim {
            writeln!(file, "# range[{}]: {:e} {:e} bins: {}", a, lo[a], hi[a], NBINS)?;
        }
        if dim == 1 {
            for (b, v) in global_counts.iter().enumerate() {
                let centre = lo[0] + (b as f64 + 0.5) * (hi[0] - lo[0]) / NBINS as f64;
                writeln!(file, "{:e} {:e}", centre, v)?;
            }
        } else {
            for row in global_counts.chunks(NBINS) {
                let line: Vec<String> = row.iter().map(|v| format!("{:e}", v)).collect();
                writeln!(file, "{}", line.join(" "))?;
            }
        }
        Ok(())
    }
}

type Quantity = Box<dyn Fn(&MacroParticle, f64) -> f64>;

fn quantity(name: &str) -> Option<Quantity> {
    let f: Quantity = match name {
        "x" => Box::new(|pt, _| pt.pos[0]),
        "y" => Box::new(|pt, _| pt.pos[1]),
        "z" => Box::new(|pt, _| pt.pos[2]),
        "px" => Box::new(|pt, _| pt.mom[0]),
        "py" => Box::new(|pt, _| pt.mom[1]),
        "pz" => Box::new(|pt, _| pt.mom[2]),
        "gamma" => Box::new(|pt, mass| pt.gamma(mass)),
        "energy" => Box::new(|pt, mass| pt.kinetic_energy(mass) / pt.weight),
        "chi" => Box::new(|pt, _| pt.chi),
        "charge" => Box::new(|pt, _| pt.charge),
        "weight" => Box::new(|pt, _| pt.weight),
        // Polar angle around the x-axis.
        "theta" => Box::new(|pt, _| {
            let p = pt.mom;
            let magnitude = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            (p[0] / magnitude).acos()
        }),
        "phi" => Box::new(|pt, _| f64::atan2(pt.mom[2], pt.mom[1])),
        _ => return None,
    };
    Some(f)
}

/// Rank-0 status line in the teacher's progress-print style.
pub fn print_status(step: usize, n_time: usize, t: f64, particles: usize, runtime: std::time::Instant) {
    println!(
        "Step {: >8} / {} at t = {: >10.3}, {} macro-particles, RT = {}",
        step,
        n_time,
        t,
        particles,
        indicatif::FormattedDuration(runtime.elapsed())
    );
}

/// Ensure the output directory exists before the loop starts.
pub fn prepare_output(params: &Params) -> std::io::Result<()> {
    let dir = Path::new(&params.diags.directory);
    if !dir.as_os_str().is_empty() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::create_dir_all(&params.checkpoint.directory)?;
    Ok(())
}
