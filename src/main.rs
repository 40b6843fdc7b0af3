//! beryl: a patch-based relativistic electromagnetic particle-in-cell
//! code for laser-plasma interaction.
//!
//! Run as `mpirun -n np ./beryl deck.yml [deck2.yml ...]`.

use anyhow::Context;
use indicatif::FormattedDuration;
use mpi::traits::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_xoshiro::Xoshiro256StarStar;

mod balance;
mod boundary;
mod checkpoint;
mod collisions;
mod constants;
mod decomposition;
mod diagnostics;
mod fields;
mod hilbert;
mod input;
mod ionization;
mod mirror;
mod params;
mod particle;
mod patch;
mod radiation;
mod solver;
mod sync;
mod timers;
mod vector_patch;
mod window;

use checkpoint::Checkpoint;
use decomposition::DomainDecomposition;
use diagnostics::Diagnostics;
use input::Configuration;
use mirror::CartesianMirror;
use params::Params;
use solver::YeeSolver;
use timers::Timers;
use vector_patch::{global_sum_usize, VectorPatch};
use window::MovingWindow;

/// Deterministic RNG stream for one (step, concern) pair. Restart
/// reproducibility comes from re-deriving these rather than saving
/// generator state; rank offsets are applied with `jump`.
fn step_stream(seed: u64, step: u64, purpose: u64, rank: i32) -> Xoshiro256StarStar {
    let mut rng = Xoshiro256StarStar::seed_from_u64(
        seed ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(purpose),
    );
    for _ in 0..rank {
        rng.jump();
    }
    rng
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let universe = mpi::initialize().context("MPI initialization failed")?;
    let world = universe.world();
    let rank = world.rank();
    let n_ranks = world.size();

    // Read and validate the input deck(s); any failure here is fatal
    // before the time loop starts.
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = Configuration::from_files(&args).context("reading input deck")?;
    let params = Params::read(&cfg).context("validating configuration")?;

    let mut deco = DomainDecomposition::new(&params, n_ranks as usize);
    let mut checkpoint = Checkpoint::new(&params);
    let mut timers = Timers::new();
    let mut diags = Diagnostics::new(&params);
    if rank == 0 {
        diagnostics::prepare_output(&params).context("creating output directories")?;
    }

    let dt = params.timestep;
    // time at integer steps (primal grid) and half-integer steps (dual)
    let mut time_prim = 0.0;
    let mut time_dual = 0.5 * dt;

    let solver = YeeSolver;

    let restart_path = checkpoint.restart_file();
    let (mut vp, mut window) = match &restart_path {
        Some(path) => {
            let (vp, window) = checkpoint
                .restart(path, &deco, &params, rank as usize)
                .context("restart failed")?;
            let step = checkpoint.this_run_start_step;
            time_prim = step as f64 * dt;
            time_dual = (step as f64 + 0.5) * dt;
            if rank == 0 {
                println!("Restarted from {} at step {}", path.display(), step);
            }
            (vp, window)
        }
        None => {
            let mut vp = VectorPatch::new(&deco, &params, rank as usize);
            let mut rng = ChaCha8Rng::seed_from_u64(params.random_seed.wrapping_add(rank as u64));
            vp.populate(&params, &mut rng);
            (vp, MovingWindow::new(&params))
        }
    };

    if rank == 0 {
        println!(
            "Running on {} ranks with {} threads per rank, {} patches of {:?} cells...",
            n_ranks,
            rayon::current_num_threads(),
            params.total_patches,
            &params.n_per_patch[..params.ndim_field]
        );
    }

    let mut mirror = CartesianMirror::build(&deco, &params, rank as usize);

    if restart_path.is_none() {
        // Initial fields: deposited charge, optional Poisson-consistent
        // electric field, then external fields and a first ghost sync.
        vp.compute_charge(&params);
        vp.sum_densities(&world, &deco);
        if params.solve_poisson {
            if rank == 0 {
                println!("Solving Poisson at t = 0");
            }
            vp.solve_poisson(&world, &deco, &params);
        }
        vp.apply_external_fields(&params);
        vp.finalize_sync_and_bc_fields(&world, &deco, &params, 0.0);
        diags
            .run_all(&world, &vp, &deco, &params, &window, 0, 0.0)
            .context("diagnostics at t = 0")?;
    }

    let mut step = checkpoint.this_run_start_step + 1;
    while step <= params.n_time && !checkpoint.exit_asap {
        time_prim += dt;
        time_dual += dt;

        timers.collisions.restart();
        let mut rng_c = step_stream(params.random_seed, step as u64, 2, rank);
        vp.apply_collisions(&params, step, &mut rng_c);
        timers.collisions.update();

        // (1) interpolate fields at particle positions
        // (2) push particles
        // (3) deposit the charge-conserving currents
        timers.dynamics.restart();
        let with_charge = params.diags.scalars_every.the_time_is_now(step)
            || params.diags.fields_every.the_time_is_now(step);
        let mut rng_d = step_stream(params.random_seed, step as u64, 0, 0);
        vp.dynamics(&params, time_dual, &mut rng_d, with_charge);
        timers.dynamics.update();

        timers.densities.restart();
        vp.sum_densities(&world, &deco);
        timers.densities.update();

        vp.apply_antennas(&params, time_dual);

        // Maxwell solve on the mirror domain; the gather, solve and
        // scatter are process-wide collectives.
        if time_dual > params.time_fields_frozen {
            timers.maxwell.restart();
            world.barrier();
            mirror.patched_to_cartesian(&world, &vp, &deco, &params);
            world.barrier();
            mirror.solve_maxwell(&solver, &params);
            mirror.cartesian_to_patches(&world, &mut vp, &deco, &params);
            timers.maxwell.update();
        }

        timers.particles.restart();
        let mut rng_b = step_stream(params.random_seed, step as u64, 1, rank);
        vp.finalize_and_sort_parts(&world, &deco, &params, window.shift_cells(), &mut rng_b);
        timers.particles.update();

        timers.fields_sync.restart();
        vp.finalize_sync_and_bc_fields(&world, &deco, &params, time_prim);
        timers.fields_sync.update();

        timers.diags.restart();
        diags
            .run_all(&world, &vp, &deco, &params, &window, step, time_prim)
            .context("running diagnostics")?;
        timers.diags.update();

        timers.window.restart();
        let mut rng_w = step_stream(params.random_seed, step as u64, 3, rank);
        window.operate(&world, &mut vp, &deco, &params, step, time_dual, &mut rng_w);
        timers.window.update();

        timers.checkpoint.restart();
        if checkpoint.dump_due(step) {
            checkpoint.dump(&world, &vp, &deco, &window, step);
        }
        timers.checkpoint.update();

        if let Some(bp) = &params.load_balancing {
            if bp.every.the_time_is_now(step) {
                timers.balance.restart();
                if balance::load_balance(&world, &mut deco, &mut vp, &params, bp, window.shift_cells()) {
                    mirror = CartesianMirror::build(&deco, &params, rank as usize);
                }
                timers.balance.update();
            }
        }

        if params.print_every > 0 && step % params.print_every == 0 {
            vp.check_finite(&world);
            let total = global_sum_usize(&world, vp.total_particles());
            if rank == 0 {
                diagnostics::print_status(step, params.n_time, time_prim, total, timers.global);
            }
            timers.consolidate(&world);
        }

        checkpoint.update_exit_flag(&world);
        step += 1;
    }

    // The watchdog leaves a restartable dump behind.
    if checkpoint.exit_asap {
        if rank == 0 {
            println!("Wall-clock limit reached; dumping a final checkpoint");
        }
        checkpoint.dump(&world, &vp, &deco, &window, step - 1);
    }

    world.barrier();
    timers.consolidate(&world);
    if rank == 0 {
        println!(
            "End of the time loop at t = {:.3}, RT = {}",
            time_prim,
            FormattedDuration(timers.global.elapsed())
        );
    }

    Ok(())
}
