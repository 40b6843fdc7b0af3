//! Per-phase wall-clock timers, consolidated across ranks at print time.

use std::time::{Duration, Instant};

use mpi::collective::SystemOperation;
use mpi::topology::Communicator;
use mpi::traits::*;

pub struct PhaseTimer {
    pub name: &'static str,
    acc: Duration,
    started: Option<Instant>,
}

impl PhaseTimer {
    fn new(name: &'static str) -> PhaseTimer {
        PhaseTimer { name, acc: Duration::ZERO, started: None }
    }

    pub fn restart(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn update(&mut self) {
        if let Some(t0) = self.started.take() {
            self.acc += t0.elapsed();
        }
    }

    pub fn seconds(&self) -> f64 {
        self.acc.as_secs_f64()
    }
}

pub struct Timers {
    pub global: Instant,
    pub collisions: PhaseTimer,
    pub dynamics: PhaseTimer,
    pub densities: PhaseTimer,
    pub maxwell: PhaseTimer,
    pub particles: PhaseTimer,
    pub fields_sync: PhaseTimer,
    pub diags: PhaseTimer,
    pub window: PhaseTimer,
    pub checkpoint: PhaseTimer,
    pub balance: PhaseTimer,
}

impl Timers {
    pub fn new() -> Timers {
        Timers {
            global: Instant::now(),
            collisions: PhaseTimer::new("collisions"),
            dynamics: PhaseTimer::new("dynamics"),
            densities: PhaseTimer::new("densities"),
            maxwell: PhaseTimer::new("maxwell"),
            particles: PhaseTimer::new("particles"),
            fields_sync: PhaseTimer::new("fields_sync"),
            diags: PhaseTimer::new("diagnostics"),
            window: PhaseTimer::new("mov_window"),
            checkpoint: PhaseTimer::new("checkpoint"),
            balance: PhaseTimer::new("load_balance"),
        }
    }

    fn all(&self) -> [&PhaseTimer; 10] {
        [
            &self.collisions,
            &self.dynamics,
            &self.densities,
            &self.maxwell,
            &self.particles,
            &self.fields_sync,
            &self.diags,
            &self.window,
            &self.checkpoint,
            &self.balance,
        ]
    }

    /// Reduce each phase across ranks and print a min/avg/max table on
    /// the master.
    pub fn consolidate<C: Communicator>(&self, comm: &C) {
        let n_ranks = comm.size() as f64;
        let rank = comm.rank();
        for timer in self.all() {
            let local = timer.seconds();
            let (mut min, mut max, mut sum) = (local, local, local);
            if comm.size() > 1 {
                comm.all_reduce_into(&local, &mut min, SystemOperation::min());
                comm.all_reduce_into(&local, &mut max, SystemOperation::max());
                comm.all_reduce_into(&local, &mut sum, SystemOperation::sum());
            }
            if rank == 0 && max > 0.0 {
                println!(
                    "    {: <14} min {: >9.3}s  avg {: >9.3}s  max {: >9.3}s",
                    timer.name,
                    min,
                    sum / n_ranks,
                    max
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_accumulates_across_restarts() {
        let mut t = PhaseTimer::new("test");
        t.restart();
        std::thread::sleep(std::time::Duration::from_millis(5));
        t.update();
        let first = t.seconds();
        assert!(first > 0.0);
        t.restart();
        std::thread::sleep(std::time::Duration::from_millis(5));
        t.update();
        assert!(t.seconds() > first);
    }

    #[test]
    fn update_without_restart_is_a_no_op() {
        let mut t = PhaseTimer::new("test");
        t.update();
        assert_eq!(t.seconds(), 0.0);
    }
}
