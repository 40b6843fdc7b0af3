//! Dynamic load balancing by patch migration along the curve.
//!
//! Per-patch cost is alpha * N_particles + beta * N_cells. Costs are
//! gathered globally, the prefix sum is split into contiguous ranges of
//! approximately equal total (every rank computes the same split from the
//! same data), and patches changing owner ship their full state to the
//! new holder. The mirror-domain tiling must be rebuilt afterwards.

use mpi::datatype::PartitionMut;
use mpi::topology::Communicator;
use mpi::traits::*;

use crate::decomposition::DomainDecomposition;
use crate::params::{BalanceParams, Params};
use crate::patch::{Patch, PatchPayload};
use crate::sync::exchange_buffers;
use crate::vector_patch::VectorPatch;

/// Greedy equal partition of the cost vector into contiguous ranges.
/// Every rank gets at least one patch while patches remain.
pub fn partition_costs(costs: &[f64], n_ranks: usize) -> Vec<usize> {
    let n = costs.len();
    let total: f64 = costs.iter().sum();
    let mut counts = vec![0usize; n_ranks];
    let mut rank = 0usize;
    let mut acc = 0.0;
    for (i, &c) in costs.iter().enumerate() {
        let remaining = n - i;
        let ranks_after = n_ranks - rank - 1;
        // Close the range once it met its share of the prefix sum, or
        // when exactly one patch per waiting rank remains.
        let met_share = acc + 0.5 * c >= total * (rank + 1) as f64 / n_ranks as f64;
        if rank + 1 < n_ranks && counts[rank] > 0 && (met_share || remaining == ranks_after) {
            rank += 1;
        }
        counts[rank] += 1;
        acc += c;
    }
    counts
}

/// Recompute the distribution and migrate patches. Returns true when any
/// patch changed owner (the caller must then rebuild the mirror domain).
pub fn load_balance<C: Communicator>(
    comm: &C,
    deco: &mut DomainDecomposition,
    vp: &mut VectorPatch,
    params: &Params,
    bp: &BalanceParams,
    n_shifted: usize,
) -> bool {
    let my_rank = comm.rank();
    let n_ranks = deco.n_ranks();
    let total = deco.total();

    // Per-patch cost, gathered so every rank sees the full vector.
    let local: Vec<f64> = vp
        .patches
        .iter()
        .map(|p| {
            bp.cost_per_particle * p.particle_count() as f64
                + bp.cost_per_cell * params.n_per_patch[..params.ndim_field].iter().product::<usize>() as f64
        })
        .collect();
    let mut costs = vec![0.0f64; total];
    if n_ranks == 1 {
        costs.copy_from_slice(&local);
    } else {
        let counts: Vec<mpi::Count> = deco.patch_count.iter().map(|&c| c as mpi::Count).collect();
        let displs: Vec<mpi::Count> = deco.offset.iter().map(|&o| o as mpi::Count).collect();
        let mut partition = PartitionMut::new(&mut costs[..], &counts[..], &displs[..]);
        comm.all_gather_varcount_into(&local[..], &mut partition);
    }

    let new_counts = partition_costs(&costs, n_ranks);
    if new_counts == deco.patch_count {
        return false;
    }

    let old_rank_of = |p: usize| -> i32 { deco.rank_of(p) };
    let mut new_offset = vec![0usize; n_ranks];
    for r in 1..n_ranks {
        new_offset[r] = new_offset[r - 1] + new_counts[r - 1];
    }
    let new_rank_of = |p: usize| -> i32 {
        let mut r = match new_offset.binary_search(&p) {
            Ok(k) => k,
            Err(k) => k - 1,
        };
        while new_counts[r] == 0 {
            r += 1;
        }
        r as i32
    };

    let my_new_range = new_offset[my_rank as usize]..new_offset[my_rank as usize] + new_counts[my_rank as usize];

    // Outgoing payloads, batched per destination in curve order.
    let mut sends: Vec<(i32, Vec<(u64, PatchPayload)>)> = Vec::new();
    let mut kept: Vec<Patch> = Vec::new();
    for patch in vp.patches.drain(..) {
        let dest = new_rank_of(patch.index);
        if dest == my_rank {
            kept.push(patch);
        } else {
            let payload = patch.payload();
            match sends.iter_mut().find(|(r, _)| *r == dest) {
                Some((_, batch)) => batch.push((patch.index as u64, payload)),
                None => sends.push((dest, vec![(patch.index as u64, payload)])),
            }
        }
    }
    sends.sort_by_key(|(r, _)| *r);

    // Ranks we will hear from: previous owners of our newly owned range.
    let mut recv_ranks: Vec<i32> = my_new_range
        .clone()
        .map(old_rank_of)
        .filter(|&r| r != my_rank)
        .collect();
    recv_ranks.sort_unstable();
    recv_ranks.dedup();

    let byte_sends: Vec<(i32, Vec<u8>)> = sends
        .iter()
        .map(|(r, batch)| (*r, bincode::serialize(batch).expect("migration payload serialization")))
        .collect();
    let received = exchange_buffers(comm, &byte_sends, &recv_ranks);

    // The distribution itself: identical on every rank by construction.
    deco.set_distribution(&new_counts);

    // Rebuild the local patch vector in curve order.
    let mut incoming: Vec<(usize, PatchPayload)> = Vec::new();
    for bytes in received {
        let batch: Vec<(u64, PatchPayload)> =
            bincode::deserialize(&bytes).expect("migration payload deserialization");
        for (index, payload) in batch {
            incoming.push((index as usize, payload));
        }
    }

    let mut patches: Vec<Patch> = Vec::with_capacity(my_new_range.len());
    let mut kept_iter = kept.into_iter().peekable();
    for index in my_new_range.clone() {
        if kept_iter.peek().map(|p| p.index) == Some(index) {
            patches.push(kept_iter.next().unwrap());
        } else {
            let (_, payload) = incoming
                .iter()
                .position(|&(i, _)| i == index)
                .map(|k| incoming.swap_remove(k))
                .unwrap_or_else(|| panic!("no payload arrived for patch {}", index));
            let mut patch = Patch::create(index, deco, params, n_shifted);
            patch.adopt(payload);
            patches.push(patch);
        }
    }
    assert!(kept_iter.next().is_none(), "kept a patch outside the new range");
    assert!(incoming.is_empty(), "unclaimed migration payloads");
    vp.patches = patches;
    vp.rebuild_plan(deco, params, my_rank);

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_costs_split_evenly() {
        let costs = vec![1.0; 16];
        let counts = partition_costs(&costs, 4);
        assert_eq!(counts.iter().sum::<usize>(), 16);
        assert_eq!(counts, vec![4, 4, 4, 4]);
    }

    #[test]
    fn skewed_costs_shift_the_boundaries() {
        // One hot patch at the front: the first rank should own little
        // else.
        let mut costs = vec![1.0; 16];
        costs[0] = 100.0;
        let counts = partition_costs(&costs, 4);
        assert_eq!(counts.iter().sum::<usize>(), 16);
        assert_eq!(counts[0], 1);
        assert!(counts.iter().all(|&c| c >= 1));
    }

    #[test]
    fn every_rank_keeps_at_least_one_patch() {
        let mut costs = vec![0.0; 8];
        costs[7] = 1.0;
        let counts = partition_costs(&costs, 8);
        assert_eq!(counts, vec![1; 8]);
    }

    #[test]
    fn partition_conserves_patch_count() {
        let costs: Vec<f64> = (0..37).map(|i| ((i * 7919) % 23) as f64 + 0.5).collect();
        for ranks in [1, 2, 3, 5, 8] {
            let counts = partition_costs(&costs, ranks);
            assert_eq!(counts.iter().sum::<usize>(), 37, "ranks = {}", ranks);
            assert!(counts.iter().all(|&c| c >= 1));
        }
    }
}
