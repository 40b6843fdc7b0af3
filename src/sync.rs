//! Inter-patch and inter-process synchronization.
//!
//! All exchanges are one message per rank pair per phase, built from a
//! deterministic plan both ends can derive from the decomposition alone,
//! so no tags or headers are needed. Sends are non-blocking; receives are
//! the suspension points; each phase completes before the next axis starts
//! so diagonal ghost cells settle correctly.

use mpi::topology::Communicator;
use mpi::traits::*;

use crate::decomposition::DomainDecomposition;
use crate::fields::{ExchangeMode, Side};
use crate::params::Params;
use crate::patch::Patch;

/// Post all sends, drain all receives, wait. One call per phase.
/// `sends` and `recv_ranks` may repeat a rank; per-pair ordering is
/// preserved on both ends.
pub fn exchange_buffers<T, C>(
    comm: &C,
    sends: &[(i32, Vec<T>)],
    recv_ranks: &[i32],
) -> Vec<Vec<T>>
where
    T: Equivalence,
    C: Communicator,
{
    let mut received: Vec<Vec<T>> = Vec::with_capacity(recv_ranks.len());
    mpi::request::scope(|scope| {
        let mut reqs = Vec::with_capacity(sends.len());
        for (rank, buf) in sends {
            reqs.push(comm.process_at_rank(*rank).immediate_send(scope, &buf[..]));
        }
        for &rank in recv_ranks {
            let (data, _status) = comm.process_at_rank(rank).receive_vec::<T>();
            received.push(data);
        }
        for req in reqs {
            req.wait();
        }
    });
    received
}

/// One (patch face -> destination) entry of a ghost-exchange plan.
struct FaceRoute {
    /// Index into the local patch vector.
    local: usize,
    side: Side,
    /// Destination patch (global index) and its owner.
    dest_patch: usize,
    dest_rank: i32,
}

/// Per-axis ghost-exchange plan. Rebuilt whenever the decomposition or the
/// local patch set changes; patches of one rank are always in curve order,
/// which both ends rely on for message layout.
pub struct GhostPlan {
    /// ndim entries; each is the list of face routes for that axis.
    axes: Vec<Vec<FaceRoute>>,
}

impl GhostPlan {
    pub fn build(patches: &[Patch], deco: &DomainDecomposition, params: &Params) -> GhostPlan {
        let mut axes = Vec::with_capacity(params.ndim_field);
        for axis in 0..params.ndim_field {
            let mut routes = Vec::new();
            for (local, patch) in patches.iter().enumerate() {
                for s in 0..2 {
                    if let Some(dest_patch) = patch.neighbors[axis][s] {
                        routes.push(FaceRoute {
                            local,
                            side: Side::from_index(s),
                            dest_patch,
                            dest_rank: deco.rank_of(dest_patch),
                        });
                    }
                }
            }
            axes.push(routes);
        }
        GhostPlan { axes }
    }

    /// Exchange ghost slabs for every patch along every axis, axis by
    /// axis. Additive for sources, assignment for fields.
    pub fn exchange<C: Communicator>(
        &self,
        comm: &C,
        patches: &mut [Patch],
        deco: &DomainDecomposition,
        mode: ExchangeMode,
    ) {
        let my_rank = comm.rank();
        for axis in 0..self.axes.len() {
            self.exchange_axis(comm, patches, deco, axis, mode, my_rank);
        }
    }

    fn exchange_axis<C: Communicator>(
        &self,
        comm: &C,
        patches: &mut [Patch],
        deco: &DomainDecomposition,
        axis: usize,
        mode: ExchangeMode,
        my_rank: i32,
    ) {
        let routes = &self.axes[axis];

        // Local moves and the per-rank outgoing batches. A patch that is
        // its own neighbor (single patch across a periodic axis) wraps
        // in place.
        let mut remote: Vec<(i32, Vec<crate::fields::Cell>)> = Vec::new();
        let mut local_moves: Vec<(usize, Side, usize)> = Vec::new();
        let mut send_ranks: Vec<i32> = Vec::new();
        for route in routes {
            if route.dest_rank == my_rank {
                let dest_local = route.dest_patch - deco.owned_range(my_rank as usize).start;
                local_moves.push((route.local, route.side, dest_local));
            } else if !send_ranks.contains(&route.dest_rank) {
                send_ranks.push(route.dest_rank);
            }
        }
        send_ranks.sort_unstable();
        for &rank in &send_ranks {
            let mut batch = Vec::new();
            for route in routes {
                if route.dest_rank == rank {
                    batch.extend(patches[route.local].fields.slab(axis, route.side));
                }
            }
            remote.push((rank, batch));
        }

        // Apply local slabs (snapshot first: additive exchanges must all
        // read pre-exchange values).
        let slabs: Vec<Vec<crate::fields::Cell>> = local_moves
            .iter()
            .map(|&(src, side, _)| patches[src].fields.slab(axis, side))
            .collect();
        for (&(_, side, dest), slab) in local_moves.iter().zip(&slabs) {
            let receive_side = match side {
                Side::Min => Side::Max,
                Side::Max => Side::Min,
            };
            patches[dest].fields.apply_slab(axis, receive_side, slab, mode);
        }

        // Remote: one message per neighbor rank, in rank order; the
        // incoming batch from rank r is laid out in r's route order, which
        // we reconstruct by sorting our expectations by (sender patch,
        // sender side).
        let recv_ranks = send_ranks.clone();
        let received = exchange_buffers(comm, &remote, &recv_ranks);

        for (&rank, batch) in recv_ranks.iter().zip(&received) {
            // Which of our faces expect data from `rank`, ordered as the
            // sender enumerated them: by (sender patch index, sender side).
            let mut expectations: Vec<(usize, usize, usize, Side)> = Vec::new();
            for route in routes {
                if route.dest_rank == rank {
                    // The sender's matching face is the opposite side of
                    // our own.
                    let sender_side = 1 - route.side.index();
                    expectations.push((route.dest_patch, sender_side, route.local, route.side));
                }
            }
            expectations.sort_unstable();

            let mut offset = 0;
            for (_, _, local, my_side) in expectations {
                let len = slab_len(&patches[local], axis);
                let slab = &batch[offset..offset + len];
                offset += len;
                patches[local].fields.apply_slab(axis, my_side, slab, mode);
            }
            assert_eq!(offset, batch.len(), "ghost batch length mismatch from rank {}", rank);
        }
    }
}

/// One-layer, assign-only ghost refresh for per-patch scalar arrays (the
/// Poisson solve's work vectors). Follows the same routes and message
/// layout as the field exchange.
pub fn exchange_scalar_ghosts<C: Communicator>(
    plan: &GhostPlan,
    comm: &C,
    deco: &DomainDecomposition,
    arrays: &mut [ndarray::ArrayD<f64>],
    ghost: usize,
) {
    let my_rank = comm.rank();
    let g = ghost as isize;
    let shape: Vec<usize> = if arrays.is_empty() {
        return;
    } else {
        arrays[0].shape().to_vec()
    };

    let edge_layer = |arr: &ndarray::ArrayD<f64>, axis: usize, side: Side| -> Vec<f64> {
        let layer = match side {
            Side::Min => ndarray::Slice::from(g..g + 1),
            Side::Max => ndarray::Slice::from(-g - 1..-g),
        };
        arr.slice_axis(ndarray::Axis(axis), layer).iter().cloned().collect()
    };
    let assign_ghost = |arr: &mut ndarray::ArrayD<f64>, axis: usize, side: Side, data: &[f64]| {
        let layer = match side {
            Side::Min => ndarray::Slice::from(g - 1..g),
            Side::Max => ndarray::Slice::from(-g..-g + 1),
        };
        for (dst, src) in arr.slice_axis_mut(ndarray::Axis(axis), layer).iter_mut().zip(data) {
            *dst = *src;
        }
    };
    let layer_len = |axis: usize| -> usize {
        shape.iter().enumerate().map(|(d, &s)| if d == axis { 1 } else { s }).product()
    };

    for axis in 0..plan.axes.len() {
        let routes = &plan.axes[axis];

        let mut send_ranks: Vec<i32> = Vec::new();
        let mut local_moves: Vec<(usize, Side, usize)> = Vec::new();
        for route in routes {
            if route.dest_rank == my_rank {
                let dest_local = route.dest_patch - deco.owned_range(my_rank as usize).start;
                local_moves.push((route.local, route.side, dest_local));
            } else if !send_ranks.contains(&route.dest_rank) {
                send_ranks.push(route.dest_rank);
            }
        }
        send_ranks.sort_unstable();

        let mut remote: Vec<(i32, Vec<f64>)> = Vec::new();
        for &rank in &send_ranks {
            let mut batch = Vec::new();
            for route in routes {
                if route.dest_rank == rank {
                    batch.extend(edge_layer(&arrays[route.local], axis, route.side));
                }
            }
            remote.push((rank, batch));
        }

        let slabs: Vec<Vec<f64>> = local_moves
            .iter()
            .map(|&(src, side, _)| edge_layer(&arrays[src], axis, side))
            .collect();
        for (&(_, side, dest), slab) in local_moves.iter().zip(&slabs) {
            let receive_side = match side {
                Side::Min => Side::Max,
                Side::Max => Side::Min,
            };
            assign_ghost(&mut arrays[dest], axis, receive_side, slab);
        }

        let received = exchange_buffers(comm, &remote, &send_ranks);
        for (&rank, batch) in send_ranks.iter().zip(&received) {
            let mut expectations: Vec<(usize, usize, usize, Side)> = Vec::new();
            for route in routes {
                if route.dest_rank == rank {
                    let sender_side = 1 - route.side.index();
                    expectations.push((route.dest_patch, sender_side, route.local, route.side));
                }
            }
            expectations.sort_unstable();
            let len = layer_len(axis);
            let mut offset = 0;
            for (_, _, local, my_side) in expectations {
                assign_ghost(&mut arrays[local], axis, my_side, &batch[offset..offset + len]);
                offset += len;
            }
        }
    }
}

fn slab_len(patch: &Patch, axis: usize) -> usize {
    let shape = patch.fields.data.shape();
    let mut n = 1;
    for (d, &s) in shape.iter().enumerate() {
        n *= if d == axis { 2 * patch.fields.ghost } else { s };
    }
    n
}
