//! Two-level domain decomposition.
//!
//! The patch grid is traversed by a space-filling curve; each rank owns a
//! contiguous interval of curve indices described by `patch_count` /
//! `offset`. A rank resolves the owner of any patch by binary search on the
//! offset prefix sum, so neighbor-rank lookup is O(log R).

use crate::hilbert::SpaceFillingCurve;
use crate::params::Params;

pub struct DomainDecomposition {
    pub curve: SpaceFillingCurve,
    pub n_patches_grid: [usize; 3],
    pub ndim: usize,
    pub patch_count: Vec<usize>,
    pub offset: Vec<usize>,
}

impl DomainDecomposition {
    pub fn new(params: &Params, n_ranks: usize) -> Self {
        let curve = SpaceFillingCurve::new(params.ndim_field, params.n_patches_grid);
        let total = curve.len();
        let base = total / n_ranks;
        let rem = total % n_ranks;
        let patch_count: Vec<usize> = (0..n_ranks)
            .map(|r| base + if r < rem { 1 } else { 0 })
            .collect();
        let mut deco = DomainDecomposition {
            curve,
            n_patches_grid: params.n_patches_grid,
            ndim: params.ndim_field,
            patch_count,
            offset: vec![0; n_ranks],
        };
        deco.rebuild_offsets();
        deco
    }

    pub fn total(&self) -> usize {
        self.curve.len()
    }

    pub fn n_ranks(&self) -> usize {
        self.patch_count.len()
    }

    pub fn rebuild_offsets(&mut self) {
        let mut running = 0;
        for (r, &count) in self.patch_count.iter().enumerate() {
            self.offset[r] = running;
            running += count;
        }
        debug_assert_eq!(running, self.curve.len());
    }

    /// Replace the distribution (after a load-balance or restart).
    pub fn set_distribution(&mut self, counts: &[usize]) {
        assert_eq!(counts.iter().sum::<usize>(), self.curve.len());
        self.patch_count = counts.to_vec();
        self.offset = vec![0; counts.len()];
        self.rebuild_offsets();
    }

    pub fn owned_range(&self, rank: usize) -> std::ops::Range<usize> {
        self.offset[rank]..self.offset[rank] + self.patch_count[rank]
    }

    /// Owner rank of a patch, by binary search on the offset prefix sum.
    pub fn rank_of(&self, patch: usize) -> i32 {
        debug_assert!(patch < self.total());
        match self.offset.binary_search(&patch) {
            Ok(r) => {
                // Exact hit may land on a rank with zero patches; walk
                // forward to the rank that actually starts here.
                let mut r = r;
                while self.patch_count[r] == 0 {
                    r += 1;
                }
                r as i32
            }
            Err(r) => (r - 1) as i32,
        }
    }

    /// Curve index of the face neighbor of a patch, wrapped on periodic
    /// axes, `None` past a non-periodic global boundary.
    pub fn neighbor(&self, patch: usize, axis: usize, side: usize, periodic: bool) -> Option<usize> {
        let mut c = self.curve.coords_of(patch);
        let extent = self.n_patches_grid[axis];
        if side == 0 {
            if c[axis] == 0 {
                if !periodic {
                    return None;
                }
                c[axis] = extent - 1;
            } else {
                c[axis] -= 1;
            }
        } else {
            if c[axis] + 1 == extent {
                if !periodic {
                    return None;
                }
                c[axis] = 0;
            } else {
                c[axis] += 1;
            }
        }
        Some(self.curve.index_of(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Configuration;
    use crate::params::Params;

    fn params_2d() -> Params {
        let deck = "control:\n\
             \x20 geometry: 2d3v\n\
             \x20 cell_length: [0.5, 0.5]\n\
             \x20 n_space_global: [64, 32]\n\
             \x20 n_space_per_patch: [8, 8]\n\
             \x20 timestep: 0.25\n\
             \x20 n_time: 1\n";
        Params::read(&Configuration::from_str(deck).unwrap()).unwrap()
    }

    #[test]
    fn even_split_covers_all_patches() {
        let deco = DomainDecomposition::new(&params_2d(), 3);
        assert_eq!(deco.total(), 32);
        assert_eq!(deco.patch_count.iter().sum::<usize>(), 32);
        let mut owned = 0;
        for r in 0..3 {
            owned += deco.owned_range(r).len();
        }
        assert_eq!(owned, 32);
    }

    #[test]
    fn rank_lookup_matches_linear_scan() {
        let mut deco = DomainDecomposition::new(&params_2d(), 5);
        deco.set_distribution(&[3, 0, 14, 9, 6]);
        for p in 0..deco.total() {
            let expected = (0..5)
                .find(|&r| deco.owned_range(r).contains(&p))
                .unwrap() as i32;
            assert_eq!(deco.rank_of(p), expected, "patch {}", p);
        }
    }

    #[test]
    fn neighbors_wrap_only_on_periodic_axes() {
        let deco = DomainDecomposition::new(&params_2d(), 2);
        let p = deco.curve.index_of([0, 3, 0]);
        assert_eq!(deco.neighbor(p, 0, 0, false), None);
        let wrapped = deco.neighbor(p, 0, 0, true).unwrap();
        assert_eq!(deco.curve.coords_of(wrapped), [7, 3, 0]);
        let right = deco.neighbor(p, 0, 1, false).unwrap();
        assert_eq!(deco.curve.coords_of(right), [1, 3, 0]);
    }
}
