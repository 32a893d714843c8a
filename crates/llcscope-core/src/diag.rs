//! Debug diagnostics backed by the address oracles.
//!
//! Everything here needs the gpa_hpa module (or at least a readable
//! pagemap) and only ever affects what gets printed: a missing oracle
//! degrades to "no diagnostics", never to a failed build.

use rand::Rng;

use crate::arena::CandidateView;
use crate::build::L2ColorSets;
use crate::cache::CacheGeometry;
use crate::evset::EvSet;
use crate::oracle::HpaOracle;
use crate::slice::slice_skx_20;

/// Result of the post-build L2 coloring self-check.
#[derive(Debug, Clone)]
pub struct ColorCheck {
    /// Observed host-side L2 color per built set; `None` when the oracle
    /// could not resolve the set's first line.
    pub colors: Vec<Option<u32>>,
    pub distinct: bool,
}

/// Verify that the built L2 sets at offset 0 really landed on pairwise
/// distinct colors, as seen through host-physical addresses.
pub fn l2_color_check(
    l2sets: &L2ColorSets,
    oracle: &mut HpaOracle,
    l2: &CacheGeometry,
) -> ColorCheck {
    let mut colors: Vec<Option<u32>> = Vec::with_capacity(l2sets.n_colors as usize);
    for color in 0..l2sets.n_colors {
        let set = l2sets.at(0, color);
        let first = set.line_ptrs().first().copied();
        let observed = first
            .and_then(|p| oracle.hpa_of(p))
            .map(|hpa| l2.color_of(hpa));
        colors.push(observed);
    }

    let mut distinct = true;
    for i in 0..colors.len() {
        for j in 0..i {
            if let (Some(a), Some(b)) = (colors[i], colors[j]) {
                if a == b {
                    log::warn!("L2 sets {j} and {i} share host color {a:#x}");
                    distinct = false;
                }
            }
        }
    }
    if distinct {
        log::debug!("all built L2 colors are unique: {colors:?}");
    }
    ColorCheck { colors, distinct }
}

/// How well an LLC set's lines agree with its target on host set-index bits
/// and slice.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentStats {
    pub total: u32,
    pub sib_matches: u32,
    pub slice_matches: u32,
    pub target_sib: u32,
    pub target_slice: u32,
}

/// Resolve every line of a set through the oracle and compare against the
/// target's set index and 20-slice hash. `None` when the target itself
/// cannot be resolved.
pub fn llc_set_alignment(
    set: &EvSet,
    oracle: &mut HpaOracle,
    l3: &CacheGeometry,
) -> Option<AlignmentStats> {
    let target_hpa = oracle.hpa_of(set.target_ptr())?;
    let target_sib = l3.set_index_of(target_hpa);
    let target_slice = slice_skx_20(target_hpa);

    let mut stats = AlignmentStats {
        total: 0,
        sib_matches: 0,
        slice_matches: 0,
        target_sib,
        target_slice,
    };

    for line in set.line_ptrs() {
        let Some(hpa) = oracle.hpa_of(line) else {
            continue;
        };
        stats.total += 1;
        if l3.set_index_of(hpa) == target_sib {
            stats.sib_matches += 1;
        }
        if slice_skx_20(hpa) == target_slice {
            stats.slice_matches += 1;
        }
    }
    Some(stats)
}

/// Fraction of a filtered candidate pool whose host L2 set index matches
/// the filter target's; the "healthy candidates" figure.
pub fn candidate_accuracy(
    view: &CandidateView,
    filter: &EvSet,
    oracle: &mut HpaOracle,
    l2: &CacheGeometry,
) -> Option<(u64, u64)> {
    let target_sib = l2.set_index_of(oracle.hpa_of(filter.target_ptr())?);
    let mut healthy = 0u64;
    let mut total = 0u64;
    for line in view.resolve() {
        let Some(hpa) = oracle.hpa_of(line) else {
            continue;
        };
        total += 1;
        if l2.set_index_of(hpa) == target_sib {
            healthy += 1;
        }
    }
    Some((healthy, total))
}

/// Pick a random shifted variant of a random color for spot checks, so
/// repeated debug runs do not always inspect offset 0.
pub fn sample_shifted_set<'a>(l2sets: &'a L2ColorSets, rng: &mut impl Rng) -> (&'a EvSet, u32, u32) {
    let offset_idx = rng.random_range(0..l2sets.n_offsets());
    let color = rng.random_range(0..l2sets.n_colors);
    (l2sets.at(offset_idx, color), offset_idx, color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::cache::CacheLevel;
    use crate::config::BuildConfig;
    use crate::context::test_support::skx_context;

    fn tiny_l2_grid() -> L2ColorSets {
        let ctx = skx_context();
        let arena = Arena::new(40, 1).unwrap();
        let view = CandidateView::full(&arena, 0);
        let ptrs = view.resolve();
        let cfg = BuildConfig::for_l2(&ctx.lats, None);
        let built: Vec<EvSet> = (0..2)
            .map(|i| {
                let lo = i * 17;
                EvSet::from_ptrs(
                    &view,
                    ptrs[lo + 16],
                    &ptrs[lo..lo + 16],
                    CacheLevel::L2,
                    16,
                    cfg.clone(),
                )
            })
            .collect();
        let grid: Vec<Vec<EvSet>> = (0..64)
            .map(|off| built.iter().map(|s| s.shift(off * 64)).collect())
            .collect();
        L2ColorSets { grid, n_colors: 2 }
    }

    #[test]
    fn sample_shifted_set_stays_in_bounds() {
        let grid = tiny_l2_grid();
        let mut rng = rand::rng();
        for _ in 0..32 {
            let (set, offset_idx, color) = sample_shifted_set(&grid, &mut rng);
            assert!(offset_idx < 64);
            assert!(color < 2);
            assert_eq!(set.offset(), offset_idx * 64);
        }
    }
}
