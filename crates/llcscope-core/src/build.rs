//! Eviction-set construction: the binary-search pruning algorithm, the L2
//! color builder that seeds it, and the candidate admission filter.
//!
//! The pruning loop is the algorithm from Zhao et al., "Last-Level Cache
//! Side-Channel Attacks Are Feasible in the Modern Public Cloud", driven
//! here as an explicit state machine. Candidate order is the only mutable
//! state: congruent lines accumulate at the front of the working pool,
//! untested lines migrate in from the back.

use std::time::Instant;

use crate::arena::{Arena, CandidateView, arena_pages};
use crate::cache::{CacheLevel, LINE_SIZE, OFFSETS_PER_PAGE};
use crate::config::{BuildConfig, FilterMode};
use crate::context::CoreContext;
use crate::error::ResourceError;
use crate::evset::{EvSet, TestEnv, prune_lines, test_eviction};
use crate::helper::HelperThread;
use crate::latency::LatencyProfile;
use crate::timing::{access_lines, access_lines_backward, lfence, time_access, time_us};

/// States of the pruning loop. `Migrate` doubles as the between-iteration
/// bookkeeping step every other state funnels through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    SearchUpper,
    SearchLower,
    Verify,
    Prune,
    Reset,
    Migrate,
    Done,
}

/// Run the pruning loop for `target` over `cands`.
///
/// On return the first `evsz` entries of `cands` are the accumulated set;
/// `evsz == 0` means the pool never produced a congruent line. The pool is
/// reordered in place — callers that need the original order keep their own
/// copy.
pub(crate) fn build_zhao(
    target: *const u8,
    cands: &mut [*const u8],
    ways: u64,
    unknown_sib: u32,
    ev_cap: usize,
    cfg: &BuildConfig,
    lats: &LatencyProfile,
    env: &TestEnv<'_>,
) -> usize {
    let n_cands = cands.len();
    if n_cands <= 1 {
        return 0;
    }

    let num_carried = ways.saturating_sub(cfg.slack as u64);
    let expected = (ways + cfg.extra_cong as u64) as usize;
    let migrate_step = 3 * (1usize << unknown_sib.min(20)) / 2;

    let mut lower: i64 = 0;
    let mut upper: i64 = n_cands as i64;
    let mut evsz: usize = 0;
    let mut backtracks: u32 = 0;
    let mut reset = false;
    let mut migrated: usize = n_cands - 1;
    let mut iterations: u64 = 0;

    let mut offset: usize = 0;
    let mut cut: i64 = 0;
    let mut state = BuildState::SearchUpper;

    loop {
        state = match state {
            BuildState::SearchUpper => {
                if evsz >= ev_cap || backtracks >= cfg.max_backtrack {
                    BuildState::Done
                } else {
                    iterations += 1;
                    offset = if cfg.slack > 0 && (evsz as u64) > num_carried {
                        evsz - num_carried as usize
                    } else {
                        0
                    };
                    // While the set is still short of the associativity and
                    // the last round found a line, bias the cut upward so
                    // the next slice keeps more candidates.
                    cut = if evsz > 0 && !reset && (evsz as u64) < ways {
                        let rem = (ways - evsz as u64) as i64;
                        let mut c = (upper * rem + lower) / (rem + 1);
                        if c == upper {
                            c -= 1;
                        }
                        c
                    } else {
                        (upper + lower) / 2
                    };
                    reset = false;
                    BuildState::SearchLower
                }
            }

            BuildState::SearchLower => {
                let mut found = false;
                while upper - lower > 1 {
                    debug_assert!(cut as usize >= offset && cut as usize <= n_cands);
                    let evicts =
                        test_eviction(target, &cands[offset..cut as usize], cfg, lats, env);
                    if evicts {
                        upper = cut;
                        found = true;
                    } else {
                        lower = cut;
                    }
                    cut = (upper + lower) / 2;
                }

                if !found
                    && !test_eviction(target, &cands[offset..upper as usize], cfg, lats, env)
                {
                    BuildState::Reset
                } else {
                    // The single line at upper-1 is what the bracket closed
                    // on; it joins the accumulated set.
                    cands.swap(evsz, (upper - 1) as usize);
                    evsz += 1;
                    if evsz >= expected {
                        BuildState::Verify
                    } else {
                        BuildState::Migrate
                    }
                }
            }

            BuildState::Verify => {
                if test_eviction(target, &cands[..evsz], cfg, lats, env) {
                    BuildState::Prune
                } else {
                    BuildState::Migrate
                }
            }

            BuildState::Prune => {
                evsz = prune_lines(target, cands, evsz, cfg, lats, env);
                if evsz >= expected {
                    BuildState::Done
                } else {
                    backtracks += 1;
                    BuildState::Migrate
                }
            }

            BuildState::Reset => {
                backtracks += 1;
                reset = true;
                BuildState::Migrate
            }

            BuildState::Migrate => {
                lower = evsz as i64;
                if reset || (cfg.slack > 0 && evsz as u64 > num_carried) {
                    if upper as usize >= migrated {
                        migrated = n_cands - 1;
                    }
                    let mut moved = 0;
                    while moved < migrate_step && (upper as usize) < migrated {
                        cands.swap(upper as usize, migrated);
                        upper += 1;
                        migrated -= 1;
                        moved += 1;
                    }
                }
                if upper <= lower {
                    upper = lower + 1;
                    if upper as usize > n_cands {
                        log::warn!("pruning ran the pool dry (upper past {n_cands})");
                        BuildState::Done
                    } else {
                        BuildState::SearchUpper
                    }
                } else {
                    BuildState::SearchUpper
                }
            }

            BuildState::Done => break,
        };
    }

    log::debug!("pruning finished: size {evsz}, {iterations} iterations, {backtracks} backtracks");
    evsz
}

/// One verified L2 eviction set per L2 color, at every cache-line offset of
/// a page. `grid[offset][color]`.
pub struct L2ColorSets {
    pub grid: Vec<Vec<EvSet>>,
    pub n_colors: u32,
}

impl L2ColorSets {
    pub fn at(&self, offset_idx: u32, color: u32) -> &EvSet {
        &self.grid[offset_idx as usize][color as usize]
    }

    pub fn n_offsets(&self) -> u32 {
        self.grid.len() as u32
    }
}

/// Build `n_colors` distinct L2 eviction sets and shift them across the
/// page.
///
/// Color distinctness is enforced empirically: a candidate target that the
/// union of previously built sets evicts shares a color with one of them
/// and is skipped. The whole procedure restarts with a fresh arena up to
/// `max_whole_ret` times; `None` means even that was not enough.
pub fn build_l2_color_sets(
    ctx: &CoreContext,
    n_colors: u32,
) -> Result<Option<L2ColorSets>, ResourceError> {
    let geom = &ctx.hier.l2;
    let n_colors = n_colors.clamp(1, ctx.hier.l2_colors());
    let cfg = BuildConfig::for_l2(&ctx.lats, ctx.params.cand_scale);
    let env = TestEnv::NONE;

    let pages = arena_pages(geom.uncertainty(), geom.ways, cfg.cand_scale) + 1;

    for whole_try in 0..=cfg.max_whole_ret {
        if whole_try > 0 {
            log::info!("L2 color build: whole-procedure retry {whole_try}/{}", cfg.max_whole_ret);
        }
        let arena = Arena::new(pages, ctx.memset_threads())?;
        let view = CandidateView::full(&arena, 0);
        let mut pool = view.resolve();
        let mut target = pool.pop().expect("arena sized for at least one line");

        let mut built: Vec<EvSet> = Vec::with_capacity(n_colors as usize);
        let mut union_lines: Vec<*const u8> = Vec::new();

        'colors: for color in 0..n_colors {
            if color > 0 {
                match pick_unconflicted_target(&mut pool, &union_lines, &cfg, &ctx.lats, &env) {
                    Some(t) => target = t,
                    None => {
                        log::warn!("no conflict-free target left for color {color}");
                        break 'colors;
                    }
                }
            }

            match build_single_l2(ctx, &mut pool, target, &union_lines, &cfg, &env) {
                Some(lines) => {
                    // Fresh verification before the set is trusted as a
                    // filter for everything downstream.
                    let verified = (0..3)
                        .any(|_| test_eviction(target, &lines, &cfg, &ctx.lats, &env));
                    if !verified {
                        log::warn!("L2 set for color {color} failed fresh verification");
                        break 'colors;
                    }

                    for &l in &lines {
                        if let Some(pos) = pool.iter().position(|&p| p == l) {
                            let last = pool.len() - 1;
                            pool.swap(pos, last);
                            pool.pop();
                        }
                    }
                    union_lines.extend_from_slice(&lines);

                    built.push(EvSet::from_ptrs(
                        &view,
                        target,
                        &lines,
                        CacheLevel::L2,
                        geom.ways,
                        cfg.clone(),
                    ));
                }
                None => break 'colors,
            }

            if (pool.len() as u64) < geom.ways as u64 * cfg.cand_scale as u64 {
                log::warn!("candidate pool running low; remaining colors may fail");
            }
        }

        if built.len() == n_colors as usize {
            let mut grid: Vec<Vec<EvSet>> = Vec::with_capacity(OFFSETS_PER_PAGE as usize);
            grid.push(built);
            for off in 1..OFFSETS_PER_PAGE {
                let shifted = grid[0]
                    .iter()
                    .map(|s| s.shift(off * LINE_SIZE as u32))
                    .collect();
                grid.push(shifted);
            }
            log::info!(
                "built {} L2 colors ({} total sets after shifting)",
                n_colors,
                n_colors * OFFSETS_PER_PAGE
            );
            return Ok(Some(L2ColorSets { grid, n_colors }));
        }

        log::warn!(
            "built only {}/{} L2 colors, retrying from scratch",
            built.len(),
            n_colors
        );
    }

    Ok(None)
}

/// First pool entry that the union of already-built sets does NOT evict.
/// Removes it from the pool.
fn pick_unconflicted_target(
    pool: &mut Vec<*const u8>,
    union_lines: &[*const u8],
    cfg: &BuildConfig,
    lats: &LatencyProfile,
    env: &TestEnv<'_>,
) -> Option<*const u8> {
    for j in 0..pool.len() {
        let cand = pool[j];
        let conflicted = !union_lines.is_empty()
            && test_eviction(cand, union_lines, cfg, lats, env);
        if !conflicted {
            let last = pool.len() - 1;
            pool.swap(j, last);
            pool.pop();
            return Some(cand);
        }
    }
    None
}

/// One L2 set with target retries. Returns the line addresses on success.
fn build_single_l2(
    ctx: &CoreContext,
    pool: &mut Vec<*const u8>,
    mut target: *const u8,
    union_lines: &[*const u8],
    cfg: &BuildConfig,
    env: &TestEnv<'_>,
) -> Option<Vec<*const u8>> {
    let geom = &ctx.hier.l2;
    let ev_cap = (cfg.cap_scaling * geom.ways) as usize;

    for attempt in 0..cfg.n_retries {
        let evsz = build_zhao(
            target,
            pool,
            geom.ways as u64,
            geom.unknown_sib,
            ev_cap,
            cfg,
            &ctx.lats,
            env,
        );

        let sized_ok = evsz == geom.ways as usize;
        if sized_ok && test_eviction(target, &pool[..evsz], cfg, &ctx.lats, env) {
            return Some(pool[..evsz].to_vec());
        }

        log::debug!(
            "L2 build attempt {}/{} rejected (size {evsz}, want {})",
            attempt + 1,
            cfg.n_retries,
            geom.ways
        );

        // Fresh target for the retry, avoiding lines of earlier sets.
        target = pick_unconflicted_target(pool, union_lines, cfg, &ctx.lats, env)?;
    }
    None
}

/// Admit candidates that the filter set evicts; everything else is a
/// different L2 color and can never be LLC-congruent with the filter's
/// targets. Reorders the view in place and returns the admitted count.
pub fn filter_candidates(
    view: &mut CandidateView,
    filter: &EvSet,
    lats: &LatencyProfile,
    mode: FilterMode,
) -> usize {
    let filter_lines = filter.line_ptrs();
    let cfg = &filter.config;
    let mut addrs = view.resolve();
    let started = time_us();

    let kept = match mode {
        FilterMode::Batch => filter_batch(&mut addrs, &filter_lines, cfg, lats),
        FilterMode::Sequential => filter_sequential(&mut addrs, &filter_lines, cfg, lats),
    };

    addrs.truncate(kept);
    view.adopt(&addrs);
    log::debug!(
        "filtered candidate pool to {kept} lines in {:.3} ms",
        (time_us() - started) as f64 / 1e3
    );
    kept
}

/// Batch admission: time `ways − 1` candidates around each filter-set
/// traversal, so one traversal serves the whole group.
fn filter_batch(
    addrs: &mut [*const u8],
    filter_lines: &[*const u8],
    cfg: &BuildConfig,
    _lats: &LatencyProfile,
) -> usize {
    let mut batch = filter_lines.len();
    if batch > 2 {
        batch -= 1;
    }
    let batch = batch.max(1);

    let total = addrs.len();
    let mut otcs = vec![0u32; batch];
    let mut kept = 0usize;

    let mut s = 0;
    while s < total {
        let cur = batch.min(total - s);
        otcs[..cur].fill(0);

        for _ in 0..cfg.trials {
            access_lines(&addrs[s..s + cur]);
            lfence();
            for _ in 0..cfg.ev_repeat.max(1) {
                access_lines_backward(filter_lines);
            }
            lfence();
            for i in 0..cur {
                // SAFETY: pool lines come from a live arena.
                let lat = unsafe { time_access(addrs[s + i]) };
                if lat > cfg.lat_thresh {
                    otcs[i] += 1;
                }
            }
        }

        for i in 0..cur {
            if otcs[i] > cfg.upp_bnd {
                addrs.swap(kept, s + i);
                kept += 1;
            }
        }
        s += batch;
    }
    kept
}

fn filter_sequential(
    addrs: &mut [*const u8],
    filter_lines: &[*const u8],
    cfg: &BuildConfig,
    lats: &LatencyProfile,
) -> usize {
    let mut kept = 0usize;
    for i in 0..addrs.len() {
        if test_eviction(addrs[i], filter_lines, cfg, lats, &TestEnv::NONE) {
            addrs.swap(kept, i);
            kept += 1;
        }
    }
    kept
}

/// Build-and-verify for one LLC set, with fresh-target retries under a
/// wall-clock budget. On success the surviving lines sit at the front of
/// `pool` and their count is returned.
fn build_verified_llc(
    target: &mut *const u8,
    pool: &mut Vec<*const u8>,
    ctx: &CoreContext,
    cfg: &BuildConfig,
    env: &TestEnv<'_>,
) -> Option<usize> {
    let geom = &ctx.hier.l3;
    let ev_cap = (cfg.cap_scaling * geom.ways) as usize;
    let deadline = Instant::now();

    for attempt in 0..cfg.verify_retry {
        let evsz = build_zhao(
            *target,
            pool,
            geom.ways as u64,
            geom.unknown_sib,
            ev_cap,
            cfg,
            &ctx.lats,
            env,
        );

        if evsz > 0 && test_eviction(*target, &pool[..evsz], cfg, &ctx.lats, env) {
            let pruned = prune_lines(*target, pool, evsz, cfg, &ctx.lats, env);
            let lo = geom.ways as usize;
            let hi = lo + cfg.slack as usize;
            if (lo..=hi).contains(&pruned) {
                return Some(pruned);
            }
            log::debug!(
                "LLC set mis-sized after prune ({pruned}, want {lo}..={hi}); treating as failed"
            );
        } else {
            log::debug!(
                "LLC build verification failed (size {evsz}), retry {}/{}",
                attempt + 1,
                cfg.verify_retry
            );
        }

        *target = pool.pop()?;

        if cfg.retry_timeout_ms > 0
            && deadline.elapsed().as_millis() as u64 > cfg.retry_timeout_ms
        {
            log::warn!("timeout during LLC eviction-set construction");
            return None;
        }
    }
    None
}

/// Build up to `max_sets` LLC eviction sets from one filtered candidate view
/// (one page offset × one L2 color).
///
/// Successive targets are chosen from candidates that the union of lines
/// already consumed does NOT evict, so each slot lands in a different LLC
/// set. The view itself stays untouched; the working pool is a copy.
pub fn build_llc_sets_at(
    ctx: &CoreContext,
    view: &CandidateView,
    l2_filter: &EvSet,
    cfg: &BuildConfig,
    helper: &HelperThread,
    max_sets: u32,
) -> Vec<Option<EvSet>> {
    let geom = &ctx.hier.l3;
    let mut n_sets = ctx.hier.l3_sets_per_l2_color() as u32;
    if max_sets > 0 && max_sets < n_sets {
        n_sets = max_sets;
    }

    let lower_lines = l2_filter.line_ptrs();
    let env = TestEnv {
        helper: Some(helper),
        lower: Some(&lower_lines),
        lower_repeat: l2_filter.config.ev_repeat,
    };

    let mut results: Vec<Option<EvSet>> = vec![None; n_sets as usize];
    let mut pool = view.resolve();
    let mut consumed: Vec<*const u8> = Vec::new();

    let Some(mut target) = pool.pop() else {
        return results;
    };

    for slot in 0..n_sets as usize {
        if pool.is_empty() {
            break;
        }

        if let Some(evsz) = build_verified_llc(&mut target, &mut pool, ctx, cfg, &env) {
            let lines = pool[..evsz].to_vec();
            consumed.push(target);
            consumed.extend_from_slice(&lines);
            results[slot] = Some(EvSet::from_ptrs(
                view,
                target,
                &lines,
                CacheLevel::L3,
                geom.ways,
                cfg.clone(),
            ));
            // Lines now in a set leave the pool.
            pool.drain(..evsz);
        } else {
            log::debug!("LLC build failed at slot {slot} (offset {:#x})", view.offset());
        }

        if slot + 1 == n_sets as usize {
            break;
        }

        // Next target must not collide with anything already consumed.
        let mut found = false;
        for j in 0..pool.len() {
            let cand = pool[j];
            if consumed.is_empty()
                || !test_eviction(cand, &consumed, cfg, &ctx.lats, &env)
            {
                target = cand;
                let last = pool.len() - 1;
                pool.swap(j, last);
                pool.pop();
                found = true;
                break;
            }
        }
        if !found {
            log::warn!(
                "cannot find the next LLC target (pool {} lines, consumed {})",
                pool.len(),
                consumed.len()
            );
            break;
        }
    }

    results
}

/// Build exactly one verified LLC eviction set end to end: one L2 filter
/// set, one filtered pool, one build. The single-pair path behind the
/// occupancy check and the boundary-behavior tests.
pub fn build_single_llc_set(
    ctx: &CoreContext,
    helper: &HelperThread,
) -> Result<Option<(EvSet, EvSet)>, ResourceError> {
    let Some(l2sets) = build_l2_color_sets(ctx, 1)? else {
        return Ok(None);
    };
    let l2 = l2sets.at(0, 0).clone();

    let cfg = BuildConfig::for_llc(&ctx.lats, ctx.params.cand_scale)
        .with_filter_mode(ctx.params.filter_mode);
    let pages = arena_pages(ctx.hier.l3.uncertainty(), ctx.hier.l3.ways, cfg.cand_scale);
    let arena = Arena::new(pages, ctx.memset_threads())?;
    let mut view = CandidateView::full(&arena, 0);

    let kept = filter_candidates(&mut view, &l2, &ctx.lats, cfg.filter_mode);
    if kept == 0 {
        log::error!("candidate filter admitted nothing");
        return Ok(None);
    }
    log::info!("filtered {} candidate lines to {kept}", arena.n_pages());

    // The filtered pool must contain a potential set before the expensive
    // build starts.
    let lower_lines = l2.line_ptrs();
    let env = TestEnv {
        helper: Some(helper),
        lower: Some(&lower_lines),
        lower_repeat: l2.config.ev_repeat,
    };
    let pool = view.resolve();
    let (probe_target, probe_pool) = pool.split_last().expect("non-empty filtered pool");
    if !test_eviction(*probe_target, probe_pool, &cfg, &ctx.lats, &env) {
        log::error!("filtered candidates hold no potential eviction set for the target");
        return Ok(None);
    }

    let sets = build_llc_sets_at(ctx, &view, &l2, &cfg, helper, 1);
    Ok(sets.into_iter().flatten().next().map(|s| (s, l2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::skx_context;

    /// With a zero threshold every slice "evicts", so the bisection collapses
    /// to single lines and accumulates exactly `expected` entries.
    #[test]
    fn zhao_accumulates_under_always_evict_oracle() {
        let ctx = skx_context();
        let arena = Arena::new(64, 1).unwrap();
        let view = CandidateView::full(&arena, 0);
        let mut pool = view.resolve();
        let target = pool.pop().unwrap();

        let mut cfg = BuildConfig::for_l2(&ctx.lats, None);
        cfg.lat_thresh = 0;
        let mut lats = ctx.lats;
        lats.interrupt = u64::MAX;

        let evsz = build_zhao(target, &mut pool, 16, 4, 32, &cfg, &lats, &TestEnv::NONE);
        assert_eq!(evsz, 16);
    }

    /// With an impossible threshold nothing ever evicts: every iteration
    /// backtracks and the loop terminates at max_backtrack with size 0.
    #[test]
    fn zhao_terminates_empty_under_never_evict_oracle() {
        let ctx = skx_context();
        let arena = Arena::new(64, 1).unwrap();
        let view = CandidateView::full(&arena, 0);
        let mut pool = view.resolve();
        let target = pool.pop().unwrap();

        let mut cfg = BuildConfig::for_l2(&ctx.lats, None);
        cfg.lat_thresh = u64::MAX / 2;

        let evsz = build_zhao(target, &mut pool, 16, 4, 32, &cfg, &ctx.lats, &TestEnv::NONE);
        assert_eq!(evsz, 0);
    }

    #[test]
    fn zhao_rejects_trivial_pools() {
        let ctx = skx_context();
        let cfg = BuildConfig::for_l2(&ctx.lats, None);
        let mut empty: Vec<*const u8> = Vec::new();
        assert_eq!(
            build_zhao(
                std::ptr::null(),
                &mut empty,
                16,
                4,
                32,
                &cfg,
                &ctx.lats,
                &TestEnv::NONE
            ),
            0
        );
    }

    /// Slack carries the prefix offset: with slack and an always-evict
    /// oracle the set still reaches the expected size.
    #[test]
    fn zhao_with_slack_reaches_expected_size() {
        let ctx = skx_context();
        let arena = Arena::new(96, 1).unwrap();
        let view = CandidateView::full(&arena, 0);
        let mut pool = view.resolve();
        let target = pool.pop().unwrap();

        let mut cfg = BuildConfig::for_llc(&ctx.lats, None);
        cfg.lat_thresh = 0;
        cfg.use_helper = false;
        let mut lats = ctx.lats;
        lats.interrupt = u64::MAX;

        let evsz = build_zhao(target, &mut pool, 11, 5, 22, &cfg, &lats, &TestEnv::NONE);
        assert_eq!(evsz, 11);
    }

    #[test]
    fn batch_filter_admits_all_when_everything_misses() {
        // lat_thresh 0 means every timed load counts over threshold, so the
        // filter admits the whole pool.
        let ctx = skx_context();
        let arena = Arena::new(40, 1).unwrap();
        let filter_view = CandidateView::full(&arena, 0);
        let fptrs = filter_view.resolve();

        let mut cfg = BuildConfig::for_l2(&ctx.lats, None);
        cfg.lat_thresh = 0;
        let filter = EvSet::from_ptrs(
            &filter_view,
            fptrs[16],
            &fptrs[..16],
            CacheLevel::L2,
            16,
            cfg,
        );

        let mut view = CandidateView::full(&arena, 64);
        let kept = filter_candidates(&mut view, &filter, &ctx.lats, FilterMode::Batch);
        assert_eq!(kept, 40);
        assert_eq!(view.len(), 40);
    }

    #[test]
    fn sequential_filter_rejects_all_under_impossible_threshold() {
        let ctx = skx_context();
        let arena = Arena::new(40, 1).unwrap();
        let filter_view = CandidateView::full(&arena, 0);
        let fptrs = filter_view.resolve();

        let mut cfg = BuildConfig::for_l2(&ctx.lats, None);
        cfg.lat_thresh = u64::MAX / 2;
        let filter = EvSet::from_ptrs(
            &filter_view,
            fptrs[16],
            &fptrs[..16],
            CacheLevel::L2,
            16,
            cfg,
        );

        let mut view = CandidateView::full(&arena, 64);
        let kept = filter_candidates(&mut view, &filter, &ctx.lats, FilterMode::Sequential);
        assert_eq!(kept, 0);
        assert!(view.is_empty());
    }

    #[test]
    fn pick_unconflicted_target_skips_evicted_candidates() {
        let ctx = skx_context();
        let arena = Arena::new(8, 1).unwrap();
        let view = CandidateView::full(&arena, 0);
        let mut pool = view.resolve();
        let union: Vec<*const u8> = Vec::new();

        // Empty union: the first candidate wins and leaves the pool.
        let cfg = BuildConfig::for_l2(&ctx.lats, None);
        let before = pool.len();
        let picked =
            pick_unconflicted_target(&mut pool, &union, &cfg, &ctx.lats, &TestEnv::NONE);
        assert!(picked.is_some());
        assert_eq!(pool.len(), before - 1);
        assert!(!pool.contains(&picked.unwrap()));
    }

    #[test]
    #[ignore] // Hardware-dependent: real L2 eviction on a quiet x86-64 machine
    fn l2_color_build_end_to_end() {
        let ctx = CoreContext::probe(Default::default()).unwrap();
        let sets = build_l2_color_sets(&ctx, 2).unwrap().unwrap();
        assert_eq!(sets.n_colors, 2);
        assert_eq!(sets.n_offsets(), OFFSETS_PER_PAGE);
        for color in 0..2 {
            let s = sets.at(0, color);
            assert_eq!(s.len() as u32, ctx.hier.l2.ways);
            assert!(s.verify(&ctx.lats, &TestEnv::NONE));
        }
    }

    #[test]
    #[ignore] // Hardware-dependent: full single LLC build with helper thread
    fn single_llc_build_end_to_end() {
        let ctx = CoreContext::probe(Default::default()).unwrap();
        let helper = HelperThread::start().unwrap();
        let (set, l2) = build_single_llc_set(&ctx, &helper).unwrap().unwrap();
        let n = set.len() as u32;
        assert!(n >= ctx.hier.l3.ways && n <= ctx.hier.l3.ways + 2);
        let lower = l2.line_ptrs();
        let env = TestEnv {
            helper: Some(&helper),
            lower: Some(&lower),
            lower_repeat: l2.config.ev_repeat,
        };
        for _ in 0..3 {
            assert!(set.verify(&ctx.lats, &env));
        }
    }
}
