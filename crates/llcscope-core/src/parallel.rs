//! Parallel LLC construction: main/helper pairs working through
//! (page offset × L2 color) cells under a pluggable pinning policy.
//!
//! One scheduler covers all three historical modes. Coarse mode steals whole
//! offsets from a shared atomic index; granular mode splits the cell
//! cross-product evenly up front; the topology-aware policy pins pairs
//! same-socket-non-SMT and re-pins in place when a periodic re-probe says a
//! pair went bad. Workers never share result cells: everything flows back
//! over a channel and the orchestrator owns the table.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::arena::{Arena, CandidateView, arena_pages};
use crate::build::{L2ColorSets, build_llc_sets_at, filter_candidates};
use crate::cache::{LINE_SIZE, OFFSETS_PER_PAGE};
use crate::config::BuildConfig;
use crate::context::CoreContext;
use crate::error::Error;
use crate::evset::EvSet;
use crate::helper::HelperThread;
use crate::latency::min_cluster;
use crate::timing::{online_cpus, pin_current_thread, pin_thread, time_us};
use crate::topology::{CpuTopology, TopologyProbe, VcpuPair};

/// One schedulable unit of construction work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnit {
    /// Every L2 color at one page offset.
    Offset(u32),
    /// A single (offset, color) cell.
    Cell { offset_idx: u32, color: u32 },
}

/// Where worker pairs get pinned.
pub enum PinPolicy {
    /// Leave placement to the OS scheduler.
    None,
    /// Hand out core ids round-robin from a shared counter.
    RoundRobin,
    /// Same-socket non-SMT pairs from a probed topology, re-checked every
    /// `interval_us` and re-pinned in place on harmful change.
    TopologyAware {
        probe: Box<dyn TopologyProbe>,
        interval_us: u64,
    },
}

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Page offsets covered, starting at line offset 0.
    pub n_offsets: u32,
    /// L2 colors per offset.
    pub n_colors: u32,
    /// Eviction sets per (offset, color) cell.
    pub evsets_per_color: u32,
    /// Cell-granular pre-assignment instead of offset work-steal.
    pub granular: bool,
}

impl BuildPlan {
    fn clamped(&self, ctx: &CoreContext) -> BuildPlan {
        let mut p = self.clone();
        if p.n_offsets == 0 || p.n_offsets > OFFSETS_PER_PAGE {
            p.n_offsets = OFFSETS_PER_PAGE;
        }
        let max_colors = ctx.hier.l2_colors();
        if p.n_colors == 0 || p.n_colors > max_colors {
            p.n_colors = max_colors;
        }
        p.evsets_per_color = p.evsets_per_color.max(1);
        p
    }
}

/// `complex[offset][color][slot]`, write-once per cell.
pub struct SetTable {
    pub n_offsets: u32,
    pub n_colors: u32,
    pub slots: u32,
    cells: Vec<Option<EvSet>>,
}

impl SetTable {
    pub fn new(n_offsets: u32, n_colors: u32, slots: u32) -> Self {
        Self {
            n_offsets,
            n_colors,
            slots,
            cells: (0..(n_offsets * n_colors * slots)).map(|_| None).collect(),
        }
    }

    fn idx(&self, offset_idx: u32, color: u32, slot: u32) -> usize {
        debug_assert!(offset_idx < self.n_offsets && color < self.n_colors && slot < self.slots);
        ((offset_idx * self.n_colors + color) * self.slots + slot) as usize
    }

    pub fn get(&self, offset_idx: u32, color: u32, slot: u32) -> Option<&EvSet> {
        self.cells[self.idx(offset_idx, color, slot)].as_ref()
    }

    pub fn put(&mut self, offset_idx: u32, color: u32, slot: u32, set: EvSet) {
        let idx = self.idx(offset_idx, color, slot);
        debug_assert!(self.cells[idx].is_none(), "result cell written twice");
        self.cells[idx] = Some(set);
    }

    /// Built sets with their cell coordinates.
    pub fn iter_built(&self) -> impl Iterator<Item = (u32, u32, u32, &EvSet)> {
        self.cells.iter().enumerate().filter_map(|(i, c)| {
            c.as_ref().map(|s| {
                let slot = i as u32 % self.slots;
                let rest = i as u32 / self.slots;
                (rest / self.n_colors, rest % self.n_colors, slot, s)
            })
        })
    }

    pub fn built_count(&self) -> u64 {
        self.cells.iter().filter(|c| c.is_some()).count() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.cells.len() as u64
    }
}

/// Construction summary handed back to callers and data files.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub total_built: u64,
    pub total_possible: u64,
    pub coverage: f64,
    /// Smallest frequent verified set size; -1 when nothing built.
    pub min_evset_size: i64,
    pub elapsed_ms: u64,
    pub pairs: u32,
    pub repins: u32,
}

/// Filtered candidate views per (offset, color).
pub struct CandidateGrid {
    views: Vec<Vec<CandidateView>>,
}

impl CandidateGrid {
    pub fn at(&self, offset_idx: u32, color: u32) -> &CandidateView {
        &self.views[offset_idx as usize][color as usize]
    }
}

/// Allocate one shared arena and produce a filtered view per (offset,
/// color). Each color is filtered once — at a color-specific offset so the
/// measurement work spreads across the page — and the result is projected
/// to every other offset.
pub fn build_candidate_grid(
    ctx: &CoreContext,
    plan: &BuildPlan,
    l2sets: &L2ColorSets,
) -> Result<CandidateGrid, Error> {
    let plan = plan.clamped(ctx);
    let cfg = BuildConfig::for_llc(&ctx.lats, ctx.params.cand_scale);
    let pages = arena_pages(ctx.hier.l3.uncertainty(), ctx.hier.l3.ways, cfg.cand_scale);
    let arena = Arena::new(pages, ctx.memset_threads())?;

    let started = time_us();
    let n_threads = ctx
        .pair_budget()
        .min(plan.n_colors)
        .max(1);

    // One filtered base view per color, built in parallel.
    let bases: Vec<Mutex<Option<CandidateView>>> =
        (0..plan.n_colors).map(|_| Mutex::new(None)).collect();

    std::thread::scope(|s| {
        for t in 0..n_threads {
            let arena = &arena;
            let bases = &bases;
            let colors: Vec<u32> = (0..plan.n_colors)
                .filter(|c| c % n_threads == t)
                .collect();
            s.spawn(move || {
                let _ = pin_current_thread((t % online_cpus()) as i32);
                for color in colors {
                    let filter_offset = (color % OFFSETS_PER_PAGE) * LINE_SIZE as u32;
                    let mut view = CandidateView::full(arena, filter_offset);
                    let filter = l2sets.at(color % OFFSETS_PER_PAGE, color);
                    let kept =
                        filter_candidates(&mut view, filter, &ctx.lats, ctx.params.filter_mode);
                    if kept == 0 {
                        log::error!("color {color}: filter admitted no candidates");
                    }
                    *bases[color as usize].lock().unwrap() = Some(view);
                }
            });
        }
    });

    let mut views: Vec<Vec<CandidateView>> = Vec::with_capacity(plan.n_offsets as usize);
    for off in 0..plan.n_offsets {
        let mut row = Vec::with_capacity(plan.n_colors as usize);
        for color in 0..plan.n_colors {
            let base = bases[color as usize].lock().unwrap();
            let base = base.as_ref().expect("every color was filtered");
            row.push(base.shift(off * LINE_SIZE as u32));
        }
        views.push(row);
    }

    log::info!(
        "built candidate grid ({} offsets x {} colors) in {:.3} ms",
        plan.n_offsets,
        plan.n_colors,
        (time_us() - started) as f64 / 1e3
    );
    Ok(CandidateGrid { views })
}

/// Even split of `total` work items over `n` takers, first `total % n`
/// takers get one extra.
pub fn even_split(total: u32, n: u32) -> Vec<u32> {
    if n == 0 {
        return Vec::new();
    }
    let base = total / n;
    let rem = total % n;
    (0..n).map(|i| base + u32::from(i < rem)).collect()
}

/// Per-offset set budget when a requested total is spread over pairs.
///
/// The oversubscribed branch (each pair needing more than one offset)
/// falls back to filling offsets front to back; none of the shipped
/// front-ends drives it, so treat it as preserved-but-unproven behavior.
pub fn evsets_per_offset_distribution(
    n_sets: u32,
    n_pairs: u32,
    max_per_offset: u32,
) -> [u32; OFFSETS_PER_PAGE as usize] {
    let mut out = [0u32; OFFSETS_PER_PAGE as usize];
    if n_pairs == 0 {
        return out;
    }

    let per_pair = n_sets / n_pairs;
    let remainder = n_sets % n_pairs;

    if per_pair > max_per_offset {
        let mut remaining = n_sets;
        let mut idx = 0usize;
        while remaining > 0 && idx < out.len() {
            let take = remaining.min(max_per_offset);
            out[idx] = take;
            remaining -= take;
            idx += 1;
        }
    } else {
        for (i, slot) in out
            .iter_mut()
            .enumerate()
            .take(n_pairs.min(OFFSETS_PER_PAGE) as usize)
        {
            *slot = per_pair + u32::from((i as u32) < remainder);
        }
    }
    out
}

struct PairPins {
    main: libc::pthread_t,
    assignment: VcpuPair,
}

enum Placement {
    Unpinned,
    Cores(Vec<VcpuPair>),
    Topology {
        pairs: Vec<VcpuPair>,
        probe: Box<dyn TopologyProbe>,
        interval_us: u64,
    },
}

fn place_pairs(n_pairs: u32, policy: PinPolicy) -> (u32, Placement) {
    match policy {
        PinPolicy::None => (n_pairs, Placement::Unpinned),
        PinPolicy::RoundRobin => {
            let cores = online_cpus() as i32;
            let next = AtomicU32::new(0);
            let mut assignments = Vec::with_capacity(n_pairs as usize);
            for _ in 0..n_pairs {
                let main = (next.fetch_add(1, Ordering::Relaxed) as i32) % cores;
                let helper = (next.fetch_add(1, Ordering::Relaxed) as i32) % cores;
                assignments.push(VcpuPair { main, helper });
            }
            (n_pairs, Placement::Cores(assignments))
        }
        PinPolicy::TopologyAware { probe, interval_us } => match probe.probe() {
            Some(topo) => {
                let pairs = topo.find_pairs(n_pairs as usize);
                if pairs.is_empty() {
                    log::warn!("no valid same-socket non-SMT pairs; falling back to round-robin");
                    return place_pairs(n_pairs, PinPolicy::RoundRobin);
                }
                if (pairs.len() as u32) < n_pairs {
                    log::warn!(
                        "only {} valid vCPU pairs available, reducing from {}",
                        pairs.len(),
                        n_pairs
                    );
                }
                let n = pairs.len() as u32;
                (
                    n,
                    Placement::Topology {
                        pairs,
                        probe,
                        interval_us,
                    },
                )
            }
            None => {
                log::warn!("topology probe failed; proceeding without topology awareness");
                place_pairs(n_pairs, PinPolicy::RoundRobin)
            }
        },
    }
}

/// Build the full `complex[offset][color][slot]` table in parallel.
pub fn build_llc_table(
    ctx: &CoreContext,
    plan: &BuildPlan,
    l2sets: &L2ColorSets,
    grid: &CandidateGrid,
    policy: PinPolicy,
) -> Result<(SetTable, BuildReport), Error> {
    let plan = plan.clamped(ctx);
    let total_cells = plan.n_offsets * plan.n_colors;

    let mut n_pairs = ctx.pair_budget().min(if plan.granular {
        total_cells
    } else {
        plan.n_offsets
    });
    n_pairs = n_pairs.max(1);

    let (n_pairs, placement) = place_pairs(n_pairs, policy);

    // Pre-assigned cells for granular mode; coarse mode steals offsets.
    let granular_cells: Vec<Vec<WorkUnit>> = if plan.granular {
        let mut all = Vec::with_capacity(total_cells as usize);
        for color in 0..plan.n_colors {
            for offset_idx in 0..plan.n_offsets {
                all.push(WorkUnit::Cell { offset_idx, color });
            }
        }
        let loads = even_split(total_cells, n_pairs);
        let mut iter = all.into_iter();
        loads
            .iter()
            .map(|&n| (&mut iter).take(n as usize).collect())
            .collect()
    } else {
        Vec::new()
    };

    let next_offset = AtomicU32::new(0);
    let init_done = AtomicU32::new(0);
    let progress = AtomicU64::new(0);
    let done = AtomicBool::new(false);
    let repins = AtomicU32::new(0);
    let registry: Vec<Mutex<Option<PairPins>>> =
        (0..n_pairs).map(|_| Mutex::new(None)).collect();
    // Helper pthread ids, written by each worker once its helper is up.
    let helper_ids: Vec<AtomicU64> = (0..n_pairs).map(|_| AtomicU64::new(0)).collect();

    let (pin_pairs, watch): (Vec<Option<VcpuPair>>, Option<(&dyn TopologyProbe, u64)>) =
        match &placement {
            Placement::Unpinned => ((0..n_pairs).map(|_| None).collect(), None),
            Placement::Cores(v) => (v.iter().copied().map(Some).collect(), None),
            Placement::Topology {
                pairs,
                probe,
                interval_us,
            } => (
                pairs.iter().copied().map(Some).collect(),
                Some((&**probe, *interval_us)),
            ),
        };

    let started = Instant::now();
    let deadline = if ctx.params.runtime_limit_min > 0 {
        Some(Duration::from_secs(ctx.params.runtime_limit_min * 60))
    } else {
        None
    };

    let (tx, rx) = mpsc::channel::<(u32, u32, u32, EvSet)>();
    let mut table = SetTable::new(plan.n_offsets, plan.n_colors, plan.evsets_per_color);

    std::thread::scope(|s| {
        for pair_idx in 0..n_pairs {
            let tx = tx.clone();
            let plan = plan.clone();
            let pin = pin_pairs[pair_idx as usize];
            let units = if plan.granular {
                granular_cells[pair_idx as usize].clone()
            } else {
                Vec::new()
            };
            let next_offset = &next_offset;
            let init_done = &init_done;
            let progress = &progress;
            let helper_ids = &helper_ids;
            let registry = &registry;

            s.spawn(move || {
                if let Some(p) = pin {
                    *registry[pair_idx as usize].lock().unwrap() = Some(PairPins {
                        main: unsafe { libc::pthread_self() },
                        assignment: p,
                    });
                }
                pair_worker(
                    ctx,
                    &plan,
                    l2sets,
                    grid,
                    pair_idx,
                    pin,
                    units,
                    next_offset,
                    init_done,
                    progress,
                    &helper_ids[pair_idx as usize],
                    deadline,
                    started,
                    tx,
                )
            });
        }
        drop(tx);

        // Watcher: periodic topology re-probe with in-place re-pinning. Work
        // is never reassigned; only the pinning moves.
        if let Some((probe, interval_us)) = watch {
            let done = &done;
            let repins = &repins;
            let registry = &registry;
            let helper_ids = &helper_ids;
            s.spawn(move || {
                let mut last_check = Instant::now();
                while !done.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(10));
                    if last_check.elapsed().as_micros() < interval_us as u128 {
                        continue;
                    }
                    last_check = Instant::now();

                    let Some(new_topo) = probe.probe() else {
                        log::warn!("topology re-probe failed; keeping current pinning");
                        continue;
                    };

                    let harmed: Vec<usize> = registry
                        .iter()
                        .enumerate()
                        .filter_map(|(i, slot)| {
                            let slot = slot.lock().unwrap();
                            slot.as_ref()
                                .filter(|p| !new_topo.pair_still_valid(p.assignment))
                                .map(|_| i)
                        })
                        .collect();

                    if harmed.is_empty() {
                        continue;
                    }

                    log::warn!(
                        "harmful vCPU topology change; re-pinning {} pairs",
                        harmed.len()
                    );
                    let fresh = new_topo.find_pairs(registry.len());
                    for (&idx, &new_pair) in harmed.iter().zip(fresh.iter()) {
                        let mut slot = registry[idx].lock().unwrap();
                        if let Some(p) = slot.as_mut() {
                            let helper = helper_ids[idx].load(Ordering::Acquire);
                            let main_ok = pin_thread(p.main, new_pair.main).is_ok();
                            let helper_ok = helper == 0
                                || pin_thread(helper as libc::pthread_t, new_pair.helper)
                                    .is_ok();
                            if main_ok && helper_ok {
                                p.assignment = new_pair;
                                repins.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            });
        }

        // Start barrier: progress reporting begins once every pair has come
        // up (or declared that it cannot).
        while init_done.load(Ordering::Acquire) < n_pairs {
            std::thread::sleep(Duration::from_millis(1));
        }
        log::info!("{n_pairs} pairs initialized, construction running");

        // Assemble the table; cells are disjoint by construction so this is
        // the only writer.
        while let Ok((offset_idx, color, slot, set)) = rx.recv() {
            table.put(offset_idx, color, slot, set);
        }
        done.store(true, Ordering::Release);
    });

    let total_built = table.built_count();
    let total_possible = table.capacity();
    let sizes: Vec<i64> = table
        .iter_built()
        .map(|(_, _, _, s)| s.len() as i64)
        .collect();

    let report = BuildReport {
        total_built,
        total_possible,
        coverage: total_built as f64 / total_possible as f64,
        min_evset_size: min_cluster(&sizes, ctx.hier.l3.ways + 8),
        elapsed_ms: started.elapsed().as_millis() as u64,
        pairs: n_pairs,
        repins: repins.load(Ordering::Relaxed),
    };

    log::info!(
        "parallel construction done: {}/{} sets ({:.2}%), min size {}, {} ms",
        report.total_built,
        report.total_possible,
        report.coverage * 100.0,
        report.min_evset_size,
        report.elapsed_ms
    );

    Ok((table, report))
}

#[allow(clippy::too_many_arguments)]
fn pair_worker(
    ctx: &CoreContext,
    plan: &BuildPlan,
    l2sets: &L2ColorSets,
    grid: &CandidateGrid,
    pair_idx: u32,
    pin: Option<VcpuPair>,
    units: Vec<WorkUnit>,
    next_offset: &AtomicU32,
    init_done: &AtomicU32,
    progress: &AtomicU64,
    helper_id_slot: &AtomicU64,
    deadline: Option<Duration>,
    started: Instant,
    tx: mpsc::Sender<(u32, u32, u32, EvSet)>,
) {
    if let Some(p) = pin {
        if let Err(e) = pin_current_thread(p.main) {
            log::error!("pair {pair_idx}: failed to pin main to vCPU {}: {e}", p.main);
        }
    }

    let helper = match pin {
        Some(p) => HelperThread::start_pinned(p.helper),
        None => HelperThread::start(),
    };
    let helper = match helper {
        Ok(h) => h,
        Err(e) => {
            log::error!("pair {pair_idx}: {e}");
            // Still count toward the start barrier so the orchestrator does
            // not wait forever on a pair that never came up.
            init_done.fetch_add(1, Ordering::AcqRel);
            return;
        }
    };
    helper_id_slot.store(helper.pthread_id() as u64, Ordering::Release);

    init_done.fetch_add(1, Ordering::AcqRel);
    log::info!(
        "pair {pair_idx} up (main {:?}, helper {:?})",
        pin.map(|p| p.main),
        pin.map(|p| p.helper)
    );

    let cfg = BuildConfig::for_llc(&ctx.lats, ctx.params.cand_scale)
        .with_filter_mode(ctx.params.filter_mode);

    let mut build_cell = |offset_idx: u32, color: u32| {
        let view = grid.at(offset_idx, color);
        let l2 = l2sets.at(offset_idx, color);
        let sets = build_llc_sets_at(ctx, view, l2, &cfg, &helper, plan.evsets_per_color);
        for (slot, set) in sets.into_iter().enumerate() {
            if let Some(set) = set {
                if !set.is_empty() {
                    progress.fetch_add(1, Ordering::Relaxed);
                    let _ = tx.send((offset_idx, color, slot as u32, set));
                }
            }
        }
    };

    let over_deadline =
        |started: Instant| deadline.is_some_and(|d| started.elapsed() >= d);

    if plan.granular {
        for unit in units {
            if over_deadline(started) {
                log::warn!("pair {pair_idx}: runtime limit hit, stopping");
                break;
            }
            if let WorkUnit::Cell { offset_idx, color } = unit {
                build_cell(offset_idx, color);
            }
        }
    } else {
        loop {
            let offset_idx = next_offset.fetch_add(1, Ordering::Relaxed);
            if offset_idx >= plan.n_offsets {
                break;
            }
            for color in 0..plan.n_colors {
                build_cell(offset_idx, color);
                if over_deadline(started) {
                    log::warn!(
                        "pair {pair_idx}: runtime limit hit at offset {:#x}",
                        offset_idx * LINE_SIZE as u32
                    );
                    return;
                }
            }
            log::info!("pair {pair_idx}: offset {:#x} done", offset_idx * LINE_SIZE as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLevel;
    use crate::context::test_support::skx_context;

    #[test]
    fn set_table_indexing_round_trips() {
        let ctx = skx_context();
        let arena = Arena::new(4, 1).unwrap();
        let view = CandidateView::full(&arena, 0);
        let ptrs = view.resolve();
        let set = EvSet::from_ptrs(
            &view,
            ptrs[3],
            &ptrs[..3],
            CacheLevel::L3,
            11,
            BuildConfig::for_llc(&ctx.lats, None),
        );

        let mut table = SetTable::new(4, 3, 2);
        assert_eq!(table.capacity(), 24);
        table.put(2, 1, 1, set.clone());
        assert!(table.get(2, 1, 1).is_some());
        assert!(table.get(2, 1, 0).is_none());
        assert_eq!(table.built_count(), 1);

        let built: Vec<_> = table.iter_built().collect();
        assert_eq!(built.len(), 1);
        let (off, color, slot, s) = built[0];
        assert_eq!((off, color, slot), (2, 1, 1));
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn even_split_balances_remainder() {
        assert_eq!(even_split(10, 3), vec![4, 3, 3]);
        assert_eq!(even_split(9, 3), vec![3, 3, 3]);
        assert_eq!(even_split(2, 4), vec![1, 1, 0, 0]);
        assert!(even_split(5, 0).is_empty());
    }

    #[test]
    fn distribution_even_branch() {
        let d = evsets_per_offset_distribution(10, 4, 640);
        assert_eq!(&d[..4], &[3, 3, 2, 2]);
        assert_eq!(d[4..].iter().sum::<u32>(), 0);
        assert_eq!(d.iter().sum::<u32>(), 10);
    }

    #[test]
    fn distribution_zero_pairs_is_empty() {
        let d = evsets_per_offset_distribution(10, 0, 640);
        assert_eq!(d.iter().sum::<u32>(), 0);
    }

    #[test]
    fn plan_clamps_to_platform() {
        let ctx = skx_context();
        let p = BuildPlan {
            n_offsets: 1000,
            n_colors: 1000,
            evsets_per_color: 0,
            granular: true,
        }
        .clamped(&ctx);
        assert_eq!(p.n_offsets, OFFSETS_PER_PAGE);
        assert_eq!(p.n_colors, ctx.hier.l2_colors());
        assert_eq!(p.evsets_per_color, 1);
    }

    #[test]
    fn round_robin_placement_assigns_all_pairs() {
        let (n, placement) = place_pairs(3, PinPolicy::RoundRobin);
        assert_eq!(n, 3);
        match placement {
            Placement::Cores(v) => assert_eq!(v.len(), 3),
            _ => panic!("expected core placement"),
        }
    }

    #[test]
    fn topology_placement_falls_back_when_probe_fails() {
        struct NoProbe;
        impl TopologyProbe for NoProbe {
            fn probe(&self) -> Option<CpuTopology> {
                None
            }
        }
        let (n, placement) = place_pairs(2, PinPolicy::TopologyAware {
            probe: Box::new(NoProbe),
            interval_us: 1000,
        });
        assert_eq!(n, 2);
        assert!(matches!(placement, Placement::Cores(_)));
    }

    #[test]
    fn topology_placement_uses_probed_pairs() {
        use crate::topology::FixedTopology;
        let topo = CpuTopology::from_ids(vec![0, 0, 0, 0], vec![0, 0, 1, 1]);
        let (n, placement) = place_pairs(4, PinPolicy::TopologyAware {
            probe: Box::new(FixedTopology(topo)),
            interval_us: 1000,
        });
        // Only 2 disjoint non-SMT pairs exist on this machine.
        assert_eq!(n, 2);
        match placement {
            Placement::Topology { pairs, .. } => assert_eq!(pairs.len(), 2),
            _ => panic!("expected topology placement"),
        }
    }

    #[test]
    #[ignore] // Hardware-dependent: full parallel construction on a real LLC
    fn parallel_build_end_to_end() {
        use crate::build::build_l2_color_sets;
        let ctx = crate::context::CoreContext::probe(Default::default()).unwrap();
        let l2 = build_l2_color_sets(&ctx, 2).unwrap().unwrap();
        let plan = BuildPlan {
            n_offsets: 1,
            n_colors: 2,
            evsets_per_color: 1,
            granular: true,
        };
        let grid = build_candidate_grid(&ctx, &plan, &l2).unwrap();
        let (table, report) =
            build_llc_table(&ctx, &plan, &l2, &grid, PinPolicy::RoundRobin).unwrap();
        assert!(report.total_built > 0);
        assert!(report.coverage > 0.0);
        for (_, _, _, set) in table.iter_built() {
            let n = set.len() as u32;
            assert!(n >= ctx.hier.l3.ways && n <= ctx.hier.l3.ways + set.config.slack);
        }
    }
}
