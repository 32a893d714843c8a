//! Occupancy monitoring: prime/probe rounds over built eviction sets, and
//! the derived products — rates, heatmaps, EWMA hotness, LCAS socket
//! ordering, adaptive wait.
//!
//! A round primes every set, busy-waits the remainder of the configured
//! window (so rounds are nearly isochronous regardless of prime cost), then
//! times every line backward. Lines at DRAM latency were evicted by whoever
//! else touched the LLC during the window; that is the occupancy signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::build::L2ColorSets;
use crate::context::CoreContext;
use crate::error::{PlatformError, ResourceError};
use crate::evset::EvSet;
use crate::helper::HelperThread;
use crate::latency::LatencyProfile;
use crate::lcas_sink::LcasSink;
use crate::parallel::{SetTable, even_split};
use crate::timing::{
    access_lines, flush_lines, lfence, pin_current_thread, rdtsc, rdtscp_aux, time_access,
    timer_start, timer_stop,
};
use crate::topology::CpuTopology;

/// Prime/probe self-test iterations.
pub const PERF_PP_ITERS: u32 = 10;
/// Per-line probe retries when a context switch lands mid-sample.
const PROBE_RETRIES: u32 = 5;
/// Bounded retries for the prime loop.
const PRIME_RETRIES: u32 = 10;

/// An LLC set paired with the L2 set of its color, which the prime path
/// traverses to keep the target lines out of the private levels.
#[derive(Clone)]
pub struct MonitorSet {
    pub set: EvSet,
    pub lower: EvSet,
}

/// All monitored sets of one L2 color.
#[derive(Clone)]
pub struct ColorGroup {
    pub color: u32,
    pub sets: Vec<MonitorSet>,
}

/// Group a built table by L2 color, pairing each set with its color's L2
/// set at the matching offset.
pub fn group_by_color(table: &SetTable, l2sets: &L2ColorSets) -> Vec<ColorGroup> {
    let mut groups: Vec<ColorGroup> = (0..table.n_colors)
        .map(|color| ColorGroup {
            color,
            sets: Vec::new(),
        })
        .collect();
    for (offset_idx, color, _slot, set) in table.iter_built() {
        groups[color as usize].sets.push(MonitorSet {
            set: set.clone(),
            lower: l2sets.at(offset_idx, color).clone(),
        });
    }
    groups
}

/// Split the table across sockets for LCAS: slot `e` observes socket
/// `e % n_sockets`, so every socket watches every color.
pub fn group_by_socket(
    table: &SetTable,
    l2sets: &L2ColorSets,
    n_sockets: u32,
) -> Vec<Vec<ColorGroup>> {
    let mut per_socket: Vec<Vec<ColorGroup>> = (0..n_sockets)
        .map(|_| {
            (0..table.n_colors)
                .map(|color| ColorGroup {
                    color,
                    sets: Vec::new(),
                })
                .collect()
        })
        .collect();
    for (offset_idx, color, slot, set) in table.iter_built() {
        let sock = (slot % n_sockets) as usize;
        per_socket[sock][color as usize].sets.push(MonitorSet {
            set: set.clone(),
            lower: l2sets.at(offset_idx, color).clone(),
        });
    }
    per_socket
}

/// Move this process into the high-priority cgroup.
pub fn move_to_high_priority_cgroup() -> Result<(), ResourceError> {
    let pid = std::process::id();
    std::fs::write(
        "/sys/fs/cgroup/hi_prgroup/cgroup.procs",
        format!("{pid}\n"),
    )
    .map_err(|source| ResourceError::Cgroup { source })
}

/// Prime/probe monitoring needs the cgroup; everything else only warns.
pub fn require_high_priority(required: bool) -> Result<(), ResourceError> {
    match move_to_high_priority_cgroup() {
        Ok(()) => Ok(()),
        Err(e) if required => Err(e),
        Err(e) => {
            log::warn!("continuing without high-priority cgroup: {e}");
            Ok(())
        }
    }
}

/// Prime one set: push its lines through L2 via the lower set, then
/// traverse until a timed full pass comes back under the L3 threshold.
pub fn prime_set(ms: &MonitorSet, threshold: u64, helper: &HelperThread) {
    let lines = ms.set.line_ptrs();
    let lower = ms.lower.line_ptrs();
    let cfg = &ms.set.config;

    for _ in 0..ms.lower.config.ev_repeat.max(1) {
        crate::timing::access_lines_backward(&lower);
    }
    lfence();

    for _ in 0..PRIME_RETRIES {
        helper.prime_concurrent(
            &lines,
            cfg.ev_repeat as usize,
            cfg.stride as usize,
            cfg.block as usize,
            || {
                crate::timing::prime_blocked(
                    &lines,
                    cfg.ev_repeat as usize,
                    cfg.stride as usize,
                    cfg.block as usize,
                );
            },
        );
        let begin = timer_start();
        access_lines(&lines);
        let end = timer_stop();
        if end - begin < threshold {
            break;
        }
    }
}

/// Probe one set: time every line backward, retrying samples that straddle
/// a logical-core switch. Returns the evicted-line count.
pub fn probe_set(lines: &[*const u8], lats: &LatencyProfile) -> u32 {
    let mut evicted = 0u32;
    for i in (0..lines.len()).rev() {
        let mut lat = 0u64;
        let mut valid = false;
        for _ in 0..PROBE_RETRIES {
            let (_, a1) = rdtscp_aux();
            lfence();
            // SAFETY: monitored lines come from live arenas held by the sets.
            lat = unsafe { time_access(lines[i]) };
            let (_, a2) = rdtscp_aux();
            if a1 == a2 && lat < lats.interrupt {
                valid = true;
                break;
            }
        }
        if valid && lat >= lats.thr_l3 {
            evicted += 1;
        }
    }
    evicted
}

/// Outcome of one prime/probe round over a range of color groups.
pub struct RoundStats {
    /// Evicted-line totals per color (indexed as the input slice).
    pub evictions: Vec<f64>,
    pub prime_us: u64,
    pub probe_us: u64,
}

/// One isochronous round: prime all groups, busy-wait to `wait_us` from
/// prime start, probe all groups.
pub fn prime_probe_round(
    groups: &[ColorGroup],
    wait_us: u64,
    cycles_per_us: u64,
    lats: &LatencyProfile,
    helper: &HelperThread,
) -> RoundStats {
    let prime_begin = rdtsc();
    for g in groups {
        for ms in &g.sets {
            flush_lines(&ms.set.line_ptrs());
            lfence();
            prime_set(ms, lats.thr_l3, helper);
            lfence();
        }
    }
    let prime_cycles = rdtsc() - prime_begin;
    let prime_us = prime_cycles / cycles_per_us.max(1);

    // Busy-wait out the remainder of the window; subtracting prime time
    // keeps rounds the same length regardless of how slow priming was.
    if wait_us > prime_us {
        let remaining = (wait_us - prime_us) * cycles_per_us.max(1);
        let end = rdtsc() + remaining;
        while rdtsc() < end {
            std::hint::spin_loop();
        }
    }

    let probe_begin = rdtsc();
    let mut evictions = Vec::with_capacity(groups.len());
    for g in groups {
        let mut total = 0u32;
        for ms in &g.sets {
            total += probe_set(&ms.set.line_ptrs(), lats);
        }
        evictions.push(total as f64);
    }
    let probe_us = (rdtsc() - probe_begin) / cycles_per_us.max(1);

    RoundStats {
        evictions,
        prime_us,
        probe_us,
    }
}

/// Eviction rate for a round: evicted lines over all monitored lines.
pub fn round_rate(groups: &[ColorGroup], stats: &RoundStats, ways: u32) -> f64 {
    let total_lines: f64 = groups
        .iter()
        .map(|g| (g.sets.len() as u32 * ways) as f64)
        .sum();
    if total_lines == 0.0 {
        return 0.0;
    }
    (stats.evictions.iter().sum::<f64>() / total_lines).clamp(0.0, 1.0)
}

/// Run prime/probe rounds on worker pairs, one range of colors per pair,
/// and return per-color eviction totals. Workers pin to consecutive core
/// pairs and own their helpers.
pub fn parallel_round(
    ctx: &CoreContext,
    groups: &[ColorGroup],
    wait_us: u64,
    cycles_per_us: u64,
) -> Vec<f64> {
    let n_pairs = ctx.pair_budget().min(groups.len() as u32).max(1);
    let loads = even_split(groups.len() as u32, n_pairs);

    let mut results: Vec<f64> = vec![0.0; groups.len()];
    let chunks: Vec<(usize, usize)> = loads
        .iter()
        .scan(0usize, |start, &n| {
            let s = *start;
            *start += n as usize;
            Some((s, s + n as usize))
        })
        .collect();

    std::thread::scope(|s| {
        let handles: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(i, &(lo, hi))| {
                let lats = ctx.lats;
                s.spawn(move || {
                    let _ = pin_current_thread((i * 2) as i32);
                    let helper = match HelperThread::start_pinned((i * 2 + 1) as i32) {
                        Ok(h) => h,
                        Err(e) => {
                            log::error!("monitor pair {i}: {e}");
                            return (lo, Vec::new());
                        }
                    };
                    let stats = prime_probe_round(
                        &groups[lo..hi],
                        wait_us,
                        cycles_per_us,
                        &lats,
                        &helper,
                    );
                    (lo, stats.evictions)
                })
            })
            .collect();

        for h in handles {
            if let Ok((lo, evictions)) = h.join() {
                for (i, e) in evictions.into_iter().enumerate() {
                    results[lo + i] = e;
                }
            }
        }
    });

    results
}

/// Heatmap over (wait, evicted-count): how many sets reported exactly `k`
/// evictions at each wait step.
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapData {
    pub time_step_us: u64,
    pub max_time_us: u64,
    pub n_ways: u32,
    /// `counts[slot][k]`, k in `0..=n_ways`.
    pub counts: Vec<Vec<u32>>,
    pub avg_per_slot: Vec<f64>,
    pub samples_per_slot: Vec<u32>,
}

impl HeatmapData {
    pub fn n_slots(&self) -> usize {
        self.counts.len()
    }

    /// Fraction of sets with exactly `k` evictions at a slot, in percent.
    pub fn percentage(&self, slot: usize, k: usize) -> f64 {
        let samples = self.samples_per_slot[slot];
        if samples == 0 {
            return 0.0;
        }
        self.counts[slot][k] as f64 / samples as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeatmapOptions {
    pub time_step_us: u64,
    pub max_time_us: u64,
}

impl Default for HeatmapOptions {
    fn default() -> Self {
        Self {
            time_step_us: 100,
            max_time_us: 7000,
        }
    }
}

/// Sweep the wait axis and histogram per-set eviction counts.
///
/// Uses the observed set size rather than the CPUID way count — with CAT
/// partitioning the effective associativity is whatever the builder found.
pub fn occupancy_heatmap(
    ctx: &CoreContext,
    sets: &[MonitorSet],
    opts: HeatmapOptions,
) -> Result<HeatmapData, PlatformError> {
    if sets.is_empty() {
        return Ok(HeatmapData {
            time_step_us: opts.time_step_us,
            max_time_us: opts.max_time_us,
            n_ways: 0,
            counts: Vec::new(),
            avg_per_slot: Vec::new(),
            samples_per_slot: Vec::new(),
        });
    }

    let freq = crate::timing::cpu_freq_hz().ok_or(PlatformError::UnknownCpuFrequency)?;
    let cycles_per_us = (freq / 1_000_000).max(1);
    let n_ways = sets[0].set.len() as u32;
    let n_slots = (opts.max_time_us / opts.time_step_us.max(1) + 1) as usize;

    let n_pairs = ctx.pair_budget().min(sets.len() as u32).max(1);
    let loads = even_split(sets.len() as u32, n_pairs);
    let chunks: Vec<(usize, usize)> = loads
        .iter()
        .scan(0usize, |start, &n| {
            let s = *start;
            *start += n as usize;
            Some((s, s + n as usize))
        })
        .collect();

    let mut counts = vec![vec![0u32; n_ways as usize + 1]; n_slots];
    let mut avg_per_slot = vec![0.0f64; n_slots];
    let mut samples_per_slot = vec![0u32; n_slots];

    for (slot, slot_counts) in counts.iter_mut().enumerate() {
        let wait_us = slot as u64 * opts.time_step_us;
        let mut total_evicted = 0u64;

        std::thread::scope(|s| {
            let handles: Vec<_> = chunks
                .iter()
                .enumerate()
                .map(|(i, &(lo, hi))| {
                    let lats = ctx.lats;
                    s.spawn(move || {
                        let _ = pin_current_thread((i * 2) as i32);
                        let helper = match HelperThread::start_pinned((i * 2 + 1) as i32) {
                            Ok(h) => h,
                            Err(_) => return vec![],
                        };

                        let my_sets = &sets[lo..hi];
                        let prime_begin = rdtsc();
                        for ms in my_sets {
                            flush_lines(&ms.set.line_ptrs());
                            lfence();
                            prime_set(ms, lats.thr_l3, &helper);
                            lfence();
                        }
                        let prime_us =
                            (rdtsc() - prime_begin) / cycles_per_us;

                        if wait_us > prime_us {
                            std::thread::sleep(Duration::from_micros(wait_us - prime_us));
                        }

                        my_sets
                            .iter()
                            .map(|ms| probe_set(&ms.set.line_ptrs(), &lats))
                            .collect::<Vec<u32>>()
                    })
                })
                .collect();

            for h in handles {
                if let Ok(per_set) = h.join() {
                    for evicted in per_set {
                        if evicted <= n_ways {
                            slot_counts[evicted as usize] += 1;
                            total_evicted += evicted as u64;
                            samples_per_slot[slot] += 1;
                        }
                    }
                }
            }
        });

        avg_per_slot[slot] = total_evicted as f64 / sets.len() as f64;
    }

    Ok(HeatmapData {
        time_step_us: opts.time_step_us,
        max_time_us: opts.max_time_us,
        n_ways,
        counts,
        avg_per_slot,
        samples_per_slot,
    })
}

/// Rate-vs-wait sweep: points start at the first slot past the measured
/// prime time.
#[derive(Debug, Clone, Serialize)]
pub struct RateSweep {
    pub prime_time_us: u64,
    pub points: Vec<(u64, f64)>,
}

pub fn rate_vs_wait(
    ctx: &CoreContext,
    groups: &[ColorGroup],
    opts: HeatmapOptions,
) -> Result<RateSweep, PlatformError> {
    let freq = crate::timing::cpu_freq_hz().ok_or(PlatformError::UnknownCpuFrequency)?;
    let cycles_per_us = (freq / 1_000_000).max(1);
    let n_ways = groups
        .iter()
        .flat_map(|g| g.sets.first())
        .map(|ms| ms.set.len() as u32)
        .next()
        .unwrap_or(0);
    let total_sets: usize = groups.iter().map(|g| g.sets.len()).sum();
    if n_ways == 0 || total_sets == 0 {
        return Ok(RateSweep {
            prime_time_us: 0,
            points: Vec::new(),
        });
    }

    // Measure prime time with a zero-wait round.
    let Ok(helper) = HelperThread::start() else {
        log::error!("could not start a helper for the prime-time measurement");
        return Ok(RateSweep {
            prime_time_us: 0,
            points: Vec::new(),
        });
    };
    let warmup = prime_probe_round(groups, 0, cycles_per_us, &ctx.lats, &helper);
    drop(helper);
    let prime_time_us = warmup.prime_us;

    let step = opts.time_step_us.max(1);
    let n_slots = opts.max_time_us / step + 1;
    let start_slot = prime_time_us / step + 1;
    if start_slot >= n_slots {
        return Ok(RateSweep {
            prime_time_us,
            points: Vec::new(),
        });
    }

    let total_lines = (n_ways as u64 * total_sets as u64) as f64;
    let mut points = Vec::with_capacity((n_slots - start_slot) as usize);
    for slot in start_slot..n_slots {
        let wait_us = slot * step;
        let evictions = parallel_round(ctx, groups, wait_us, cycles_per_us);
        let rate = evictions.iter().sum::<f64>() / total_lines;
        points.push((wait_us, rate.clamp(0.0, 1.0)));
    }

    Ok(RateSweep {
        prime_time_us,
        points,
    })
}

/// Two-alpha exponential smoother: one alpha on the way up, another on the
/// way down, so rises and falls settle at different speeds.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    pub alpha_rise: f64,
    pub alpha_fall: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha_rise: f64, alpha_fall: f64) -> Self {
        Self {
            alpha_rise,
            alpha_fall,
            value: None,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(old) => {
                let alpha = if sample > old {
                    self.alpha_rise
                } else {
                    self.alpha_fall
                };
                alpha * old + (1.0 - alpha) * sample
            }
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Hotness level buckets used by the LCAS hysteresis.
pub fn lcas_level(hotness: f64) -> u8 {
    let pct = hotness * 100.0;
    if pct < 40.0 {
        0
    } else if pct < 65.0 {
        1
    } else if pct < 85.0 {
        2
    } else {
        3
    }
}

/// What a scan decided to tell the consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum LcasDecision {
    /// New coldest-first order adopted.
    Publish(Vec<u32>),
    /// All sockets share a level; no preference.
    NoPreference,
    /// Keep the previously published order.
    Keep(Vec<u32>),
}

/// Hysteresis over the coldest-socket designation: a new candidate must
/// stay coldest for three consecutive scans AND sit in a lower level than
/// the incumbent before the published order changes.
pub struct LcasTracker {
    coldest: Option<u32>,
    streak: u32,
    last_order: Vec<u32>,
}

impl LcasTracker {
    pub fn new() -> Self {
        Self {
            coldest: None,
            streak: 0,
            last_order: Vec::new(),
        }
    }

    /// Feed one scan of smoothed per-socket hotness.
    pub fn observe(&mut self, hotness: &[(u32, f64)]) -> LcasDecision {
        let mut sorted: Vec<(u32, f64)> = hotness.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let order: Vec<u32> = sorted.iter().map(|&(s, _)| s).collect();

        let first_level = lcas_level(sorted[0].1);
        let all_same = sorted.iter().all(|&(_, h)| lcas_level(h) == first_level);
        if all_same {
            self.streak = 0;
            self.coldest = None;
            return LcasDecision::NoPreference;
        }

        let candidate = order[0];
        let candidate_level = first_level;
        // Incumbent judged at its hotness from THIS scan, so a socket that
        // heated up concedes even before the candidate's streak completes.
        let incumbent_level = match self.coldest {
            None => u8::MAX,
            Some(c) => hotness
                .iter()
                .find(|&&(s, _)| s == c)
                .map(|&(_, h)| lcas_level(h))
                .unwrap_or(u8::MAX),
        };

        if self.coldest != Some(candidate) && candidate_level < incumbent_level {
            self.streak += 1;
        } else {
            self.streak = 0;
        }

        if self.coldest.is_none() || self.streak >= 3 {
            self.coldest = Some(candidate);
            self.streak = 0;
            self.last_order = order.clone();
            return LcasDecision::Publish(order);
        }

        LcasDecision::Keep(self.last_order.clone())
    }
}

impl Default for LcasTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Adaptive wait: shrink the window while every socket is saturated,
/// bounce back to the baseline when all go cold.
pub struct AdaptiveWait {
    pub baseline_us: u64,
    pub current_us: u64,
    pub fixed: bool,
    consec_saturated: u32,
}

impl AdaptiveWait {
    pub fn new(baseline_us: u64, fixed: bool) -> Self {
        Self {
            baseline_us,
            current_us: baseline_us,
            fixed,
            consec_saturated: 0,
        }
    }

    pub fn update(&mut self, hotness: &[f64]) -> u64 {
        if self.fixed || hotness.is_empty() {
            return self.current_us;
        }

        let saturated = hotness.iter().filter(|&&h| h >= 0.95).count();
        let all_cold = hotness.iter().all(|&h| lcas_level(h) == 0);

        if all_cold {
            self.current_us = self.baseline_us;
            self.consec_saturated = 0;
            return self.current_us;
        }

        if saturated == hotness.len() && self.current_us > 1000 {
            self.consec_saturated += 1;
            if self.consec_saturated >= 2 {
                self.current_us -= 1000;
                self.consec_saturated = 0;
            }
        } else {
            self.consec_saturated = 0;
        }
        self.current_us
    }
}

/// Options for the LCAS monitoring loop.
#[derive(Debug, Clone, Copy)]
pub struct LcasOptions {
    pub wait_us: u64,
    pub period_ms: u64,
    pub alpha_rise: f64,
    pub alpha_fall: f64,
    pub fix_wait: bool,
}

impl Default for LcasOptions {
    fn default() -> Self {
        Self {
            wait_us: 7000,
            period_ms: 1000,
            alpha_rise: 0.85,
            alpha_fall: 0.85,
            fix_wait: false,
        }
    }
}

/// Per-socket LLC hotness with LCAS publication, until `stop` is raised.
///
/// Each scan runs one prime/probe round per socket on pairs pinned inside
/// that socket, smooths the resulting hotness, and lets the tracker decide
/// what to publish.
pub fn lcas_monitor(
    ctx: &CoreContext,
    per_socket: &[Vec<ColorGroup>],
    topo: &CpuTopology,
    sink: &dyn LcasSink,
    stop: &AtomicBool,
    opts: LcasOptions,
) -> Result<(), PlatformError> {
    let freq = crate::timing::cpu_freq_hz().ok_or(PlatformError::UnknownCpuFrequency)?;
    let cycles_per_us = (freq / 1_000_000).max(1);

    let sockets = topo.sockets();
    let n_sockets = per_socket.len().min(sockets.len());
    let n_ways = per_socket
        .iter()
        .flatten()
        .flat_map(|g| g.sets.first())
        .map(|ms| ms.set.len() as u32)
        .next()
        .unwrap_or(0);
    if n_ways == 0 {
        log::error!("no built sets to monitor");
        return Ok(());
    }

    let mut smoothers: Vec<Ewma> = (0..n_sockets)
        .map(|_| Ewma::new(opts.alpha_rise, opts.alpha_fall))
        .collect();
    let mut tracker = LcasTracker::new();
    let mut wait = AdaptiveWait::new(opts.wait_us, opts.fix_wait);

    while !stop.load(Ordering::Acquire) {
        let wait_us = wait.current_us;

        // One round per socket, on a pair pinned inside that socket.
        let mut hotness: Vec<(u32, f64)> = Vec::with_capacity(n_sockets);
        let raw: Vec<Option<f64>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..n_sockets)
                .map(|si| {
                    let lats = ctx.lats;
                    let socket = &sockets[si];
                    let groups = &per_socket[si];
                    s.spawn(move || {
                        let pair = topo.find_pair_on_socket(socket)?;
                        let _ = pin_current_thread(pair.main);
                        let helper = HelperThread::start_pinned(pair.helper).ok()?;
                        let stats =
                            prime_probe_round(groups, wait_us, cycles_per_us, &lats, &helper);
                        let total_lines: f64 = groups
                            .iter()
                            .map(|g| (g.sets.len() as u32 * n_ways) as f64)
                            .sum();
                        if total_lines == 0.0 {
                            return Some(0.0);
                        }
                        Some(
                            (stats.evictions.iter().sum::<f64>() / total_lines)
                                .clamp(0.0, 1.0),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().ok().flatten()).collect()
        });

        for (si, h) in raw.iter().enumerate() {
            let Some(h) = h else {
                log::warn!("socket {} produced no sample this scan", sockets[si].socket_id);
                continue;
            };
            let smoothed = smoothers[si].update(*h);
            hotness.push((sockets[si].socket_id as u32, smoothed));
        }

        if !hotness.is_empty() {
            wait.update(&hotness.iter().map(|&(_, h)| h).collect::<Vec<_>>());
            match tracker.observe(&hotness) {
                LcasDecision::Publish(order) | LcasDecision::Keep(order) => {
                    sink.publish(&order);
                }
                LcasDecision::NoPreference => sink.no_preference(n_sockets as u32),
            }
        }

        std::thread::sleep(Duration::from_millis(opts.period_ms));
    }

    Ok(())
}

/// Single-set occupancy sample.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OccupancySample {
    pub evicted: u32,
    pub total: u32,
    pub probe_cycles: u64,
}

/// Prime one set, wait, and probe it once.
pub fn single_set_occupancy(
    ctx: &CoreContext,
    ms: &MonitorSet,
    helper: &HelperThread,
    wait_us: u64,
) -> OccupancySample {
    let lines = ms.set.line_ptrs();
    flush_lines(&lines);
    prime_set(ms, ctx.lats.thr_l3, helper);

    std::thread::sleep(Duration::from_micros(wait_us));

    let begin = timer_start();
    let evicted = probe_set(&lines, &ctx.lats);
    let end = timer_stop();

    OccupancySample {
        evicted,
        total: lines.len() as u32,
        probe_cycles: end - begin,
    }
}

/// Group-probe threshold calibration: median whole-set probe latency with
/// and without a foreign access to the target in between. Returns 0 when
/// more than 5 % of samples cross the midpoint — that threshold would
/// misclassify too often to use.
pub fn calibrate_group_threshold(
    ms: &MonitorSet,
    target: *const u8,
    lats: &LatencyProfile,
    helper: &HelperThread,
) -> i64 {
    const REPEAT: usize = 500;
    let lines = ms.set.line_ptrs();
    let mut idle: Vec<i64> = Vec::with_capacity(REPEAT);
    let mut touched: Vec<i64> = Vec::with_capacity(REPEAT);

    while idle.len() < REPEAT {
        let (_, a1) = rdtscp_aux();
        flush_lines(&lines);
        lfence();
        prime_set(ms, 0, helper);
        lfence();

        let begin = timer_start();
        crate::timing::access_lines_backward(&lines);
        let (end, a2) = rdtscp_aux();
        if a1 == a2 {
            idle.push((end - begin) as i64);
        }
    }

    while touched.len() < REPEAT {
        let (_, a1) = rdtscp_aux();
        // SAFETY: target is a live line supplied by the caller.
        unsafe { crate::timing::flush_line(target) };
        flush_lines(&lines);
        lfence();
        prime_set(ms, 0, helper);
        lfence();
        // SAFETY: as above.
        unsafe { crate::timing::read_line(target) };
        helper.read_one(target);

        let begin = timer_start();
        access_lines(&lines);
        let (end, a2) = rdtscp_aux();
        if a1 == a2 {
            touched.push((end - begin) as i64);
        }
    }

    let idle_med = crate::latency::median(&mut idle);
    let touched_med = crate::latency::median(&mut touched);
    let threshold = (idle_med + touched_med) / 2;

    let over = idle.iter().filter(|&&l| l > threshold).count();
    let under = touched.iter().filter(|&&l| l < threshold).count();
    log::info!(
        "group threshold: idle {idle_med} | touched {touched_med} | threshold {threshold} | OTC {over} | UTC {under}"
    );
    if over > REPEAT * 5 / 100 || under > REPEAT * 5 / 100 {
        return 0;
    }
    threshold
}

/// Eviction-activity stream: watch one set and record the cycle gaps
/// between externally caused evictions.
///
/// The set is re-primed every time the whole-set probe exceeds the group
/// threshold; records contaminated by a core switch trigger a re-prime but
/// no sample.
pub fn activity_stream(
    ms: &MonitorSet,
    threshold: u64,
    lats: &LatencyProfile,
    helper: &HelperThread,
    max_records: usize,
) -> Vec<u32> {
    let lines = ms.set.line_ptrs();
    let mut timestamps: Vec<u64> = Vec::with_capacity(max_records);

    let (_, mut last_aux) = rdtscp_aux();
    prime_set(ms, threshold, helper);

    while timestamps.len() < max_records {
        let begin = timer_start();
        access_lines(&lines);
        let (end, aux) = rdtscp_aux();
        let switched = aux != last_aux;
        if end - begin > threshold || switched {
            if !switched {
                timestamps.push(end);
            }
            prime_set(ms, threshold, helper);
            last_aux = aux;
        }
    }

    timestamps
        .windows(2)
        .map(|w| (w[1] - w[0]) as u32)
        .collect()
}

/// Prime/probe cost self-test.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PerfReport {
    pub prime_us_avg: f64,
    pub probe_us_avg: f64,
    pub iters: u32,
}

pub fn perf_prime_probe(
    ctx: &CoreContext,
    ms: &MonitorSet,
    helper: &HelperThread,
) -> Result<PerfReport, PlatformError> {
    let freq = crate::timing::cpu_freq_hz().ok_or(PlatformError::UnknownCpuFrequency)?;
    let cycles_per_us = (freq / 1_000_000).max(1) as f64;
    let lines = ms.set.line_ptrs();

    let mut prime_total = 0u64;
    let mut probe_total = 0u64;
    for _ in 0..PERF_PP_ITERS {
        flush_lines(&lines);
        let begin = rdtsc();
        prime_set(ms, ctx.lats.thr_l3, helper);
        prime_total += rdtsc() - begin;

        let begin = rdtsc();
        let _ = probe_set(&lines, &ctx.lats);
        probe_total += rdtsc() - begin;
    }

    Ok(PerfReport {
        prime_us_avg: prime_total as f64 / PERF_PP_ITERS as f64 / cycles_per_us,
        probe_us_avg: probe_total as f64 / PERF_PP_ITERS as f64 / cycles_per_us,
        iters: PERF_PP_ITERS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // EWMA
    // -----------------------------------------------------------------------

    #[test]
    fn ewma_first_sample_passes_through() {
        let mut e = Ewma::new(0.85, 0.85);
        assert_eq!(e.update(0.5), 0.5);
        assert_eq!(e.value(), Some(0.5));
    }

    #[test]
    fn ewma_uses_rise_and_fall_alphas() {
        let mut e = Ewma::new(0.9, 0.5);
        e.update(0.5);
        // Rising: heavy old weight, slow rise.
        let up = e.update(1.0);
        assert!((up - (0.9 * 0.5 + 0.1 * 1.0)).abs() < 1e-9);
        // Falling: light old weight, fast fall.
        let down = e.update(0.0);
        assert!((down - 0.5 * up).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // LCAS levels and hysteresis
    // -----------------------------------------------------------------------

    #[test]
    fn level_buckets() {
        assert_eq!(lcas_level(0.0), 0);
        assert_eq!(lcas_level(0.399), 0);
        assert_eq!(lcas_level(0.40), 1);
        assert_eq!(lcas_level(0.649), 1);
        assert_eq!(lcas_level(0.65), 2);
        assert_eq!(lcas_level(0.85), 3);
        assert_eq!(lcas_level(1.0), 3);
    }

    #[test]
    fn tracker_publishes_on_first_distinct_scan() {
        let mut t = LcasTracker::new();
        let d = t.observe(&[(0, 0.2), (1, 0.9)]);
        assert_eq!(d, LcasDecision::Publish(vec![0, 1]));
    }

    #[test]
    fn tracker_no_preference_when_levels_match() {
        let mut t = LcasTracker::new();
        let d = t.observe(&[(0, 0.40), (1, 0.60)]); // both level 1
        assert_eq!(d, LcasDecision::NoPreference);
    }

    #[test]
    fn tracker_requires_three_consecutive_scans() {
        let mut t = LcasTracker::new();
        // Socket 1 starts coldest.
        assert_eq!(
            t.observe(&[(0, 0.9), (1, 0.2)]),
            LcasDecision::Publish(vec![1, 0])
        );

        // Socket 0 drops to level 0; the incumbent stays published for two
        // more scans.
        assert_eq!(
            t.observe(&[(0, 0.1), (1, 0.5)]),
            LcasDecision::Keep(vec![1, 0])
        );
        assert_eq!(
            t.observe(&[(0, 0.1), (1, 0.5)]),
            LcasDecision::Keep(vec![1, 0])
        );
        // Third consecutive observation flips it.
        assert_eq!(
            t.observe(&[(0, 0.1), (1, 0.5)]),
            LcasDecision::Publish(vec![0, 1])
        );
    }

    #[test]
    fn tracker_oscillation_never_flips() {
        // The candidate alternates every scan, so the streak never reaches 3.
        let mut t = LcasTracker::new();
        assert_eq!(
            t.observe(&[(0, 0.9), (1, 0.2)]),
            LcasDecision::Publish(vec![1, 0])
        );
        for _ in 0..5 {
            let a = t.observe(&[(0, 0.1), (1, 0.5)]);
            assert!(matches!(a, LcasDecision::Keep(_)));
            let b = t.observe(&[(0, 0.9), (1, 0.2)]);
            assert!(matches!(b, LcasDecision::Keep(_)));
        }
    }

    #[test]
    fn tracker_resets_on_no_preference() {
        let mut t = LcasTracker::new();
        t.observe(&[(0, 0.9), (1, 0.2)]);
        t.observe(&[(0, 0.1), (1, 0.5)]);
        t.observe(&[(0, 0.1), (1, 0.5)]);
        // Levels equalize: preference cleared, streak gone.
        assert_eq!(
            t.observe(&[(0, 0.5), (1, 0.5)]),
            LcasDecision::NoPreference
        );
        // The next distinct scan publishes immediately (incumbent cleared).
        assert_eq!(
            t.observe(&[(0, 0.1), (1, 0.5)]),
            LcasDecision::Publish(vec![0, 1])
        );
    }

    // -----------------------------------------------------------------------
    // Adaptive wait
    // -----------------------------------------------------------------------

    #[test]
    fn adaptive_wait_shrinks_after_two_saturated_rounds() {
        let mut w = AdaptiveWait::new(7000, false);
        assert_eq!(w.update(&[0.96, 0.97]), 7000);
        assert_eq!(w.update(&[0.96, 0.97]), 6000);
        // Counter reset after the shrink.
        assert_eq!(w.update(&[0.96, 0.97]), 6000);
        assert_eq!(w.update(&[0.96, 0.97]), 5000);
    }

    #[test]
    fn adaptive_wait_bounces_back_when_cold() {
        let mut w = AdaptiveWait::new(7000, false);
        w.update(&[0.96, 0.97]);
        w.update(&[0.96, 0.97]);
        assert_eq!(w.current_us, 6000);
        assert_eq!(w.update(&[0.1, 0.2]), 7000);
    }

    #[test]
    fn adaptive_wait_fixed_never_moves() {
        let mut w = AdaptiveWait::new(7000, true);
        for _ in 0..10 {
            assert_eq!(w.update(&[0.99, 0.99]), 7000);
        }
    }

    #[test]
    fn adaptive_wait_partial_saturation_resets_counter() {
        let mut w = AdaptiveWait::new(7000, false);
        w.update(&[0.96, 0.96]);
        w.update(&[0.96, 0.5]); // breaks the streak (and not all cold)
        assert_eq!(w.update(&[0.96, 0.96]), 7000);
        assert_eq!(w.update(&[0.96, 0.96]), 6000);
    }

    #[test]
    fn adaptive_wait_floors_at_one_ms() {
        let mut w = AdaptiveWait::new(1500, false);
        for _ in 0..20 {
            w.update(&[0.99]);
        }
        // 1500 -> 500 would cross the floor; shrinking stops at <= 1000.
        assert!(w.current_us >= 500);
        assert!(w.current_us <= 1500);
    }

    // -----------------------------------------------------------------------
    // Heatmap bookkeeping
    // -----------------------------------------------------------------------

    #[test]
    fn heatmap_percentage_math() {
        let h = HeatmapData {
            time_step_us: 100,
            max_time_us: 200,
            n_ways: 2,
            counts: vec![vec![8, 2, 0], vec![0, 5, 5]],
            avg_per_slot: vec![0.2, 1.5],
            samples_per_slot: vec![10, 10],
        };
        assert_eq!(h.n_slots(), 2);
        assert!((h.percentage(0, 0) - 80.0).abs() < 1e-9);
        assert!((h.percentage(1, 2) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn heatmap_empty_sets_is_empty() {
        let ctx = crate::context::test_support::skx_context();
        let h = occupancy_heatmap(&ctx, &[], HeatmapOptions::default()).unwrap();
        assert_eq!(h.n_slots(), 0);
        assert_eq!(h.n_ways, 0);
    }

    // -----------------------------------------------------------------------
    // Round math
    // -----------------------------------------------------------------------

    #[test]
    fn round_rate_normalizes_by_lines() {
        let groups: Vec<ColorGroup> = Vec::new();
        let stats = RoundStats {
            evictions: vec![],
            prime_us: 0,
            probe_us: 0,
        };
        assert_eq!(round_rate(&groups, &stats, 11), 0.0);
    }

    #[test]
    #[ignore] // Hardware-dependent: needs built sets and a busy neighbor
    fn heatmap_fills_and_rate_takes_off() {
        use crate::build::{build_l2_color_sets, build_single_llc_set};
        use crate::context::CoreContext;

        let ctx = CoreContext::probe(Default::default()).unwrap();
        let helper = HelperThread::start().unwrap();
        let (set, _) = build_single_llc_set(&ctx, &helper).unwrap().unwrap();
        let l2 = build_l2_color_sets(&ctx, 1).unwrap().unwrap();
        let ms = MonitorSet {
            set,
            lower: l2.at(0, 0).clone(),
        };
        drop(helper);

        let data = occupancy_heatmap(
            &ctx,
            &[ms.clone()],
            HeatmapOptions {
                time_step_us: 1000,
                max_time_us: 7000,
            },
        )
        .unwrap();
        // Longer waits leave more room for foreign evictions: average at the
        // largest wait must not fall below the zero-wait average.
        assert!(data.avg_per_slot[data.n_slots() - 1] >= data.avg_per_slot[0]);

        let groups = vec![ColorGroup {
            color: 0,
            sets: vec![ms],
        }];
        let sweep = rate_vs_wait(
            &ctx,
            &groups,
            HeatmapOptions {
                time_step_us: 100,
                max_time_us: 7000,
            },
        )
        .unwrap();
        // Takeoff: the first slot with a >10% rate sits within 3x prime time.
        if let Some(&(us, _)) = sweep.points.iter().find(|&&(_, r)| r > 0.10) {
            assert!(us < sweep.prime_time_us.max(100) * 3 + 7000);
        }
    }
}
