//! Per-level latency calibration and the thresholds derived from it.
//!
//! Every trial is bracketed by a pair of rdtscp reads; a changed aux word
//! means the OS moved or interrupted us mid-sample and the trial is thrown
//! away. DRAM is measured first because its latency seeds the interrupt
//! threshold used to reject outliers everywhere else.

use crate::cache::{CacheHierarchy, CacheLevel, PAGE_SIZE};
use crate::error::PlatformError;
use crate::timing::{
    access_stride, flush_line, lfence, mfence, rdtscp_aux, read_line, time_access,
};

/// Default repetitions per level.
pub const DEFAULT_LATENCY_REPS: u32 = 350;

/// Median hit latencies plus the decision thresholds built from them.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LatencyProfile {
    pub l1d: u64,
    pub l2: u64,
    pub l3: u64,
    pub dram: u64,

    pub thr_l1d: u64,
    pub thr_l2: u64,
    pub thr_l3: u64,
    /// Samples above this saw a context switch or SMI; discard them.
    pub interrupt: u64,
}

impl LatencyProfile {
    /// Hit/miss split point. The 3:2 weighting with a 4.6 divisor sits the
    /// threshold below the midpoint, which has fewer edge cases than an even
    /// split on the measured platforms.
    pub fn hit_threshold(hit: u64, miss: u64) -> u64 {
        ((3 * hit + 2 * miss) as f64 / 4.6) as u64
    }

    /// The latency ordering every downstream measurement depends on.
    pub fn plausible(&self) -> bool {
        self.l1d < self.l2
            && self.l2 < self.l3
            && self.l3 < self.dram
            && (self.l3 as f64) < self.dram as f64 * 0.8
    }

    /// Assemble thresholds from raw medians, applying the fallback
    /// corrections for abnormal orderings.
    fn from_medians(l1d: u64, mut l2: u64, mut l3: u64, dram: u64) -> Self {
        if l2 <= l1d {
            l2 = (l1d as f64 * 1.2) as u64;
        }
        if (l3 as f64) <= l2 as f64 * 1.15 {
            l3 = (l2 as f64 * 1.8) as u64;
        }

        let mut thr_l3 = Self::hit_threshold(l3, dram);
        if thr_l3 as f64 > l3 as f64 * 2.5 {
            thr_l3 = l3 * 2; // extreme DRAM latency would overshoot
        }

        Self {
            l1d,
            l2,
            l3,
            dram,
            thr_l1d: Self::hit_threshold(l1d, l2),
            thr_l2: Self::hit_threshold(l2, l3),
            thr_l3,
            interrupt: dram * 5,
        }
    }

    /// Run the full calibration. Fatal when the DRAM or L3 measurement stays
    /// noisy after its retries or the final ordering is implausible.
    pub fn calibrate(hier: &CacheHierarchy, reps: u32) -> Result<Self, PlatformError> {
        let reps = reps.max(16);
        let dram = measure_dram(reps)?;
        let interrupt = dram * 5;
        let l1d = measure_l1d(reps);
        let l2 = measure_l2(hier, reps, interrupt)?;
        let l3 = measure_l3(hier, reps, interrupt, dram)?;

        let profile = Self::from_medians(l1d, l2, l3, dram);
        if !profile.plausible() {
            return Err(PlatformError::LatencyOrder {
                l1d: profile.l1d,
                l2: profile.l2,
                l3: profile.l3,
                dram: profile.dram,
            });
        }
        log::info!(
            "latencies: L1d {} | L2 {} | L3 {} | DRAM {} (thresholds {}/{}/{}, interrupt {})",
            profile.l1d,
            profile.l2,
            profile.l3,
            profile.dram,
            profile.thr_l1d,
            profile.thr_l2,
            profile.thr_l3,
            profile.interrupt
        );
        Ok(profile)
    }

    /// A synthetic profile for tests and dry runs.
    pub fn synthetic(l1d: u64, l2: u64, l3: u64, dram: u64) -> Self {
        Self::from_medians(l1d, l2, l3, dram)
    }

    pub fn threshold_for(&self, level: CacheLevel) -> u64 {
        match level {
            CacheLevel::L1d => self.thr_l1d,
            CacheLevel::L2 => self.thr_l2,
            CacheLevel::L3 => self.thr_l3,
        }
    }
}

/// Median of a sample set. Sorts in place.
pub fn median(samples: &mut [i64]) -> i64 {
    match samples.len() {
        0 => -1,
        1 => samples[0],
        n => {
            samples.sort_unstable();
            if n % 2 == 1 {
                samples[n / 2]
            } else {
                (samples[n / 2] + samples[n / 2 - 1]) / 2
            }
        }
    }
}

/// Smallest value that accounts for at least 5 % of the valid samples,
/// after dropping zeros and anything above `max_ways`. Falls back to the
/// median of the cleaned samples. Used for the minimal-evset-size summary,
/// where the mode of the small cluster is more honest than a mean skewed by
/// failed builds.
pub fn min_cluster(samples: &[i64], max_ways: u32) -> i64 {
    let mut cleaned: Vec<i64> = samples
        .iter()
        .copied()
        .filter(|&v| v > 0 && v <= max_ways as i64)
        .collect();
    if cleaned.is_empty() {
        return -1;
    }
    cleaned.sort_unstable();

    let min_freq = cleaned.len() * 5 / 100;
    let mut best = -1i64;
    let mut i = 0;
    while i < cleaned.len() {
        let v = cleaned[i];
        let mut j = i;
        while j < cleaned.len() && cleaned[j] == v {
            j += 1;
        }
        if j - i >= min_freq.max(1) && (best == -1 || v < best) {
            best = v;
        }
        i = j;
    }

    if best == -1 {
        let n = cleaned.len();
        if n % 2 == 1 {
            cleaned[n / 2]
        } else {
            (cleaned[n / 2] + cleaned[n / 2 - 1]) / 2
        }
    } else {
        best
    }
}

fn measure_dram(reps: u32) -> Result<u64, PlatformError> {
    let target = vec![0u8; 64];
    let mut accepted: Vec<i64> = Vec::with_capacity(reps as usize);

    for _ in 0..reps {
        let (_, a1) = rdtscp_aux();
        // SAFETY: target is live for the whole loop.
        unsafe {
            flush_line(target.as_ptr());
            let lat = time_access(target.as_ptr());
            let (_, a2) = rdtscp_aux();
            if a1 == a2 {
                accepted.push(lat as i64);
            }
        }
    }

    if accepted.len() <= reps as usize / 2 {
        return Err(PlatformError::NoisyLatency {
            level: CacheLevel::L3, // DRAM rides the same probe path
            attempts: 1,
        });
    }
    Ok(median(&mut accepted) as u64)
}

fn measure_l1d(reps: u32) -> u64 {
    let mut target = vec![0u8; 64];
    let mut samples: Vec<i64> = Vec::with_capacity(reps as usize);
    for _ in 0..reps {
        target[0] = 1;
        // SAFETY: target is live.
        let lat = unsafe { time_access(target.as_ptr()) };
        samples.push(lat as i64);
    }
    median(&mut samples) as u64
}

/// Walk a page-strided eviction buffer big enough to push the previous
/// target out of the level under the one being measured, rotating through 16
/// in-page offsets so the TLB entry for the target page stays warm without
/// the walk hitting the target's own set every time.
fn measure_pressured(
    ev_lines: usize,
    reps: u32,
    interrupt: u64,
    extra_reject: Option<u64>,
) -> Option<u64> {
    let buf = vec![0u8; (ev_lines + 2) * PAGE_SIZE];
    let base = buf.as_ptr();
    let page = ((base as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)) as *const u8;

    let offsets_per_page = 16u32;
    let offset_step = PAGE_SIZE / offsets_per_page as usize;
    let mut accepted: Vec<i64> = Vec::with_capacity(reps as usize);

    for i in 0..reps {
        let idx = ((i / (reps / offsets_per_page).max(1)) % offsets_per_page) as usize;
        // SAFETY: page..page+PAGE_SIZE and the ev_lines pages after the
        // target all live inside buf (ev_lines + 2 pages were allocated and
        // the aligned page consumed at most one of the two spare pages).
        unsafe {
            let target = page.add(idx * offset_step);
            let tlb_warm = page.add(((idx + 1) % offsets_per_page as usize) * offset_step);
            let ev_start = target.add(PAGE_SIZE);

            let (_, a1) = rdtscp_aux();
            std::ptr::write_volatile(target as *mut u8, 1);
            mfence();
            lfence();

            for _ in 0..5 {
                access_stride(ev_start, PAGE_SIZE, ev_lines);
            }

            lfence();
            read_line(tlb_warm);
            let lat = time_access(target);

            let (_, a2) = rdtscp_aux();
            let clean = a1 == a2
                && lat < interrupt
                && extra_reject.map(|cap| lat < cap).unwrap_or(true);
            if clean {
                accepted.push(lat as i64);
            }
        }
    }

    let quorum = if extra_reject.is_some() {
        reps as usize / 3 // the L3 probe gets more mercy
    } else {
        reps as usize / 2
    };
    if accepted.len() < quorum {
        return None;
    }
    Some(median(&mut accepted) as u64)
}

fn measure_l2(hier: &CacheHierarchy, reps: u32, interrupt: u64) -> Result<u64, PlatformError> {
    let ev_lines =
        3 * hier.l1d.ways as usize * (1usize << hier.l1d.unknown_sib.min(16)).max(1);
    measure_pressured(ev_lines, reps, interrupt, None).ok_or(PlatformError::NoisyLatency {
        level: CacheLevel::L2,
        attempts: 1,
    })
}

fn measure_l3(
    hier: &CacheHierarchy,
    reps: u32,
    interrupt: u64,
    dram: u64,
) -> Result<u64, PlatformError> {
    const MAX_ATTEMPTS: u32 = 3;
    let ev_lines = (2.5 * hier.l2.ways as f64 * hier.l2.uncertainty() as f64) as usize;
    let reject = dram * 8 / 10;

    for attempt in 0..MAX_ATTEMPTS {
        if let Some(lat) = measure_pressured(ev_lines, reps, interrupt, Some(reject)) {
            return Ok(lat);
        }
        log::warn!(
            "L3 latency attempt {}/{} too noisy, retrying",
            attempt + 1,
            MAX_ATTEMPTS
        );
    }
    Err(PlatformError::NoisyLatency {
        level: CacheLevel::L3,
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_odd_even_empty() {
        assert_eq!(median(&mut []), -1);
        assert_eq!(median(&mut [7]), 7);
        assert_eq!(median(&mut [3, 1, 2]), 2);
        assert_eq!(median(&mut [4, 1, 3, 2]), 2); // (2+3)/2
    }

    #[test]
    fn min_cluster_prefers_smallest_frequent_value() {
        // 11 dominates but 10 clears the 5% bar and is smaller.
        let mut samples = vec![11i64; 40];
        samples.extend([10; 4]);
        assert_eq!(min_cluster(&samples, 16), 10);
    }

    #[test]
    fn min_cluster_drops_zeros_and_oversize() {
        let samples = vec![0, 0, 0, 12, 12, 12, 99, 99];
        assert_eq!(min_cluster(&samples, 16), 12);
        assert_eq!(min_cluster(&[0, 0, 99], 16), -1);
    }

    #[test]
    fn threshold_sits_between_hit_and_miss() {
        let thr = LatencyProfile::hit_threshold(40, 200);
        assert!(thr > 40 && thr < 200);
    }

    #[test]
    fn synthetic_profile_orders_and_derives() {
        let p = LatencyProfile::synthetic(4, 14, 44, 200);
        assert!(p.plausible());
        assert_eq!(p.interrupt, 1000);
        assert!(p.thr_l2 > p.l2 && p.thr_l2 < p.l3);
        assert!(p.thr_l3 > p.l3 && p.thr_l3 < p.dram);
    }

    #[test]
    fn abnormal_medians_are_corrected() {
        // L2 at or below L1d gets pushed up, L3 too close to L2 likewise.
        let p = LatencyProfile::synthetic(10, 10, 11, 300);
        assert!(p.l2 > p.l1d);
        assert!(p.l3 as f64 >= p.l2 as f64 * 1.8 - 1.0);
    }

    #[test]
    fn extreme_dram_caps_l3_threshold() {
        let p = LatencyProfile::synthetic(4, 14, 40, 100_000);
        assert!(p.thr_l3 <= p.l3 * 2);
    }

    #[test]
    fn implausible_profile_detected() {
        let p = LatencyProfile {
            l1d: 50,
            l2: 40,
            l3: 30,
            dram: 20,
            thr_l1d: 0,
            thr_l2: 0,
            thr_l3: 0,
            interrupt: 100,
        };
        assert!(!p.plausible());
    }

    #[test]
    #[ignore] // Hardware-dependent: full calibration on a real, quiet machine
    fn calibrate_orders_levels() {
        let hier = CacheHierarchy::probe(None).unwrap();
        let p = LatencyProfile::calibrate(&hier, DEFAULT_LATENCY_REPS).unwrap();
        assert!(p.l1d < p.l2 && p.l2 < p.l3 && p.l3 < p.dram);
        assert!((p.l3 as f64) < p.dram as f64 * 0.8);
    }
}
