//! Build configuration: every knob the eviction-test oracle and the pruning
//! algorithm consume, frozen at construction.
//!
//! A config never points at other sets or threads — filter sets, lower-level
//! sets and the helper handle travel as explicit arguments, so configs can be
//! cloned across workers freely.

use serde::Serialize;

use crate::latency::LatencyProfile;

/// How candidates are admitted against the L2 filter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterMode {
    /// Measure `ways − 1` candidates per filter-set traversal. Fast and
    /// reliable on Skylake/Cascade Lake class parts.
    Batch,
    /// One candidate per traversal. Slower, for platforms where the batch
    /// variant is noisy (Ice Lake, very large LLCs).
    Sequential,
}

/// Immutable build/test configuration for one cache level.
#[derive(Debug, Clone, Serialize)]
pub struct BuildConfig {
    /// Candidate pool oversampling factor.
    pub cand_scale: u32,

    /// Latency at or above which a reload counts as a miss.
    pub lat_thresh: u64,
    /// Oracle iterations per test call.
    pub trials: u32,
    pub low_bnd: u32,
    /// Misses needed within `trials` for an "evicted" verdict.
    pub upp_bnd: u32,
    pub test_scale: u32,
    /// Traversal repetitions per prime.
    pub ev_repeat: u32,
    /// Target loads per trial before priming.
    pub access_cnt: u32,
    /// Blocked-prime window; 0 selects a plain backward sweep.
    pub block: u32,
    /// Blocked-prime stride; ignored when `block` is 0.
    pub stride: u32,

    /// Fresh-target retries for a single set build.
    pub n_retries: u32,
    /// Whole-procedure retries (reallocate and start over).
    pub max_whole_ret: u32,

    /// `ev_cap = cap_scaling · ways`.
    pub cap_scaling: u32,
    pub verify_retry: u32,
    /// Wall-clock bound on the verify/retry loop, in milliseconds.
    pub retry_timeout_ms: u64,
    pub max_backtrack: u32,
    /// Allowed surplus lines in a verified LLC set.
    pub slack: u32,
    /// Extra congruent lines demanded before the verify step.
    pub extra_cong: u32,

    /// Drive the target through the helper so the line is in the shared LLC
    /// before priming.
    pub use_helper: bool,
    /// Flush the candidate pool at the top of each trial.
    pub flush_cands: bool,
    /// Delegate the whole candidate traversal to the helper.
    pub foreign_evictor: bool,

    pub filter_mode: FilterMode,
}

impl BuildConfig {
    /// Defaults for building L2 sets: tight bounds, many cheap trials, no
    /// helper involvement.
    pub fn for_l2(lats: &LatencyProfile, cand_scale: Option<u32>) -> Self {
        Self {
            cand_scale: cand_scale.unwrap_or(3),
            lat_thresh: lats.thr_l2,
            trials: 9,
            low_bnd: 3,
            upp_bnd: 6,
            test_scale: 1,
            ev_repeat: 4,
            access_cnt: 3,
            block: 0,
            stride: 0,
            n_retries: 10,
            max_whole_ret: 10,
            cap_scaling: 2,
            verify_retry: 5,
            retry_timeout_ms: 20,
            max_backtrack: 20,
            slack: 0,
            extra_cong: 0,
            use_helper: false,
            flush_cands: false,
            foreign_evictor: false,
            filter_mode: FilterMode::Batch,
        }
    }

    /// Defaults for building LLC sets: few trials (each is expensive),
    /// helper attached, blocked 24/12 prime, slack of 2.
    pub fn for_llc(lats: &LatencyProfile, cand_scale: Option<u32>) -> Self {
        Self {
            cand_scale: cand_scale.unwrap_or(3),
            lat_thresh: lats.thr_l3,
            trials: 4,
            low_bnd: 2,
            upp_bnd: 2,
            test_scale: 1,
            ev_repeat: 1,
            access_cnt: 1,
            block: 24,
            stride: 12,
            n_retries: 10,
            max_whole_ret: 5,
            cap_scaling: 2,
            verify_retry: 10,
            retry_timeout_ms: 1000,
            max_backtrack: 20,
            slack: 2,
            extra_cong: 0,
            use_helper: true,
            flush_cands: false,
            foreign_evictor: false,
            filter_mode: FilterMode::Batch,
        }
    }

    /// Effective trial count and bounds with `test_scale` applied.
    pub fn scaled_bounds(&self) -> (u32, u32) {
        if self.test_scale > 1 {
            (self.trials * self.test_scale, self.upp_bnd * self.test_scale)
        } else {
            (self.trials, self.upp_bnd)
        }
    }

    pub fn with_filter_mode(mut self, mode: FilterMode) -> Self {
        self.filter_mode = mode;
        self
    }

    pub fn with_cand_scale(mut self, scale: u32) -> Self {
        self.cand_scale = scale.max(1);
        self
    }

    pub fn with_slack(mut self, slack: u32) -> Self {
        self.slack = slack;
        self
    }

    pub fn with_retry_timeout_ms(mut self, ms: u64) -> Self {
        self.retry_timeout_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lats() -> LatencyProfile {
        LatencyProfile::synthetic(4, 14, 44, 200)
    }

    #[test]
    fn l2_defaults() {
        let c = BuildConfig::for_l2(&lats(), None);
        assert_eq!(c.cand_scale, 3);
        assert_eq!(c.lat_thresh, lats().thr_l2);
        assert_eq!((c.trials, c.upp_bnd), (9, 6));
        assert!(!c.use_helper);
        assert_eq!(c.slack, 0);
        assert_eq!(c.block, 0); // plain backward sweep
    }

    #[test]
    fn llc_defaults() {
        let c = BuildConfig::for_llc(&lats(), Some(5));
        assert_eq!(c.cand_scale, 5);
        assert_eq!(c.lat_thresh, lats().thr_l3);
        assert!(c.use_helper);
        assert_eq!((c.block, c.stride), (24, 12));
        assert_eq!(c.slack, 2);
        assert_eq!(c.retry_timeout_ms, 1000);
    }

    #[test]
    fn scaled_bounds_multiply() {
        let mut c = BuildConfig::for_l2(&lats(), None);
        assert_eq!(c.scaled_bounds(), (9, 6));
        c.test_scale = 3;
        assert_eq!(c.scaled_bounds(), (27, 18));
    }

    #[test]
    fn builder_overrides() {
        let c = BuildConfig::for_llc(&lats(), None)
            .with_filter_mode(FilterMode::Sequential)
            .with_slack(3)
            .with_cand_scale(0);
        assert_eq!(c.filter_mode, FilterMode::Sequential);
        assert_eq!(c.slack, 3);
        assert_eq!(c.cand_scale, 1); // clamped
    }
}
