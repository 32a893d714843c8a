//! [`CoreContext`]: the probed platform facts plus process-wide knobs,
//! constructed once at startup and passed by reference everywhere. There is
//! no global state in this crate.

use serde::Serialize;

use crate::cache::CacheHierarchy;
use crate::config::FilterMode;
use crate::error::PlatformError;
use crate::latency::{DEFAULT_LATENCY_REPS, LatencyProfile};
use crate::timing::online_cpus;

/// Operator-supplied knobs that shape a context.
#[derive(Debug, Clone, Serialize)]
pub struct CoreParams {
    /// Worker threads (main+helper counted separately); 0 = use every core.
    pub num_threads: u32,
    /// Candidate pool oversampling; `None` keeps the per-level default.
    pub cand_scale: Option<u32>,
    /// Override the derived LLC slice count.
    pub slice_override: Option<u32>,
    /// Candidate admission variant.
    pub filter_mode: FilterMode,
    /// Latency calibration repetitions.
    pub latency_reps: u32,
    /// Period of the topology re-probe in topology-aware runs, microseconds.
    pub vtop_interval_us: u64,
    /// Overall construction budget in minutes; 0 disables the limit.
    pub runtime_limit_min: u64,
}

impl Default for CoreParams {
    fn default() -> Self {
        Self {
            num_threads: 0,
            cand_scale: None,
            slice_override: None,
            filter_mode: FilterMode::Batch,
            latency_reps: DEFAULT_LATENCY_REPS,
            vtop_interval_us: 2_000_000,
            runtime_limit_min: 10,
        }
    }
}

/// Everything the build and monitoring layers need to know about the
/// platform, probed once.
#[derive(Debug, Clone)]
pub struct CoreContext {
    pub hier: CacheHierarchy,
    pub lats: LatencyProfile,
    pub params: CoreParams,
}

impl CoreContext {
    /// Probe geometry and calibrate latencies. Fatal on negative unknown
    /// SIBs, missing descriptors, or a latency profile that refuses to
    /// order itself.
    pub fn probe(params: CoreParams) -> Result<Self, PlatformError> {
        let hier = CacheHierarchy::probe(params.slice_override)?;
        let lats = LatencyProfile::calibrate(&hier, params.latency_reps)?;
        Ok(Self { hier, lats, params })
    }

    /// Assemble a context from parts; used by tests and by callers that
    /// already hold a calibration.
    pub fn from_parts(hier: CacheHierarchy, lats: LatencyProfile, params: CoreParams) -> Self {
        Self { hier, lats, params }
    }

    /// Main/helper pair budget: half the requested threads, or half the
    /// online CPUs when the request is 0.
    pub fn pair_budget(&self) -> u32 {
        let threads = if self.params.num_threads == 0 {
            online_cpus()
        } else {
            self.params.num_threads
        };
        (threads / 2).max(1)
    }

    /// Threads to throw at arena zero-fill.
    pub fn memset_threads(&self) -> u32 {
        if self.params.num_threads == 0 {
            online_cpus()
        } else {
            self.params.num_threads
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A Skylake-Xeon-shaped context with synthetic latencies, for tests
    /// that need geometry arithmetic without hardware.
    pub(crate) fn skx_context() -> CoreContext {
        let hier = CacheHierarchy::from_raw(
            (64, 8, 64),
            (64, 16, 1024),
            (64, 11, 20 * 2048),
            None,
        )
        .unwrap();
        let lats = LatencyProfile::synthetic(4, 14, 44, 200);
        CoreContext::from_parts(hier, lats, CoreParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params() {
        let p = CoreParams::default();
        assert_eq!(p.num_threads, 0);
        assert_eq!(p.vtop_interval_us, 2_000_000);
        assert_eq!(p.filter_mode, FilterMode::Batch);
    }

    #[test]
    fn pair_budget_halves_threads() {
        let mut ctx = test_support::skx_context();
        ctx.params.num_threads = 6;
        assert_eq!(ctx.pair_budget(), 3);
        ctx.params.num_threads = 2;
        assert_eq!(ctx.pair_budget(), 1);
    }

    #[test]
    fn pair_budget_auto_uses_half_the_cores() {
        let ctx = test_support::skx_context();
        assert_eq!(ctx.pair_budget(), (online_cpus() / 2).max(1));
    }
}
