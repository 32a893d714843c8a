//! # llcscope-core
//!
//! **Build and exercise LLC eviction sets from inside a guest VM.**
//!
//! On Xeon Scalable hosts the guest sees neither host-physical addresses
//! nor the LLC slice hash, so congruent cache lines cannot be computed —
//! they have to be *discovered*, with nothing but user-space virtual
//! memory and a cycle counter. This crate does that discovery and then
//! uses the result to watch the shared LLC.
//!
//! ## Quick start
//!
//! ```no_run
//! use llcscope_core::{CoreContext, CoreParams, HelperThread, build_single_llc_set};
//!
//! let ctx = CoreContext::probe(CoreParams::default()).unwrap();
//! let helper = HelperThread::start().unwrap();
//! if let Some((set, _l2)) = build_single_llc_set(&ctx, &helper).unwrap() {
//!     println!("eviction set of {} lines", set.len());
//! }
//! ```
//!
//! ## Pipeline
//!
//! geometry + latencies → candidate arena → L2 color sets → L2 filter →
//! binary-search pruning (per offset × color, on main/helper pairs) →
//! prime/probe monitoring (rates, heatmaps, EWMA hotness, LCAS hints).
//!
//! The whole pipeline is driven through a [`CoreContext`] built once at
//! startup; there are no process-wide singletons. The CLIs, the kernel
//! modules that provide the address oracles, and the vCPU topology prober
//! are external collaborators — this crate only defines the interfaces it
//! consumes ([`topology::TopologyProbe`], [`oracle`], [`lcas_sink`]).

pub mod arena;
pub mod build;
pub mod cache;
pub mod config;
pub mod context;
pub mod datafile;
pub mod diag;
pub mod error;
pub mod evset;
pub mod helper;
pub mod latency;
pub mod lcas_sink;
pub mod monitor;
pub mod oracle;
pub mod parallel;
pub mod slice;
pub mod timing;
pub mod topology;

pub use arena::{Arena, CandidateView, LineHandle};
pub use build::{L2ColorSets, build_l2_color_sets, build_llc_sets_at, build_single_llc_set, filter_candidates};
pub use cache::{CacheGeometry, CacheHierarchy, CacheLevel};
pub use config::{BuildConfig, FilterMode};
pub use context::{CoreContext, CoreParams};
pub use error::{ConfigError, Error, PlatformError, ResourceError};
pub use evset::{EvSet, TestEnv, test_eviction};
pub use helper::HelperThread;
pub use latency::LatencyProfile;
pub use lcas_sink::{FileLcasSink, LcasSink};
pub use monitor::{
    AdaptiveWait, ColorGroup, Ewma, HeatmapOptions, LcasOptions, LcasTracker, MonitorSet,
};
pub use parallel::{BuildPlan, BuildReport, PinPolicy, SetTable, build_llc_table};
pub use topology::{CpuRelation, CpuTopology, TopologyProbe, VcpuPair};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
