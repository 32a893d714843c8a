//! Error taxonomy for the core library.
//!
//! Fatal conditions (platform probe failures, resource exhaustion) surface as
//! typed errors. Transient build failures do not: a build that cannot be
//! completed yields an empty cell and the caller moves on, so those paths
//! return `Option`/`bool` instead.

use crate::cache::CacheLevel;

/// Errors detected before any measurement starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Worker threads come in main/helper pairs.
    #[error("thread count must be even (or 0 for auto), got {0}")]
    OddThreadCount(u32),

    #[error("unsupported target cache level: {0}")]
    BadCacheLevel(String),

    #[error("granular mode requires at least one L2 color and one offset")]
    EmptyWorkSet,

    #[error("{0}")]
    Conflicting(String),
}

/// Platform probe failures. These are fatal: without trustworthy geometry and
/// latency constants every downstream measurement is meaningless.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// `line_bits + set_idx_bits < 12` — the whole set index would fit inside
    /// the page offset, which no supported cache level exhibits.
    #[error("{level} reports negative unknown set-index bits ({value})")]
    NegativeUnknownSib { level: CacheLevel, value: i32 },

    #[error("CPUID leaf 4 returned no descriptor for {level}")]
    MissingCacheDescriptor { level: CacheLevel },

    #[error("could not determine the CPU frequency from /proc/cpuinfo or sysfs")]
    UnknownCpuFrequency,

    #[error("too many context switches while measuring {level} latency (after {attempts} attempts)")]
    NoisyLatency { level: CacheLevel, attempts: u32 },

    /// The calibrated latencies do not order as L1d < L2 < L3 < DRAM with
    /// enough headroom between L3 and DRAM to tell them apart.
    #[error("implausible latency profile: l1d={l1d} l2={l2} l3={l3} dram={dram}")]
    LatencyOrder { l1d: u64, l2: u64, l3: u64, dram: u64 },

    #[error("this build only runs on x86-64 with rdtscp/clflushopt")]
    UnsupportedArch,
}

/// OS resource failures, fatal with a hint at the likely operator cause.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("mmap of {bytes} bytes failed: {source}")]
    Mmap {
        bytes: u64,
        source: std::io::Error,
    },

    #[error(
        "could not move the process into the high-priority cgroup: {source}\n\
         1) running as root?\n\
         2) has the hi_prgroup cgroup been created?"
    )]
    Cgroup { source: std::io::Error },

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: &'static str,
        source: std::io::Error,
    },
}

/// Umbrella error for fallible core entry points.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let e = PlatformError::NegativeUnknownSib {
            level: CacheLevel::L2,
            value: -1,
        };
        assert!(e.to_string().contains("L2"));
        assert!(e.to_string().contains("-1"));

        let e = ConfigError::OddThreadCount(5);
        assert!(e.to_string().contains('5'));
    }

    #[test]
    fn umbrella_converts() {
        fn fails() -> Result<(), Error> {
            Err(ConfigError::EmptyWorkSet)?
        }
        assert!(matches!(fails(), Err(Error::Config(_))));
    }
}
