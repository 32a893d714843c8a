//! Cache geometry: what the CPU says about its hierarchy, and which set-index
//! bits a user-space virtual address actually controls.
//!
//! On 4 KiB pages the low 12 address bits survive virtualization untouched.
//! Set-index bits above them ("unknown SIB") plus the slice hash are the part
//! the eviction-set machinery has to discover empirically; everything in this
//! module is bookkeeping around that split.

use serde::Serialize;

use crate::error::PlatformError;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const LINE_SIZE: usize = 64;
/// Cache-line offsets within one page.
pub const OFFSETS_PER_PAGE: u32 = (PAGE_SIZE / LINE_SIZE) as u32;

/// Sets per LLC slice on Xeon Scalable parts. Platform data, not an
/// invariant: `CoreParams::slice_override` replaces the derived slice count
/// when an operator knows better.
pub const SETS_PER_SLICE: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheLevel {
    L1d,
    L2,
    L3,
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::L1d => write!(f, "L1d"),
            Self::L2 => write!(f, "L2"),
            Self::L3 => write!(f, "L3"),
        }
    }
}

/// Geometry of one cache level. Sizes in bytes; for L3 `sets` counts the sum
/// across slices while `set_idx_bits` indexes within a single slice.
#[derive(Debug, Clone, Serialize)]
pub struct CacheGeometry {
    pub level: CacheLevel,
    pub line_size: u32,
    pub line_bits: u32,
    pub sets: u32,
    pub sets_per_slice: u32,
    pub set_idx_bits: u32,
    pub ways: u32,
    pub slices: u32,
    pub size: u64,
    /// Set-index bits outside the 4 KiB page offset.
    pub unknown_sib: u32,
}

impl CacheGeometry {
    fn derive(
        level: CacheLevel,
        line_size: u32,
        ways: u32,
        sets: u32,
        slices: u32,
        sets_per_slice: u32,
    ) -> Result<Self, PlatformError> {
        let line_bits = log2_ceil(line_size as u64);
        let set_idx_bits = log2_ceil(sets_per_slice as u64);
        let unknown = line_bits as i32 + set_idx_bits as i32 - PAGE_SHIFT as i32;
        if unknown < 0 {
            return Err(PlatformError::NegativeUnknownSib {
                level,
                value: unknown,
            });
        }
        Ok(Self {
            level,
            line_size,
            line_bits,
            sets,
            sets_per_slice,
            set_idx_bits,
            ways,
            slices,
            size: line_size as u64 * ways as u64 * sets as u64,
            unknown_sib: unknown as u32,
        })
    }

    /// Number of distinct (hidden-set-bits × slice) combinations an address at
    /// a fixed page offset can land in. This is the candidate-pool
    /// oversampling factor.
    pub fn uncertainty(&self) -> u64 {
        let ctrl_set_bits = PAGE_SHIFT.saturating_sub(self.line_bits);
        if ctrl_set_bits >= self.set_idx_bits {
            self.slices as u64
        } else {
            (1u64 << (self.set_idx_bits - ctrl_set_bits)) * self.slices as u64
        }
    }

    /// Full set index of a physical address within one slice.
    pub fn set_index_of(&self, addr: u64) -> u32 {
        read_bit_range(
            addr,
            (self.line_bits + self.set_idx_bits) as u16,
            self.line_bits as u16,
        ) as u32
    }

    /// Color: the unknown-SIB value of a physical address. Zero when every
    /// set bit is page-controlled.
    pub fn color_of(&self, addr: u64) -> u32 {
        if self.unknown_sib == 0 {
            return 0;
        }
        let end = (self.line_bits + self.set_idx_bits) as u16;
        read_bit_range(addr, end, end - self.unknown_sib as u16) as u32
    }

    /// Distance in bytes between two lines mapping to the same set (ignoring
    /// the slice hash).
    pub fn same_set_stride(&self) -> usize {
        1usize << (self.line_bits + self.set_idx_bits)
    }
}

/// The three probed levels, bundled.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHierarchy {
    pub l1d: CacheGeometry,
    pub l2: CacheGeometry,
    pub l3: CacheGeometry,
    /// Whether the L3 slice count came from `SETS_PER_SLICE` heuristics
    /// rather than an operator override.
    pub slices_auto_detected: bool,
}

impl CacheHierarchy {
    /// Probe CPUID leaf 4 for L1d/L2/L3 and derive the slice split.
    ///
    /// The guest-visible vCPU count is routinely wrong about the host, but
    /// cloud hosts pass the physical cache descriptors through, so
    /// `total_l3_sets / SETS_PER_SLICE` is the working heuristic for the
    /// host slice count. `slice_override` replaces it when set.
    pub fn probe(slice_override: Option<u32>) -> Result<Self, PlatformError> {
        let l1 = cpuid_cache_leaf(0).ok_or(PlatformError::MissingCacheDescriptor {
            level: CacheLevel::L1d,
        })?;
        let l2 = cpuid_cache_leaf(2).ok_or(PlatformError::MissingCacheDescriptor {
            level: CacheLevel::L2,
        })?;
        let l3 = cpuid_cache_leaf(3).ok_or(PlatformError::MissingCacheDescriptor {
            level: CacheLevel::L3,
        })?;
        Self::from_raw(l1, l2, l3, slice_override)
    }

    /// Build a hierarchy from raw (line_size, ways, sets) triples. Split out
    /// of `probe` so tests can model arbitrary platforms.
    pub fn from_raw(
        l1: (u32, u32, u32),
        l2: (u32, u32, u32),
        l3: (u32, u32, u32),
        slice_override: Option<u32>,
    ) -> Result<Self, PlatformError> {
        let l1d = CacheGeometry::derive(CacheLevel::L1d, l1.0, l1.1, l1.2, 1, l1.2)?;
        let l2g = CacheGeometry::derive(CacheLevel::L2, l2.0, l2.1, l2.2, 1, l2.2)?;

        let (slices, per_slice, auto) = match slice_override {
            Some(n) if n > 0 => (n, l3.2 / n, false),
            _ => (l3.2 / SETS_PER_SLICE, SETS_PER_SLICE, true),
        };
        let l3g = CacheGeometry::derive(CacheLevel::L3, l3.0, l3.1, l3.2, slices.max(1), per_slice)?;

        if auto {
            log::warn!(
                "auto-detected {} LLC slices from {} total sets; double-check against the host part",
                l3g.slices,
                l3g.sets
            );
        } else {
            log::info!("LLC slice count set to {} by override", l3g.slices);
        }

        Ok(Self {
            l1d,
            l2: l2g,
            l3: l3g,
            slices_auto_detected: auto,
        })
    }

    pub fn level(&self, level: CacheLevel) -> &CacheGeometry {
        match level {
            CacheLevel::L1d => &self.l1d,
            CacheLevel::L2 => &self.l2,
            CacheLevel::L3 => &self.l3,
        }
    }

    /// L2 colors a fixed page offset can map to.
    pub fn l2_colors(&self) -> u32 {
        self.l2.uncertainty() as u32
    }

    /// LLC sets reachable per L2 color: the L3 uncertainty divided by the
    /// L2's share of it.
    pub fn l3_sets_per_l2_color(&self) -> u64 {
        let l3u = self.l3.uncertainty().max(1);
        let l2u = self.l2.uncertainty().max(1);
        (l3u / l2u).max(1)
    }
}

/// (line_size, ways, sets) from CPUID.(EAX=4, ECX=subleaf), or None when the
/// subleaf describes no cache.
#[cfg(target_arch = "x86_64")]
fn cpuid_cache_leaf(subleaf: u32) -> Option<(u32, u32, u32)> {
    // SAFETY: __cpuid_count is available on every x86-64 target we build for.
    let r = unsafe { std::arch::x86_64::__cpuid_count(4, subleaf) };
    let cache_type = r.eax & 0x1f;
    if cache_type == 0 {
        return None;
    }
    let line_size = (r.ebx & 0xfff) + 1;
    let ways = ((r.ebx >> 22) & 0x3ff) + 1;
    let sets = r.ecx + 1;
    Some((line_size, ways, sets))
}

#[cfg(not(target_arch = "x86_64"))]
fn cpuid_cache_leaf(_subleaf: u32) -> Option<(u32, u32, u32)> {
    None
}

pub(crate) fn log2_ceil(v: u64) -> u32 {
    let mut cnt = 0;
    while (1u64 << cnt) < v {
        cnt += 1;
    }
    cnt
}

/// `data[start..end]`, end exclusive, counted from bit 0.
pub(crate) fn read_bit_range(data: u64, end: u16, start: u16) -> u64 {
    if end <= start {
        return 0;
    }
    let width = end - start;
    let mask = if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    (data >> start) & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Skylake-Xeon-like platform: 32K/8w L1d, 1M/16w L2, 20 slices of
    /// 2048-set 11-way L3.
    fn skx() -> CacheHierarchy {
        CacheHierarchy::from_raw(
            (64, 8, 64),
            (64, 16, 1024),
            (64, 11, 20 * 2048),
            None,
        )
        .unwrap()
    }

    #[test]
    fn skx_geometry_derivation() {
        let h = skx();
        assert_eq!(h.l1d.unknown_sib, 0);
        assert_eq!(h.l2.set_idx_bits, 10);
        assert_eq!(h.l2.unknown_sib, 4); // 6 + 10 - 12
        assert_eq!(h.l3.slices, 20);
        assert_eq!(h.l3.set_idx_bits, 11);
        assert_eq!(h.l3.unknown_sib, 5);
        assert!(h.slices_auto_detected);
    }

    #[test]
    fn uncertainty_counts_hidden_combinations() {
        let h = skx();
        assert_eq!(h.l1d.uncertainty(), 1);
        assert_eq!(h.l2.uncertainty(), 16); // 2^4
        assert_eq!(h.l3.uncertainty(), 32 * 20); // 2^5 * slices
        assert_eq!(h.l2_colors(), 16);
        assert_eq!(h.l3_sets_per_l2_color(), 40);
    }

    #[test]
    fn slice_override_changes_split() {
        let h = CacheHierarchy::from_raw(
            (64, 8, 64),
            (64, 16, 1024),
            (64, 11, 20 * 2048),
            Some(10),
        )
        .unwrap();
        assert_eq!(h.l3.slices, 10);
        assert_eq!(h.l3.sets_per_slice, 4096);
        assert_eq!(h.l3.set_idx_bits, 12);
        assert!(!h.slices_auto_detected);
    }

    #[test]
    fn tiny_cache_is_rejected() {
        // 16-set 64B-line cache: set index fits entirely in the page offset
        // minus two bits — unknown_sib would be negative.
        let err = CacheGeometry::derive(CacheLevel::L1d, 64, 2, 16, 1, 16).unwrap_err();
        assert!(matches!(
            err,
            PlatformError::NegativeUnknownSib { value: -2, .. }
        ));
    }

    #[test]
    fn set_index_and_color_extraction() {
        let h = skx();
        // L2: bits [6..16), color = bits [12..16)
        let addr = 0b1010_1100_1101_000000u64;
        assert_eq!(h.l2.set_index_of(addr), ((addr >> 6) & 0x3ff) as u32);
        assert_eq!(h.l2.color_of(addr), ((addr >> 12) & 0xf) as u32);
    }

    #[test]
    fn color_is_zero_without_hidden_bits() {
        let h = skx();
        assert_eq!(h.l1d.color_of(0xdead_beef), 0);
    }

    #[test]
    fn same_set_stride_matches_bits() {
        let h = skx();
        assert_eq!(h.l2.same_set_stride(), 1 << 16);
    }

    #[test]
    fn bit_range_edges() {
        assert_eq!(read_bit_range(0xff, 4, 0), 0xf);
        assert_eq!(read_bit_range(0xff, 4, 4), 0);
        assert_eq!(read_bit_range(u64::MAX, 64, 0), u64::MAX);
    }

    #[test]
    fn log2_ceil_basics() {
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(2), 1);
        assert_eq!(log2_ceil(3), 2);
        assert_eq!(log2_ceil(2048), 11);
    }

    #[test]
    #[ignore] // Hardware-dependent: requires x86-64 with CPUID leaf 4
    fn probe_real_cpu() {
        let h = CacheHierarchy::probe(None).unwrap();
        assert_eq!(h.l1d.line_size, 64);
        assert!(h.l2.sets >= h.l1d.sets);
        assert!(h.l3.size > h.l2.size);
    }
}
