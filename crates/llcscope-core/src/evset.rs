//! Eviction sets and the oracle that decides whether a set evicts a target.
//!
//! An [`EvSet`] owns no memory: it is a length-capped list of arena handles
//! at one page offset, plus the target it was built for. Shifting a set to
//! another cache-line offset preserves congruence because the low six bits
//! never participate in set selection above the line granularity.

use std::sync::Arc;

use crate::arena::{Arena, CandidateView, LineHandle};
use crate::cache::{CacheLevel, PAGE_SIZE};
use crate::config::BuildConfig;
use crate::helper::HelperThread;
use crate::latency::LatencyProfile;
use crate::timing::{
    access_lines_backward, flush_line, flush_lines, lfence, mfence, prime_blocked, read_line,
    time_access,
};

/// How the candidate pool gets traversed during a trial.
pub trait Traverser {
    fn traverse(&self, lines: &[*const u8], cfg: &BuildConfig);
}

/// The calling core does all the work: a blocked backward prime, or a plain
/// repeated backward sweep when the config carries no block geometry.
pub struct MainOnly;

impl Traverser for MainOnly {
    fn traverse(&self, lines: &[*const u8], cfg: &BuildConfig) {
        if cfg.block == 0 {
            for _ in 0..cfg.ev_repeat.max(1) {
                access_lines_backward(lines);
            }
        } else {
            prime_blocked(
                lines,
                cfg.ev_repeat as usize,
                cfg.stride as usize,
                cfg.block as usize,
            );
        }
    }
}

/// The helper primes from one end while the calling core primes from the
/// other; the cross-core traffic is what drags the lines into the shared LLC.
pub struct MainPlusHelper<'h> {
    pub helper: &'h HelperThread,
}

impl Traverser for MainPlusHelper<'_> {
    fn traverse(&self, lines: &[*const u8], cfg: &BuildConfig) {
        let (repeat, stride, block) = (
            cfg.ev_repeat as usize,
            cfg.stride as usize,
            cfg.block as usize,
        );
        self.helper.prime_concurrent(lines, repeat, stride, block, || {
            prime_blocked(lines, repeat, stride, block);
        });
    }
}

/// Everything a test call needs beyond the candidates: the helper (if the
/// config wants one) and the resolved lower-level filter set that forces L2
/// eviction of the target.
pub struct TestEnv<'a> {
    pub helper: Option<&'a HelperThread>,
    pub lower: Option<&'a [*const u8]>,
    /// Traversal repetitions for the lower set (its own config's
    /// `ev_repeat`).
    pub lower_repeat: u32,
}

impl TestEnv<'_> {
    pub const NONE: TestEnv<'static> = TestEnv {
        helper: None,
        lower: None,
        lower_repeat: 4,
    };
}

fn traverse_lower(env: &TestEnv<'_>, repeat: u32) {
    if let Some(lower) = env.lower {
        for _ in 0..repeat.max(1) {
            access_lines_backward(lower);
        }
    }
}

/// The eviction-test oracle.
///
/// Per trial: evict the target to reset its insertion age, optionally force
/// it out of L2 via the lower set, load it (helper first when attached, so
/// the line lands in the LLC in shared state), traverse the candidates, and
/// time a reload. A trial counts toward the over-threshold count when the
/// reload latency lands in `[lat_thresh, interrupt]` — above the interrupt
/// threshold the sample saw a context switch and is discarded. Returns true
/// once `upp_bnd` trials scored.
pub fn test_eviction(
    target: *const u8,
    cands: &[*const u8],
    cfg: &BuildConfig,
    lats: &LatencyProfile,
    env: &TestEnv<'_>,
) -> bool {
    let (trials, upp_bnd) = cfg.scaled_bounds();
    let mut otc = 0u32;

    for _ in 0..trials {
        // SAFETY: target stays resolved for the whole call; candidate lines
        // come out of a live arena.
        unsafe {
            flush_line(target);
        }
        if cfg.flush_cands {
            flush_lines(cands);
        }
        lfence();
        mfence();

        for _ in 0..cfg.access_cnt.max(1) {
            traverse_lower(env, cfg.ev_repeat);

            lfence();
            // SAFETY: as above.
            unsafe { read_line(target) };
            lfence();

            if cfg.use_helper {
                if let Some(h) = env.helper {
                    h.read_one(target);
                    // SAFETY: as above.
                    unsafe { read_line(target) };
                }
            }
        }

        lfence();

        if cfg.foreign_evictor {
            if let Some(h) = env.helper {
                h.traverse(cands, cfg.ev_repeat as usize);
            } else {
                MainOnly.traverse(cands, cfg);
            }
        } else if cfg.use_helper && env.helper.is_some() {
            MainPlusHelper {
                helper: env.helper.unwrap(),
            }
            .traverse(cands, cfg);
        } else {
            MainOnly.traverse(cands, cfg);
        }

        // A slice smaller than the lower set fits entirely inside L2, so
        // the timed reload would hit there regardless of congruence. Push
        // the target back out through the lower set and re-touch the slice.
        if let Some(lower) = env.lower {
            if cfg.use_helper && cands.len() < lower.len() {
                traverse_lower(env, env.lower_repeat);
                lfence();
                access_lines_backward(cands);
            }
        }

        lfence();

        // SAFETY: as above.
        let lat = unsafe { time_access(target) };
        if lat >= cfg.lat_thresh && lat <= lats.interrupt {
            otc += 1;
        }
        if otc >= upp_bnd {
            return true;
        }
    }

    false
}

/// Single-pass congruence prune.
///
/// Each line takes a turn as the target (role swap with the real target,
/// which joins the set in its place); a line that the resulting set fails to
/// evict is not congruent and gets swapped out. Operates on the first `cnt`
/// entries, returns the surviving count.
pub fn prune_lines(
    target: *const u8,
    lines: &mut [*const u8],
    mut cnt: usize,
    cfg: &BuildConfig,
    lats: &LatencyProfile,
    env: &TestEnv<'_>,
) -> usize {
    let mut target = target;
    let mut i = 0;
    while i < cnt {
        std::mem::swap(&mut target, &mut lines[i]);
        let evicts = test_eviction(target, &lines[..cnt], cfg, lats, env);
        std::mem::swap(&mut target, &mut lines[i]);
        if evicts {
            i += 1;
        } else {
            cnt -= 1;
            lines.swap(i, cnt);
        }
    }
    cnt
}

/// A built eviction set: target plus congruent lines, all at one page
/// offset inside one arena.
#[derive(Clone, Debug)]
pub struct EvSet {
    arena: Arc<Arena>,
    offset: u32,
    target: LineHandle,
    lines: Vec<LineHandle>,
    pub level: CacheLevel,
    /// Associativity of the target level; a clean L2 set has exactly this
    /// many lines, an LLC set between this and this + slack.
    pub ways: u32,
    pub config: BuildConfig,
}

impl EvSet {
    pub(crate) fn from_ptrs(
        view: &CandidateView,
        target: *const u8,
        line_ptrs: &[*const u8],
        level: CacheLevel,
        ways: u32,
        config: BuildConfig,
    ) -> Self {
        let arena = Arc::clone(view.arena());
        let lines = line_ptrs.iter().map(|&p| arena.handle_of(p)).collect();
        Self {
            target: arena.handle_of(target),
            arena,
            offset: view.offset(),
            lines,
            level,
            ways,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn target_ptr(&self) -> *const u8 {
        self.arena.line_ptr(self.target, self.offset)
    }

    /// Resolve the lines to raw addresses in set order.
    pub fn line_ptrs(&self) -> Vec<*const u8> {
        self.lines
            .iter()
            .map(|&h| self.arena.line_ptr(h, self.offset))
            .collect()
    }

    /// Project the set (and its target) to another cache-line offset within
    /// the page. Shares arena and handles; congruence is preserved.
    pub fn shift(&self, offset: u32) -> Self {
        debug_assert!((offset as usize) < PAGE_SIZE);
        Self {
            arena: Arc::clone(&self.arena),
            offset,
            target: self.target,
            lines: self.lines.clone(),
            level: self.level,
            ways: self.ways,
            config: self.config.clone(),
        }
    }

    /// Re-run the oracle for this set against its own target.
    pub fn verify(&self, lats: &LatencyProfile, env: &TestEnv<'_>) -> bool {
        let lines = self.line_ptrs();
        test_eviction(self.target_ptr(), &lines, &self.config, lats, env)
    }

    /// Re-run the oracle against an arbitrary target.
    pub fn evicts(&self, target: *const u8, lats: &LatencyProfile, env: &TestEnv<'_>) -> bool {
        let lines = self.line_ptrs();
        test_eviction(target, &lines, &self.config, lats, env)
    }

    /// Whether the size satisfies the level's acceptance window.
    pub fn size_ok(&self) -> bool {
        match self.level {
            CacheLevel::L3 => {
                let n = self.len() as u32;
                n >= self.ways && n <= self.ways + self.config.slack
            }
            _ => self.len() as u32 == self.ways,
        }
    }
}
