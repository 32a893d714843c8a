//! Cycle-accurate timing primitives and raw cache-line operations.
//!
//! Everything here compiles to the exact instruction sequence it names; the
//! fence placement is load-bearing. `timer_start`/`timer_stop` follow the
//! serialized rdtsc/rdtscp pattern, and `time_access` adds the address
//! pre-computation and timer warm-up that keep the measured window down to
//! the single load being timed.

#[cfg(target_arch = "x86_64")]
use std::arch::asm;

/// Nanosecond fallback clock for non-x86 builds (tests and tooling only;
/// every measurement path assumes the real TSC).
#[cfg(not(target_arch = "x86_64"))]
fn fallback_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    fallback_ns()
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtscp_aux() -> (u64, u32) {
    (fallback_ns(), 0)
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn timer_start() -> u64 {
    fallback_ns()
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn timer_stop() -> u64 {
    fallback_ns()
}

/// Plain rdtsc, no serialization. Cheap; used for busy-wait deadlines and as
/// a timer warm-up before a measured section.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    let lo: u64;
    let hi: u64;
    // SAFETY: rdtsc reads the timestamp counter, no memory effects.
    unsafe {
        asm!("rdtsc", out("rax") lo, out("rdx") hi, options(nomem, nostack));
    }
    (hi << 32) | lo
}

/// rdtscp returning `(tsc, aux)`. The aux word is IA32_TSC_AUX, which Linux
/// initializes to encode the logical CPU — two reads with differing aux
/// bracket a migration or interrupt and the sample in between is garbage.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtscp_aux() -> (u64, u32) {
    let lo: u64;
    let hi: u64;
    let aux: u32;
    // SAFETY: rdtscp reads the TSC and TSC_AUX, no memory effects. The
    // trailing lfence keeps later instructions from drifting above the read.
    unsafe {
        asm!(
            "rdtscp",
            "lfence",
            out("rax") lo,
            out("rdx") hi,
            out("rcx") aux,
            options(nostack),
        );
    }
    ((hi << 32) | lo, aux)
}

/// Serialized timer start: mfence + lfence drain earlier loads/stores, the
/// trailing lfence pins the rdtsc before the measured section.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn timer_start() -> u64 {
    let lo: u64;
    let hi: u64;
    // SAFETY: fences and rdtsc only.
    unsafe {
        asm!(
            "mfence",
            "lfence",
            "rdtsc",
            "lfence",
            out("rax") lo,
            out("rdx") hi,
            options(nostack),
        );
    }
    (hi << 32) | lo
}

/// Serialized timer stop: rdtscp waits for earlier loads to retire, lfence
/// stops later work from overlapping the read.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn timer_stop() -> u64 {
    let lo: u64;
    let hi: u64;
    // SAFETY: rdtscp + lfence only.
    unsafe {
        asm!(
            "rdtscp",
            "lfence",
            out("rax") lo,
            out("rdx") hi,
            out("rcx") _,
            options(nostack),
        );
    }
    (hi << 32) | lo
}

#[inline(always)]
pub fn mfence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: mfence has no operands.
    unsafe {
        asm!("mfence", options(nostack, preserves_flags));
    }
}

#[inline(always)]
pub fn lfence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: lfence has no operands.
    unsafe {
        asm!("lfence", options(nostack, preserves_flags));
    }
}

/// Read one byte of a cache line, defeating dead-load elimination.
///
/// # Safety
/// `line` must be valid for reads.
#[inline(always)]
pub unsafe fn read_line(line: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: caller guarantees the pointer is readable.
    unsafe {
        asm!("mov {tmp}, byte ptr [{ptr}]",
             ptr = in(reg) line,
             tmp = out(reg_byte) _,
             options(nostack));
    }
    #[cfg(not(target_arch = "x86_64"))]
    unsafe {
        std::ptr::read_volatile(line);
    }
}

/// Evict one line from the whole hierarchy.
///
/// # Safety
/// `line` must be valid for reads.
#[inline(always)]
pub unsafe fn flush_line(line: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: clflushopt on a readable address.
    unsafe {
        asm!("clflushopt byte ptr [{ptr}]", ptr = in(reg) line, options(nostack));
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = line;
}

/// Time a single load of `line` in cycles.
///
/// Forces the address computation and warms the timer before the measured
/// window so neither shows up inside it.
///
/// # Safety
/// `line` must be valid for reads.
#[inline(always)]
pub unsafe fn time_access(line: *const u8) -> u64 {
    mfence();
    let mut p = line;
    #[cfg(target_arch = "x86_64")]
    // SAFETY: register-to-register move; forces the address into a register
    // ahead of the timed load.
    unsafe {
        asm!("mov {0}, {0}", inout(reg) p, options(nostack));
    }
    let _ = rdtsc(); // timer warm-up
    let start = timer_start();
    // SAFETY: caller guarantees readability.
    unsafe { read_line(p) };
    let end = timer_stop();
    mfence();
    end - start
}

/// Flush every line in the slice.
#[inline]
pub fn flush_lines(lines: &[*const u8]) {
    for &l in lines {
        // SAFETY: callers only pass lines resolved from a live arena/set.
        unsafe { flush_line(l) };
    }
}

/// Forward access of every line.
#[inline]
pub fn access_lines(lines: &[*const u8]) {
    for &l in lines {
        // SAFETY: as in flush_lines.
        unsafe { read_line(l) };
    }
}

/// Backward access. Forward traversal lets the prefetcher speculate past the
/// end of the array; walking the index down blocks that.
#[inline]
pub fn access_lines_backward(lines: &[*const u8]) {
    for i in (0..lines.len()).rev() {
        // SAFETY: as in flush_lines.
        unsafe { read_line(lines[i]) };
    }
}

/// Blocked backward prime (the rowhammer.js traversal): slide a window of
/// `block` lines by `stride`, repeating each window `repeat` times, wrapping
/// the final window around to the front of the array.
#[inline]
pub fn prime_blocked(lines: &[*const u8], repeat: usize, stride: usize, block: usize) {
    let cnt = lines.len();
    if cnt == 0 {
        return;
    }
    let block = block.min(cnt);
    let stride = stride.max(1);
    let mut s = 0;
    while s < cnt {
        for _ in 0..repeat.max(1) {
            if cnt >= block + s {
                access_lines_backward(&lines[s..s + block]);
            } else {
                let rem = cnt - s;
                access_lines_backward(&lines[s..]);
                access_lines_backward(&lines[..block - rem]);
            }
        }
        s += stride;
    }
}

/// Strided forward access with full fencing between elements; used by the
/// latency calibrator to walk a private eviction buffer.
///
/// # Safety
/// `start + i*stride` must be readable for all `i < count`.
pub unsafe fn access_stride(start: *const u8, stride: usize, count: usize) {
    for i in 0..count {
        // SAFETY: caller guarantees the range.
        unsafe { read_line(start.add(i * stride)) };
        lfence();
        mfence();
    }
}

/// Current wall clock in microseconds.
#[inline]
pub fn time_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// TSC frequency in Hz, from /proc/cpuinfo with sysfs fallbacks.
///
/// Returns `None` when every source is unavailable; callers that need a
/// cycles-per-microsecond figure treat that as a platform error.
pub fn cpu_freq_hz() -> Option<u64> {
    if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
        for line in cpuinfo.lines() {
            if line.starts_with("cpu MHz") {
                if let Some(v) = line.split(':').nth(1) {
                    if let Ok(mhz) = v.trim().parse::<f64>() {
                        return Some((mhz * 1_000_000.0) as u64);
                    }
                }
            }
        }
    }

    for path in [
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq",
        "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq",
    ] {
        if let Ok(s) = std::fs::read_to_string(path) {
            if let Ok(khz) = s.trim().parse::<u64>() {
                return Some(khz * 1000);
            }
        }
    }

    None
}

/// Cycles per microsecond, defaulting to a 2 GHz guess when the frequency
/// cannot be read. Monitoring paths that depend on wall-clock accuracy probe
/// `cpu_freq_hz` directly and fail loudly instead.
pub fn cycles_per_us_or_default() -> u64 {
    cpu_freq_hz().map(|hz| hz / 1_000_000).unwrap_or(2000)
}

/// Pin the calling thread to one logical CPU.
pub fn pin_current_thread(cpu: i32) -> std::io::Result<()> {
    // SAFETY: CPU_SET/sched_setaffinity with a properly zeroed cpu_set_t.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pin an arbitrary thread by its pthread id.
pub fn pin_thread(handle: libc::pthread_t, cpu: i32) -> std::io::Result<()> {
    // SAFETY: as in pin_current_thread, targeting another thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::pthread_setaffinity_np(handle, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Number of online logical CPUs.
pub fn online_cpus() -> u32 {
    // SAFETY: plain sysconf query.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 { 1 } else { n as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdtsc_is_monotone() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn timer_brackets_are_ordered() {
        let s = timer_start();
        let e = timer_stop();
        assert!(e >= s);
    }

    #[test]
    fn rdtscp_aux_stable_on_pinned_thread() {
        if pin_current_thread(0).is_err() {
            return; // restricted environment, nothing to assert
        }
        let (_, a1) = rdtscp_aux();
        let (_, a2) = rdtscp_aux();
        assert_eq!(a1, a2);
    }

    #[test]
    fn time_access_returns_something_plausible() {
        let buf = vec![0u8; 64];
        // SAFETY: buf is live for the duration of the call.
        let lat = unsafe { time_access(buf.as_ptr()) };
        assert!(lat > 0);
        assert!(lat < 1_000_000, "single load took {lat} cycles");
    }

    #[test]
    #[ignore] // Hardware-dependent: needs a quiet core for stable timing
    fn warm_line_times_under_l1_scale() {
        let buf = vec![1u8; 64];
        // SAFETY: buf outlives both calls.
        let a = unsafe { time_access(buf.as_ptr()) };
        let b = unsafe { time_access(buf.as_ptr()) };
        let diff = a.abs_diff(b);
        assert!(diff < 200, "back-to-back warm loads differ by {diff} cycles");
    }

    #[test]
    fn prime_blocked_touches_wrapped_window() {
        // 6 lines, block 4, stride 3: second window starts at 3 and wraps.
        let backing: Vec<[u8; 64]> = vec![[0; 64]; 6];
        let lines: Vec<*const u8> = backing.iter().map(|l| l.as_ptr()).collect();
        prime_blocked(&lines, 2, 3, 4);
        prime_blocked(&lines, 1, 1, 16); // block larger than array
        prime_blocked(&[], 1, 1, 1); // empty is a no-op
    }

    #[test]
    fn cycles_per_us_has_fallback() {
        assert!(cycles_per_us_or_default() > 0);
    }

    #[test]
    fn online_cpus_positive() {
        assert!(online_cpus() >= 1);
    }

    #[test]
    fn time_us_advances() {
        let a = time_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(time_us() > a);
    }
}
