//! The helper thread: a second logical CPU that touches lines on command.
//!
//! A line loaded by one core and then re-read from another gets promoted
//! into the shared LLC, which is what makes a candidate eligible for LLC
//! eviction testing in the first place. Each main thread owns exactly one
//! helper and drives it through a two-state protocol:
//!
//! controller: wait Idle → write command slot → state := Busy (release)
//! helper:     observe Busy (acquire) → execute → state := Idle (release)
//!
//! The release/acquire pair on `state` is the only synchronization; the
//! command slot is never touched outside one's own phase.

use std::cell::UnsafeCell;
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crate::error::ResourceError;
use crate::timing::{
    access_lines_backward, lfence, mfence, pin_current_thread, pin_thread, prime_blocked,
    read_line, time_access,
};

const IDLE: u8 = 0;
const BUSY: u8 = 1;

/// Borrowed address span handed across the protocol. The controller-side
/// wrappers keep the backing slice borrowed until the helper reports Idle,
/// which is what makes the raw pointer sound.
#[derive(Clone, Copy)]
struct AddrSpan {
    ptr: *const *const u8,
    len: usize,
}

// SAFETY: spans only travel controller → helper under the protocol above;
// the backing memory outlives the Busy phase by construction.
unsafe impl Send for AddrSpan {}

impl AddrSpan {
    fn of(lines: &[*const u8]) -> Self {
        Self {
            ptr: lines.as_ptr(),
            len: lines.len(),
        }
    }

    /// # Safety
    /// Only callable during the Busy phase of the command that carried it.
    unsafe fn as_slice<'a>(&self) -> &'a [*const u8] {
        // SAFETY: see above.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

enum Command {
    Stop,
    ReadOne(usize),
    TimeOne(usize),
    ReadArray {
        span: AddrSpan,
        repeat: usize,
        stride: usize,
        block: usize,
    },
    Traverse {
        span: AddrSpan,
        repeat: usize,
    },
}

struct Shared {
    state: AtomicU8,
    /// Written by the controller while Idle, read by the helper while Busy.
    slot: UnsafeCell<Option<Command>>,
    latency: AtomicU64,
}

// SAFETY: slot access is phased by `state` with release/acquire ordering;
// exactly one side touches it at any time.
unsafe impl Sync for Shared {}

/// Handle to a running helper. Dropping it stops the thread.
pub struct HelperThread {
    shared: Arc<Shared>,
    pthread: libc::pthread_t,
    join: Option<JoinHandle<()>>,
}

impl HelperThread {
    /// Start unpinned.
    pub fn start() -> Result<Self, ResourceError> {
        Self::spawn(None)
    }

    /// Start pinned to a logical CPU.
    pub fn start_pinned(cpu: i32) -> Result<Self, ResourceError> {
        Self::spawn(Some(cpu))
    }

    fn spawn(pin: Option<i32>) -> Result<Self, ResourceError> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(BUSY), // Idle once the worker is ready
            slot: UnsafeCell::new(None),
            latency: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("llcscope-helper".into())
            .spawn(move || worker_loop(worker_shared, pin))
            .map_err(|e| ResourceError::Spawn {
                what: "helper thread",
                source: e,
            })?;

        let pthread = join.as_pthread_t();
        let h = Self {
            shared,
            pthread,
            join: Some(join),
        };
        h.wait_idle();
        Ok(h)
    }

    /// Re-pin the running helper (topology changed under us).
    pub fn repin(&self, cpu: i32) -> std::io::Result<()> {
        pin_thread(self.pthread, cpu)
    }

    /// Raw pthread id, for external re-pinning by a topology watcher.
    pub fn pthread_id(&self) -> libc::pthread_t {
        self.pthread
    }

    #[inline]
    fn wait_idle(&self) {
        while self.shared.state.load(Ordering::Acquire) != IDLE {
            std::hint::spin_loop();
        }
    }

    #[inline]
    fn publish(&self, cmd: Command) {
        self.wait_idle();
        // SAFETY: state is Idle, so the helper is not reading the slot.
        unsafe { *self.shared.slot.get() = Some(cmd) };
        self.shared.state.store(BUSY, Ordering::Release);
    }

    fn run(&self, cmd: Command) {
        self.publish(cmd);
        self.wait_idle();
    }

    /// Have the helper load one line and wait for it.
    pub fn read_one(&self, line: *const u8) {
        self.run(Command::ReadOne(line as usize));
    }

    /// Have the helper time one load and return its cycle count.
    pub fn time_one(&self, line: *const u8) -> u64 {
        self.run(Command::TimeOne(line as usize));
        mfence();
        lfence();
        self.shared.latency.load(Ordering::Acquire)
    }

    /// Full foreign traversal: the helper walks the lines backward `repeat`
    /// times while the caller blocks.
    pub fn traverse(&self, lines: &[*const u8], repeat: usize) {
        self.run(Command::Traverse {
            span: AddrSpan::of(lines),
            repeat,
        });
    }

    /// Two-sided prime: the helper runs a blocked backward prime over the
    /// lines while `main_work` runs on the calling core. Returns only after
    /// both sides are done, so the borrow of `lines` covers the helper's use.
    pub fn prime_concurrent(
        &self,
        lines: &[*const u8],
        repeat: usize,
        stride: usize,
        block: usize,
        main_work: impl FnOnce(),
    ) {
        self.publish(Command::ReadArray {
            span: AddrSpan::of(lines),
            repeat,
            stride,
            block,
        });
        main_work();
        self.wait_idle();
    }
}

impl Drop for HelperThread {
    fn drop(&mut self) {
        self.publish(Command::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, pin: Option<i32>) {
    if let Some(cpu) = pin {
        if cpu >= 0 {
            if let Err(e) = pin_current_thread(cpu) {
                log::warn!("helper failed to pin to CPU {cpu}: {e}");
            }
        }
    }

    loop {
        shared.state.store(IDLE, Ordering::Release);
        while shared.state.load(Ordering::Acquire) != BUSY {
            std::hint::spin_loop();
        }

        // SAFETY: state is Busy, so the controller is not writing the slot.
        let cmd = unsafe { (*shared.slot.get()).take() };
        match cmd {
            None | Some(Command::Stop) => {
                shared.state.store(IDLE, Ordering::Release);
                return;
            }
            Some(Command::ReadOne(addr)) => {
                // SAFETY: the controller keeps the line alive through the
                // Busy phase.
                unsafe { read_line(addr as *const u8) };
            }
            Some(Command::TimeOne(addr)) => {
                // SAFETY: as above.
                let lat = unsafe { time_access(addr as *const u8) };
                shared.latency.store(lat, Ordering::Release);
            }
            Some(Command::ReadArray {
                span,
                repeat,
                stride,
                block,
            }) => {
                // SAFETY: span valid during Busy.
                let lines = unsafe { span.as_slice() };
                prime_blocked(lines, repeat, stride, block);
            }
            Some(Command::Traverse { span, repeat }) => {
                // SAFETY: span valid during Busy.
                let lines = unsafe { span.as_slice() };
                for _ in 0..repeat.max(1) {
                    access_lines_backward(lines);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop() {
        let h = HelperThread::start().unwrap();
        drop(h); // Stop + join must not hang
    }

    #[test]
    fn read_one_round_trip() {
        let h = HelperThread::start().unwrap();
        let line = vec![7u8; 64];
        h.read_one(line.as_ptr());
        h.read_one(line.as_ptr());
    }

    #[test]
    fn time_one_reports_cycles() {
        let h = HelperThread::start().unwrap();
        let line = vec![7u8; 64];
        let lat = h.time_one(line.as_ptr());
        assert!(lat > 0);
        assert!(lat < 10_000_000);
    }

    #[test]
    fn traverse_and_concurrent_prime() {
        let h = HelperThread::start().unwrap();
        let backing: Vec<[u8; 64]> = vec![[0; 64]; 32];
        let lines: Vec<*const u8> = backing.iter().map(|l| l.as_ptr()).collect();

        h.traverse(&lines, 3);

        let mut main_ran = false;
        h.prime_concurrent(&lines, 2, 12, 24, || {
            prime_blocked(&lines, 2, 12, 24);
            main_ran = true;
        });
        assert!(main_ran);
    }

    #[test]
    fn many_commands_in_sequence() {
        let h = HelperThread::start().unwrap();
        let line = vec![1u8; 64];
        for _ in 0..200 {
            h.read_one(line.as_ptr());
        }
        let lat = h.time_one(line.as_ptr());
        assert!(lat > 0);
    }

    #[test]
    #[ignore] // Hardware-dependent: pinning needs an unrestricted CPU mask
    fn pinned_start_and_repin() {
        let h = HelperThread::start_pinned(0).unwrap();
        let line = vec![1u8; 64];
        h.read_one(line.as_ptr());
        h.repin(1).unwrap();
        h.read_one(line.as_ptr());
    }
}
