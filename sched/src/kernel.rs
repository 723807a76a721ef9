//! Kernel framework boundary
//!
//! The scheduler core runs inside callbacks provided by the host
//! kernel's extensible scheduler framework and consumes a small set of
//! helpers from it. [`KernelOps`] is that helper surface as a trait:
//! production wires it to the real kernel, tests wire it to a mock
//! with a hand-cranked clock.

use alloc::string::String;

use bitflags::bitflags;

use crate::task::Task;

bitflags! {
    /// Wake flags passed to CPU selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeFlags: u32 {
        /// The waker is about to block; its CPU is going free and its
        /// caches are hot with the wakee's data.
        const SYNC = 1 << 0;
    }
}

bitflags! {
    /// Flags passed to enqueue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// The task just woke up.
        const WAKEUP = 1 << 0;
        /// The task was preempted off a CPU.
        const PREEMPT = 1 << 1;
    }
}

/// How hard to kick a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickKind {
    /// Wake the CPU if it is idle; may be ignored if it raced busy.
    Idle,
    /// Force the CPU through a scheduling pass even if busy.
    Preempt,
}

/// Helpers the core consumes from the host kernel.
///
/// All clocks are monotonic nanoseconds. CPU ids are dense indexes in
/// `0..nr_cpus()`.
pub trait KernelOps {
    /// Monotonic clock (ns).
    fn now_ns(&self) -> u64;

    /// The CPU this callback is running on.
    fn this_cpu(&self) -> u32;

    /// Number of possible CPU ids.
    fn nr_cpus(&self) -> u32;

    /// The CPU a task last ran on.
    fn task_cpu(&self, task: &Task) -> u32;

    /// Ask the kernel to reschedule a CPU.
    fn kick_cpu(&self, cpu: u32, kind: KickKind);

    /// Whether a CPU is idle right now; only consulted while attaching,
    /// to pre-warm the idle mask.
    fn cpu_is_idle_now(&self, cpu: u32) -> bool;

    /// The kernel's own CPU pick, used when a task has no context yet.
    fn default_select_cpu(&self, task: &Task, prev_cpu: u32, wake_flags: WakeFlags) -> u32;
}

/// Detach record handed to the framework's exit hook, kept for the
/// loader to read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Framework exit code; zero for a clean detach.
    pub exit_code: i64,
    /// Human-readable detach reason.
    pub reason: String,
}

impl ExitInfo {
    pub fn new(exit_code: i64, reason: impl Into<String>) -> Self {
        Self {
            exit_code,
            reason: reason.into(),
        }
    }
}
