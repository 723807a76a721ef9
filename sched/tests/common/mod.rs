//! Shared test fixtures: a mock kernel with a hand-cranked clock.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use cake_sched::{CakeScheduler, KernelOps, KickKind, Pid, Task, WakeFlags};

/// Mock kernel: deterministic clock, scripted current-CPU, recorded
/// kicks.
pub struct MockKernel {
    now: AtomicU64,
    cpu: AtomicU32,
    nr_cpus: u32,
    idle_at_attach: u64,
    kicks: Mutex<Vec<(u32, KickKind)>>,
    task_cpus: Mutex<HashMap<u32, u32>>,
    default_picks: AtomicU64,
}

impl MockKernel {
    pub fn new(nr_cpus: u32) -> Self {
        Self::with_idle(nr_cpus, 0)
    }

    /// Mock where `idle_mask` names the CPUs idle at attach time.
    pub fn with_idle(nr_cpus: u32, idle_mask: u64) -> Self {
        Self {
            // Nonzero epoch so a fresh wake timestamp is distinguishable
            // from the "no wake pending" sentinel.
            now: AtomicU64::new(1_000_000),
            cpu: AtomicU32::new(0),
            nr_cpus,
            idle_at_attach: idle_mask,
            kicks: Mutex::new(Vec::new()),
            task_cpus: Mutex::new(HashMap::new()),
            default_picks: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::Relaxed);
    }

    /// Script which CPU the next callbacks appear to run on.
    pub fn on_cpu(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn set_task_cpu(&self, pid: Pid, cpu: u32) {
        self.task_cpus.lock().unwrap().insert(pid.0, cpu);
    }

    /// Drain the recorded kicks.
    pub fn take_kicks(&self) -> Vec<(u32, KickKind)> {
        std::mem::take(&mut *self.kicks.lock().unwrap())
    }

    /// How often the core fell back to the kernel's own CPU pick.
    pub fn default_picks(&self) -> u64 {
        self.default_picks.load(Ordering::Relaxed)
    }
}

impl KernelOps for &MockKernel {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn this_cpu(&self) -> u32 {
        self.cpu.load(Ordering::Relaxed)
    }

    fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    fn task_cpu(&self, task: &Task) -> u32 {
        self.task_cpus
            .lock()
            .unwrap()
            .get(&task.pid.0)
            .copied()
            .unwrap_or(0)
    }

    fn kick_cpu(&self, cpu: u32, kind: KickKind) {
        self.kicks.lock().unwrap().push((cpu, kind));
    }

    fn cpu_is_idle_now(&self, cpu: u32) -> bool {
        self.idle_at_attach & (1 << cpu) != 0
    }

    fn default_select_cpu(&self, _task: &Task, prev_cpu: u32, _wake_flags: WakeFlags) -> u32 {
        self.default_picks.fetch_add(1, Ordering::Relaxed);
        prev_cpu
    }
}

/// One full run on a CPU: start running, burn `runtime_ns`, stop. No
/// wake is staged, so the wait-budget window is untouched.
pub fn run_cycle(
    sched: &CakeScheduler<&MockKernel>,
    kernel: &MockKernel,
    task: &Task,
    cpu: u32,
    runtime_ns: u64,
) {
    kernel.on_cpu(cpu);
    sched.running(task);
    kernel.advance(runtime_ns);
    sched.stopping(task, true);
    kernel.advance(1_000);
}

/// Drive a task's sparse score with repeated identical runs.
pub fn run_cycles(
    sched: &CakeScheduler<&MockKernel>,
    kernel: &MockKernel,
    task: &Task,
    cpu: u32,
    runtime_ns: u64,
    n: usize,
) {
    for _ in 0..n {
        run_cycle(sched, kernel, task, cpu, runtime_ns);
    }
}
