//! Core scheduler implementation
//!
//! The event handlers the kernel framework drives, wired over the task
//! store, the queue fabric, the bitmasks, and the classifier. Every
//! handler runs to completion with no suspension points and may be
//! interleaved arbitrarily across CPUs; nothing here takes a lock that
//! outlives a single queue operation.
//!
//! The split of work between handlers is deliberate:
//!
//! - the wake path (`select_cpu`, `enqueue`) only *reads* precomputed
//!   task state and routes;
//! - the run path (`running`) pays for allocation and the wait-budget
//!   accounting, both serialized per CPU by the framework;
//! - the stop path (`stopping`) does all the classification math and
//!   writes the results back in one burst.

use spin::Mutex;

use crate::aqm::{observe_wait, LONG_SLEEP_NS};
use crate::classifier::{ema_runtime_us, sparse_score, tier_for, SCORE_GAMING};
use crate::config::SchedConfig;
use crate::cpumask::{
    first_idle, first_idle_preferred, CpuShadow, IdleMask, VictimMask, MAX_CPUS,
};
use crate::dsq::{mailbox_dsq, DsqFabric, QueuedTask};
use crate::error::{SchedError, SchedResult};
use crate::kernel::{EnqueueFlags, ExitInfo, KernelOps, KickKind, WakeFlags};
use crate::slice::{drain_deficit, next_slice_ns};
use crate::stats::{Stats, StatsSnapshot};
use crate::storage::ContextStore;
use crate::task::{Pid, Task, Tier};

use core::sync::atomic::Ordering;

/// Lottery mask: roughly one dispatch in sixteen tries the low tiers
/// ahead of the strict order.
const LOTTERY_MASK: u64 = 0xF;

/// Starvation jitter is 7 random bits scaled to ~microseconds.
const JITTER_BITS: u32 = 0x7F;

/// The tiered CPU scheduler core.
///
/// One instance services the whole machine. Construction wires the
/// configuration in; [`CakeScheduler::init`] must run (and succeed)
/// before the framework delivers any other callback.
pub struct CakeScheduler<K: KernelOps> {
    kernel: K,
    config: SchedConfig,
    /// Sparse run-length threshold, precomputed so the stop path never
    /// divides.
    cached_threshold_ns: u64,
    store: ContextStore,
    dsqs: DsqFabric,
    idle: IdleMask,
    victims: VictimMask,
    shadows: [CpuShadow; MAX_CPUS],
    stats: Stats,
    exit_info: Mutex<Option<ExitInfo>>,
}

impl<K: KernelOps> CakeScheduler<K> {
    /// Build the scheduler with its queues and empty state. Cheap; the
    /// attach-time work lives in [`CakeScheduler::init`].
    pub fn new(kernel: K, config: SchedConfig) -> Self {
        let cached_threshold_ns = config.cached_threshold_ns();
        let store = ContextStore::new(config.quantum_ns, config.new_flow_bonus_ns);
        Self {
            kernel,
            config,
            cached_threshold_ns,
            store,
            dsqs: DsqFabric::new(),
            idle: IdleMask::new(),
            victims: VictimMask::new(),
            shadows: [const { CpuShadow::new() }; MAX_CPUS],
            stats: Stats::new(),
            exit_info: Mutex::new(None),
        }
    }

    /// Attach-time setup: validate the CPU count and pre-warm the idle
    /// mask from CPUs that are already idle.
    pub fn init(&self) -> SchedResult<()> {
        let nr_cpus = self.kernel.nr_cpus();
        if nr_cpus == 0 {
            return Err(SchedError::NoCpus);
        }
        if nr_cpus as usize > MAX_CPUS {
            return Err(SchedError::TooManyCpus { nr_cpus });
        }

        for cpu in 0..nr_cpus {
            if self.kernel.cpu_is_idle_now(cpu) {
                self.idle.set(cpu);
                self.shadows[cpu as usize].set_idle(true);
            }
        }

        log::debug!(
            "scheduler attached: {} CPUs, quantum {}ns, sparse threshold {}ns",
            nr_cpus,
            self.config.quantum_ns,
            self.cached_threshold_ns
        );
        Ok(())
    }

    /// Detach: record the framework's reason for the loader.
    pub fn exit(&self, info: ExitInfo) {
        log::debug!("scheduler detached: code {} ({})", info.exit_code, info.reason);
        *self.exit_info.lock() = Some(info);
    }

    /// Pick a CPU for a waking task and, where possible, stage a direct
    /// dispatch to it.
    ///
    /// Order of preference: the waker's CPU on a sync wake (L1 warmth
    /// beats placement), the task's previous CPU if idle, a
    /// topology-preferred idle CPU, any idle CPU, and (for the top
    /// tier only) a victim CPU running demotable work. Every path
    /// stamps the wake time first so the wait-budget accounting never
    /// misses a cycle.
    pub fn select_cpu(&self, task: &Task, prev_cpu: u32, wake_flags: WakeFlags) -> u32 {
        // Speculative victim pick, issued before it is known to be
        // needed; discarded on every other path.
        let spec_victim = self.victims.first();

        let Some(ctx) = self.store.get(task.pid) else {
            // No context yet: the kernel picks, and the run hook will
            // allocate on first execution.
            return self.kernel.default_select_cpu(task, prev_cpu, wake_flags);
        };

        // Zero is the "no pending wake" sentinel; never store it as a
        // real timestamp.
        let now_ts = (self.kernel.now_ns() as u32).max(1);
        ctx.last_wake_ts.store(now_ts, Ordering::Relaxed);

        if wake_flags.contains(WakeFlags::SYNC) {
            let this_cpu = self.kernel.this_cpu();
            if (this_cpu as usize) < MAX_CPUS {
                ctx.target_dsq.store(mailbox_dsq(this_cpu), Ordering::Relaxed);
                self.kernel.kick_cpu(this_cpu, KickKind::Preempt);
                return this_cpu;
            }
        }

        let tier = ctx.packed_info().tier();
        let idle_mask = self.idle.load();
        let topo = &self.config.topology;

        let mut cpu = prev_cpu;
        let mut found_idle = false;
        if (prev_cpu as usize) < MAX_CPUS && idle_mask & (1 << prev_cpu) != 0 {
            found_idle = true;
        } else if tier <= Tier::Realtime || topo.has_multi_llc || topo.has_hybrid {
            // Latency tiers always get the rigorous walk; on machines
            // with placement structure everyone does.
            if let Some(found) = first_idle_preferred(idle_mask, prev_cpu, topo) {
                cpu = found;
                found_idle = true;
            }
        } else if let Some(found) = first_idle(idle_mask, prev_cpu) {
            cpu = found;
            found_idle = true;
        }

        // Hybrid parts: a gaming-or-better task that landed on an
        // efficiency core moves to a performance core if one is idle.
        // An idle E-core still beats a busy P-core, so no swap
        // otherwise.
        if topo.has_hybrid && found_idle && tier <= Tier::Gaming && !topo.is_big(cpu) {
            let p_candidates = self.idle.load() & topo.big_mask();
            if p_candidates != 0 {
                cpu = p_candidates.trailing_zeros();
            }
        }

        if found_idle {
            ctx.target_dsq.store(mailbox_dsq(cpu), Ordering::Relaxed);
            if self.config.enable_stats {
                self.stats
                    .cpu(self.kernel.this_cpu())
                    .nr_new_flow_dispatches
                    .fetch_add(1, Ordering::Relaxed);
            }
            // The mailbox write alone does not make an idle CPU look;
            // the kick does.
            self.kernel.kick_cpu(cpu, KickKind::Preempt);
            return cpu;
        }

        // Input fast lane: a top-tier wake with no idle CPU preempts a
        // victim directly, bypassing the tier queues entirely.
        if tier == Tier::CriticalLatency {
            if let Some(victim) = spec_victim {
                self.kernel.kick_cpu(victim, KickKind::Preempt);
                ctx.target_dsq.store(mailbox_dsq(victim), Ordering::Relaxed);
                if self.config.enable_stats {
                    self.stats
                        .cpu(self.kernel.this_cpu())
                        .nr_input_preempts
                        .fetch_add(1, Ordering::Relaxed);
                }
                return victim;
            }
        }

        prev_cpu
    }

    /// Route a task into exactly one queue.
    pub fn enqueue(&self, task: &Task, flags: EnqueueFlags) {
        let ctx = self.store.get(task.pid);

        if let Some(ctx) = ctx.as_deref() {
            // Consume the direct-dispatch target unconditionally; a
            // value staged by an earlier wake must never leak into a
            // later yield.
            let target = ctx.target_dsq.swap(0, Ordering::Relaxed);
            if flags.contains(EnqueueFlags::WAKEUP) && target != 0 {
                self.dsqs
                    .insert(target, task.pid, ctx.next_slice_ns.load(Ordering::Relaxed));
                return;
            }
        }

        // Neither woken nor preempted means the task yielded; it goes
        // to the back of the bulk tier.
        if !flags.intersects(EnqueueFlags::WAKEUP | EnqueueFlags::PREEMPT) {
            self.dsqs
                .insert_tier(Tier::Background, task.pid, self.config.quantum_ns as u32);
            return;
        }

        let Some(ctx) = ctx else {
            self.dsqs
                .insert_tier(Tier::Interactive, task.pid, self.config.quantum_ns as u32);
            return;
        };

        let tier = ctx.packed_info().tier();
        let slice_ns = ctx.next_slice_ns.load(Ordering::Relaxed);

        if self.config.enable_stats {
            self.stats
                .cpu(self.kernel.this_cpu())
                .record_tier_dispatch(tier, flags.contains(EnqueueFlags::WAKEUP));
        }

        self.dsqs.insert_tier(tier, task.pid, slice_ns);
    }

    /// Pull at most one task for a CPU.
    ///
    /// The CPU's private mailbox drains first; the common direct-
    /// dispatch case never touches a shared queue. About one call in
    /// sixteen then offers the two lowest tiers a slot before the
    /// strict priority walk, so bulk work cannot be starved outright.
    /// The lottery coin comes from the outgoing task's identity and
    /// accumulated runtime: free entropy that differs across CPUs and
    /// calls.
    pub fn dispatch(&self, cpu: u32, prev: Option<&Task>) -> Option<QueuedTask> {
        if let Some(task) = self.dsqs.pop(mailbox_dsq(cpu)) {
            return Some(task);
        }

        let coin = prev
            .map(|p| p.pid.0 as u64 ^ p.sum_exec_runtime.load(Ordering::Relaxed))
            .unwrap_or(1);
        if coin & LOTTERY_MASK == 0 {
            if let Some(task) = self.dsqs.pop_tier(Tier::Background) {
                return Some(task);
            }
            if let Some(task) = self.dsqs.pop_tier(Tier::Interactive) {
                return Some(task);
            }
        }

        for tier in Tier::PRIORITY_ORDER {
            if let Some(task) = self.dsqs.pop_tier(tier) {
                return Some(task);
            }
        }
        None
    }

    /// A task starts running on this CPU.
    ///
    /// This is the allocation point for task contexts (serialized per
    /// CPU, so the store's write lock sees no wake-path contention) and
    /// the measurement point for wake-to-run latency.
    pub fn running(&self, task: &Task) {
        let ctx = self.store.get_or_create(task.pid);
        let cpu = self.kernel.this_cpu();
        if cpu as usize >= MAX_CPUS {
            return;
        }

        let packed = ctx.packed_info();
        let tier = packed.tier();

        // Victim bit via the cached cursor: the global mask is only
        // touched when this CPU's preemptability actually flips.
        let is_victim = tier >= Tier::Interactive;
        let shadow = &self.shadows[cpu as usize];
        if shadow.victim() != is_victim {
            if is_victim {
                self.victims.set(cpu);
            } else {
                self.victims.clear(cpu);
            }
            shadow.set_victim(is_victim);
        }

        let now_ts = self.kernel.now_ns() as u32;
        let last_wake = ctx.last_wake_ts.load(Ordering::Relaxed);

        if last_wake > 0 {
            let wait_ns = now_ts.wrapping_sub(last_wake) as u64;

            // A task that slept through something big (a load screen,
            // a pause) gets half its runtime history back so it can
            // re-qualify for a latency tier quickly.
            if wait_ns > LONG_SLEEP_NS {
                let halved = ctx.avg_runtime_us.load(Ordering::Relaxed) >> 1;
                ctx.avg_runtime_us.store(halved, Ordering::Relaxed);
            }

            if self.config.enable_stats {
                self.stats.cpu(cpu).record_wait(tier, wait_ns);
            }

            let budget_ns = self.config.tiers.params(tier).wait_budget_ns;
            let verdict = observe_wait(packed, tier, wait_ns, budget_ns);
            if verdict.demoted && self.config.enable_stats {
                self.stats
                    .cpu(cpu)
                    .nr_wait_demotions
                    .fetch_add(1, Ordering::Relaxed);
            }
            let new_packed = packed.with_wait(verdict.wait).with_score(verdict.score);
            ctx.store_packed_if_changed(packed, new_packed);

            ctx.last_wake_ts.store(0, Ordering::Relaxed);
        }

        ctx.last_run_at.store(now_ts, Ordering::Relaxed);
    }

    /// A task stops running (yield, block, or preemption).
    ///
    /// One fused pass: load everything, compute the new average, score,
    /// deficit, tier, and slice, then write back in a burst. The packed
    /// word is only stored when it changed, since score and tier are stable
    /// for most tasks most of the time.
    pub fn stopping(&self, task: &Task, _still_runnable: bool) {
        let Some(ctx) = self.store.get(task.pid) else {
            return;
        };
        let last_run = ctx.last_run_at.load(Ordering::Relaxed);
        if last_run == 0 {
            return;
        }

        let now = self.kernel.now_ns();
        let packed = ctx.packed_info();
        let old_avg = ctx.avg_runtime_us.load(Ordering::Relaxed);
        let old_deficit = ctx.deficit_us.load(Ordering::Relaxed);
        let runtime_ns = (now as u32).wrapping_sub(last_run) as u64;

        let new_avg = ema_runtime_us(old_avg, runtime_ns);
        let new_score = sparse_score(packed.score(), runtime_ns, self.cached_threshold_ns);
        let new_deficit = drain_deficit(old_deficit, runtime_ns);
        let new_tier = tier_for(new_score, new_avg);
        let new_slice =
            next_slice_ns(new_deficit, new_tier, self.config.quantum_ns, &self.config.tiers);

        if self.config.enable_stats {
            let was_sparse = packed.score() >= SCORE_GAMING;
            let is_sparse = new_score >= SCORE_GAMING;
            if was_sparse != is_sparse {
                let shard = self.stats.cpu(self.kernel.this_cpu());
                if is_sparse {
                    shard.nr_sparse_promotions.fetch_add(1, Ordering::Relaxed);
                } else {
                    shard.nr_sparse_demotions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        ctx.avg_runtime_us.store(new_avg, Ordering::Relaxed);
        ctx.deficit_us.store(new_deficit, Ordering::Relaxed);
        ctx.next_slice_ns.store(new_slice, Ordering::Relaxed);
        ctx.store_packed_if_changed(
            packed,
            packed.with_score(new_score).with_tier(new_tier),
        );
    }

    /// Periodic tick on the current task: the starvation safety net.
    ///
    /// The threshold gets 0-127us of per-task jitter so a crowd of
    /// threads that started together does not kick every CPU in the
    /// same microsecond.
    pub fn tick(&self, task: &Task) {
        let Some(ctx) = self.store.get(task.pid) else {
            return;
        };
        let last_run = ctx.last_run_at.load(Ordering::Relaxed);
        if last_run == 0 {
            return;
        }

        let tier = ctx.packed_info().tier();
        let base_ns = self.config.tiers.params(tier).starvation_ns;
        let now = self.kernel.now_ns();
        let jitter = (ctx.next_rand(now as u32) & JITTER_BITS) as u64;
        let threshold_ns = base_ns + (jitter << 10);

        let runtime_ns = (now as u32).wrapping_sub(last_run) as u64;
        if runtime_ns > threshold_ns {
            self.kernel
                .kick_cpu(self.kernel.task_cpu(task), KickKind::Preempt);
            if self.config.enable_stats {
                self.stats.cpu(self.kernel.this_cpu()).nr_starvation_preempts[tier as usize]
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// A CPU entered or left idle.
    ///
    /// Cached cursor: the shadow bit filters the ~99% of calls where
    /// nothing changed before any shared line is touched. Going idle
    /// publishes with release ordering and also retires the CPU as a
    /// victim.
    pub fn update_idle(&self, cpu: u32, idle: bool) {
        if cpu as usize >= MAX_CPUS {
            return;
        }
        let shadow = &self.shadows[cpu as usize];
        if shadow.idle() == idle {
            return;
        }

        if idle {
            self.idle.set(cpu);
            if shadow.victim() {
                self.victims.clear(cpu);
                shadow.set_victim(false);
            }
        } else {
            self.idle.clear(cpu);
        }
        shadow.set_idle(idle);
    }

    /// A task joined the scheduler class. Context is created lazily on
    /// first run, so nothing to do.
    pub fn enable(&self, _task: &Task) {}

    /// A task left the scheduler class; release its storage.
    pub fn disable(&self, task: &Task) {
        self.store.remove(task.pid);
    }

    /// Aggregate statistics for the loader.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue depth by id, for the loader and tests.
    pub fn nr_queued(&self, dsq: u32) -> u32 {
        self.dsqs.nr_queued(dsq)
    }

    /// Detach record, if the framework has exited.
    pub fn take_exit_info(&self) -> Option<ExitInfo> {
        self.exit_info.lock().take()
    }

    /// Number of live task contexts.
    pub fn nr_contexts(&self) -> usize {
        self.store.len()
    }

    /// Point-in-time view of one task's scheduling state, for debug
    /// dumps and tests.
    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        let ctx = self.store.get(pid)?;
        let packed = ctx.packed_info();
        Some(TaskState {
            tier: packed.tier(),
            score: packed.score(),
            avg_runtime_us: ctx.avg_runtime_us.load(Ordering::Relaxed),
            deficit_us: ctx.deficit_us.load(Ordering::Relaxed),
            next_slice_ns: ctx.next_slice_ns.load(Ordering::Relaxed),
            wait_checks: packed.wait().checks(),
            wait_violations: packed.wait().violations(),
            wake_pending: ctx.last_wake_ts.load(Ordering::Relaxed) != 0,
        })
    }
}

/// Read-only snapshot of one task's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskState {
    pub tier: Tier,
    pub score: u8,
    pub avg_runtime_us: u16,
    pub deficit_us: u16,
    pub next_slice_ns: u32,
    pub wait_checks: u8,
    pub wait_violations: u8,
    pub wake_pending: bool,
}
