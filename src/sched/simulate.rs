//! Barrier feasibility simulator.
//!
//! A single deterministic forward sweep over the task graph in global program
//! order, defined by list scheduling: queues are visited round-robin in
//! ascending queue id, and a queue's cursor advances only when its head
//! task's wait barriers are all fully signaled. Within one simulated task,
//! waits are released (possibly retiring barriers and freeing their slots)
//! *before* updates bind new slots, so a slot retired by a task is
//! immediately reusable by that same task.
//!
//! Physical slots are bound lazily: a logical barrier acquires the lowest
//! free slot at the moment its first producer executes, and the slot returns
//! to the pool only once the barrier's producer and consumer counters have
//! both reached zero. A slot is owned by exactly one logical barrier at any
//! simulated time; violations are internal bugs, not input errors.
//!
//! Two modes share the sweep:
//!
//! - **strict** ([`simulate`]): enforces the physical pool size and returns
//!   an [`Assignment`] or an [`InfeasibleReport`] with full diagnostic
//!   context. Reaching infeasibility after legalization is a compiler
//!   defect, surfaced loudly rather than retried.
//! - **profile** ([`profile`]): never aborts on pool exhaustion; binds
//!   virtual slots without limit and records barrier lifetimes, the live
//!   count per step, and the first overflow event. Legalization uses this
//!   to find congestion before it becomes an error.

use std::fmt;

use crate::graph::{BarrierId, SlotId, TaskGraph, TaskId};

/// Final output of a successful feasibility sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Physical slot per logical barrier, indexed by barrier id.
    /// `None` for dead barriers and barriers that never went live.
    pub slots: Vec<Option<SlotId>>,
    /// Slot of the designated completion barrier, if the graph has one.
    pub completion_slot: Option<SlotId>,
    /// Tasks in simulated execution order.
    pub sweep_order: Vec<TaskId>,
}

/// Why the sweep could not produce a valid assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfeasibleKind {
    /// A task's wait barrier was not live at release time: a missing or
    /// mis-ordered dependency upstream.
    WaitNotLive { barrier: BarrierId },
    /// No free physical slot when a barrier needed to bind.
    NoFreeSlot { barrier: BarrierId },
    /// No queue could advance although tasks remain: circular or
    /// unsatisfiable dependencies.
    Stalled { blocked_task: TaskId },
    /// A non-final (or under-signaled) barrier was still live after the
    /// full sweep: a dangling producer or consumer.
    DanglingLive { barrier: BarrierId },
    /// More than one completion barrier survived the sweep; the host polls
    /// a single completion slot.
    DuplicateCompletion { barrier: BarrierId },
}

/// Infeasibility diagnostic: the congestion point with full context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfeasibleReport {
    /// Program position (sweep step index) of the failure.
    pub position: usize,
    /// Task being simulated when the failure occurred, if any.
    pub task: Option<TaskId>,
    /// Specific violation.
    pub kind: InfeasibleKind,
    /// Barriers live at the failure point.
    pub live_barriers: Vec<BarrierId>,
    /// Physical slots in use at the failure point.
    pub slots_in_use: usize,
    /// Physical pool size.
    pub pool_size: usize,
}

impl fmt::Display for InfeasibleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InfeasibleKind::WaitNotLive { barrier } => write!(
                f,
                "task {:?} waits on barrier {} which is not live at step {}",
                self.task, barrier, self.position
            )?,
            InfeasibleKind::NoFreeSlot { barrier } => write!(
                f,
                "no free physical slot for barrier {} at step {} (task {:?})",
                barrier, self.position, self.task
            )?,
            InfeasibleKind::Stalled { blocked_task } => write!(
                f,
                "sweep stalled at step {}: task {} can never become ready",
                self.position, blocked_task
            )?,
            InfeasibleKind::DanglingLive { barrier } => write!(
                f,
                "barrier {} still live after full sweep (dangling dependency)",
                barrier
            )?,
            InfeasibleKind::DuplicateCompletion { barrier } => write!(
                f,
                "barrier {} is a second completion barrier after the sweep",
                barrier
            )?,
        }
        write!(
            f,
            "; live barriers {:?}, slots in use {}/{}",
            self.live_barriers, self.slots_in_use, self.pool_size
        )
    }
}

/// Overflow event recorded by the profiling sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowEvent {
    /// Sweep step at which the overflow occurred.
    pub step: usize,
    /// Task whose update triggered the bind.
    pub task: TaskId,
    /// Barrier that had to bind beyond the budget.
    pub barrier: BarrierId,
    /// Barriers live immediately before the bind.
    pub live: Vec<BarrierId>,
}

/// Concurrency profile of a full sweep, budget violations included.
#[derive(Debug, Clone)]
pub struct CongestionProfile {
    /// Maximum number of simultaneously live barriers.
    pub peak_live: usize,
    /// Live-barrier count after each sweep step.
    pub live_per_step: Vec<usize>,
    /// Step at which each barrier went live, indexed by barrier id.
    pub bind_step: Vec<Option<usize>>,
    /// Step at which each barrier retired, indexed by barrier id.
    pub retire_step: Vec<Option<usize>>,
    /// Tasks in simulated execution order.
    pub sweep_order: Vec<TaskId>,
    /// First bind that exceeded the budget, if any.
    pub first_overflow: Option<OverflowEvent>,
}

/// Physical slot state. Counters live with the barrier bookkeeping; the
/// pool only tracks ownership so mutual exclusion is enforced in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Programmed(BarrierId),
}

/// Shared sweep state for both modes.
struct Sweep<'g> {
    graph: &'g TaskGraph,
    remaining_producers: Vec<u32>,
    remaining_consumers: Vec<u32>,
    live: Vec<bool>,
    /// Pool indices, not hardware slot ids: profile mode grows the pool
    /// past the hardware id range.
    bound: Vec<Option<usize>>,
    slots: Vec<SlotState>,
    /// Profile mode grows the pool instead of failing.
    unlimited: bool,
    sweep_order: Vec<TaskId>,
}

impl<'g> Sweep<'g> {
    fn new(graph: &'g TaskGraph, pool_size: usize, unlimited: bool) -> Self {
        let n = graph.num_barriers();
        let mut remaining_producers = vec![0u32; n];
        let mut remaining_consumers = vec![0u32; n];
        for b in graph.live_barriers() {
            remaining_producers[b] = graph.producer_count(b);
            remaining_consumers[b] = graph.consumers_of(b).len() as u32;
        }
        Self {
            graph,
            remaining_producers,
            remaining_consumers,
            live: vec![false; n],
            bound: vec![None; n],
            slots: vec![SlotState::Free; pool_size],
            unlimited,
            sweep_order: Vec::with_capacity(graph.num_tasks()),
        }
    }

    fn live_set(&self) -> Vec<BarrierId> {
        self.live
            .iter()
            .enumerate()
            .filter(|(_, &l)| l)
            .map(|(b, _)| b)
            .collect()
    }

    fn slots_in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotState::Programmed(_)))
            .count()
    }

    fn report(&self, position: usize, task: Option<TaskId>, kind: InfeasibleKind) -> InfeasibleReport {
        InfeasibleReport {
            position,
            task,
            kind,
            live_barriers: self.live_set(),
            slots_in_use: self.slots_in_use(),
            pool_size: self.slots.len(),
        }
    }

    /// All wait barriers fully signaled and still live.
    fn is_ready(&self, task: TaskId) -> bool {
        self.graph
            .task(task)
            .wait_barriers
            .iter()
            .all(|&b| self.live[b] && self.remaining_producers[b] == 0)
    }

    /// Bind the lowest free slot to `barrier`.
    fn bind(&mut self, barrier: BarrierId) -> Option<usize> {
        let free = self.slots.iter().position(|&s| s == SlotState::Free);
        let idx = match free {
            Some(i) => i,
            None if self.unlimited => {
                self.slots.push(SlotState::Free);
                self.slots.len() - 1
            }
            None => return None,
        };
        self.slots[idx] = SlotState::Programmed(barrier);
        self.bound[barrier] = Some(idx);
        self.live[barrier] = true;
        log::debug!("barrier {} bound to slot {}", barrier, idx);
        Some(idx)
    }

    /// Retire `barrier`: both counters are zero, return its slot to the pool.
    fn retire(&mut self, barrier: BarrierId) {
        let slot = self.bound[barrier].expect("BUG: retiring unbound barrier");
        match self.slots[slot] {
            SlotState::Programmed(owner) if owner == barrier => {
                self.slots[slot] = SlotState::Free;
            }
            other => panic!(
                "BUG: slot {} owned by {:?} while retiring barrier {}",
                slot, other, barrier
            ),
        }
        self.live[barrier] = false;
        log::debug!("barrier {} retired, slot {} freed", barrier, slot);
    }

    /// Simulate one task. Waits are released before updates bind.
    fn exec(
        &mut self,
        task: TaskId,
        step: usize,
        observer: &mut impl SweepObserver,
    ) -> Result<(), InfeasibleReport> {
        let waits: Vec<BarrierId> = self.graph.task(task).wait_barriers.to_vec();
        for b in waits {
            if !self.live[b] {
                return Err(self.report(step, Some(task), InfeasibleKind::WaitNotLive { barrier: b }));
            }
            self.remaining_consumers[b] -= 1;
            if self.remaining_consumers[b] == 0 && self.remaining_producers[b] == 0 {
                self.retire(b);
                observer.retired(b, step);
            }
        }

        let variant_count = self.graph.task(task).variant_count;
        let updates: Vec<BarrierId> = self.graph.task(task).update_barriers.to_vec();
        for b in updates {
            if !self.live[b] {
                debug_assert!(self.bound[b].is_none(), "BUG: barrier {} signaled after retirement", b);
                let live_before = self.live_set();
                if self.bind(b).is_none() {
                    return Err(self.report(step, Some(task), InfeasibleKind::NoFreeSlot { barrier: b }));
                }
                observer.bound(b, task, step, live_before);
            }
            self.remaining_producers[b] = self.remaining_producers[b]
                .checked_sub(variant_count)
                .expect("BUG: barrier over-signaled beyond its static producer count");
            // A barrier whose consumers all released before its last signal
            // cannot exist (consumers wait for full signaling), so only
            // consumer-less barriers complete here. Final barriers stay
            // programmed for the host; anything else was pruned upstream.
            if self.remaining_producers[b] == 0
                && self.remaining_consumers[b] == 0
                && !self.graph.barrier(b).is_final
            {
                self.retire(b);
                observer.retired(b, step);
            }
        }

        self.sweep_order.push(task);
        observer.stepped(self.live.iter().filter(|&&l| l).count());
        Ok(())
    }

    /// Run the full round-robin sweep.
    fn run(&mut self, observer: &mut impl SweepObserver) -> Result<(), InfeasibleReport> {
        let queues: Vec<_> = self.graph.queue_ids().collect();
        let mut cursors = vec![0usize; queues.len()];
        let total = self.graph.num_tasks();
        let mut step = 0usize;

        while step < total {
            let mut progressed = false;
            for (qi, &q) in queues.iter().enumerate() {
                let lane = self.graph.tasks_in_program_order(q);
                if cursors[qi] >= lane.len() {
                    continue;
                }
                let head = lane[cursors[qi]];
                if !self.is_ready(head) {
                    log::trace!("queue {} blocked at task {}", q, head);
                    continue;
                }
                self.exec(head, step, observer)?;
                cursors[qi] += 1;
                step += 1;
                progressed = true;
            }
            if !progressed {
                // Deterministic counterexample: the blocked head of the
                // lowest unfinished queue.
                let blocked = queues
                    .iter()
                    .enumerate()
                    .find_map(|(qi, &q)| {
                        self.graph.tasks_in_program_order(q).get(cursors[qi]).copied()
                    })
                    .expect("BUG: sweep stalled with all cursors at end");
                return Err(self.report(step, None, InfeasibleKind::Stalled { blocked_task: blocked }));
            }
        }
        Ok(())
    }

    /// Post-sweep check: everything retired except a fully signaled
    /// completion barrier. Returns the completion slot's pool index.
    fn check_drained(&self) -> Result<Option<usize>, InfeasibleReport> {
        let mut completion = None;
        for b in self.graph.live_barriers() {
            if !self.live[b] {
                continue;
            }
            let fully_signaled =
                self.remaining_producers[b] == 0 && self.remaining_consumers[b] == 0;
            if self.graph.barrier(b).is_final && fully_signaled {
                if completion.is_some() {
                    return Err(self.report(
                        self.sweep_order.len(),
                        None,
                        InfeasibleKind::DuplicateCompletion { barrier: b },
                    ));
                }
                completion = self.bound[b];
                continue;
            }
            return Err(self.report(
                self.sweep_order.len(),
                None,
                InfeasibleKind::DanglingLive { barrier: b },
            ));
        }
        Ok(completion)
    }
}

/// Hooks the profiling sweep uses; the strict sweep ignores everything.
trait SweepObserver {
    fn bound(&mut self, _barrier: BarrierId, _task: TaskId, _step: usize, _live_before: Vec<BarrierId>) {}
    fn retired(&mut self, _barrier: BarrierId, _step: usize) {}
    fn stepped(&mut self, _live_count: usize) {}
}

struct NoObserver;
impl SweepObserver for NoObserver {}

struct ProfileObserver {
    budget: usize,
    profile: CongestionProfile,
}

impl SweepObserver for ProfileObserver {
    fn bound(&mut self, barrier: BarrierId, task: TaskId, step: usize, live_before: Vec<BarrierId>) {
        self.profile.bind_step[barrier] = Some(step);
        if live_before.len() >= self.budget && self.profile.first_overflow.is_none() {
            log::debug!(
                "overflow at step {}: barrier {} binds with {} already live (budget {})",
                step,
                barrier,
                live_before.len(),
                self.budget
            );
            self.profile.first_overflow = Some(OverflowEvent {
                step,
                task,
                barrier,
                live: live_before,
            });
        }
    }

    fn retired(&mut self, barrier: BarrierId, step: usize) {
        self.profile.retire_step[barrier] = Some(step);
    }

    fn stepped(&mut self, live_count: usize) {
        self.profile.live_per_step.push(live_count);
        self.profile.peak_live = self.profile.peak_live.max(live_count);
    }
}

/// Run the strict feasibility sweep against a physical pool of `pool_size`
/// slots, producing the virtual→physical [`Assignment`].
///
/// `pool_size` must fit the hardware slot id range (at most
/// `SlotId::MAX + 1` slots); real targets have far fewer.
pub fn simulate(graph: &TaskGraph, pool_size: usize) -> Result<Assignment, InfeasibleReport> {
    assert!(
        pool_size <= SlotId::MAX as usize + 1,
        "physical pool of {} slots exceeds the slot id range",
        pool_size
    );
    let mut sweep = Sweep::new(graph, pool_size, false);
    sweep.run(&mut NoObserver)?;
    let completion_slot = sweep.check_drained()?.map(|idx| idx as SlotId);
    log::info!(
        "feasibility sweep ok: {} tasks, {} barriers bound, completion slot {:?}",
        sweep.sweep_order.len(),
        sweep.bound.iter().filter(|s| s.is_some()).count(),
        completion_slot
    );
    Ok(Assignment {
        slots: sweep
            .bound
            .iter()
            .map(|s| s.map(|idx| idx as SlotId))
            .collect(),
        completion_slot,
        sweep_order: sweep.sweep_order,
    })
}

/// Run the profiling sweep: unlimited virtual slots, full concurrency
/// profile, first overflow beyond `budget` recorded instead of aborting.
///
/// Still fails on structural problems (stalled sweep, dead waits); those
/// cannot be profiled around.
pub fn profile(graph: &TaskGraph, budget: usize) -> Result<CongestionProfile, InfeasibleReport> {
    let n = graph.num_barriers();
    let mut observer = ProfileObserver {
        budget,
        profile: CongestionProfile {
            peak_live: 0,
            live_per_step: Vec::with_capacity(graph.num_tasks()),
            bind_step: vec![None; n],
            retire_step: vec![None; n],
            sweep_order: Vec::new(),
            first_overflow: None,
        },
    };
    let mut sweep = Sweep::new(graph, 0, true);
    sweep.run(&mut observer)?;
    sweep.check_drained()?;
    observer.profile.sweep_order = sweep.sweep_order;
    Ok(observer.profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskKind;

    /// p1→B1, consumed by c1 on another queue.
    fn chain_graph() -> (TaskGraph, BarrierId) {
        let mut g = TaskGraph::new();
        let b = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b]).unwrap();
        g.push_task(1, TaskKind::Compute, 1, &[b], &[]).unwrap();
        (g, b)
    }

    #[test]
    fn test_chain_binds_slot_zero() {
        let (g, b) = chain_graph();
        let assignment = simulate(&g, 1).unwrap();
        assert_eq!(assignment.slots[b], Some(0));
        assert_eq!(assignment.completion_slot, None);
        assert_eq!(assignment.sweep_order, vec![0, 1]);
    }

    #[test]
    fn test_release_before_bind_reuses_slot() {
        // c consumes B1 and immediately produces B2: with release-before-bind
        // a single slot suffices.
        let mut g = TaskGraph::new();
        let b1 = g.add_barrier();
        let b2 = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b1]).unwrap();
        g.push_task(1, TaskKind::Compute, 1, &[b1], &[b2]).unwrap();
        g.push_task(2, TaskKind::Vector, 1, &[b2], &[]).unwrap();

        let assignment = simulate(&g, 1).unwrap();
        assert_eq!(assignment.slots[b1], Some(0));
        assert_eq!(assignment.slots[b2], Some(0)); // reused after retirement
    }

    #[test]
    fn test_pool_exhaustion_reported() {
        // Two barriers live at once, pool of one.
        let mut g = TaskGraph::new();
        let b1 = g.add_barrier();
        let b2 = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b1]).unwrap();
        g.push_task(1, TaskKind::DmaCopy, 1, &[], &[b2]).unwrap();
        g.push_task(2, TaskKind::Compute, 1, &[b1], &[]).unwrap();
        g.push_task(2, TaskKind::Compute, 1, &[b2], &[]).unwrap();

        let err = simulate(&g, 1).unwrap_err();
        assert_eq!(err.kind, InfeasibleKind::NoFreeSlot { barrier: b2 });
        assert_eq!(err.live_barriers, vec![b1]);
        assert_eq!(err.slots_in_use, 1);
        // Same graph fits in a pool of two.
        assert!(simulate(&g, 2).is_ok());
    }

    #[test]
    fn test_final_barrier_stays_programmed() {
        let mut g = TaskGraph::new();
        let f = g.add_final_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[f]).unwrap();

        let assignment = simulate(&g, 1).unwrap();
        assert_eq!(assignment.completion_slot, Some(0));
        assert_eq!(assignment.slots[f], Some(0));
    }

    #[test]
    fn test_dangling_consumer_is_infeasible() {
        // B produced but its second consumer lives on a queue that never
        // reaches it: consumer counter cannot drain.
        let mut g = TaskGraph::new();
        let b1 = g.add_barrier();
        let b2 = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b1]).unwrap();
        // Waits on b2 which is only produced after b1's consumer: fine.
        g.push_task(1, TaskKind::Compute, 1, &[b1], &[b2]).unwrap();
        // Second consumer of b1 blocked forever behind an unproduced wait.
        let dead = g.add_barrier();
        g.push_task(2, TaskKind::Compute, 1, &[dead], &[]).unwrap();
        g.push_task(2, TaskKind::Compute, 1, &[b1, b2], &[]).unwrap();

        let err = simulate(&g, 4).unwrap_err();
        assert!(matches!(err.kind, InfeasibleKind::Stalled { .. }));
    }

    #[test]
    fn test_variant_count_signaling() {
        // One producer with 3 variants: counter must drain exactly.
        let mut g = TaskGraph::new();
        let b = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 3, &[], &[b]).unwrap();
        g.push_task(1, TaskKind::Compute, 1, &[b], &[]).unwrap();
        assert!(simulate(&g, 1).is_ok());
    }

    #[test]
    fn test_profile_records_overflow() {
        // Three producers on distinct queues, consumers ordered so that all
        // three barriers are live at once.
        let mut g = TaskGraph::new();
        let b1 = g.add_barrier();
        let b2 = g.add_barrier();
        let b3 = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b1]).unwrap();
        g.push_task(1, TaskKind::DmaCopy, 1, &[], &[b2]).unwrap();
        g.push_task(2, TaskKind::DmaCopy, 1, &[], &[b3]).unwrap();
        g.push_task(3, TaskKind::Compute, 1, &[b3], &[]).unwrap();
        g.push_task(3, TaskKind::Compute, 1, &[b2], &[]).unwrap();
        g.push_task(3, TaskKind::Compute, 1, &[b1], &[]).unwrap();

        let p = profile(&g, 2).unwrap();
        assert_eq!(p.peak_live, 3);
        let overflow = p.first_overflow.expect("overflow expected with budget 2");
        assert_eq!(overflow.barrier, b3);
        assert_eq!(overflow.live, vec![b1, b2]);
        // Lifetimes are recorded for every bound barrier.
        assert!(p.bind_step[b1].is_some());
        assert!(p.retire_step[b1].is_some());
        assert!(p.bind_step[b1] < p.retire_step[b1]);
    }

    #[test]
    fn test_profile_pool_outgrows_slot_id_range() {
        // 300 barriers produced before any is consumed: the virtual pool
        // must grow past the hardware slot id width without wrapping.
        let n = 300;
        let mut g = TaskGraph::new();
        let barriers: Vec<BarrierId> = (0..n).map(|_| g.add_barrier()).collect();
        for &b in &barriers {
            g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b]).unwrap();
        }
        // Consume in reverse so the first consumer unblocks only after all
        // producers ran, keeping every barrier live at the peak.
        for &b in barriers.iter().rev() {
            g.push_task(1, TaskKind::Compute, 1, &[b], &[]).unwrap();
        }

        let p = profile(&g, 16).unwrap();
        assert_eq!(p.peak_live, n);
        assert!(p.first_overflow.is_some());
        for &b in &barriers {
            assert!(p.retire_step[b].is_some(), "barrier {} never retired", b);
        }
    }

    #[test]
    fn test_double_completion_rejected() {
        let mut g = TaskGraph::new();
        let f1 = g.add_final_barrier();
        let f2 = g.add_final_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[f1]).unwrap();
        g.push_task(1, TaskKind::DmaCopy, 1, &[], &[f2]).unwrap();

        let err = simulate(&g, 4).unwrap_err();
        assert_eq!(err.kind, InfeasibleKind::DuplicateCompletion { barrier: f2 });
    }

    #[test]
    fn test_profile_clean_when_under_budget() {
        let (g, _) = chain_graph();
        let p = profile(&g, 4).unwrap();
        assert_eq!(p.peak_live, 1);
        assert!(p.first_overflow.is_none());
    }

    #[test]
    fn test_determinism() {
        let (g, _) = chain_graph();
        let a = simulate(&g, 2).unwrap();
        let b = simulate(&g, 2).unwrap();
        assert_eq!(a, b);
    }
}
