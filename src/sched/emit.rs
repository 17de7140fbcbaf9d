//! Physical assignment emitter.
//!
//! A pure 1:1 rewrite of the legalized graph through the simulator's
//! [`Assignment`]: every logical barrier id is replaced by its physical
//! slot, tasks keep their queue program order. No scheduling decisions are
//! made here; a logical barrier without a slot at this point is a
//! simulator/legalizer defect and panics rather than erroring.

use smallvec::SmallVec;

use crate::graph::{QueueId, SlotId, TaskGraph, TaskKind};
use crate::sched::simulate::Assignment;

/// One physical hardware barrier used by the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalBarrier {
    pub slot: SlotId,
    /// Completion barrier the host polls on.
    pub is_final: bool,
}

/// A task descriptor ready for dispatch: barrier operands are physical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub queue: QueueId,
    pub kind: TaskKind,
    pub variant_count: u32,
    /// At most one wait slot survives legalization.
    pub wait: Option<SlotId>,
    /// Slots each variant signals on completion.
    pub updates: SmallVec<[SlotId; 2]>,
}

/// Complete physical schedule for one task graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Per-queue task lists in program order, ascending queue id.
    pub queues: Vec<(QueueId, Vec<ScheduledTask>)>,
    /// Physical barriers in use, in slot order.
    pub barriers: Vec<PhysicalBarrier>,
    /// Slot the host polls for end-of-graph completion, if finalized.
    pub completion_slot: Option<SlotId>,
}

impl Schedule {
    /// Total number of task descriptors, synthetic markers included.
    pub fn num_tasks(&self) -> usize {
        self.queues.iter().map(|(_, tasks)| tasks.len()).sum()
    }

    pub fn print_summary(&self) {
        println!("Schedule Summary");
        println!("================");
        println!("Queues: {}", self.queues.len());
        println!("Tasks: {}", self.num_tasks());
        println!("Physical barriers: {}", self.barriers.len());
        match self.completion_slot {
            Some(slot) => println!("Completion slot: {}", slot),
            None => println!("Completion slot: none"),
        }
        println!();

        for (queue, tasks) in &self.queues {
            println!("  queue {}:", queue);
            for task in tasks {
                let wait = match task.wait {
                    Some(s) => format!("wait s{}", s),
                    None => "-".to_string(),
                };
                let updates: Vec<String> =
                    task.updates.iter().map(|s| format!("s{}", s)).collect();
                println!(
                    "    {:?} x{} [{}] -> [{}]",
                    task.kind,
                    task.variant_count,
                    wait,
                    updates.join(" ")
                );
            }
        }
    }
}

/// Rewrite the legalized graph into its physical [`Schedule`].
pub fn emit(graph: &TaskGraph, assignment: &Assignment) -> Schedule {
    let slot_of = |b: usize| -> SlotId {
        assignment.slots[b].expect("BUG: logical barrier missing physical assignment")
    };

    let mut barriers: Vec<PhysicalBarrier> = graph
        .live_barriers()
        .filter(|&b| assignment.slots[b].is_some())
        .map(|b| PhysicalBarrier {
            slot: slot_of(b),
            is_final: graph.barrier(b).is_final,
        })
        .collect();
    // Disjoint-lifetime barriers share a slot; one physical entry per slot,
    // keeping the completion marker if the final barrier is among them.
    barriers.sort_by_key(|p| (p.slot, !p.is_final));
    barriers.dedup_by_key(|p| p.slot);

    let queues = graph
        .queue_ids()
        .map(|q| {
            let tasks = graph
                .tasks_in_program_order(q)
                .iter()
                .map(|&t| {
                    let task = graph.task(t);
                    debug_assert!(
                        task.wait_barriers.len() <= 1,
                        "BUG: task {} kept {} waits past legalization",
                        t,
                        task.wait_barriers.len()
                    );
                    ScheduledTask {
                        queue: q,
                        kind: task.kind,
                        variant_count: task.variant_count,
                        wait: task.wait_barriers.first().map(|&b| slot_of(b)),
                        updates: task.update_barriers.iter().map(|&b| slot_of(b)).collect(),
                    }
                })
                .collect();
            (q, tasks)
        })
        .collect();

    Schedule {
        queues,
        barriers,
        completion_slot: assignment.completion_slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::simulate::simulate;

    #[test]
    fn test_emit_chain() {
        let mut g = TaskGraph::new();
        let b = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b]).unwrap();
        g.push_task(1, TaskKind::Compute, 1, &[b], &[]).unwrap();

        let assignment = simulate(&g, 2).unwrap();
        let schedule = emit(&g, &assignment);

        assert_eq!(schedule.barriers, vec![PhysicalBarrier { slot: 0, is_final: false }]);
        assert_eq!(schedule.queues.len(), 2);
        assert_eq!(schedule.num_tasks(), 2);

        let (_, dma) = &schedule.queues[0];
        assert_eq!(dma[0].wait, None);
        assert_eq!(dma[0].updates.as_slice(), &[0]);
        let (_, compute) = &schedule.queues[1];
        assert_eq!(compute[0].wait, Some(0));
        assert!(compute[0].updates.is_empty());
    }

    #[test]
    fn test_emit_slot_reuse_shares_physical_barrier() {
        // Two logical barriers with disjoint lifetimes share one slot; the
        // emitted schedule has a single physical barrier.
        let mut g = TaskGraph::new();
        let b1 = g.add_barrier();
        let b2 = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b1]).unwrap();
        g.push_task(1, TaskKind::Compute, 1, &[b1], &[b2]).unwrap();
        g.push_task(2, TaskKind::Vector, 1, &[b2], &[]).unwrap();

        let assignment = simulate(&g, 1).unwrap();
        let schedule = emit(&g, &assignment);
        assert_eq!(schedule.barriers.len(), 1);
        assert_eq!(schedule.barriers[0].slot, 0);
    }

    #[test]
    fn test_emit_completion_slot() {
        let mut g = TaskGraph::new();
        let f = g.add_final_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[f]).unwrap();

        let assignment = simulate(&g, 1).unwrap();
        let schedule = emit(&g, &assignment);
        assert_eq!(schedule.completion_slot, Some(0));
        assert_eq!(
            schedule.barriers,
            vec![PhysicalBarrier { slot: 0, is_final: true }]
        );
    }
}
