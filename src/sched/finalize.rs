//! Completion-barrier finalization.
//!
//! Host/runtime code detects full-graph completion by waiting on a single
//! physical barrier. This pass guarantees that barrier exists: every queue
//! that would otherwise finish without signaling anything gets its last task
//! rewritten to update one shared `is_final` barrier. All queues converge on
//! the same barrier so the host has exactly one thing to wait on.
//!
//! In WLM mode the requirement is stricter: every queue's last task updates
//! the completion barrier, whether or not it already signals real work, so
//! completion of each lane is explicitly detectable.
//!
//! The pass is purely additive and idempotent; running it twice is a no-op.
//! It runs before legalization because it can only add edges.

use crate::graph::{BarrierId, GraphError, TaskGraph, TaskId};

/// Append the shared completion barrier where needed.
///
/// Returns the completion barrier id, or `None` when no queue needed one
/// (and none existed). Fails only for degenerate inputs where the completion
/// barrier's producer count would exceed the hardware signal limit.
pub fn finalize(
    graph: &mut TaskGraph,
    wlm: bool,
    max_producers: u32,
) -> Result<Option<BarrierId>, GraphError> {
    let existing = graph.live_barriers().find(|&b| graph.barrier(b).is_final);

    // Last task of each queue that still needs a completion signal.
    let mut pending: Vec<TaskId> = Vec::new();
    for q in graph.queue_ids().collect::<Vec<_>>() {
        let Some(&last) = graph.tasks_in_program_order(q).last() else {
            continue;
        };
        let updates = &graph.task(last).update_barriers;
        let already_final = updates.iter().any(|&b| graph.barrier(b).is_final);
        let needs = if wlm {
            !already_final
        } else {
            updates.is_empty()
        };
        if needs {
            pending.push(last);
        }
    }

    if pending.is_empty() {
        return Ok(existing);
    }

    let final_barrier = match existing {
        Some(b) => b,
        None => graph.add_final_barrier(),
    };
    for task in &pending {
        graph.add_update(*task, final_barrier);
    }

    let signals = graph.producer_count(final_barrier);
    if signals > max_producers {
        return Err(GraphError::TooManyQueues {
            queues: graph.producers_of(final_barrier).len(),
            limit: max_producers,
        });
    }

    log::info!(
        "finalize: barrier {} signaled by {} queue tails ({} signals)",
        final_barrier,
        pending.len(),
        signals
    );
    Ok(Some(final_barrier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskKind;

    #[test]
    fn test_appends_shared_final_barrier() {
        let mut g = TaskGraph::new();
        let b = g.add_barrier();
        let t1 = g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b]).unwrap();
        let t2 = g.push_task(1, TaskKind::Compute, 1, &[b], &[]).unwrap();
        let t3 = g.push_task(2, TaskKind::Vector, 1, &[], &[]).unwrap();

        let f = finalize(&mut g, false, 255).unwrap().unwrap();
        assert!(g.barrier(f).is_final);
        // Queue 0's tail already signals b: untouched in default mode.
        assert_eq!(g.task(t1).update_barriers.as_slice(), &[b]);
        // Queues 1 and 2 end silent: both converge on the shared barrier.
        assert_eq!(g.task(t2).update_barriers.as_slice(), &[f]);
        assert_eq!(g.task(t3).update_barriers.as_slice(), &[f]);
        assert_eq!(g.producers_of(f), &[t2, t3]);
    }

    #[test]
    fn test_wlm_signals_every_queue_tail() {
        let mut g = TaskGraph::new();
        let b = g.add_barrier();
        let t1 = g.push_task(0, TaskKind::DmaCopy, 1, &[], &[b]).unwrap();
        let t2 = g.push_task(1, TaskKind::Compute, 1, &[b], &[]).unwrap();

        let f = finalize(&mut g, true, 255).unwrap().unwrap();
        // Even the tail that already signals real work joins the barrier.
        assert!(g.task(t1).update_barriers.contains(&f));
        assert!(g.task(t2).update_barriers.contains(&f));
        assert_eq!(g.producer_count(f), 2);
    }

    #[test]
    fn test_idempotent() {
        let mut g = TaskGraph::new();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[]).unwrap();
        g.push_task(1, TaskKind::Compute, 1, &[], &[]).unwrap();

        let f1 = finalize(&mut g, false, 255).unwrap();
        let snapshot_barriers = g.num_barriers();
        let snapshot_tasks = g.num_tasks();
        let f2 = finalize(&mut g, false, 255).unwrap();

        assert_eq!(f1, f2);
        assert_eq!(g.num_barriers(), snapshot_barriers);
        assert_eq!(g.num_tasks(), snapshot_tasks);
        assert_eq!(g.producer_count(f1.unwrap()), 2); // not double-counted
    }

    #[test]
    fn test_no_op_when_all_tails_signal() {
        let mut g = TaskGraph::new();
        let x = g.add_barrier();
        let y = g.add_barrier();
        let z = g.add_barrier();
        g.push_task(0, TaskKind::DmaCopy, 1, &[], &[x]).unwrap();
        g.push_task(1, TaskKind::Compute, 1, &[x], &[y]).unwrap();
        g.push_task(0, TaskKind::Compute, 1, &[y], &[z]).unwrap();

        // Both queue tails already signal: default mode leaves the graph alone.
        let before = g.num_barriers();
        assert_eq!(finalize(&mut g, false, 255).unwrap(), None);
        assert_eq!(g.num_barriers(), before);
    }

    #[test]
    fn test_signal_limit_enforced() {
        let mut g = TaskGraph::new();
        for q in 0..4 {
            g.push_task(q, TaskKind::DmaCopy, 1, &[], &[]).unwrap();
        }
        let err = finalize(&mut g, false, 3).unwrap_err();
        assert!(matches!(err, GraphError::TooManyQueues { queues: 4, limit: 3 }));
    }
}
