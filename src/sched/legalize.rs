//! Constraint legalizers.
//!
//! Three cooperating rewrites reduce the logical dependency graph until it
//! is simulatable under the hardware limits:
//!
//! - **Producer split**: a barrier whose summed signal count exceeds the
//!   per-barrier counter width is replaced by one barrier per contiguous
//!   producer group; consumers wait on the whole split set.
//! - **Wait join**: task descriptors dispatch with a single wait barrier, so
//!   a task waiting on several barriers is rewritten to wait on one join
//!   barrier signaled by synthetic zero-cost markers, one per original wait.
//! - **Live-set reduction**: when the profiling sweep shows more barriers
//!   simultaneously live than the slot budget, one serialization edge is
//!   added to delay a victim barrier's lifetime start past an early-retiring
//!   anchor, screened against cycles.
//!
//! Each rewrite can re-expose violations for the others (a split widens wait
//! sets, a join concentrates producers, a serialization widens a wait set),
//! so all three run to a fixpoint. The fixpoint is bounded by a hard
//! iteration cap; exceeding it is a fatal compiler error, never a silent
//! fallback.

use crate::config::SchedulerConfig;
use crate::graph::{BarrierId, GraphError, TaskGraph, TaskId, TaskKind};
use crate::sched::simulate::{self, CongestionProfile};
use crate::sched::ScheduleError;

/// Per-run legalization counters, logged at `info` level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegalizeStats {
    /// Fixpoint iterations that applied at least one rewrite.
    pub iterations: u32,
    /// Barriers split for producer-count overflow.
    pub splits: usize,
    /// Multi-wait tasks rewritten through a join barrier.
    pub joins: usize,
    /// Serialization edges added for live-set reduction.
    pub serializations: usize,
}

/// Run all legalizers to a fixpoint bounded by the configured cap.
pub fn legalize(
    graph: &mut TaskGraph,
    config: &SchedulerConfig,
) -> Result<LegalizeStats, ScheduleError> {
    let budget = config.slot_budget();
    let mut stats = LegalizeStats::default();

    loop {
        let splits = split_producer_overflow(graph, config.max_producers_per_barrier)?;
        let joins = join_multi_waits(graph);
        let serializations = reduce_live_pressure(graph, budget)?;

        stats.splits += splits;
        stats.joins += joins;
        stats.serializations += serializations;

        if splits + joins + serializations == 0 {
            break;
        }
        stats.iterations += 1;
        // The cap bounds productive rounds; converging in exactly the
        // capped number is still success.
        if stats.iterations > config.legalize_iteration_cap {
            return Err(ScheduleError::LegalizationTimeout {
                iterations: stats.iterations,
            });
        }
    }

    log::info!(
        "legalize: {} iterations, {} splits, {} joins, {} serializations",
        stats.iterations,
        stats.splits,
        stats.joins,
        stats.serializations
    );
    Ok(stats)
}

/// Pass (a): split barriers whose hardware-visible signal count exceeds the
/// per-barrier counter limit.
///
/// Producers are ordered by program position and partitioned into contiguous
/// groups whose summed variant counts stay under the limit; the barrier is
/// replaced by one barrier per group, each waited on by every original
/// consumer so the "all producers signaled" semantics survive as a
/// conjunction. Completion barriers are exempt (finalization bounds their
/// producer count instead). Returns the number of barriers split.
pub fn split_producer_overflow(graph: &mut TaskGraph, limit: u32) -> Result<usize, GraphError> {
    let targets: Vec<BarrierId> = graph
        .live_barriers()
        .filter(|&b| !graph.barrier(b).is_final && graph.producer_count(b) > limit)
        .collect();

    for &b in &targets {
        let mut producers = graph.producers_of(b).to_vec();
        producers.sort_by_key(|&t| graph.program_key(t));

        // Contiguous grouping under the limit.
        let mut groups: Vec<Vec<TaskId>> = Vec::new();
        let mut current: Vec<TaskId> = Vec::new();
        let mut current_signals = 0u32;
        for p in producers {
            let variants = graph.task(p).variant_count;
            if variants > limit {
                return Err(GraphError::IndivisibleProducer {
                    task: p,
                    variants,
                    limit,
                });
            }
            if current_signals + variants > limit && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_signals = 0;
            }
            current_signals += variants;
            current.push(p);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let consumers = graph.consumers_of(b).to_vec();
        log::debug!(
            "splitting barrier {} ({} signals > {}) into {} barriers",
            b,
            graph.producer_count(b),
            limit,
            groups.len()
        );
        for group in &groups {
            let nb = graph.add_barrier();
            for &p in group {
                graph.remove_update(p, b);
                graph.add_update(p, nb);
            }
            for &c in &consumers {
                graph.add_wait(c, nb);
            }
        }
        for &c in &consumers {
            graph.remove_wait(c, b);
        }
        graph.kill_barrier(b);
    }
    Ok(targets.len())
}

/// Pass (b): rewrite tasks waiting on more than one barrier.
///
/// For a task waiting on `{b1..bk}`, a join barrier is created and `k`
/// synthetic markers are inserted on the task's queue immediately before it,
/// each waiting on one original barrier and signaling the join; the task
/// then waits only on the join. Applied only where a real violation exists.
/// Returns the number of tasks rewritten.
pub fn join_multi_waits(graph: &mut TaskGraph) -> usize {
    let mut rewritten = 0;
    for t in 0..graph.num_tasks() {
        let waits = graph.task(t).wait_barriers.clone();
        if waits.len() <= 1 {
            continue;
        }
        let join = graph.add_barrier();
        log::debug!(
            "task {} waits on {} barriers, joining through barrier {}",
            t,
            waits.len(),
            join
        );
        for &b in &waits {
            graph.remove_wait(t, b);
            graph.insert_task_before(t, TaskKind::SyncMarker, 1, &[b], &[join]);
        }
        graph.add_wait(t, join);
        rewritten += 1;
    }
    rewritten
}

/// Pass (c): reduce peak live-barrier concurrency below the slot budget.
///
/// Runs the profiling sweep; at the first overflow event, picks a victim
/// among the live barriers (longest remaining lifetime first) and delays its
/// lifetime start by making its first producer an extra consumer of an
/// early-retiring anchor barrier. The sweep releases waits before binding
/// updates, so the anchor's slot frees before the victim binds. Candidate
/// edges are screened for cycles and applied one per invocation; the
/// fixpoint loop re-profiles after each edge.
///
/// Only edges introduced here (or by the other passes) are ever touched;
/// upstream data dependencies are never removed.
pub fn reduce_live_pressure(graph: &mut TaskGraph, budget: usize) -> Result<usize, ScheduleError> {
    let profile = simulate::profile(graph, budget).map_err(ScheduleError::Infeasible)?;
    let Some(overflow) = profile.first_overflow.clone() else {
        return Ok(0);
    };
    log::debug!(
        "live-set overflow at step {}: barrier {} binds over budget {} (peak {})",
        overflow.step,
        overflow.barrier,
        budget,
        profile.peak_live
    );

    let mut sweep_pos = vec![usize::MAX; graph.num_tasks()];
    for (i, &t) in profile.sweep_order.iter().enumerate() {
        sweep_pos[t] = i;
    }

    // Victims: live barriers at the overflow, longest remaining lifetime
    // first. The overflowing barrier itself is a victim candidate too; its
    // own bind can be delayed just as well.
    let mut victims: Vec<BarrierId> = overflow
        .live
        .iter()
        .copied()
        .chain(std::iter::once(overflow.barrier))
        .filter(|&b| !graph.barrier(b).is_final)
        .collect();
    victims.sort_by_key(|&b| {
        (
            std::cmp::Reverse(retire_key(&profile, b)),
            b,
        )
    });

    // Anchors: same pool, earliest retirement first.
    let mut anchors: Vec<BarrierId> = overflow
        .live
        .iter()
        .copied()
        .chain(std::iter::once(overflow.barrier))
        .filter(|&b| !graph.barrier(b).is_final)
        .collect();
    anchors.sort_by_key(|&b| (retire_key(&profile, b), b));

    for &victim in &victims {
        let first_producer = graph
            .producers_of(victim)
            .iter()
            .copied()
            .min_by_key(|&p| sweep_pos[p])
            .expect("BUG: live barrier with no producers");

        for &anchor in &anchors {
            if anchor == victim {
                continue;
            }
            if graph.task(first_producer).wait_barriers.contains(&anchor) {
                continue;
            }
            // Cycle screen: the anchor must not depend on the producer we
            // are about to make wait.
            let anchor_producers = graph.producers_of(anchor).to_vec();
            if anchor_producers.iter().any(|&p| graph.reaches(first_producer, p)) {
                continue;
            }
            // Redundant edge: anchor already precedes the producer entirely.
            if anchor_producers.iter().all(|&p| graph.reaches(p, first_producer)) {
                continue;
            }
            log::debug!(
                "serializing barrier {} behind barrier {} (task {} gains wait)",
                victim,
                anchor,
                first_producer
            );
            graph.add_wait(first_producer, anchor);
            return Ok(1);
        }
    }

    log::warn!(
        "live-set overflow at step {} has no legal serialization edge; \
         leaving for the strict sweep to report",
        overflow.step
    );
    Ok(0)
}

fn retire_key(profile: &CongestionProfile, barrier: BarrierId) -> usize {
    profile.retire_step[barrier].unwrap_or(usize::MAX)
}
