//! Barrier scheduling pipeline.
//!
//! Maps the unbounded logical barriers of a [`TaskGraph`] onto the fixed
//! physical slot pool, in fixed pass order:
//!
//! ```text
//! TaskGraph ──finalize──▶ +completion barrier
//!           ──prune────▶ consumer-less barriers dropped
//!           ──legalize──▶ split / join / serialize to fixpoint
//!           ──simulate──▶ strict sweep, virtual→physical Assignment
//!           ──emit──────▶ Schedule (physical barrier operands)
//! ```
//!
//! Every pass is deterministic, so the same graph and config always produce
//! the same [`Schedule`]. There is no strategy selection and no retry: a
//! graph the legalizers cannot fit is a hard [`ScheduleError`].

pub mod emit;
pub mod finalize;
pub mod legalize;
pub mod simulate;

pub use emit::{PhysicalBarrier, Schedule, ScheduledTask};
pub use legalize::LegalizeStats;
pub use simulate::{Assignment, CongestionProfile, InfeasibleKind, InfeasibleReport};

use thiserror::Error;

use crate::config::SchedulerConfig;
use crate::graph::{GraphError, TaskGraph};

/// Fatal scheduling failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// The input graph violates a structural invariant.
    #[error("malformed task graph: {0}")]
    Malformed(#[from] GraphError),

    /// The legalizer fixpoint did not converge within the configured cap.
    #[error("legalization did not converge within {iterations} iterations")]
    LegalizationTimeout { iterations: u32 },

    /// The strict feasibility sweep found no valid slot assignment. After a
    /// clean legalization this indicates a scheduler defect, not bad input.
    #[error("no feasible physical barrier assignment: {0}")]
    Infeasible(InfeasibleReport),
}

/// Run the full pipeline, rewriting `graph` in place and returning the
/// physical [`Schedule`].
pub fn schedule(
    graph: &mut TaskGraph,
    config: &SchedulerConfig,
) -> Result<Schedule, ScheduleError> {
    log::debug!(
        "scheduling {} tasks / {} barriers onto {} physical slots (wlm: {})",
        graph.num_tasks(),
        graph.num_barriers(),
        config.physical_barriers,
        config.wlm
    );

    finalize::finalize(graph, config.wlm, config.max_producers_per_barrier)?;
    graph.prune_dead_barriers();
    graph.validate()?;

    legalize::legalize(graph, config)?;

    let assignment = simulate::simulate(graph, config.physical_barriers)
        .map_err(ScheduleError::Infeasible)?;
    Ok(emit::emit(graph, &assignment))
}
