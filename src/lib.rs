//! syncplan library
//!
//! Compile-time synchronization-barrier scheduling for NPU task graphs.
//!
//! A statically compiled task graph runs on several independent hardware
//! engines (DMA copy queues, compute-array queues, vector queues). Ordering
//! between queues is enforced through a small fixed pool of hardware counting
//! semaphores ("barriers"). This crate decides how an unbounded number of
//! logical dependency edges is packed onto that pool:
//!
//! 1. Finalization appends a shared completion barrier for the host.
//! 2. Legalization rewrites the graph until it fits hardware limits
//!    (per-barrier signal count, one wait per task, live-barrier pool size).
//! 3. The feasibility simulator runs a deterministic sweep and binds each
//!    logical barrier to a physical slot.
//! 4. The emitter rewrites the graph 1:1 into its physical form.
//!
//! The whole pipeline is driven by [`sched::schedule`].

pub mod config;
pub mod graph;
pub mod sched;

pub use config::SchedulerConfig;
pub use graph::{BarrierId, QueueId, SlotId, TaskGraph, TaskId, TaskKind};
pub use sched::{schedule, Schedule, ScheduleError};
