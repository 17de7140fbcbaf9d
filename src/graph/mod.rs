//! Task graph model.
//!
//! The scheduler's subject is a statically compiled task graph:
//!
//! - **Tasks** are schedulable units of hardware work, partitioned onto
//!   queues. Tasks on one queue execute in strict program order; tasks on
//!   different queues run concurrently unless a barrier orders them.
//! - **Logical barriers** are virtual counting semaphores. Producer tasks
//!   increment the counter on completion, consumer tasks wait for it.
//!
//! Tasks and barriers live in plain arenas addressed by dense indices, with
//! adjacency stored as index lists. The task's wait/update sets are the
//! source of truth; each barrier's producer/consumer lists are kept in sync
//! by the mutation API, which is the only surface the legalizer passes use.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        TaskGraph                          │
//! │  queue 0 (DMA):      [T0]──[T1]──[T4]                    │
//! │  queue 1 (compute):  [T2]──[T3]                          │
//! │                                                           │
//! │  barriers:  B0  producers={T0}      consumers={T2}       │
//! │             B1  producers={T2,T3}   consumers={T4}       │
//! └──────────────────────────────────────────────────────────┘
//! ```

use smallvec::SmallVec;
use thiserror::Error;

/// Dense task arena index.
pub type TaskId = usize;

/// Dense logical-barrier arena index.
pub type BarrierId = usize;

/// Hardware execution lane identifier.
pub type QueueId = u8;

/// Physical barrier slot identifier.
pub type SlotId = u8;

/// Barrier set carried on a task. Wait/update sets are nearly always tiny.
pub type BarrierSet = SmallVec<[BarrierId; 2]>;

/// Kind of hardware work a task performs.
///
/// The scheduler never interprets the work itself; the kind only feeds
/// diagnostics and distinguishes real work from synthetic markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// DMA copy-engine descriptor.
    DmaCopy,
    /// Compute-array invocation.
    Compute,
    /// Auxiliary vector-processor invocation.
    Vector,
    /// Synthetic zero-cost marker inserted by legalization.
    SyncMarker,
}

impl TaskKind {
    /// Whether this is a synthetic marker rather than real hardware work.
    pub fn is_marker(self) -> bool {
        matches!(self, TaskKind::SyncMarker)
    }
}

/// One schedulable unit of hardware work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Execution lane this task is issued on.
    pub queue: QueueId,
    /// Kind of work performed.
    pub kind: TaskKind,
    /// Number of hardware sub-invocations. Each variant independently
    /// increments the producer counter of every updated barrier.
    pub variant_count: u32,
    /// Barriers that must be fully signaled before this task starts.
    pub wait_barriers: BarrierSet,
    /// Barriers this task signals on completion.
    pub update_barriers: BarrierSet,
}

/// A virtual synchronization object.
#[derive(Debug, Clone, Default)]
pub struct LogicalBarrier {
    /// Tasks that signal this barrier, in edge-insertion order.
    producers: Vec<TaskId>,
    /// Tasks that wait on this barrier, in edge-insertion order.
    consumers: Vec<TaskId>,
    /// End-of-graph completion barrier; the host is its implicit consumer.
    pub is_final: bool,
    /// Replaced or pruned by legalization; ignored by later passes.
    dead: bool,
}

impl LogicalBarrier {
    /// Tasks that signal this barrier.
    pub fn producers(&self) -> &[TaskId] {
        &self.producers
    }

    /// Tasks that wait on this barrier.
    pub fn consumers(&self) -> &[TaskId] {
        &self.consumers
    }

    /// Whether this barrier has been replaced or pruned.
    pub fn is_dead(&self) -> bool {
        self.dead
    }
}

/// Malformed-input error, surfaced before any scheduling runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A task references a barrier that was never declared.
    #[error("task {task} references undeclared barrier {barrier}")]
    DanglingBarrier { task: TaskId, barrier: BarrierId },

    /// A barrier with zero producers can never be signaled.
    #[error("barrier {barrier} has no producers and can never be signaled")]
    NoProducers { barrier: BarrierId },

    /// A single task's variant count alone exceeds the hardware signal
    /// limit, so no producer split can legalize it.
    #[error("task {task} variant count {variants} exceeds the per-barrier signal limit {limit}")]
    IndivisibleProducer {
        task: TaskId,
        variants: u32,
        limit: u32,
    },

    /// More queues than the completion barrier can count signals for.
    #[error("completion barrier would need {queues} producers, exceeding the signal limit {limit}")]
    TooManyQueues { queues: usize, limit: u32 },
}

/// Immutable-after-construction task graph, mutated only through the
/// explicit legalizer surface.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    barriers: Vec<LogicalBarrier>,
    /// Per-queue task lists in program order, sorted by queue id.
    queues: Vec<(QueueId, Vec<TaskId>)>,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // === Construction ===

    /// Declare a new logical barrier.
    pub fn add_barrier(&mut self) -> BarrierId {
        self.barriers.push(LogicalBarrier::default());
        self.barriers.len() - 1
    }

    /// Declare the shared end-of-graph completion barrier.
    pub fn add_final_barrier(&mut self) -> BarrierId {
        let id = self.add_barrier();
        self.barriers[id].is_final = true;
        id
    }

    /// Append a task to a queue's program order.
    ///
    /// Fails immediately if the task references an undeclared barrier.
    pub fn push_task(
        &mut self,
        queue: QueueId,
        kind: TaskKind,
        variant_count: u32,
        waits: &[BarrierId],
        updates: &[BarrierId],
    ) -> Result<TaskId, GraphError> {
        let id = self.tasks.len();
        for &b in waits.iter().chain(updates) {
            if b >= self.barriers.len() {
                return Err(GraphError::DanglingBarrier { task: id, barrier: b });
            }
        }

        self.tasks.push(Task {
            queue,
            kind,
            variant_count,
            wait_barriers: BarrierSet::new(),
            update_barriers: BarrierSet::new(),
        });
        self.queue_tasks_mut(queue).push(id);

        for &b in waits {
            self.add_wait(id, b);
        }
        for &b in updates {
            self.add_update(id, b);
        }
        Ok(id)
    }

    /// Insert a task on the same queue immediately before `before`.
    ///
    /// Used by legalization to place synthetic markers; referenced barriers
    /// must already exist (`debug_assert`ed, this is internal surface).
    pub fn insert_task_before(
        &mut self,
        before: TaskId,
        kind: TaskKind,
        variant_count: u32,
        waits: &[BarrierId],
        updates: &[BarrierId],
    ) -> TaskId {
        debug_assert!(waits.iter().chain(updates).all(|&b| b < self.barriers.len()));

        let queue = self.tasks[before].queue;
        let id = self.tasks.len();
        self.tasks.push(Task {
            queue,
            kind,
            variant_count,
            wait_barriers: BarrierSet::new(),
            update_barriers: BarrierSet::new(),
        });

        let lane = self.queue_tasks_mut(queue);
        let pos = lane
            .iter()
            .position(|&t| t == before)
            .expect("BUG: task missing from its own queue lane");
        lane.insert(pos, id);

        for &b in waits {
            self.add_wait(id, b);
        }
        for &b in updates {
            self.add_update(id, b);
        }
        id
    }

    // === Accessors ===

    /// Number of tasks, including dead-barrier-free synthetic markers.
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Number of barrier arena entries, dead ones included.
    pub fn num_barriers(&self) -> usize {
        self.barriers.len()
    }

    /// Look up a task.
    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    /// Look up a barrier.
    pub fn barrier(&self, id: BarrierId) -> &LogicalBarrier {
        &self.barriers[id]
    }

    /// Iterate over live barrier ids.
    pub fn live_barriers(&self) -> impl Iterator<Item = BarrierId> + '_ {
        self.barriers
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.dead)
            .map(|(id, _)| id)
    }

    /// Queue ids present in the graph, ascending.
    pub fn queue_ids(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.queues.iter().map(|(q, _)| *q)
    }

    /// Tasks of one queue in program order. Empty for unknown queues.
    pub fn tasks_in_program_order(&self, queue: QueueId) -> &[TaskId] {
        match self.queues.binary_search_by_key(&queue, |(q, _)| *q) {
            Ok(i) => &self.queues[i].1,
            Err(_) => &[],
        }
    }

    /// Tasks that signal `barrier`.
    pub fn producers_of(&self, barrier: BarrierId) -> &[TaskId] {
        &self.barriers[barrier].producers
    }

    /// Tasks that wait on `barrier`.
    pub fn consumers_of(&self, barrier: BarrierId) -> &[TaskId] {
        &self.barriers[barrier].consumers
    }

    /// Hardware-visible producer signal count: the sum of `variant_count`
    /// over all producers.
    pub fn producer_count(&self, barrier: BarrierId) -> u32 {
        self.barriers[barrier]
            .producers
            .iter()
            .map(|&t| self.tasks[t].variant_count)
            .sum()
    }

    /// Position of a task within its queue's program order.
    pub fn position_in_queue(&self, task: TaskId) -> usize {
        self.tasks_in_program_order(self.tasks[task].queue)
            .iter()
            .position(|&t| t == task)
            .expect("BUG: task missing from its own queue lane")
    }

    /// Static sort key approximating program order across queues.
    pub fn program_key(&self, task: TaskId) -> (QueueId, usize) {
        (self.tasks[task].queue, self.position_in_queue(task))
    }

    // === Mutation surface for the legalizers ===

    /// Add a wait edge. No-op if already present.
    pub fn add_wait(&mut self, task: TaskId, barrier: BarrierId) {
        if self.tasks[task].wait_barriers.contains(&barrier) {
            return;
        }
        self.tasks[task].wait_barriers.push(barrier);
        self.barriers[barrier].consumers.push(task);
    }

    /// Remove a wait edge. No-op if absent.
    pub fn remove_wait(&mut self, task: TaskId, barrier: BarrierId) {
        self.tasks[task].wait_barriers.retain(|&mut b| b != barrier);
        self.barriers[barrier].consumers.retain(|&t| t != task);
    }

    /// Add an update edge. No-op if already present.
    pub fn add_update(&mut self, task: TaskId, barrier: BarrierId) {
        if self.tasks[task].update_barriers.contains(&barrier) {
            return;
        }
        self.tasks[task].update_barriers.push(barrier);
        self.barriers[barrier].producers.push(task);
    }

    /// Remove an update edge. No-op if absent.
    pub fn remove_update(&mut self, task: TaskId, barrier: BarrierId) {
        self.tasks[task].update_barriers.retain(|&mut b| b != barrier);
        self.barriers[barrier].producers.retain(|&t| t != task);
    }

    /// Mark a barrier dead after all of its edges have been rewritten away.
    pub fn kill_barrier(&mut self, barrier: BarrierId) {
        debug_assert!(
            self.barriers[barrier].producers.is_empty()
                && self.barriers[barrier].consumers.is_empty(),
            "BUG: killing barrier {} with live edges",
            barrier
        );
        self.barriers[barrier].dead = true;
    }

    /// Prune barriers nobody waits on.
    ///
    /// A zero-consumer barrier is dead weight: its producers would signal a
    /// counter nothing reads and the slot would never retire. The completion
    /// barrier is exempt (the host consumes it). Returns the number pruned.
    pub fn prune_dead_barriers(&mut self) -> usize {
        let mut pruned = 0;
        for b in 0..self.barriers.len() {
            let barrier = &self.barriers[b];
            if barrier.dead || barrier.is_final || !barrier.consumers.is_empty() {
                continue;
            }
            log::debug!("pruning barrier {} (no consumers)", b);
            for p in std::mem::take(&mut self.barriers[b].producers) {
                self.tasks[p].update_barriers.retain(|&mut x| x != b);
            }
            self.barriers[b].dead = true;
            pruned += 1;
        }
        pruned
    }

    // === Validation ===

    /// Check the pre-simulation invariants: every live barrier has at least
    /// one producer. Dangling references are rejected at construction time.
    pub fn validate(&self) -> Result<(), GraphError> {
        for b in self.live_barriers() {
            if self.barriers[b].producers.is_empty() {
                return Err(GraphError::NoProducers { barrier: b });
            }
        }
        Ok(())
    }

    // === Dependence queries ===

    /// Whether `to` is reachable from `from` along queue program order and
    /// barrier edges. Used to screen legalizer edge insertions for cycles.
    pub fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = vec![false; self.tasks.len()];
        let mut stack = vec![from];
        visited[from] = true;

        while let Some(t) = stack.pop() {
            // Queue successor
            let lane = self.tasks_in_program_order(self.tasks[t].queue);
            let pos = self.position_in_queue(t);
            if let Some(&next) = lane.get(pos + 1) {
                if next == to {
                    return true;
                }
                if !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
            // Barrier consumers
            for &b in &self.tasks[t].update_barriers {
                for &c in &self.barriers[b].consumers {
                    if c == to {
                        return true;
                    }
                    if !visited[c] {
                        visited[c] = true;
                        stack.push(c);
                    }
                }
            }
        }
        false
    }

    fn queue_tasks_mut(&mut self, queue: QueueId) -> &mut Vec<TaskId> {
        let i = match self.queues.binary_search_by_key(&queue, |(q, _)| *q) {
            Ok(i) => i,
            Err(i) => {
                self.queues.insert(i, (queue, Vec::new()));
                i
            }
        };
        &mut self.queues[i].1
    }
}
