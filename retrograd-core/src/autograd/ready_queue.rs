use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex, Weak};

use std::sync::Arc;

use super::backward_op::BackwardOp;
use super::graph_task::GraphTask;
use super::input_buffer::InputBuffer;

/// One unit of schedulable work: a node plus its fully or partially
/// accumulated gradient inputs.
///
/// A task with no function is a no-op wakeup used to rouse an owner thread
/// parked in `pop` so it can observe completion.
pub struct NodeTask {
    /// Weak on purpose: the owner thread holds the only strong reference, and
    /// if it goes away in-flight tasks become no-ops.
    pub(crate) base: Weak<GraphTask>,
    pub(crate) func: Option<Arc<dyn BackwardOp>>,
    pub(crate) inputs: InputBuffer,
    pub(crate) shutdown: bool,
    /// Snapshot of the graph task's reentrant depth, taken at construction so
    /// the heap ordering stays stable while the task is queued.
    pub(crate) reentrant_depth: usize,
}

impl NodeTask {
    pub fn new(
        base: Weak<GraphTask>,
        func: Option<Arc<dyn BackwardOp>>,
        inputs: InputBuffer,
    ) -> Self {
        // An expired task sorts first so workers notice the dead graph soon.
        let reentrant_depth = base
            .upgrade()
            .map(|graph_task| graph_task.reentrant_depth)
            .unwrap_or(usize::MAX);
        NodeTask {
            base,
            func,
            inputs,
            shutdown: false,
            reentrant_depth,
        }
    }

    fn shutdown_task() -> Self {
        NodeTask {
            base: Weak::new(),
            func: None,
            inputs: InputBuffer::new(0),
            shutdown: true,
            reentrant_depth: usize::MAX,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }
}

// Priority: shutdown sentinels first, then deeper reentrant work (so nested
// backwards unwind before new outer work starts). Arrival order within one
// depth is unspecified.
impl PartialEq for NodeTask {
    fn eq(&self, other: &Self) -> bool {
        self.shutdown == other.shutdown && self.reentrant_depth == other.reentrant_depth
    }
}

impl Eq for NodeTask {}

impl PartialOrd for NodeTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.shutdown, self.reentrant_depth).cmp(&(other.shutdown, other.reentrant_depth))
    }
}

/// Blocking priority queue of runnable tasks.
///
/// One shared queue per accelerator device, plus one private CPU queue per
/// graph task. `pop` is the engine's only suspension point.
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<NodeTask>>,
    not_empty: Condvar,
}

impl ReadyQueue {
    pub fn new() -> Self {
        ReadyQueue {
            heap: Mutex::new(BinaryHeap::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues `task` and wakes one waiter.
    ///
    /// When `increment_outstanding` is set, the target graph task's
    /// outstanding count is bumped while the queue mutex is held, so a worker
    /// that later observes zero has seen every prior push.
    pub fn push(&self, task: NodeTask, increment_outstanding: bool) {
        {
            let mut heap = self.heap.lock().expect("ReadyQueue mutex poisoned");
            if increment_outstanding {
                match task.base.upgrade() {
                    Some(graph_task) => {
                        graph_task.outstanding_tasks.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {
                        // The owner already returned; nobody is left to
                        // observe this task, so drop it instead of queueing.
                        log::debug!("dropping task for an expired GraphTask");
                        return;
                    }
                }
            }
            heap.push(task);
        }
        self.not_empty.notify_one();
    }

    /// Enqueues a sentinel that makes one worker exit its loop.
    pub fn push_shutdown(&self) {
        {
            let mut heap = self.heap.lock().expect("ReadyQueue mutex poisoned");
            heap.push(NodeTask::shutdown_task());
        }
        self.not_empty.notify_one();
    }

    /// Blocks until the queue is non-empty and returns the highest-priority
    /// task.
    pub fn pop(&self) -> NodeTask {
        let heap = self.heap.lock().expect("ReadyQueue mutex poisoned");
        let mut heap = self
            .not_empty
            .wait_while(heap, |heap| heap.is_empty())
            .expect("ReadyQueue mutex poisoned");
        heap.pop().expect("ReadyQueue awoke while empty")
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("ReadyQueue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        ReadyQueue::new()
    }
}

#[cfg(test)]
#[path = "ready_queue_test.rs"]
mod tests;
