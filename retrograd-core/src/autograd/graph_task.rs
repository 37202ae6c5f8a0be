use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::accelerator::Stream;
use crate::tensor::Tensor;

use super::backward_op::BackwardOp;
use super::engine::WorkerDevice;
use super::future::GradFuture;
use super::graph::{node_id, Edge, NodeId};
use super::input_buffer::InputBuffer;
use super::mode::AnomalyMode;
use super::ready_queue::ReadyQueue;
use crate::error::RetrogradError;

/// A record that one input slot of a node is one of the caller's requested
/// outputs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Capture {
    pub input_nr: usize,
    pub output_idx: usize,
}

/// Execution filter entry for one node. When `exec_info` is non-empty, only
/// nodes whose entry says so execute, and captured slots are recorded into
/// `captured_vars`.
#[derive(Debug, Default)]
pub(crate) struct ExecInfo {
    pub needed: bool,
    pub captures: Vec<Capture>,
}

impl ExecInfo {
    pub fn should_execute(&self) -> bool {
        self.needed || !self.captures.is_empty()
    }
}

/// Mutable scheduling state of a graph task, all guarded by one mutex.
#[derive(Debug)]
pub(crate) struct GraphTaskState {
    /// Remaining predecessor count per reachable node. A node leaves this map
    /// the moment its count hits zero.
    pub dependencies: HashMap<NodeId, usize>,
    /// Partial input buffers for nodes still awaiting predecessors. A node is
    /// here iff it has a positive dependency count and at least one
    /// contribution has arrived.
    pub not_ready: HashMap<NodeId, InputBuffer>,
    /// Empty when the whole reachable graph executes; otherwise the filter
    /// and capture plan computed by `init_to_execute`.
    pub exec_info: HashMap<NodeId, ExecInfo>,
    /// Final gradients in the caller's requested output order.
    pub captured_vars: Vec<Option<Tensor>>,
    /// Streams leaf nodes ran on; synchronized with the default streams at
    /// completion.
    pub leaf_streams: HashSet<Stream>,
    /// Device of the thread that initiated this task.
    pub owner: WorkerDevice,
}

/// The shared state of one in-flight backward call.
pub struct GraphTask {
    pub(crate) keep_graph: bool,
    pub(crate) grad_mode: bool,
    /// When set, completion is declared on the first error even while tasks
    /// are still in flight.
    pub(crate) exit_on_error: bool,
    pub(crate) reentrant_depth: usize,
    /// Number of enqueued-but-not-yet-finished tasks across all queues.
    pub(crate) outstanding_tasks: AtomicUsize,
    pub(crate) has_error: AtomicBool,
    pub(crate) state: Mutex<GraphTaskState>,
    pub(crate) future: GradFuture,
    /// CPU ready queue private to this graph task, so concurrent backwards
    /// do not interleave their CPU work.
    pub(crate) cpu_ready_queue: Arc<ReadyQueue>,
}

impl GraphTask {
    pub fn new(
        keep_graph: bool,
        grad_mode: bool,
        exit_on_error: bool,
        reentrant_depth: usize,
        cpu_ready_queue: Arc<ReadyQueue>,
    ) -> Self {
        GraphTask {
            keep_graph,
            grad_mode,
            exit_on_error,
            reentrant_depth,
            outstanding_tasks: AtomicUsize::new(0),
            has_error: AtomicBool::new(false),
            state: Mutex::new(GraphTaskState {
                dependencies: HashMap::new(),
                not_ready: HashMap::new(),
                exec_info: HashMap::new(),
                captured_vars: Vec::new(),
                leaf_streams: HashSet::new(),
                owner: WorkerDevice::None,
            }),
            future: GradFuture::new(),
            cpu_ready_queue,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, GraphTaskState> {
        self.state.lock().expect("GraphTask mutex poisoned")
    }

    /// True once every outstanding task has drained, or immediately on error
    /// when `exit_on_error` is set.
    pub fn completed(&self) -> bool {
        self.outstanding_tasks.load(Ordering::SeqCst) == 0
            || (self.exit_on_error && self.has_error.load(Ordering::SeqCst))
    }

    pub(crate) fn owner(&self) -> WorkerDevice {
        self.lock_state().owner
    }

    /// Checkpointing is only valid while the whole graph executes; a filtered
    /// run recomputes through captures and must not be checkpointed.
    pub(crate) fn can_checkpoint(&self) -> bool {
        self.lock_state().exec_info.is_empty()
    }

    /// Latches the first error onto this task and its future. Later errors
    /// are dropped.
    pub(crate) fn set_exception(
        &self,
        error: RetrogradError,
        func: Option<&Arc<dyn BackwardOp>>,
    ) {
        let _state = self.lock_state();
        if !self.has_error.load(Ordering::SeqCst) {
            if AnomalyMode::is_enabled() {
                if let Some(func) = func {
                    log::error!(
                        "Function '{}' failed during the backward pass: {}",
                        func.name(),
                        error
                    );
                }
            }
            self.has_error.store(true, Ordering::SeqCst);
            if !self.future.completed() {
                self.future.set_error(error);
            }
        }
    }

    /// Prepares a filtered execution: only nodes on a path from the root to a
    /// requested output run, and requested slots are captured.
    pub(crate) fn init_to_execute(&self, graph_root: &Arc<dyn BackwardOp>, outputs: &[Edge]) {
        let mut state = self.lock_state();
        state
            .exec_info
            .entry(node_id(graph_root))
            .or_default()
            .needed = true;

        let mut output_idx = 0;
        for output_edge in outputs {
            let Some(output) = &output_edge.function else {
                continue;
            };
            let info = state.exec_info.entry(node_id(output)).or_default();
            info.captures.push(Capture {
                input_nr: output_edge.input_nr,
                output_idx,
            });
            output_idx += 1;
        }
        state.captured_vars = vec![None; output_idx];

        // Iterative post-order: a node is needed iff any successor is needed
        // or it has captures.
        struct Frame {
            func: Arc<dyn BackwardOp>,
            next_edge: usize,
        }

        impl Frame {
            fn next_function(&mut self) -> Option<Arc<dyn BackwardOp>> {
                let edges = self.func.next_edges();
                while self.next_edge < edges.len() {
                    let edge = &edges[self.next_edge];
                    self.next_edge += 1;
                    if let Some(func) = &edge.function {
                        return Some(Arc::clone(func));
                    }
                }
                None
            }
        }

        let mut stack: Vec<Frame> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        for input in graph_root.next_edges() {
            let Some(input_fn) = &input.function else {
                continue;
            };
            if !seen.insert(node_id(input_fn)) {
                continue;
            }
            stack.push(Frame {
                func: Arc::clone(input_fn),
                next_edge: 0,
            });
            while let Some(frame) = stack.last_mut() {
                if let Some(next_fn) = frame.next_function() {
                    if seen.insert(node_id(&next_fn)) {
                        stack.push(Frame {
                            func: next_fn,
                            next_edge: 0,
                        });
                    }
                } else {
                    let func = stack.pop().expect("frame stack checked non-empty").func;
                    let needed = func.next_edges().iter().any(|edge| {
                        edge.function.as_ref().is_some_and(|next| {
                            state
                                .exec_info
                                .get(&node_id(next))
                                .is_some_and(ExecInfo::should_execute)
                        })
                    });
                    state.exec_info.entry(node_id(&func)).or_default().needed = needed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward_op::InputMetadata;
    use crate::error::RetrogradError;

    #[derive(Debug)]
    struct StubOp {
        name: &'static str,
        next: Vec<Edge>,
        metadata: Vec<InputMetadata>,
    }

    impl StubOp {
        fn leaf(name: &'static str) -> Arc<dyn BackwardOp> {
            StubOp::with_edges(name, Vec::new())
        }

        fn with_edges(name: &'static str, next: Vec<Edge>) -> Arc<dyn BackwardOp> {
            Arc::new(StubOp {
                name,
                next,
                metadata: Vec::new(),
            })
        }
    }

    impl BackwardOp for StubOp {
        fn backward(
            &self,
            _grads: Vec<Option<Tensor>>,
        ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
            Ok(Vec::new())
        }

        fn next_edges(&self) -> &[Edge] {
            &self.next
        }

        fn num_inputs(&self) -> usize {
            1
        }

        fn input_metadata(&self, index: usize) -> &InputMetadata {
            &self.metadata[index]
        }

        fn name(&self) -> String {
            self.name.to_string()
        }
    }

    fn new_graph_task() -> GraphTask {
        GraphTask::new(false, false, false, 0, Arc::new(ReadyQueue::new()))
    }

    #[test]
    fn test_completed_follows_outstanding_tasks() {
        let task = new_graph_task();
        assert!(task.completed());
        task.outstanding_tasks.fetch_add(1, Ordering::SeqCst);
        assert!(!task.completed());
        task.outstanding_tasks.fetch_sub(1, Ordering::SeqCst);
        assert!(task.completed());
    }

    #[test]
    fn test_exit_on_error_short_circuits_completion() {
        let task = GraphTask::new(false, false, true, 0, Arc::new(ReadyQueue::new()));
        task.outstanding_tasks.fetch_add(1, Ordering::SeqCst);
        assert!(!task.completed());
        task.set_exception(RetrogradError::BackwardError("boom".to_string()), None);
        assert!(task.completed());
    }

    #[test]
    fn test_set_exception_first_writer_wins() {
        let task = new_graph_task();
        task.set_exception(RetrogradError::BackwardError("first".to_string()), None);
        task.set_exception(RetrogradError::BackwardError("second".to_string()), None);
        let err = task.future.wait().unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn test_init_to_execute_marks_the_capture_path() {
        // root -> a -> {b, c}; captures requested on b only.
        let b = StubOp::leaf("b");
        let c = StubOp::leaf("c");
        let a = StubOp::with_edges("a", vec![Edge::new(Arc::clone(&b), 0), Edge::new(Arc::clone(&c), 0)]);
        let root = StubOp::with_edges("root", vec![Edge::new(Arc::clone(&a), 0)]);

        let task = new_graph_task();
        task.init_to_execute(&root, &[Edge::new(Arc::clone(&b), 0)]);

        let state = task.lock_state();
        assert_eq!(state.captured_vars.len(), 1);
        assert!(state.exec_info[&node_id(&root)].needed);
        assert!(state.exec_info[&node_id(&a)].needed);

        let b_info = &state.exec_info[&node_id(&b)];
        assert!(!b_info.needed);
        assert_eq!(b_info.captures.len(), 1);
        assert!(b_info.should_execute());

        let c_info = &state.exec_info[&node_id(&c)];
        assert!(!c_info.should_execute());
    }
}
