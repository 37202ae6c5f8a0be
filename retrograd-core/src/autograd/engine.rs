//! The backward-graph execution engine.
//!
//! One persistent worker thread per accelerator device index, plus the
//! calling thread when it drives a top-level backward, plus a lazily grown
//! pool for deep reentrancy. Workers block only in `ReadyQueue::pop`; there
//! is no cooperative task system.
//!
//! Reentrant backwards: a backward function may call `execute` again. The
//! calling worker cannot simply block on the nested future, because it is
//! also the thread responsible for draining the queue that nested work lands
//! on. Below the recursion limit the worker runs the nested task's loop
//! inline; at the limit the task is handed to the pool so the stack stays
//! bounded, and the worker blocks on the future while a pool thread drains
//! its queue.
//!
//! Streaming backwards: a node records the stream it ran on during forward;
//! its backward runs with that stream current, and gradient hand-off between
//! differing streams is ordered with an event recorded on the producer that
//! the consumer waits on. Streams of leaf nodes are synchronized with their
//! device's default stream at completion to preserve the historic "sync the
//! default stream and you are done" contract.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;

use once_cell::sync::{Lazy, OnceCell};

use crate::accelerator::{self, OptionalStreamGuard};
use crate::device::Device;
use crate::error::RetrogradError;
use crate::tensor::ops::is_expandable_to;
use crate::tensor::Tensor;

use super::backward_op::BackwardOp;
use super::functions::GraphRoot;
use super::graph::{node_id, Edge, NodeId};
use super::graph_task::{GraphTask, GraphTaskState};
use super::input_buffer::InputBuffer;
use super::mode::{AnomalyMode, AutoGradMode};
use super::ready_queue::{NodeTask, ReadyQueue};

/// Device affinity of the current thread inside the engine.
///
/// Assigned at thread creation for device workers and constant afterwards;
/// toggled on the caller's thread for the duration of a top-level `execute`.
/// `None` outside the engine, which is how a reentrant call is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum WorkerDevice {
    /// Not an engine thread.
    #[default]
    None,
    /// Driving CPU work for one graph task.
    Cpu,
    /// Persistent worker pinned to an accelerator device index.
    Accelerator(usize),
}

thread_local! {
    static WORKER_DEVICE: Cell<WorkerDevice> = Cell::new(WorkerDevice::None);
    static LOCAL_READY_QUEUE: RefCell<Option<Arc<ReadyQueue>>> = RefCell::new(None);
    // Number of nested reentrant backwards on this thread.
    static CURRENT_DEPTH: Cell<usize> = Cell::new(0);
    // Nested reentrant backwards across the threads this chain has crossed.
    static TOTAL_DEPTH: Cell<usize> = Cell::new(0);
    // True iff every engine invocation on this stack may be checkpointed.
    static CHECKPOINT_VALID: Cell<bool> = Cell::new(true);
}

fn worker_device() -> WorkerDevice {
    WORKER_DEVICE.with(|device| device.get())
}

fn set_worker_device(device: WorkerDevice) {
    if let WorkerDevice::Accelerator(index) = device {
        accelerator::set_device_on_all(index);
    }
    WORKER_DEVICE.with(|slot| slot.set(device));
}

fn bind_local_ready_queue(queue: Arc<ReadyQueue>) {
    LOCAL_READY_QUEUE.with(|slot| *slot.borrow_mut() = Some(queue));
}

fn local_ready_queue() -> Arc<ReadyQueue> {
    LOCAL_READY_QUEUE.with(|slot| {
        slot.borrow()
            .as_ref()
            .cloned()
            .expect("thread has no local ready queue bound")
    })
}

fn clear_local_ready_queue() {
    LOCAL_READY_QUEUE.with(|slot| *slot.borrow_mut() = None);
}

/// Scoped narrowing of the thread's checkpoint-valid flag.
struct CheckpointValidGuard {
    prev: bool,
}

impl CheckpointValidGuard {
    fn new(can_checkpoint: bool) -> Self {
        let prev = CHECKPOINT_VALID.with(|flag| flag.get());
        CHECKPOINT_VALID.with(|flag| flag.set(prev && can_checkpoint));
        CheckpointValidGuard { prev }
    }
}

impl Drop for CheckpointValidGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        CHECKPOINT_VALID.with(|flag| flag.set(prev));
    }
}

type Callback = Box<dyn FnOnce() + Send>;

/// Clears the callback list on construction and again on drop, so callbacks
/// never leak across `execute` calls.
struct ClearCallbacks<'a> {
    callbacks: &'a Mutex<Vec<Callback>>,
}

impl<'a> ClearCallbacks<'a> {
    fn new(callbacks: &'a Mutex<Vec<Callback>>) -> Self {
        callbacks.lock().expect("callbacks mutex poisoned").clear();
        ClearCallbacks { callbacks }
    }
}

impl Drop for ClearCallbacks<'_> {
    fn drop(&mut self) {
        self.callbacks
            .lock()
            .expect("callbacks mutex poisoned")
            .clear();
    }
}

#[derive(Default)]
struct ThreadPoolState {
    /// Workers currently parked on the condvar.
    num_idle_workers: usize,
    pending_tasks: VecDeque<Weak<GraphTask>>,
}

#[derive(Default)]
struct ThreadPoolShared {
    state: Mutex<ThreadPoolState>,
    work: Condvar,
}

/// The execution engine. One instance normally lives for the whole process
/// (see [`Engine::get_default`]); separate instances are possible for
/// embedding and tests.
pub struct Engine {
    max_recursion_depth: usize,
    /// One shared queue per accelerator device index; populated once,
    /// together with the worker threads, on first use.
    device_ready_queues: OnceCell<Vec<Arc<ReadyQueue>>>,
    thread_pool_shared: ThreadPoolShared,
    final_callbacks: Mutex<Vec<Callback>>,
    stopping: AtomicBool,
}

pub type EngineStub = fn() -> Arc<Engine>;

fn get_base_engine() -> Arc<Engine> {
    static BASE_ENGINE: Lazy<Arc<Engine>> = Lazy::new(|| Arc::new(Engine::new()));
    Arc::clone(&BASE_ENGINE)
}

static ENGINE_STUB: Lazy<RwLock<EngineStub>> =
    Lazy::new(|| RwLock::new(get_base_engine as EngineStub));

/// Installs a factory for the default engine, letting a front-end substitute
/// a subclassed engine before first use.
pub fn set_default_engine_stub(stub: EngineStub) {
    *ENGINE_STUB.write().expect("RwLock poisoned") = stub;
}

impl Engine {
    /// Reentrant calls nested deeper than `max_recursion_depth` are handed
    /// to the thread pool instead of recursing on the caller's stack.
    pub fn new() -> Self {
        Engine {
            max_recursion_depth: 100,
            device_ready_queues: OnceCell::new(),
            thread_pool_shared: ThreadPoolShared::default(),
            final_callbacks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        }
    }

    /// The process-wide engine, built through the installed stub.
    pub fn get_default() -> Arc<Engine> {
        let stub = *ENGINE_STUB.read().expect("RwLock poisoned");
        stub()
    }

    /// True iff the current stack of engine invocations is purely imperative
    /// and may therefore be checkpointed.
    pub fn is_checkpoint_valid() -> bool {
        CHECKPOINT_VALID.with(|flag| flag.get())
    }

    /// Registers a callback to run after graph execution, before the future
    /// is fulfilled. Callbacks may register further callbacks.
    pub fn queue_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.final_callbacks
            .lock()
            .expect("callbacks mutex poisoned")
            .push(Box::new(callback));
    }

    /// Latches the stopping flag and wakes every worker so it can exit.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(queues) = self.device_ready_queues.get() {
            for queue in queues {
                queue.push_shutdown();
            }
        }
        self.thread_pool_shared.work.notify_all();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Lazily allocates the per-device queues and spawns one detached worker
    /// per device index. Accelerator kinds sharing an index share the thread.
    fn start_device_threads(self: &Arc<Self>) {
        self.device_ready_queues.get_or_init(|| {
            let num_devices = accelerator::max_device_count();
            let queues: Vec<_> = (0..num_devices)
                .map(|_| Arc::new(ReadyQueue::new()))
                .collect();
            for (index, queue) in queues.iter().enumerate() {
                let engine = Arc::clone(self);
                let queue = Arc::clone(queue);
                thread::spawn(move || engine.thread_init(index, queue));
            }
            queues
        });
    }

    fn thread_init(self: Arc<Self>, device: usize, ready_queue: Arc<ReadyQueue>) {
        set_worker_device(WorkerDevice::Accelerator(device));
        bind_local_ready_queue(ready_queue);
        log::debug!("autograd worker started for device {}", device);
        self.thread_main(None, false);
        log::debug!("autograd worker for device {} exited", device);
    }

    /// The worker loop. Device workers run it forever with no owned task;
    /// owner threads and reentrant workers run it for one specific task.
    ///
    /// Graph tasks do not form a stack: after a reentrant call starts, this
    /// loop may pop tasks belonging to unrelated graph tasks sharing the
    /// queue; completion bookkeeping is per graph task, so that is fine.
    fn thread_main(self: &Arc<Self>, owned_task: Option<Arc<GraphTask>>, reentrant_worker: bool) {
        debug_assert!(!reentrant_worker || owned_task.is_some());
        let queue = local_ready_queue();

        loop {
            if reentrant_worker {
                let owned = owned_task
                    .as_ref()
                    .expect("reentrant worker without a graph task");
                if owned.outstanding_tasks.load(Ordering::SeqCst) == 0 {
                    break;
                }
            }

            let task = queue.pop();
            if task.is_shutdown() || self.is_stopping() {
                log::debug!("autograd worker received shutdown");
                break;
            }
            let NodeTask {
                base, func, inputs, ..
            } = task;

            let local_graph_task = match base.upgrade() {
                Some(graph_task) => graph_task,
                None => {
                    log::debug!(
                        "GraphTask for function {:?} is no longer valid, skipping execution",
                        func.as_ref().map(|f| f.name())
                    );
                    continue;
                }
            };

            if let Some(func) = &func {
                if !local_graph_task.has_error.load(Ordering::SeqCst) {
                    let _grad_mode = AutoGradMode::new(local_graph_task.grad_mode);
                    if let Err(error) = self.evaluate_function(&local_graph_task, func, inputs) {
                        local_graph_task.set_exception(error, Some(func));
                    }
                }
            }

            local_graph_task.outstanding_tasks.fetch_sub(1, Ordering::SeqCst);

            if local_graph_task.completed() {
                self.mark_graph_task_completed(&local_graph_task);

                // The owner thread requested this computation; once its own
                // task is done it must return to the code that called
                // execute. A completion observed for some *other* graph task
                // sharing this queue must not end this loop.
                let is_own_task = owned_task
                    .as_ref()
                    .is_some_and(|owned| Arc::ptr_eq(owned, &local_graph_task));
                if worker_device() == WorkerDevice::Cpu && is_own_task {
                    break;
                }

                // Nudge an owner parked in pop() so it observes completion.
                // It may pop real work first and see outstanding_tasks == 0
                // early, but the wakeup is a no-op anyway.
                let owner = local_graph_task.owner();
                if owner != worker_device() {
                    self.ready_queue_by_index(&local_graph_task, owner).push(
                        NodeTask::new(Arc::downgrade(&local_graph_task), None, InputBuffer::new(0)),
                        true,
                    );
                }
            }
        }
    }

    /// Pool worker body: waits for overflowing reentrant tasks, adopts each
    /// task's owner device and queue, and drives its loop to completion.
    fn reentrant_thread_init(self: Arc<Self>) {
        loop {
            let pending = {
                let mut pool = self
                    .thread_pool_shared
                    .state
                    .lock()
                    .expect("thread pool mutex poisoned");
                pool.num_idle_workers += 1;
                while pool.pending_tasks.is_empty() && !self.is_stopping() {
                    pool = self
                        .thread_pool_shared
                        .work
                        .wait(pool)
                        .expect("thread pool mutex poisoned");
                }
                pool.num_idle_workers -= 1;
                match pool.pending_tasks.pop_front() {
                    Some(pending) => pending,
                    None => break, // stopping with nothing queued
                }
            };
            let graph_task = match pending.upgrade() {
                Some(graph_task) => graph_task,
                None => {
                    log::debug!("GraphTask has expired, skipping reentrant execution");
                    continue;
                }
            };
            let owner = graph_task.owner();
            set_worker_device(owner);
            bind_local_ready_queue(self.ready_queue_by_index(&graph_task, owner));
            TOTAL_DEPTH.with(|depth| depth.set(graph_task.reentrant_depth));
            self.thread_main(Some(graph_task), true);
        }
    }

    fn add_thread_pool_task(self: &Arc<Self>, graph_task: Weak<GraphTask>) {
        let create_thread = {
            let mut pool = self
                .thread_pool_shared
                .state
                .lock()
                .expect("thread pool mutex poisoned");
            // Idle workers may already be claimed by queued tasks.
            let create_thread = pool.num_idle_workers <= pool.pending_tasks.len();
            pool.pending_tasks.push_back(graph_task);
            create_thread
        };
        if create_thread {
            let engine = Arc::clone(self);
            thread::spawn(move || engine.reentrant_thread_init());
        }
        self.thread_pool_shared.work.notify_one();
    }

    /// The queue a task for `device` belongs on: the graph task's private CPU
    /// queue, or the engine-wide queue of the device index.
    fn ready_queue(&self, graph_task: &Arc<GraphTask>, device: Device) -> Arc<ReadyQueue> {
        if device.is_cpu() {
            Arc::clone(&graph_task.cpu_ready_queue)
        } else {
            let queues = self
                .device_ready_queues
                .get()
                .expect("device threads not started");
            Arc::clone(&queues[device.index])
        }
    }

    fn ready_queue_by_index(
        &self,
        graph_task: &Arc<GraphTask>,
        device: WorkerDevice,
    ) -> Arc<ReadyQueue> {
        match device {
            WorkerDevice::Accelerator(index) => {
                let queues = self
                    .device_ready_queues
                    .get()
                    .expect("device threads not started");
                Arc::clone(&queues[index])
            }
            _ => Arc::clone(&graph_task.cpu_ready_queue),
        }
    }

    /// Number of queued tasks for `device`. Zero before the device threads
    /// have started.
    pub fn ready_queue_size(&self, graph_task: &Arc<GraphTask>, device: Device) -> usize {
        if self.device_ready_queues.get().is_none() {
            return 0;
        }
        self.ready_queue(graph_task, device).len()
    }

    /// External-dispatch hook: enqueues a task onto the addressed graph
    /// task's CPU queue without touching `outstanding_tasks`; the caller
    /// has already accounted for it.
    pub fn enqueue_blocked_task_on_cpu(self: &Arc<Self>, task: NodeTask) {
        self.start_device_threads();
        let graph_task = task
            .base
            .upgrade()
            .expect("GraphTask is no longer valid on external enqueue");
        self.ready_queue(&graph_task, Device::cpu()).push(task, false);
    }

    /// Counts the in-degree of every node reachable from `graph_root`.
    fn compute_dependencies(graph_root: &Arc<dyn BackwardOp>, state: &mut GraphTaskState) {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queue: Vec<Arc<dyn BackwardOp>> = vec![Arc::clone(graph_root)];
        while let Some(func) = queue.pop() {
            for edge in func.next_edges() {
                if let Some(next_fn) = &edge.function {
                    *state.dependencies.entry(node_id(next_fn)).or_insert(0) += 1;
                    if seen.insert(node_id(next_fn)) {
                        queue.push(Arc::clone(next_fn));
                    }
                }
            }
        }
    }

    /// Entry point of a backward run.
    ///
    /// Validates the seed gradients against the root edges, builds the graph
    /// task and its synthetic root, analyzes dependencies (and the needed
    /// sub-graph when specific `outputs` are requested), then dispatches.
    pub fn execute(
        self: &Arc<Self>,
        roots: Vec<Edge>,
        mut seeds: Vec<Option<Tensor>>,
        keep_graph: bool,
        create_graph: bool,
        outputs: &[Edge],
    ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
        validate_outputs(&roots, &mut seeds, |msg| msg.to_string())?;

        let is_reentrant = worker_device() != WorkerDevice::None;

        // Callbacks are only valid for the duration of one top-level run.
        let _callbacks_guard =
            (!is_reentrant).then(|| ClearCallbacks::new(&self.final_callbacks));

        // A reentrant call reuses the parent thread's CPU queue: nested CPU
        // work must land where this thread (or its pool stand-in) drains.
        let cpu_ready_queue = if is_reentrant {
            local_ready_queue()
        } else {
            let queue = Arc::new(ReadyQueue::new());
            bind_local_ready_queue(Arc::clone(&queue));
            queue
        };

        let reentrant_depth = if is_reentrant {
            TOTAL_DEPTH.with(|depth| depth.get()) + 1
        } else {
            0
        };
        let graph_task = Arc::new(GraphTask::new(
            keep_graph,
            create_graph,
            false,
            reentrant_depth,
            cpu_ready_queue,
        ));

        let graph_root: Arc<dyn BackwardOp> = Arc::new(GraphRoot::new(roots, seeds));
        {
            let mut state = graph_task.lock_state();
            Self::compute_dependencies(&graph_root, &mut state);
        }
        if !outputs.is_empty() {
            graph_task.init_to_execute(&graph_root, outputs);
        }

        self.execute_with_graph_task(graph_task, graph_root)
    }

    /// Seeds the root task and drives or delegates the worker loop.
    pub fn execute_with_graph_task(
        self: &Arc<Self>,
        graph_task: Arc<GraphTask>,
        graph_root: Arc<dyn BackwardOp>,
    ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
        self.start_device_threads();

        let mut state = graph_task.lock_state();
        self.ready_queue(&graph_task, Device::cpu()).push(
            NodeTask::new(Arc::downgrade(&graph_task), Some(graph_root), InputBuffer::new(0)),
            true,
        );

        if worker_device() == WorkerDevice::None {
            // Not reentrant: this thread becomes the CPU owner and drives the
            // loop until its task completes.
            set_worker_device(WorkerDevice::Cpu);
            state.owner = WorkerDevice::Cpu;
            drop(state);

            self.thread_main(Some(Arc::clone(&graph_task)), false);

            // Restore the initial engine state for the next backward call.
            set_worker_device(WorkerDevice::None);
            clear_local_ready_queue();
            graph_task.future.wait()
        } else {
            state.owner = worker_device();
            if CURRENT_DEPTH.with(|depth| depth.get()) >= self.max_recursion_depth {
                // Off-load to the pool rather than growing this stack.
                drop(state);
                self.add_thread_pool_task(Arc::downgrade(&graph_task));
                graph_task.future.wait()
            } else {
                TOTAL_DEPTH.with(|depth| depth.set(depth.get() + 1));
                CURRENT_DEPTH.with(|depth| depth.set(depth.get() + 1));
                drop(state);

                // Get back to work on this thread while the nested task runs.
                self.thread_main(Some(Arc::clone(&graph_task)), true);

                CURRENT_DEPTH.with(|depth| depth.set(depth.get() - 1));
                TOTAL_DEPTH.with(|depth| depth.set(depth.get() - 1));
                debug_assert!(graph_task.future.completed());
                graph_task.future.wait()
            }
        }
    }

    /// Runs one ready node: records captures, applies the exec-info filter,
    /// calls the backward under its forward stream, then routes every output
    /// into its successor's input buffer and dispatches newly ready nodes.
    fn evaluate_function(
        self: &Arc<Self>,
        graph_task: &Arc<GraphTask>,
        func: &Arc<dyn BackwardOp>,
        inputs: InputBuffer,
    ) -> Result<(), RetrogradError> {
        {
            let mut state = graph_task.lock_state();
            if !state.exec_info.is_empty() {
                let (captures, needed) = match state.exec_info.get(&node_id(func)) {
                    Some(info) => (info.captures.clone(), info.needed),
                    None => {
                        return Err(RetrogradError::InternalError(format!(
                            "no execution info for {}",
                            func.name()
                        )))
                    }
                };
                for capture in &captures {
                    state.captured_vars[capture.output_idx] = inputs.get(capture.input_nr).clone();
                }
                if !needed {
                    return Ok(());
                }
            }
        }

        // Run the backward on the stream the node used in forward.
        let opt_parent_stream = func.stream();
        let outputs = {
            let _stream_guard = OptionalStreamGuard::new(opt_parent_stream);
            self.call_function(graph_task, func, inputs)?
        };

        if !graph_task.keep_graph {
            func.release_variables();
        }

        if outputs.is_empty() {
            // A leaf; remember its stream for the final default-stream sync.
            if let Some(parent_stream) = opt_parent_stream {
                graph_task.lock_state().leaf_streams.insert(parent_stream);
            }
            return Ok(());
        }

        if AnomalyMode::is_enabled() {
            let _no_grad = AutoGradMode::new(false);
            for (i, output) in outputs.iter().enumerate() {
                if let Some(output) = output {
                    if output.has_nan()? {
                        return Err(RetrogradError::BackwardError(format!(
                            "Function '{}' returned nan values in its {}th output.",
                            func.name(),
                            i
                        )));
                    }
                }
            }
        }

        let mut guard = graph_task.lock_state();
        let state = &mut *guard;
        for (i, output) in outputs.into_iter().enumerate() {
            let next = func.next_edge(i);
            if !next.is_valid() {
                continue;
            }
            let next_fn = next.function.as_ref().expect("edge checked valid");
            let next_id = node_id(next_fn);

            let mut is_ready = false;
            match state.dependencies.get_mut(&next_id) {
                None => {
                    return Err(RetrogradError::BackwardError(format!(
                        "dependency not found for {}",
                        next_fn.name()
                    )))
                }
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        state.dependencies.remove(&next_id);
                        is_ready = true;
                    }
                }
            }

            let opt_next_stream = next_fn.stream();
            if let Some(input_buffer) = state.not_ready.get_mut(&next_id) {
                // The function already has a buffer; accumulate.
                input_buffer.add(next.input_nr, output, opt_parent_stream, opt_next_stream)?;
                if is_ready {
                    let input_buffer = state
                        .not_ready
                        .remove(&next_id)
                        .expect("buffer present above");
                    self.ready_queue(graph_task, input_buffer.device()).push(
                        NodeTask::new(
                            Arc::downgrade(graph_task),
                            Some(Arc::clone(next_fn)),
                            input_buffer,
                        ),
                        true,
                    );
                }
            } else {
                // Skip functions that aren't supposed to be executed.
                if !state.exec_info.is_empty() {
                    match state.exec_info.get(&next_id) {
                        Some(info) if info.should_execute() => {}
                        _ => continue,
                    }
                }
                let mut input_buffer = InputBuffer::new(next_fn.num_inputs());
                input_buffer.add(next.input_nr, output, opt_parent_stream, opt_next_stream)?;
                if is_ready {
                    self.ready_queue(graph_task, input_buffer.device()).push(
                        NodeTask::new(
                            Arc::downgrade(graph_task),
                            Some(Arc::clone(next_fn)),
                            input_buffer,
                        ),
                        true,
                    );
                } else {
                    state.not_ready.insert(next_id, input_buffer);
                }
            }
        }
        Ok(())
    }

    /// Hooks, the backward itself, and output validation.
    fn call_function(
        &self,
        graph_task: &Arc<GraphTask>,
        func: &Arc<dyn BackwardOp>,
        input_buffer: InputBuffer,
    ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
        let _checkpoint_guard = CheckpointValidGuard::new(graph_task.can_checkpoint());

        let inputs = call_pre_hooks(func.as_ref(), input_buffer.into_variables())?;
        if !graph_task.keep_graph {
            func.will_release_variables();
        }

        let has_post_hooks = !func.post_hooks().is_empty();
        let (mut outputs, inputs) = if has_post_hooks {
            // Post hooks still see the inputs, so they cannot be moved in.
            (func.backward(inputs.clone())?, inputs)
        } else {
            (func.backward(inputs)?, Vec::new())
        };

        validate_outputs(func.next_edges(), &mut outputs, |msg| {
            format!("Function {} returned an {}", func.name(), msg)
        })?;

        if has_post_hooks {
            call_post_hooks(func.as_ref(), outputs, &inputs)
        } else {
            Ok(outputs)
        }
    }

    /// Declares the task finished exactly once: verifies nothing was left
    /// half-accumulated, runs the queued callbacks, syncs leaf streams with
    /// their default streams, and fulfils the future.
    fn mark_graph_task_completed(&self, graph_task: &Arc<GraphTask>) {
        let mut state = graph_task.lock_state();
        if graph_task.future.completed() {
            return;
        }
        match self.graph_task_exec_post_processing(&mut state) {
            Ok(captured_vars) => graph_task.future.complete(captured_vars),
            Err(error) => graph_task.future.set_error(error),
        }
    }

    fn graph_task_exec_post_processing(
        &self,
        state: &mut GraphTaskState,
    ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
        if !state.not_ready.is_empty() {
            return Err(RetrogradError::BackwardError(
                "could not compute gradients for some functions".to_string(),
            ));
        }

        // Drain in batches: a callback may queue more callbacks, and none of
        // them run under the callbacks lock.
        loop {
            let batch: Vec<Callback> = {
                let mut callbacks = self
                    .final_callbacks
                    .lock()
                    .expect("callbacks mutex poisoned");
                callbacks.drain(..).collect()
            };
            if batch.is_empty() {
                break;
            }
            for callback in batch {
                callback();
            }
        }

        // Syncs leaf streams with their device's default stream, so syncing
        // with default streams is still enough to observe the whole backward.
        for leaf_stream in &state.leaf_streams {
            if let Some(hooks) = accelerator::accelerator_hooks(leaf_stream.device.kind) {
                let default_stream = hooks.default_stream(leaf_stream.device.index);
                if *leaf_stream != default_stream {
                    let event = hooks.record_event(*leaf_stream);
                    hooks.wait_event(default_stream, event);
                }
            }
        }

        Ok(std::mem::take(&mut state.captured_vars))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

fn call_pre_hooks(
    func: &dyn BackwardOp,
    mut inputs: Vec<Option<Tensor>>,
) -> Result<Vec<Option<Tensor>>, RetrogradError> {
    for hook in func.pre_hooks() {
        inputs = hook.call(inputs)?;
    }
    Ok(inputs)
}

fn call_post_hooks(
    func: &dyn BackwardOp,
    mut outputs: Vec<Option<Tensor>>,
    inputs: &[Option<Tensor>],
) -> Result<Vec<Option<Tensor>>, RetrogradError> {
    for hook in func.post_hooks() {
        outputs = hook.call(outputs, inputs)?;
    }
    Ok(outputs)
}

/// Validates `grads` against the metadata of the edges they flow into,
/// coercing where the contract allows it.
///
/// Undefined gradients pass through; defined gradients must be floating
/// point, broadcast-reducible to the metadata shape (reduction by summation
/// is applied in place), castable to the metadata dtype, and on the metadata
/// device. `format_error` lets callers attribute the message to the
/// producing function.
pub(crate) fn validate_outputs(
    edges: &[Edge],
    grads: &mut Vec<Option<Tensor>>,
    format_error: impl Fn(&str) -> String,
) -> Result<(), RetrogradError> {
    if grads.len() != edges.len() {
        return Err(RetrogradError::InvalidGradient(format_error(&format!(
            "invalid number of gradients - expected {}, but got {}",
            edges.len(),
            grads.len()
        ))));
    }
    for i in 0..grads.len() {
        let edge = &edges[i];
        if !edge.is_valid() {
            continue;
        }
        let function = edge.function.as_ref().expect("edge checked valid");
        let metadata = function.input_metadata(edge.input_nr);

        let Some(mut grad) = grads[i].take() else {
            continue;
        };
        if grad.shape() != metadata.shape {
            if !is_expandable_to(&metadata.shape, &grad.shape()) {
                return Err(RetrogradError::InvalidGradient(format_error(&format!(
                    "invalid gradient at index {} - got {:?} but expected shape compatible with {:?}",
                    i,
                    grad.shape(),
                    metadata.shape
                ))));
            }
            grad = grad.sum_to(&metadata.shape)?;
        }
        if !grad.dtype().is_float() {
            return Err(RetrogradError::InvalidGradient(format_error(&format!(
                "invalid gradient at index {} - expected a floating point type, but got {:?}",
                i,
                grad.dtype()
            ))));
        }
        if grad.dtype() != metadata.dtype {
            grad = grad.cast(metadata.dtype)?;
        }
        if grad.device() != metadata.device {
            return Err(RetrogradError::InvalidGradient(format_error(&format!(
                "invalid gradient at index {} - expected device {} but got {}",
                i,
                metadata.device,
                grad.device()
            ))));
        }
        grads[i] = Some(grad);
    }
    Ok(())
}
