// Shared helpers for the engine integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use retrograd_core::accelerator::{register_accelerator, AcceleratorHooks, Event, Stream};
use retrograd_core::autograd::{
    BackwardOp, Edge, FunctionPostHook, FunctionPreHook, InputMetadata,
};
use retrograd_core::device::{Device, DeviceKind};
use retrograd_core::error::RetrogradError;
use retrograd_core::tensor::Tensor;
use retrograd_core::types::DType;

/// One recorded cross-stream ordering operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Record { stream_id: u64, event: u64 },
    Wait { stream_id: u64, event: u64 },
}

/// In-process accelerator used by the tests: streams and events are pure
/// bookkeeping, and every record/wait is logged for inspection.
#[derive(Debug, Default)]
pub struct MockAccelerator {
    current: Mutex<HashMap<usize, Stream>>,
    next_event: AtomicU64,
    sync_ops: Mutex<Vec<SyncOp>>,
}

impl MockAccelerator {
    pub fn take_sync_ops(&self) -> Vec<SyncOp> {
        std::mem::take(&mut self.sync_ops.lock().unwrap())
    }

    /// Id of the stream currently selected for device `index`.
    pub fn current_stream_id(&self, index: usize) -> u64 {
        AcceleratorHooks::current_stream(self, index).id
    }
}

impl AcceleratorHooks for MockAccelerator {
    fn device_count(&self) -> usize {
        2
    }

    fn set_device(&self, _index: usize) {}

    fn current_stream(&self, index: usize) -> Stream {
        self.current
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or_else(|| self.default_stream(index))
    }

    fn default_stream(&self, index: usize) -> Stream {
        Stream {
            device: Device::new(DeviceKind::Cuda, index),
            id: 0,
        }
    }

    fn exchange_stream(&self, stream: Stream) -> Stream {
        let mut current = self.current.lock().unwrap();
        let prev = current
            .get(&stream.device.index)
            .copied()
            .unwrap_or_else(|| self.default_stream(stream.device.index));
        current.insert(stream.device.index, stream);
        prev
    }

    fn record_event(&self, stream: Stream) -> Event {
        let id = self.next_event.fetch_add(1, Ordering::SeqCst);
        self.sync_ops.lock().unwrap().push(SyncOp::Record {
            stream_id: stream.id,
            event: id,
        });
        Event {
            device: stream.device,
            id,
        }
    }

    fn wait_event(&self, stream: Stream, event: Event) {
        self.sync_ops.lock().unwrap().push(SyncOp::Wait {
            stream_id: stream.id,
            event: event.id,
        });
    }
}

/// Registers the mock accelerator (once per process) and returns it. Must be
/// called before the first engine use in tests that rely on device workers.
pub fn init_accelerator() -> Arc<MockAccelerator> {
    static MOCK: Lazy<Arc<MockAccelerator>> = Lazy::new(|| {
        let mock = Arc::new(MockAccelerator::default());
        register_accelerator(DeviceKind::Cuda, Arc::clone(&mock) as Arc<dyn AcceleratorHooks>);
        mock
    });
    Arc::clone(&MOCK)
}

pub type OpBody =
    Box<dyn Fn(Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, RetrogradError> + Send + Sync>;

/// Configurable backward node with instrumentation: counts calls and
/// `release_variables`, detects overlapping invocations, and keeps the last
/// inputs it saw.
pub struct TestOp {
    name: String,
    next: Vec<Edge>,
    metadata: Vec<InputMetadata>,
    stream: Option<Stream>,
    pre_hooks: Vec<Arc<dyn FunctionPreHook>>,
    post_hooks: Vec<Arc<dyn FunctionPostHook>>,
    calls: AtomicUsize,
    releases: AtomicUsize,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
    last_inputs: Mutex<Option<Vec<Option<Tensor>>>>,
    body: OpBody,
}

impl fmt::Debug for TestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestOp").field("name", &self.name).finish()
    }
}

impl TestOp {
    pub fn with_options(
        name: &str,
        metadata: Vec<InputMetadata>,
        next: Vec<Edge>,
        stream: Option<Stream>,
        body: OpBody,
    ) -> Arc<TestOp> {
        TestOp::with_hooks(name, metadata, next, stream, Vec::new(), Vec::new(), body)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_hooks(
        name: &str,
        metadata: Vec<InputMetadata>,
        next: Vec<Edge>,
        stream: Option<Stream>,
        pre_hooks: Vec<Arc<dyn FunctionPreHook>>,
        post_hooks: Vec<Arc<dyn FunctionPostHook>>,
        body: OpBody,
    ) -> Arc<TestOp> {
        Arc::new(TestOp {
            name: name.to_string(),
            next,
            metadata,
            stream,
            pre_hooks,
            post_hooks,
            calls: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            last_inputs: Mutex::new(None),
            body,
        })
    }

    pub fn new(
        name: &str,
        metadata: Vec<InputMetadata>,
        next: Vec<Edge>,
        body: OpBody,
    ) -> Arc<TestOp> {
        TestOp::with_options(name, metadata, next, None, body)
    }

    /// A leaf that swallows its gradient (records it, produces nothing).
    pub fn sink(name: &str, metadata: InputMetadata) -> Arc<TestOp> {
        TestOp::new(name, vec![metadata], Vec::new(), Box::new(|_| Ok(Vec::new())))
    }

    /// Single-input node that forwards its gradient scaled by `k` along each
    /// of its `next` edges.
    pub fn scale(name: &str, k: f64, metadata: InputMetadata, next: Vec<Edge>) -> Arc<TestOp> {
        let copies = next.len();
        TestOp::new(
            name,
            vec![metadata],
            next,
            Box::new(move |grads| {
                let grad = grads
                    .into_iter()
                    .next()
                    .flatten()
                    .expect("scale op expects a defined gradient");
                let scaled = scale_tensor(&grad, k);
                Ok((0..copies).map(|_| Some(scaled.clone())).collect())
            }),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// The gradient last delivered to input slot `pos`.
    pub fn last_input(&self, pos: usize) -> Option<Tensor> {
        self.last_inputs
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|inputs| inputs.get(pos).cloned().flatten())
    }
}

impl BackwardOp for TestOp {
    fn backward(
        &self,
        grads: Vec<Option<Tensor>>,
    ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_inputs.lock().unwrap() = Some(grads.clone());
        let result = (self.body)(grads);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn next_edges(&self) -> &[Edge] {
        &self.next
    }

    fn num_inputs(&self) -> usize {
        self.metadata.len()
    }

    fn input_metadata(&self, index: usize) -> &InputMetadata {
        &self.metadata[index]
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn stream(&self) -> Option<Stream> {
        self.stream
    }

    fn pre_hooks(&self) -> &[Arc<dyn FunctionPreHook>] {
        &self.pre_hooks
    }

    fn post_hooks(&self) -> &[Arc<dyn FunctionPostHook>] {
        &self.post_hooks
    }

    fn release_variables(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Elementwise scale preserving dtype and device.
pub fn scale_tensor(tensor: &Tensor, k: f64) -> Tensor {
    let device = tensor.device();
    let shape = tensor.shape();
    let scaled = match tensor.dtype() {
        DType::F32 => Tensor::new_f32(
            tensor
                .to_vec_f32()
                .unwrap()
                .into_iter()
                .map(|v| (v as f64 * k) as f32)
                .collect(),
            shape,
        )
        .unwrap(),
        DType::F64 => Tensor::new_f64(
            tensor
                .to_vec_f64()
                .unwrap()
                .into_iter()
                .map(|v| v * k)
                .collect(),
            shape,
        )
        .unwrap(),
        other => panic!("scale_tensor does not support {:?}", other),
    };
    if device.is_cpu() {
        scaled
    } else {
        scaled.to_device(device)
    }
}

/// Metadata for a CPU f64 tensor of the given shape.
pub fn meta_f64(shape: Vec<usize>) -> InputMetadata {
    InputMetadata::new(shape, DType::F64, Device::cpu())
}

/// A defined f64 seed of ones with the given shape.
pub fn ones_f64(shape: Vec<usize>) -> Option<Tensor> {
    Some(Tensor::ones(shape, DType::F64).unwrap())
}
