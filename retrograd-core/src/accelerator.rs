//! Accelerator runtime interface consumed by the autograd engine.
//!
//! The engine never talks to a device runtime directly. Backends (CUDA, ROCm)
//! implement [`AcceleratorHooks`] and register themselves once per process;
//! the engine then queries device counts, switches devices for its worker
//! threads, and records/waits events to order work across streams.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::device::{Device, DeviceKind};

/// Handle to an accelerator compute stream.
///
/// Streams are plain identifiers here; all semantics live behind the hooks of
/// the stream's device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub device: Device,
    pub id: u64,
}

/// Handle to an event recorded on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub device: Device,
    pub id: u64,
}

/// Device runtime operations the engine needs from a backend.
pub trait AcceleratorHooks: Debug + Send + Sync {
    /// Number of devices of this kind.
    fn device_count(&self) -> usize;

    /// Makes `index` the current device on the calling thread.
    fn set_device(&self, index: usize);

    /// The stream currently selected on the calling thread for `index`.
    fn current_stream(&self, index: usize) -> Stream;

    /// The device's default stream.
    fn default_stream(&self, index: usize) -> Stream;

    /// Makes `stream` current for its device and returns the previous one.
    fn exchange_stream(&self, stream: Stream) -> Stream;

    /// Records an event capturing the work submitted to `stream` so far.
    fn record_event(&self, stream: Stream) -> Event;

    /// Makes `stream` wait until `event` has fired.
    fn wait_event(&self, stream: Stream, event: Event);
}

static REGISTRY: Lazy<RwLock<HashMap<DeviceKind, Arc<dyn AcceleratorHooks>>>> =
    Lazy::new(Default::default);

/// Registers the runtime for one accelerator kind. Backends call this once at
/// initialization; re-registration replaces the previous hooks.
pub fn register_accelerator(kind: DeviceKind, hooks: Arc<dyn AcceleratorHooks>) {
    let mut registry = REGISTRY.write().expect("RwLock poisoned");
    if registry.insert(kind, hooks).is_some() {
        log::warn!("accelerator hooks for {:?} were replaced", kind);
    }
}

/// The hooks registered for `kind`, if any.
pub fn accelerator_hooks(kind: DeviceKind) -> Option<Arc<dyn AcceleratorHooks>> {
    REGISTRY.read().expect("RwLock poisoned").get(&kind).cloned()
}

/// Highest device count across every registered accelerator kind.
///
/// Kinds with the same index share one engine worker thread, so this is the
/// number of device threads the engine spawns.
pub fn max_device_count() -> usize {
    let registry = REGISTRY.read().expect("RwLock poisoned");
    registry
        .values()
        .map(|hooks| hooks.device_count())
        .max()
        .unwrap_or(0)
}

/// Makes `index` current on every registered runtime that has such a device.
pub(crate) fn set_device_on_all(index: usize) {
    let registry = REGISTRY.read().expect("RwLock poisoned");
    for hooks in registry.values() {
        if index < hooks.device_count() {
            hooks.set_device(index);
        }
    }
}

/// Scoped switch of the current stream; restores the previous one on drop.
///
/// A `None` stream makes the guard a no-op, which lets callers guard an
/// optional forward stream without branching.
pub struct OptionalStreamGuard {
    prev: Option<Stream>,
}

impl OptionalStreamGuard {
    pub fn new(stream: Option<Stream>) -> Self {
        let prev = stream
            .and_then(|s| accelerator_hooks(s.device.kind).map(|hooks| hooks.exchange_stream(s)));
        OptionalStreamGuard { prev }
    }
}

impl Drop for OptionalStreamGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            if let Some(hooks) = accelerator_hooks(prev.device.kind) {
                hooks.exchange_stream(prev);
            }
        }
    }
}
