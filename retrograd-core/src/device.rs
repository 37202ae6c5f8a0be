use std::fmt;

/// The kind of runtime a tensor or a stream belongs to.
///
/// Accelerator kinds share worker threads by index: CUDA device 0 and ROCm
/// device 0 are serviced by the same engine thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Default)]
pub enum DeviceKind {
    /// Main system memory; the default.
    #[default]
    Cpu,
    /// NVIDIA CUDA devices.
    Cuda,
    /// AMD ROCm devices.
    Rocm,
}

/// A concrete device: a kind plus an index within that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: usize,
}

impl Device {
    pub const fn cpu() -> Self {
        Device {
            kind: DeviceKind::Cpu,
            index: 0,
        }
    }

    pub const fn new(kind: DeviceKind, index: usize) -> Self {
        Device { kind, index }
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda:{}", self.index),
            DeviceKind::Rocm => write!(f, "rocm:{}", self.index),
        }
    }
}
