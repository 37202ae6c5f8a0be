// Autograd engine modules
pub mod backward_op;
pub mod engine;
pub mod functions;
pub mod graph;
pub mod graph_task;
pub mod input_buffer;
pub mod mode;
pub mod ready_queue;

mod future;

pub use backward_op::{BackwardOp, FunctionPostHook, FunctionPreHook, InputMetadata};
pub use engine::{set_default_engine_stub, Engine, EngineStub};
pub use functions::{AccumulateGrad, GraphRoot};
pub use graph::{node_id, Edge, NodeId};
pub use graph_task::GraphTask;
pub use input_buffer::InputBuffer;
pub use mode::{AnomalyMode, AutoGradMode, GradMode};
pub use ready_queue::{NodeTask, ReadyQueue};
