// Core modules of the crate
pub mod accelerator;
pub mod autograd;
pub mod buffer;
pub mod device;
pub mod error;
pub mod tensor;
pub mod tensor_data;
pub mod types;

// Re-export the most commonly used types at the crate root
pub use error::RetrogradError;
pub use tensor::Tensor;
