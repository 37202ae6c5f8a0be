use crate::accelerator::{accelerator_hooks, Stream};
use crate::device::Device;
use crate::error::RetrogradError;
use crate::tensor::{ops, Tensor};

/// Per-node accumulator of partial gradients pending full arrival.
///
/// One positional slot per gradient input of the target node. The first
/// contribution to a slot is stored, later contributions are summed in.
/// When producer and consumer ran on different streams, the consumer stream
/// is made to wait on an event recorded on the producer before the sum is
/// considered ordered.
#[derive(Debug)]
pub struct InputBuffer {
    buffer: Vec<Option<Tensor>>,
}

impl InputBuffer {
    pub fn new(size: usize) -> Self {
        InputBuffer {
            buffer: vec![None; size],
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The gradient currently accumulated in slot `pos`.
    pub fn get(&self, pos: usize) -> &Option<Tensor> {
        &self.buffer[pos]
    }

    /// Accumulates `var` into slot `pos`.
    ///
    /// An undefined (`None`) contribution is a no-op. `opt_producer` is the
    /// stream the gradient was produced on, `opt_consumer` the stream the
    /// target node will consume it on.
    pub fn add(
        &mut self,
        pos: usize,
        var: Option<Tensor>,
        opt_producer: Option<Stream>,
        opt_consumer: Option<Stream>,
    ) -> Result<(), RetrogradError> {
        let Some(var) = var else {
            return Ok(());
        };
        if pos >= self.buffer.len() {
            return Err(RetrogradError::InternalError(format!(
                "input buffer slot {} out of range ({} slots)",
                pos,
                self.buffer.len()
            )));
        }

        if let (Some(producer), Some(consumer)) = (opt_producer, opt_consumer) {
            if producer != consumer {
                if let Some(hooks) = accelerator_hooks(producer.device.kind) {
                    let event = hooks.record_event(producer);
                    let wait_hooks = if consumer.device.kind == producer.device.kind {
                        hooks
                    } else {
                        accelerator_hooks(consumer.device.kind).ok_or_else(|| {
                            RetrogradError::InternalError(format!(
                                "no accelerator hooks registered for {:?}",
                                consumer.device.kind
                            ))
                        })?
                    };
                    wait_hooks.wait_event(consumer, event);
                }
            }
        }

        let slot = &mut self.buffer[pos];
        *slot = match slot.take() {
            Some(existing) => Some(ops::add_op(&existing, &var)?),
            None => Some(var),
        };
        Ok(())
    }

    /// The device of the first non-empty slot; CPU while the buffer is empty.
    /// Determines which ready queue the resulting task is dispatched to.
    pub fn device(&self) -> Device {
        self.buffer
            .iter()
            .flatten()
            .next()
            .map(|var| var.device())
            .unwrap_or_else(Device::cpu)
    }

    /// Drains the buffer into an ordered list of gradients; empty slots stay
    /// `None`.
    pub fn into_variables(self) -> Vec<Option<Tensor>> {
        self.buffer
    }
}

#[cfg(test)]
#[path = "input_buffer_test.rs"]
mod tests;
