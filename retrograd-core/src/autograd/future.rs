use std::sync::{Condvar, Mutex};

use crate::error::RetrogradError;
use crate::tensor::Tensor;

type GradResult = Result<Vec<Option<Tensor>>, RetrogradError>;

/// Single-assignment completion cell for one backward invocation.
///
/// Carries either the captured gradients or the first error. Completion
/// happens exactly once; `wait` blocks any number of callers until then.
#[derive(Debug, Default)]
pub(crate) struct GradFuture {
    result: Mutex<Option<GradResult>>,
    done: Condvar,
}

impl GradFuture {
    pub fn new() -> Self {
        GradFuture::default()
    }

    pub fn completed(&self) -> bool {
        self.result
            .lock()
            .expect("GradFuture mutex poisoned")
            .is_some()
    }

    /// Fulfils the future with the captured gradients.
    pub fn complete(&self, vars: Vec<Option<Tensor>>) {
        let mut result = self.result.lock().expect("GradFuture mutex poisoned");
        debug_assert!(result.is_none(), "GradFuture completed twice");
        *result = Some(Ok(vars));
        drop(result);
        self.done.notify_all();
    }

    /// Fulfils the future with an error. A no-op if already completed (the
    /// first completion wins).
    pub fn set_error(&self, error: RetrogradError) {
        let mut result = self.result.lock().expect("GradFuture mutex poisoned");
        if result.is_none() {
            *result = Some(Err(error));
            drop(result);
            self.done.notify_all();
        }
    }

    /// Blocks until completion and returns the outcome.
    pub fn wait(&self) -> GradResult {
        let result = self.result.lock().expect("GradFuture mutex poisoned");
        let result = self
            .done
            .wait_while(result, |result| result.is_none())
            .expect("GradFuture mutex poisoned");
        result.as_ref().expect("GradFuture awoke incomplete").clone()
    }
}
