//! Containment of caller-code failures.
//!
//! Caller closures report failure through `anyhow::Result`; panics are caught at
//! the call site as well. The first fault of a run is kept in a [`FaultCell`];
//! later faults lose the race and are only logged.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use futures::FutureExt;

use crate::errors::{PipelineError, Result, StageOrigin};

/// Convert a caught panic payload into an error.
pub(crate) fn panic_to_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    anyhow::anyhow!("panicked: {}", message)
}

/// Run caller-supplied code, turning both `Err` and panics into
/// [`PipelineError::CallerFault`] attributed to `origin`.
pub(crate) fn invoke<T>(
    origin: StageOrigin,
    context: impl FnOnce() -> String,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(PipelineError::caller_fault(origin, context(), err)),
        Err(panic) => Err(PipelineError::caller_fault(
            origin,
            context(),
            panic_to_error(panic),
        )),
    }
}

/// Await caller-supplied async code, turning a panic into an error.
pub(crate) async fn contain<T>(fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_to_error(panic)),
    }
}

/// Async counterpart of [`invoke`].
pub(crate) async fn invoke_async<T>(
    origin: StageOrigin,
    context: impl FnOnce() -> String,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T> {
    contain(fut)
        .await
        .map_err(|err| PipelineError::caller_fault(origin, context(), err))
}

/// The root-cause fault of a run.
#[derive(Debug)]
pub struct FaultRecord {
    pub origin: StageOrigin,
    pub error: PipelineError,
}

/// Once-only slot for the first fault.
#[derive(Debug, Default)]
pub struct FaultCell {
    slot: OnceLock<FaultRecord>,
}

impl FaultCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `error` if no fault was recorded yet. Returns `true` when this call won.
    pub fn record(&self, origin: StageOrigin, error: PipelineError) -> bool {
        match self.slot.set(FaultRecord { origin, error }) {
            Ok(()) => true,
            Err(lost) => {
                tracing::debug!(
                    origin = %lost.origin,
                    error = %lost.error,
                    "secondary fault discarded"
                );
                false
            },
        }
    }

    pub fn get(&self) -> Option<&FaultRecord> {
        self.slot.get()
    }

    pub fn is_faulted(&self) -> bool {
        self.slot.get().is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_maps_err_and_panic() {
        let ok = invoke(StageOrigin::Clustering, || "ctx".into(), || Ok(5));
        assert_eq!(ok.unwrap(), 5);

        let err = invoke::<()>(StageOrigin::Clustering, || "at record #2".into(), || {
            anyhow::bail!("bad marker")
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "clustering block failed at record #2: bad marker");

        let panicked = invoke::<()>(StageOrigin::Unclustering, || "routing".into(), || {
            panic!("router exploded")
        })
        .unwrap_err();
        assert!(panicked.to_string().contains("router exploded"));
    }

    async fn exploding_sink() -> anyhow::Result<()> {
        panic!("sink exploded")
    }

    #[tokio::test]
    async fn test_invoke_async_contains_panics() {
        let err = invoke_async(StageOrigin::Output, || "at record #7".into(), exploding_sink())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "output block failed at record #7: panicked: sink exploded"
        );
    }

    #[test]
    fn test_first_fault_wins() {
        let cell = FaultCell::new();
        assert!(!cell.is_faulted());
        assert!(cell.record(StageOrigin::Transforming, PipelineError::NotImplemented("a")));
        assert!(!cell.record(StageOrigin::Output, PipelineError::NotImplemented("b")));

        let record = cell.get().unwrap();
        assert_eq!(record.origin, StageOrigin::Transforming);
        assert_eq!(record.error.to_string(), "not implemented: a");
    }
}
