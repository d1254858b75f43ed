use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use futures::FutureExt;

use crate::{AppError, AppResult};

fn caught(payload: Box<dyn Any + Send>) -> AppError {
    let error = AppError::panic(payload.as_ref());
    error.log_with_event("panic_caught");
    error
}

/// Run `f`, turning a panic into a logged `RUNTIME/PANIC` error.
#[allow(clippy::result_large_err)]
pub fn fence<T>(f: impl FnOnce() -> T) -> AppResult<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(caught)
}

/// One poller cycle: errors pass through, and a panic while building or
/// polling the future comes back as an error in the same channel.
#[allow(clippy::result_large_err)]
pub async fn fenced_cycle<F, Fut, T>(cycle: F) -> AppResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let future = fence(cycle)?;
    AssertUnwindSafe(future).catch_unwind().await.map_err(caught)?
}
