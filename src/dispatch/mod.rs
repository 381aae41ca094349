pub use diagnostics::*;
pub use queue::*;

mod diagnostics;
mod queue;

use crate::error::{DispatchError, DispatchResult};

/// Pending invocation held by a [`CallbackQueue`].
pub type Callback = Box<dyn FnOnce() -> DispatchResult + Send + 'static>;

/// Return types accepted from user callbacks.
///
/// `()` always succeeds; `anyhow::Result<()>` reports `Err` as a callback failure.
pub trait CallbackOutput {
    fn into_dispatch(self) -> DispatchResult;
}

impl CallbackOutput for () {
    #[inline(always)]
    fn into_dispatch(self) -> DispatchResult {
        Ok(())
    }
}

impl CallbackOutput for anyhow::Result<()> {
    #[inline]
    fn into_dispatch(self) -> DispatchResult {
        self.map_err(DispatchError::Callback)
    }
}
