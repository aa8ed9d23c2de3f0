use crate::compiler::code::CodeObject;
use crate::error::SiltResult;
use crate::vm::value::Value;
use futures::future::LocalBoxFuture;
use std::sync::Arc;

/// Cooperative task scheduler seam.
///
/// The compiler never executes bytecode itself. The one place it needs a
/// result from the runtime is default-argument pre-evaluation: each default is
/// compiled into a zero-argument [`CodeObject`] and handed over here, and the
/// single value the task produces becomes the recorded default. A default may
/// suspend inside host machinery, which is why this returns a future rather
/// than a plain value.
///
/// Implementations must drive the task to completion and resolve with the
/// value left on top of the task's data stack.
pub trait Scheduler {
    fn schedule(&mut self, code: Arc<CodeObject>) -> LocalBoxFuture<'_, SiltResult<Value>>;
}
