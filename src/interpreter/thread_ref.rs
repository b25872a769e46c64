use super::heap::HeapRef;
use super::{FromMulti, IntoMulti, ThreadStatus, Vm};
use crate::errors::RuntimeError;
use slotmap::Key;

/// A coroutine, or the main thread
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadRef(pub(crate) HeapRef);

impl ThreadRef {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.key().data().as_ffi()
    }

    pub fn status(&self, vm: &Vm) -> Result<ThreadStatus, RuntimeError> {
        vm.thread_status(self.0.key())
    }

    /// Runs the thread until it yields or finishes.
    ///
    /// The first resume passes `args` to the thread's function, later resumes pass them as the results of the yield.
    /// Errors leave the thread dead.
    pub fn resume<A: IntoMulti, R: FromMulti>(&self, args: A, vm: &mut Vm) -> Result<R, RuntimeError> {
        let args = args.into_multi(vm)?;
        let results = vm.resume_thread(self.0.key(), args)?;
        R::from_multi(results, vm)
    }
}
