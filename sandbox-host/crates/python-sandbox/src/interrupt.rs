//! Cooperative interruption of a running interpreter
//!
//! The VM polls its user-signal channel between bytecode instructions. The
//! host keeps an [`InterruptHandle`] and fires it when the execution deadline
//! passes; the next poll raises `TimeoutError` inside tool code and the run
//! unwinds on its own thread.

use rustpython_vm::signal::UserSignalSender;
use rustpython_vm::VirtualMachine;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct InterruptState {
    cancelled: bool,
    sender: Option<UserSignalSender>,
}

/// Shared handle used by the host to interrupt one execution.
///
/// Firing is idempotent and may be repeated; every call re-arms the signal,
/// which matters when tool code catches the first `TimeoutError`.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<Mutex<InterruptState>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption of the execution bound to this handle.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        if let Some(sender) = &state.sender {
            let _ = sender.send(Box::new(raise_deadline_exceeded));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Bind the signal sender of a freshly created VM.
    ///
    /// Returns `false` when the handle was fired before the VM existed; the
    /// caller must then skip the run entirely.
    pub(crate) fn attach(&self, sender: UserSignalSender) -> bool {
        let mut state = self.lock();
        if state.cancelled {
            return false;
        }
        state.sender = Some(sender);
        true
    }

    pub(crate) fn detach(&self) {
        self.lock().sender = None;
    }

    fn lock(&self) -> MutexGuard<'_, InterruptState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn raise_deadline_exceeded(vm: &VirtualMachine) -> rustpython_vm::PyResult<()> {
    Err(vm.new_exception_msg(
        vm.ctx.exceptions.timeout_error.to_owned(),
        "execution deadline exceeded".to_owned(),
    ))
}
