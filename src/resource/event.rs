//! Waitable handle for asynchronous allocation
//!
//! The worker thread signals the event exactly once with the allocation
//! result; the client waits or polls, then takes the result out. There is
//! no cancellation: once enqueued, the work runs to completion.

use std::sync::{Arc, Condvar, Mutex};

use crate::resource::ResourceAllocation;
use crate::GmmResult;

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    result: Option<GmmResult<ResourceAllocation>>,
}

/// Completion handle returned by
/// [`ResourceAllocator::create_resource_async`](crate::ResourceAllocator::create_resource_async).
#[derive(Debug, Clone)]
pub struct AllocationEvent {
    shared: Arc<(Mutex<EventState>, Condvar)>,
}

impl AllocationEvent {
    pub(crate) fn new() -> Self {
        AllocationEvent {
            shared: Arc::new((Mutex::new(EventState::default()), Condvar::new())),
        }
    }

    pub(crate) fn signal(&self, result: GmmResult<ResourceAllocation>) {
        let (state, condvar) = &*self.shared;
        if let Ok(mut state) = state.lock() {
            state.result = Some(result);
            state.signaled = true;
        }
        condvar.notify_all();
    }

    /// Block until the allocation attempt has finished.
    pub fn wait(&self) {
        let (state, condvar) = &*self.shared;
        let Ok(mut guard) = state.lock() else {
            return;
        };
        while !guard.signaled {
            guard = match condvar.wait(guard) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }

    /// Non-blocking completion poll.
    pub fn is_signaled(&self) -> bool {
        let (state, _) = &*self.shared;
        state.lock().map(|s| s.signaled).unwrap_or(false)
    }

    /// Wait and take the result. Returns `None` on the second and later
    /// calls; the allocation is retrievable exactly once.
    pub fn take_allocation(&self) -> Option<GmmResult<ResourceAllocation>> {
        self.wait();
        let (state, _) = &*self.shared;
        state.lock().ok()?.result.take()
    }
}
