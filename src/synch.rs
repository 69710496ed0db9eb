//! Wait-channel seam.
//!
//! Synchronization objects (semaphores, queues, mutexes...) live outside
//! the pod. The pod only needs to notify the object layer when it detaches
//! a sleeper, reorders one after a priority change, or strips ownerships on
//! restart/delete. Objects implement this trait and threads pend on them
//! through `suspend_thread`.

use crate::sched::Priority;
use crate::thread::ThreadHandle;

/// A synchronization object a thread can pend on.
pub trait WaitChannel: Send + Sync {
    /// The given thread is no longer sleeping on this channel; drop it from
    /// the channel's wait queue.
    fn forget_sleeper(&self, thread: ThreadHandle);

    /// The given sleeper's effective priority changed; reposition it in the
    /// wait queue.
    fn reorder_sleeper(&self, _thread: ThreadHandle, _prio: Priority) {}

    /// The given thread no longer owns this channel; pass ownership on.
    fn release_ownership(&self, _thread: ThreadHandle) {}

    /// Whether the channel opted out of priority-driven wait-queue
    /// reordering.
    fn deny_reorder(&self) -> bool {
        false
    }
}
