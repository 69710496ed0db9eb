//! User-space shadow bridge seam.
//!
//! A shadow is a pod thread bound to a user-space mate scheduled by a host
//! OS. Moving a shadow between the pod scheduler (primary mode) and the
//! host scheduler (secondary mode), and signalling its mate, is the
//! bridge's business. The bridge is installed at pod init; without one, all
//! shadow-specific paths are skipped.

use crate::thread::ThreadHandle;

/// Host-side operations on shadow threads.
pub trait ShadowBridge: Send + Sync {
    /// Release a newly started shadow towards its user-space mate.
    fn shadow_start(&self, thread: ThreadHandle);

    /// Ask a relaxed shadow's mate to migrate back under pod control so a
    /// pending suspension can take hold.
    fn shadow_suspend(&self, thread: ThreadHandle);

    /// Move the current shadow to secondary mode, optionally notifying the
    /// host of the cause.
    fn shadow_relax(&self, notify: bool);

    /// Send a host signal to the thread's mate; `lethal` requests
    /// termination.
    fn shadow_send_sig(&self, thread: ThreadHandle, lethal: bool);

    /// Finalize the current mate's exit path.
    fn shadow_exit(&self);

    /// Whether the current host task has a deleted shadow awaiting reaping.
    fn shadow_exit_pending(&self) -> bool {
        false
    }

    /// Re-evaluate the root-thread priority coupling after a remote pick
    /// request.
    fn shadow_rpi_check(&self);

    /// Re-apply the interrupt shield setting of the current shadow.
    fn shadow_reset_shield(&self);
}
