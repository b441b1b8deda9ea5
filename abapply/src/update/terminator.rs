// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::sync::atomic::{AtomicBool, Ordering};

/// Critical section marker for work that must not be interrupted by process
/// termination. The applier sets it while a non-idempotent operation or a
/// checkpoint write is in flight. A signal handler should consult
/// [`Self::request_exit()`] instead of exiting unconditionally.
#[derive(Debug, Default)]
pub struct ExitBlocker {
    blocked: AtomicBool,
    exit_requested: AtomicBool,
}

impl ExitBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Mark the section as blocked until the returned guard is dropped.
    pub fn block(&self) -> ExitBlockerGuard<'_> {
        self.set_blocked(true);
        self.unblock_on_drop()
    }

    /// Return a guard that unblocks when dropped, regardless of whether the
    /// section is blocked now. Anything in the guard's scope may block.
    pub fn unblock_on_drop(&self) -> ExitBlockerGuard<'_> {
        ExitBlockerGuard(self)
    }

    /// Record that the process wants to exit. Returns whether exiting right
    /// now is safe.
    pub fn request_exit(&self) -> bool {
        self.exit_requested.store(true, Ordering::SeqCst);
        !self.is_blocked()
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }
}

/// Unblocks the owning [`ExitBlocker`] when dropped.
#[must_use]
#[derive(Debug)]
pub struct ExitBlockerGuard<'a>(&'a ExitBlocker);

impl Drop for ExitBlockerGuard<'_> {
    fn drop(&mut self) {
        self.0.set_blocked(false);
    }
}
