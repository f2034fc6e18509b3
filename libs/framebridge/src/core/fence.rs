// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU sync tokens.
//!
//! A [`SyncFence`] marks a point in a GPU command stream. The producer's
//! commands up to that point can be awaited either by blocking the calling
//! thread ([`SyncFence::wait`]) or by ordering another GPU queue behind it
//! without touching the CPU ([`SyncFence::wait_on_gpu`]). Waiting on a fence
//! that was already disposed is a race between producer and consumer and
//! fails loudly rather than silently succeeding.

use crate::core::error::{BridgeError, Result};
use crate::core::handle::NativeHandle;
use crate::ffi::{FenceOps, MG_STATUS_OK, MgSyncTokenRef};

pub struct SyncFence {
    handle: NativeHandle,
    ops: FenceOps,
}

impl SyncFence {
    /// Take ownership of a native sync token.
    pub fn from_raw(token: MgSyncTokenRef, ops: FenceOps) -> Result<Self> {
        Ok(Self {
            handle: NativeHandle::owned("sync token", token, ops.release)?,
            ops,
        })
    }

    /// Block the calling thread until the fence's GPU commands complete.
    ///
    /// May be called from any thread, and repeatedly while the fence is
    /// undisposed.
    pub fn wait(&self) -> Result<()> {
        let token = self.handle.get()?;
        // SAFETY: token is live for the duration of this borrow.
        let code = unsafe { (self.ops.wait)(token) };
        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, "sync token wait"));
        }
        Ok(())
    }

    /// Insert a wait into the current GPU command queue so a different queue
    /// defers execution until this fence is reached. Never blocks the CPU.
    pub fn wait_on_gpu(&self) -> Result<()> {
        let token = self.handle.get()?;
        // SAFETY: token is live for the duration of this borrow.
        let code = unsafe { (self.ops.wait_on_gpu)(token) };
        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, "sync token gpu wait"));
        }
        Ok(())
    }

    /// Non-blocking completion poll.
    pub fn is_ready(&self) -> Result<bool> {
        let token = self.handle.get()?;
        // SAFETY: token is live for the duration of this borrow.
        Ok(unsafe { (self.ops.is_ready)(token) })
    }

    /// Release the native token. Further waits fail with `UseAfterRelease`.
    pub fn dispose(&mut self) {
        self.handle.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.is_released()
    }
}

impl std::fmt::Debug for SyncFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncFence")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backing store for a stub fence; the opaque token points at this.
    pub(crate) struct StubFence {
        pub waits: AtomicUsize,
        pub gpu_waits: AtomicUsize,
        pub releases: AtomicUsize,
        pub ready: bool,
    }

    impl StubFence {
        pub fn new() -> Self {
            Self {
                waits: AtomicUsize::new(0),
                gpu_waits: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                ready: false,
            }
        }

        pub fn token(&self) -> MgSyncTokenRef {
            self as *const StubFence as *mut c_void
        }
    }

    unsafe extern "C" fn stub_wait(token: MgSyncTokenRef) -> i32 {
        let fence = unsafe { &*(token as *const StubFence) };
        fence.waits.fetch_add(1, Ordering::SeqCst);
        MG_STATUS_OK
    }

    unsafe extern "C" fn stub_wait_on_gpu(token: MgSyncTokenRef) -> i32 {
        let fence = unsafe { &*(token as *const StubFence) };
        fence.gpu_waits.fetch_add(1, Ordering::SeqCst);
        MG_STATUS_OK
    }

    unsafe extern "C" fn stub_is_ready(token: MgSyncTokenRef) -> bool {
        let fence = unsafe { &*(token as *const StubFence) };
        fence.ready
    }

    unsafe extern "C" fn stub_release(token: *mut c_void) {
        let fence = unsafe { &*(token as *const StubFence) };
        fence.releases.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) const STUB_FENCE_OPS: FenceOps = FenceOps {
        wait: stub_wait,
        wait_on_gpu: stub_wait_on_gpu,
        is_ready: stub_is_ready,
        release: stub_release,
    };

    #[test]
    fn test_wait_repeats_while_undisposed() {
        let stub = StubFence::new();
        let fence = SyncFence::from_raw(stub.token(), STUB_FENCE_OPS).unwrap();

        fence.wait().unwrap();
        fence.wait().unwrap();
        fence.wait_on_gpu().unwrap();

        assert_eq!(stub.waits.load(Ordering::SeqCst), 2);
        assert_eq!(stub.gpu_waits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_after_dispose_fails_loudly() {
        let stub = StubFence::new();
        let mut fence = SyncFence::from_raw(stub.token(), STUB_FENCE_OPS).unwrap();

        fence.dispose();

        assert!(matches!(
            fence.wait(),
            Err(BridgeError::UseAfterRelease(_))
        ));
        assert!(matches!(
            fence.wait_on_gpu(),
            Err(BridgeError::UseAfterRelease(_))
        ));
        assert!(fence.is_ready().is_err());
        assert_eq!(stub.waits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispose_releases_token_once() {
        let stub = StubFence::new();
        {
            let mut fence = SyncFence::from_raw(stub.token(), STUB_FENCE_OPS).unwrap();
            fence.dispose();
            fence.dispose();
        }
        assert_eq!(stub.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_ready_polls_without_blocking() {
        let mut stub = StubFence::new();
        stub.ready = true;
        let fence = SyncFence::from_raw(stub.token(), STUB_FENCE_OPS).unwrap();
        assert!(fence.is_ready().unwrap());
        assert_eq!(stub.waits.load(Ordering::SeqCst), 0);
    }
}
