// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Ownership wrappers for raw engine pointers.
//!
//! Every native object that crosses the boundary is held by exactly one
//! [`NativeHandle`], which guarantees the matching release entry point runs at
//! most once no matter how the handle reaches the end of its life (explicit
//! [`NativeHandle::dispose`], [`NativeHandle::transfer`], or `Drop`).
//!
//! Methods that pass the raw pointer to native code take `&self`, so the
//! borrow keeps the handle (and with it the native object) alive for the full
//! duration of the call.

use std::ffi::c_void;

use crate::core::error::{BridgeError, Result};
use crate::ffi::ReleaseFn;

/// How a handle relates to the native object behind its pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Sole owner; releases on disposal.
    ExclusiveOwned,
    /// Non-owning view; never releases.
    Borrowed,
    /// Holder of one native shared-pointer control block; disposal drops this
    /// holder's count, the pointee dies with the last holder.
    Shared,
    /// Owner that may move the pointer out ([`NativeHandle::transfer`]),
    /// mirroring native unique-pointer semantics.
    UniqueMoved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandleState {
    Live,
    Released,
    Transferred,
}

/// Wraps one native pointer and one ownership mode.
pub struct NativeHandle {
    ptr: *mut c_void,
    ownership: Ownership,
    release: Option<ReleaseFn>,
    state: HandleState,
    label: &'static str,
}

// SAFETY: the handle only stores the pointer; all engine objects wrapped here
// are documented thread-safe, and mutation of the handle itself requires
// `&mut self`.
unsafe impl Send for NativeHandle {}
// SAFETY: `&self` access never mutates the pointer or state.
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    /// Wrap `ptr` with the given ownership mode.
    ///
    /// Owning modes require a non-null pointer; a borrowed view may wrap null
    /// (some engine accessors legitimately return it).
    pub fn acquire(
        label: &'static str,
        ptr: *mut c_void,
        ownership: Ownership,
        release: Option<ReleaseFn>,
    ) -> Result<Self> {
        if ownership != Ownership::Borrowed {
            if ptr.is_null() {
                return Err(BridgeError::InvalidConfiguration(format!(
                    "null pointer for owned {label} handle"
                )));
            }
            if release.is_none() {
                return Err(BridgeError::InvalidConfiguration(format!(
                    "owned {label} handle requires a release function"
                )));
            }
        }
        Ok(Self {
            ptr,
            ownership,
            release,
            state: HandleState::Live,
            label,
        })
    }

    pub fn owned(label: &'static str, ptr: *mut c_void, release: ReleaseFn) -> Result<Self> {
        Self::acquire(label, ptr, Ownership::ExclusiveOwned, Some(release))
    }

    pub fn shared(label: &'static str, ptr: *mut c_void, release: ReleaseFn) -> Result<Self> {
        Self::acquire(label, ptr, Ownership::Shared, Some(release))
    }

    pub fn unique(label: &'static str, ptr: *mut c_void, release: ReleaseFn) -> Result<Self> {
        Self::acquire(label, ptr, Ownership::UniqueMoved, Some(release))
    }

    pub fn borrowed(label: &'static str, ptr: *mut c_void) -> Self {
        Self {
            ptr,
            ownership: Ownership::Borrowed,
            release: None,
            state: HandleState::Live,
            label,
        }
    }

    /// The current native pointer.
    ///
    /// Fails once the handle has been disposed or its pointer moved out.
    pub fn get(&self) -> Result<*mut c_void> {
        match self.state {
            HandleState::Live => Ok(self.ptr),
            HandleState::Released | HandleState::Transferred => {
                Err(BridgeError::UseAfterRelease(self.label))
            }
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_released(&self) -> bool {
        self.state != HandleState::Live
    }

    /// Whether disposal would actually invoke the native release.
    pub fn owns_resource(&self) -> bool {
        self.state == HandleState::Live
            && self.ownership != Ownership::Borrowed
            && self.release.is_some()
    }

    /// Release the native resource if this handle owns it.
    ///
    /// Idempotent: the release entry point runs at most once per handle, and
    /// calling this again (or dropping the handle afterwards) is a no-op.
    pub fn dispose(&mut self) {
        if self.state != HandleState::Live {
            return;
        }
        if let (true, Some(release)) = (self.ownership != Ownership::Borrowed, self.release) {
            // SAFETY: the pointer is live (state checked above) and was
            // acquired together with its matching release entry point.
            unsafe { release(self.ptr) };
        }
        self.state = HandleState::Released;
    }

    /// Move the pointer out, leaving the handle inert (`UniqueMoved` only).
    ///
    /// After a successful transfer, [`NativeHandle::get`] fails and
    /// [`NativeHandle::dispose`] is a no-op: the native side now owns the
    /// pointer and this handle must never release it.
    pub fn transfer(&mut self) -> Result<*mut c_void> {
        if self.ownership != Ownership::UniqueMoved {
            return Err(BridgeError::InvalidConfiguration(format!(
                "transfer on non-unique {} handle",
                self.label
            )));
        }
        if self.state != HandleState::Live {
            return Err(BridgeError::UseAfterRelease(self.label));
        }
        self.state = HandleState::Transferred;
        Ok(self.ptr)
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if self.owns_resource() {
            tracing::trace!(label = self.label, "releasing native handle on drop");
            self.dispose();
        }
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("label", &self.label)
            .field("ownership", &self.ownership)
            .field("state", &self.state)
            .finish()
    }
}

/// Holder of a native shared-pointer control block.
///
/// The engine object behind the control block is released only when the last
/// holder anywhere (host or native) disposes; this wrapper only owns its own
/// control block.
pub struct SharedNativeRef {
    ctrl: NativeHandle,
    get_target: unsafe extern "C" fn(*mut c_void) -> *mut c_void,
}

impl SharedNativeRef {
    pub fn from_control_block(
        label: &'static str,
        ctrl: *mut c_void,
        get_target: unsafe extern "C" fn(*mut c_void) -> *mut c_void,
        release: ReleaseFn,
    ) -> Result<Self> {
        Ok(Self {
            ctrl: NativeHandle::shared(label, ctrl, release)?,
            get_target,
        })
    }

    /// The control block pointer itself (what other native calls expect when
    /// they take the shared pointer by value).
    pub fn control_block(&self) -> Result<*mut c_void> {
        self.ctrl.get()
    }

    /// Resolve the pointee through the control block.
    ///
    /// Always goes through the native accessor; the pointee address is not
    /// cached host-side.
    pub fn target(&self) -> Result<*mut c_void> {
        let ctrl = self.ctrl.get()?;
        // SAFETY: control block is live for the duration of this borrow.
        Ok(unsafe { (self.get_target)(ctrl) })
    }

    pub fn dispose(&mut self) {
        self.ctrl.dispose();
    }

    pub fn is_released(&self) -> bool {
        self.ctrl.is_released()
    }
}

/// Owner of a native unique pointer that can be moved out exactly once.
pub struct UniqueNativeRef {
    handle: NativeHandle,
}

impl UniqueNativeRef {
    pub fn new(label: &'static str, ptr: *mut c_void, release: ReleaseFn) -> Result<Self> {
        Ok(Self {
            handle: NativeHandle::unique(label, ptr, release)?,
        })
    }

    pub fn get(&self) -> Result<*mut c_void> {
        self.handle.get()
    }

    /// Hand the pointer to native code that takes ownership by move.
    pub fn transfer(&mut self) -> Result<*mut c_void> {
        self.handle.transfer()
    }

    pub fn dispose(&mut self) {
        self.handle.dispose();
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }
}
