// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pixel frame buffers with stable identity.
//!
//! A [`FrameBuffer`] has a process-unique [`FrameId`] that never changes, and
//! (optionally) a native name that can change over its lifetime and be
//! recycled to other frames after it dies. The
//! [`FrameNameRegistry`](crate::core::registry::FrameNameRegistry) arbitrates
//! the name space; this module owns everything else: storage, pending release
//! fences, and the rebind/revoke protocol around content rewrites.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::error::{BridgeError, Result};
use crate::core::fence::SyncFence;
use crate::core::registry::FrameNameRegistry;

/// Process-unique frame identity, independent of any native name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId(uuid::Uuid);

impl FrameId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(self) -> uuid::Uuid {
        self.0
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb24 => 3,
        }
    }

    /// Wire value used by the engine ABI.
    pub fn to_native(self) -> i32 {
        match self {
            PixelFormat::Rgba8 => 1,
            PixelFormat::Bgra8 => 2,
            PixelFormat::Rgb24 => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Host-memory pixels owned by the frame.
    CpuBacked,
    /// Pixels live in a GPU texture identified by the frame's native name.
    GpuBacked,
}

struct FrameState {
    native_name: Option<u32>,
    pending_fence: Option<SyncFence>,
    /// `CpuBacked` only.
    pixels: Option<Box<[u8]>>,
}

pub(crate) struct FrameInner {
    id: FrameId,
    width: u32,
    height: u32,
    format: PixelFormat,
    kind: StorageKind,
    state: Mutex<FrameState>,
}

/// A fixed-size pixel buffer with stable identity.
///
/// Cheap to clone; clones share the same underlying frame.
#[derive(Clone)]
pub struct FrameBuffer {
    inner: Arc<FrameInner>,
}

impl FrameBuffer {
    /// Allocate a zero-filled host-memory frame.
    pub fn new_cpu(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            inner: Arc::new(FrameInner {
                id: FrameId::new(),
                width,
                height,
                format,
                kind: StorageKind::CpuBacked,
                state: Mutex::new(FrameState {
                    native_name: None,
                    pending_fence: None,
                    pixels: Some(vec![0u8; len].into_boxed_slice()),
                }),
            }),
        }
    }

    /// Create a GPU-backed frame. The texture name is bound separately via
    /// [`FrameBuffer::bind_native_name`] once the allocator knows it.
    pub fn new_gpu(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                id: FrameId::new(),
                width,
                height,
                format,
                kind: StorageKind::GpuBacked,
                state: Mutex::new(FrameState {
                    native_name: None,
                    pending_fence: None,
                    pixels: None,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<FrameInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<FrameInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> FrameId {
        self.inner.id
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.inner.kind
    }

    pub fn matches_dimensions(&self, width: u32, height: u32) -> bool {
        self.inner.width == width && self.inner.height == height
    }

    pub fn byte_len(&self) -> usize {
        self.inner.width as usize
            * self.inner.height as usize
            * self.inner.format.bytes_per_pixel()
    }

    /// The native name currently bound to this frame, if any.
    pub fn native_name(&self) -> Option<u32> {
        self.inner.state.lock().native_name
    }

    /// Bind (or move) this frame's native name.
    ///
    /// Registration and rename go through `registry` so a collision with a
    /// live frame fails loudly while a stale binding left by a dead frame is
    /// reclaimed. On success the frame's own record is updated; on failure
    /// nothing changes anywhere.
    pub fn bind_native_name(&self, registry: &FrameNameRegistry, name: u32) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.native_name == Some(name) {
            return Ok(());
        }
        registry.rename(state.native_name, name, self)?;
        state.native_name = Some(name);
        Ok(())
    }

    /// Drop the native-name binding after the backing store was rewritten.
    ///
    /// Required whenever an operation may have changed which native buffer
    /// holds the pixels; the next bind re-registers under the new name.
    pub fn revoke_native_name(&self, registry: &FrameNameRegistry) {
        let mut state = self.inner.state.lock();
        if let Some(name) = state.native_name.take() {
            registry.remove(name, self.inner.id);
        }
    }

    /// Store the fence the consumer handed back at release time.
    ///
    /// Replaces (and disposes) any fence that was still pending; the frame is
    /// not reusable until the stored fence has been waited on.
    pub fn attach_fence(&self, fence: Option<SyncFence>) {
        let mut state = self.inner.state.lock();
        if let Some(mut previous) = state.pending_fence.take() {
            previous.dispose();
        }
        state.pending_fence = fence;
    }

    pub fn take_pending_fence(&self) -> Option<SyncFence> {
        self.inner.state.lock().pending_fence.take()
    }

    pub fn has_pending_fence(&self) -> bool {
        self.inner.state.lock().pending_fence.is_some()
    }

    /// Block until the GPU is done with the last consumer's commands, then
    /// consume the fence. No-op when no fence is pending.
    pub fn wait_until_released(&self) -> Result<()> {
        if let Some(mut fence) = self.take_pending_fence() {
            fence.wait()?;
            fence.dispose();
        }
        Ok(())
    }

    /// Read access to host-memory pixels (`CpuBacked` only).
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.inner.state.lock();
        match state.pixels.as_deref() {
            Some(pixels) => Ok(f(pixels)),
            None => Err(BridgeError::InvalidConfiguration(
                "pixel access on a GPU-backed frame".into(),
            )),
        }
    }

    /// Overwrite host-memory pixels (`CpuBacked` only).
    ///
    /// Rewriting the content may hand the frame a different native buffer, so
    /// the stale name binding is revoked; it is re-established on the next
    /// bind.
    pub fn copy_from_slice(&self, registry: &FrameNameRegistry, data: &[u8]) -> Result<()> {
        let expected = self.byte_len();
        if data.len() != expected {
            return Err(BridgeError::InvalidConfiguration(format!(
                "pixel data is {} bytes, frame needs {expected}",
                data.len()
            )));
        }
        {
            let mut state = self.inner.state.lock();
            match state.pixels.as_deref_mut() {
                Some(pixels) => pixels.copy_from_slice(data),
                None => {
                    return Err(BridgeError::InvalidConfiguration(
                        "pixel write on a GPU-backed frame".into(),
                    ));
                }
            }
        }
        self.revoke_native_name(registry);
        Ok(())
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.inner.id)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .field("kind", &self.inner.kind)
            .field("native_name", &self.native_name())
            .finish()
    }
}
