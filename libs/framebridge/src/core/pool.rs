// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Bounded frame pool decoupling capture from the engine.
//!
//! The producer thread acquires frames with [`FramePool::request_frame`],
//! fills them, and submits them to the engine; the engine's release
//! notification routes back through [`FramePool::on_frame_released`], possibly
//! carrying a GPU fence. The fence is waited on lazily by the *next* acquirer
//! of that frame, never by the release notifier, so frame reclamation latency
//! stays off the engine's threads.
//!
//! Queue and map share one mutex; `request_frame` blocks on the paired
//! condvar until a frame frees up or the tracked count drops below capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::error::{BridgeError, Result};
use crate::core::fence::SyncFence;
use crate::core::frame::{FrameBuffer, FrameId, PixelFormat};
use crate::core::registry::FrameNameRegistry;

/// Allocates a frame when the pool is below capacity and nothing reusable is
/// queued. Receives the pool's registry so it can bind the frame's native
/// name at creation time.
pub type FrameAllocator =
    dyn Fn(&FrameNameRegistry, u32, u32, PixelFormat) -> Result<FrameBuffer> + Send + Sync;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            width: 1280,
            height: 720,
            format: PixelFormat::Rgba8,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BridgeError::InvalidConfiguration(
                "pool capacity must be at least 1".into(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(BridgeError::InvalidConfiguration(
                "pool dimensions must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of pool usage.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub capacity: usize,
    pub width: u32,
    pub height: u32,
}

struct PoolState {
    width: u32,
    height: u32,
    available: VecDeque<FrameBuffer>,
    in_use: HashMap<FrameId, FrameBuffer>,
    /// Requests that dropped the lock to run the allocator; counted so
    /// concurrent waiters cannot overshoot capacity together.
    allocating: usize,
    closed: bool,
}

pub(crate) struct PoolShared {
    capacity: usize,
    format: PixelFormat,
    state: Mutex<PoolState>,
    available_cond: Condvar,
    registry: FrameNameRegistry,
    allocator: Box<FrameAllocator>,
}

impl PoolShared {
    /// Reclaim a frame the engine (or a dropped guard) handed back.
    fn requeue(&self, frame: FrameBuffer, fence: Option<SyncFence>) {
        let mut state = self.state.lock();
        if state.in_use.remove(&frame.id()).is_none() {
            drop(state);
            tracing::warn!(id = %frame.id(), "released frame does not belong to the pool");
            if let Some(mut fence) = fence {
                fence.dispose();
            }
            return;
        }
        frame.attach_fence(fence);

        let stale = !frame.matches_dimensions(state.width, state.height);
        let tracked = state.available.len() + state.in_use.len();
        if state.closed || stale || tracked >= self.capacity {
            drop(state);
            tracing::debug!(id = %frame.id(), stale, "discarding released frame");
            self.discard(frame);
        } else {
            state.available.push_back(frame);
            drop(state);
        }
        self.available_cond.notify_one();
    }

    /// Drop a frame out of the pool for good: its name binding is invalidated
    /// immediately, any pending fence is released with the frame.
    fn discard(&self, frame: FrameBuffer) {
        frame.revoke_native_name(&self.registry);
    }
}

/// Bounded, reusable pool of [`FrameBuffer`]s.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    /// Create a pool that allocates CPU-backed frames.
    pub fn new(config: PoolConfig) -> Result<Self> {
        // CPU-backed frames have no engine-assigned texture name; synthesize
        // names from a counter so release routing is uniform across storage
        // kinds.
        let name_seq = AtomicU32::new(1);
        Self::with_allocator(
            config,
            Box::new(move |registry, width, height, format| {
                let frame = FrameBuffer::new_cpu(width, height, format);
                frame.bind_native_name(registry, name_seq.fetch_add(1, Ordering::Relaxed))?;
                Ok(frame)
            }),
        )
    }

    /// Create a pool with a custom allocator (e.g. GPU textures created
    /// against the engine's context).
    pub fn with_allocator(config: PoolConfig, allocator: Box<FrameAllocator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                capacity: config.capacity,
                format: config.format,
                state: Mutex::new(PoolState {
                    width: config.width,
                    height: config.height,
                    available: VecDeque::with_capacity(config.capacity),
                    in_use: HashMap::with_capacity(config.capacity),
                    allocating: 0,
                    closed: false,
                }),
                available_cond: Condvar::new(),
                registry: FrameNameRegistry::new(),
                allocator,
            }),
        })
    }

    /// The name registry owned by this pool.
    pub fn registry(&self) -> &FrameNameRegistry {
        &self.shared.registry
    }

    /// Whether two handles refer to the same underlying pool.
    pub(crate) fn same_pool(&self, other: &FramePool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Update target dimensions. Existing frames are not evicted; each frame
    /// is checked against the current target before it is reused.
    pub fn set_dimensions(&self, width: u32, height: u32) {
        let mut state = self.shared.state.lock();
        state.width = width;
        state.height = height;
        drop(state);
        self.shared.available_cond.notify_all();
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let state = self.shared.state.lock();
        (state.width, state.height)
    }

    /// Acquire a frame, blocking until one is available or the pool can grow.
    ///
    /// Available frames are scanned in FIFO order; any frame whose dimensions
    /// no longer match the current target is discarded on the spot, trading a
    /// little extra allocation for never handing out a stale-sized buffer. A
    /// pending release fence on the selected frame is waited on here, by the
    /// acquirer, outside the pool lock.
    pub fn request_frame(&self) -> Result<PooledFrame> {
        let shared = &self.shared;
        loop {
            let mut state = shared.state.lock();
            if state.closed {
                return Err(BridgeError::PoolClosed);
            }

            // Reuse path: first available frame that matches the target.
            let mut reusable = None;
            while let Some(frame) = state.available.pop_front() {
                if frame.matches_dimensions(state.width, state.height) {
                    reusable = Some(frame);
                    break;
                }
                tracing::debug!(
                    id = %frame.id(),
                    width = frame.width(),
                    height = frame.height(),
                    "discarding stale-sized frame"
                );
                shared.discard(frame);
            }
            if let Some(frame) = reusable {
                state.in_use.insert(frame.id(), frame.clone());
                drop(state);
                match frame.wait_until_released() {
                    Ok(()) => return Ok(PooledFrame::new(frame, Arc::clone(shared))),
                    Err(err) => {
                        // The inherited fence failed; this frame is not safe
                        // to hand out. Drop it and keep scanning.
                        tracing::warn!(id = %frame.id(), error = %err, "release fence wait failed, discarding frame");
                        shared.state.lock().in_use.remove(&frame.id());
                        shared.discard(frame);
                        shared.available_cond.notify_one();
                        continue;
                    }
                }
            }

            // Growth path: allocate while below capacity. The allocator runs
            // outside the lock; `allocating` keeps concurrent requests from
            // overshooting together.
            let tracked = state.in_use.len() + state.allocating;
            if tracked < shared.capacity {
                state.allocating += 1;
                let (width, height) = (state.width, state.height);
                drop(state);

                let allocated = (shared.allocator)(&shared.registry, width, height, shared.format);

                let mut state = shared.state.lock();
                state.allocating -= 1;
                match allocated {
                    Ok(frame) => {
                        if state.closed {
                            drop(state);
                            shared.discard(frame);
                            return Err(BridgeError::PoolClosed);
                        }
                        state.in_use.insert(frame.id(), frame.clone());
                        drop(state);
                        return Ok(PooledFrame::new(frame, Arc::clone(shared)));
                    }
                    Err(err) => {
                        drop(state);
                        // The reserved slot is free again; let another waiter
                        // try.
                        shared.available_cond.notify_one();
                        return Err(err);
                    }
                }
            }

            shared.available_cond.wait(&mut state);
        }
    }

    /// Release-notification entry point, invoked when the engine is done with
    /// the frame submitted under `name`. `fence`, if present, guards the
    /// consumer's outstanding GPU reads; it is stored with the frame and
    /// waited on by the next acquirer.
    pub fn on_frame_released(&self, name: u32, fence: Option<SyncFence>) {
        match self.shared.registry.resolve(name) {
            Some(frame) => self.shared.requeue(frame, fence),
            None => {
                tracing::warn!(name, "released frame name has no live owner");
                if let Some(mut fence) = fence {
                    fence.dispose();
                }
            }
        }
    }

    /// Tear the pool down: every tracked frame is discarded, the name table
    /// cleared, and all blocked `request_frame` callers woken with
    /// [`BridgeError::PoolClosed`]. Release notifications arriving after
    /// close are ignored.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let available: Vec<_> = state.available.drain(..).collect();
        let in_use: Vec<_> = state.in_use.drain().map(|(_, frame)| frame).collect();
        drop(state);

        for frame in available {
            self.shared.discard(frame);
        }
        for frame in in_use {
            tracing::warn!(id = %frame.id(), "frame still in use at pool teardown");
            self.shared.discard(frame);
        }
        self.shared.registry.clear();
        self.shared.available_cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            available: state.available.len(),
            in_use: state.in_use.len(),
            capacity: self.shared.capacity,
            width: state.width,
            height: state.height,
        }
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("FramePool")
            .field("available", &stats.available)
            .field("in_use", &stats.in_use)
            .field("capacity", &stats.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Guard for a frame handed out by [`FramePool::request_frame`].
///
/// Dropping the guard returns the frame to the pool; submitting the frame to
/// the engine instead goes through [`PooledFrame::detach`], which hands
/// reclamation over to the engine's release notification.
pub struct PooledFrame {
    frame: Option<FrameBuffer>,
    pool: Arc<PoolShared>,
}

impl PooledFrame {
    fn new(frame: FrameBuffer, pool: Arc<PoolShared>) -> Self {
        Self {
            frame: Some(frame),
            pool,
        }
    }

    pub fn frame(&self) -> &FrameBuffer {
        // `frame` is only ever None after `detach`, which consumes self.
        self.frame.as_ref().expect("pooled frame already detached")
    }

    /// Take the frame out of the guard without returning it to the pool.
    ///
    /// The frame stays in the pool's in-use map; whoever detaches it is
    /// responsible for routing the eventual release back through
    /// [`FramePool::on_frame_released`].
    pub fn detach(mut self) -> FrameBuffer {
        self.frame.take().expect("pooled frame already detached")
    }

    /// The pool this frame was acquired from.
    pub(crate) fn pool_handle(&self) -> FramePool {
        FramePool {
            shared: Arc::clone(&self.pool),
        }
    }
}

impl std::ops::Deref for PooledFrame {
    type Target = FrameBuffer;

    fn deref(&self) -> &Self::Target {
        self.frame()
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.requeue(frame, None);
        }
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledFrame").field(&self.frame).finish()
    }
}
