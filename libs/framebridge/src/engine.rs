// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Binding to the native mediagraph engine.
//!
//! [`Engine`] resolves the `mg_*` symbol set once at load time (a missing
//! symbol is a load-time configuration error, never a crash at call time)
//! and hands out the vtables the safe wrappers run against. Hosts that link
//! the engine statically (and tests) construct an [`Engine`] from vtables
//! directly.
//!
//! [`Pipeline`] wraps one running graph: frame submission with release
//! routing back to the owning [`FramePool`], and per-stream output consumption
//! in exactly one mode. Everything the engine may call back into after
//! `start` (observer mailboxes, release contexts) is pinned here, keyed by
//! the owning pipeline, and detached only after the engine confirms teardown.

use std::collections::HashMap;
use std::ffi::{CString, c_void};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::core::error::{BridgeError, Result};
use crate::core::fence::SyncFence;
use crate::core::handle::{NativeHandle, SharedNativeRef};
use crate::core::packet::{FromPacket, Timestamp};
use crate::core::pool::{FramePool, PooledFrame};
use crate::core::stream::{
    ObserverPin, StreamMode, StreamObserver, StreamPoller, packet_trampoline,
};
use crate::core::frame::StorageKind;
use crate::ffi::{
    FenceOps, GpuContextOps, GraphOps, MG_STATUS_OK, MgGpuContextRef, MgGraphRef, MgPollerRef,
    MgSyncTokenRef, PacketOps, PollerOps,
};

/// Resolved entry points of one loaded engine library.
pub struct Engine {
    graph_ops: GraphOps,
    packet_ops: PacketOps,
    poller_ops: PollerOps,
    fence_ops: FenceOps,
    gpu_context_ops: GpuContextOps,
    /// Keeps the dynamic library mapped for as long as any resolved function
    /// pointer can run.
    _lib: Option<libloading::Library>,
}

macro_rules! resolve {
    ($lib:expr, $name:literal, $sig:ty) => {{
        // SAFETY: the engine library exports this symbol with exactly this
        // signature; the pointer is copied out and stays valid because the
        // library is kept mapped by the owning Engine.
        let symbol: libloading::Symbol<'_, $sig> = unsafe { $lib.get($name) }.map_err(|e| {
            BridgeError::native(
                crate::ffi::MG_STATUS_NOT_FOUND,
                format!("missing engine symbol {}: {e}", String::from_utf8_lossy($name)),
            )
        })?;
        *symbol
    }};
}

impl Engine {
    /// Load the engine shared library and resolve the full symbol set.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initializers; the engine library
        // documents none with side effects beyond symbol setup.
        let lib = unsafe { libloading::Library::new(path) }.map_err(|e| {
            BridgeError::native(
                crate::ffi::MG_STATUS_NOT_FOUND,
                format!("failed to load engine library {}: {e}", path.display()),
            )
        })?;

        let graph_ops = GraphOps {
            create: resolve!(
                lib,
                b"mg_graph__create\0",
                unsafe extern "C" fn(*const u8, usize, *mut MgGraphRef) -> i32
            ),
            start: resolve!(
                lib,
                b"mg_graph__start\0",
                unsafe extern "C" fn(MgGraphRef) -> i32
            ),
            close: resolve!(
                lib,
                b"mg_graph__close\0",
                unsafe extern "C" fn(MgGraphRef) -> i32
            ),
            add_gpu_frame: resolve!(
                lib,
                b"mg_graph__add_gpu_frame\0",
                unsafe extern "C" fn(
                    MgGraphRef,
                    *const std::ffi::c_char,
                    u32,
                    u32,
                    u32,
                    i32,
                    i64,
                    crate::ffi::FrameReleaseCallback,
                    *mut c_void,
                ) -> i32
            ),
            add_cpu_frame: resolve!(
                lib,
                b"mg_graph__add_cpu_frame\0",
                unsafe extern "C" fn(
                    MgGraphRef,
                    *const std::ffi::c_char,
                    *const u8,
                    usize,
                    u32,
                    u32,
                    u32,
                    i32,
                    i64,
                    crate::ffi::FrameReleaseCallback,
                    *mut c_void,
                ) -> i32
            ),
            add_poller: resolve!(
                lib,
                b"mg_graph__add_poller\0",
                unsafe extern "C" fn(MgGraphRef, *const std::ffi::c_char, *mut MgPollerRef) -> i32
            ),
            observe: resolve!(
                lib,
                b"mg_graph__observe\0",
                unsafe extern "C" fn(
                    MgGraphRef,
                    *const std::ffi::c_char,
                    u64,
                    crate::ffi::PacketCallback,
                    *mut c_void,
                ) -> i32
            ),
            gpu_context: resolve!(
                lib,
                b"mg_graph__gpu_context\0",
                unsafe extern "C" fn(MgGraphRef) -> MgGpuContextRef
            ),
            release: resolve!(
                lib,
                b"mg_graph__delete\0",
                unsafe extern "C" fn(*mut c_void)
            ),
        };
        let packet_ops = PacketOps {
            timestamp_us: resolve!(
                lib,
                b"mg_packet__timestamp_us\0",
                unsafe extern "C" fn(crate::ffi::MgPacketRef) -> i64
            ),
            is_empty: resolve!(
                lib,
                b"mg_packet__is_empty\0",
                unsafe extern "C" fn(crate::ffi::MgPacketRef) -> bool
            ),
            payload: resolve!(
                lib,
                b"mg_packet__payload\0",
                unsafe extern "C" fn(crate::ffi::MgPacketRef, *mut *const u8, *mut usize) -> i32
            ),
            release: resolve!(
                lib,
                b"mg_packet__delete\0",
                unsafe extern "C" fn(*mut c_void)
            ),
        };
        let poller_ops = PollerOps {
            next: resolve!(
                lib,
                b"mg_poller__next\0",
                unsafe extern "C" fn(MgPollerRef, *mut crate::ffi::MgPacketRef) -> bool
            ),
            release: resolve!(
                lib,
                b"mg_poller__delete\0",
                unsafe extern "C" fn(*mut c_void)
            ),
        };
        let fence_ops = FenceOps {
            wait: resolve!(
                lib,
                b"mg_sync_token__wait\0",
                unsafe extern "C" fn(MgSyncTokenRef) -> i32
            ),
            wait_on_gpu: resolve!(
                lib,
                b"mg_sync_token__wait_on_gpu\0",
                unsafe extern "C" fn(MgSyncTokenRef) -> i32
            ),
            is_ready: resolve!(
                lib,
                b"mg_sync_token__is_ready\0",
                unsafe extern "C" fn(MgSyncTokenRef) -> bool
            ),
            release: resolve!(
                lib,
                b"mg_sync_token__delete\0",
                unsafe extern "C" fn(*mut c_void)
            ),
        };
        let gpu_context_ops = GpuContextOps {
            get: resolve!(
                lib,
                b"mg_gpu_context__get\0",
                unsafe extern "C" fn(*mut c_void) -> *mut c_void
            ),
            release: resolve!(
                lib,
                b"mg_gpu_context__delete\0",
                unsafe extern "C" fn(*mut c_void)
            ),
        };

        Ok(Arc::new(Self {
            graph_ops,
            packet_ops,
            poller_ops,
            fence_ops,
            gpu_context_ops,
            _lib: Some(lib),
        }))
    }

    /// Build an engine from vtables supplied by the host.
    ///
    /// For hosts that link the engine statically instead of loading it at
    /// runtime.
    pub fn from_vtables(
        graph_ops: GraphOps,
        packet_ops: PacketOps,
        poller_ops: PollerOps,
        fence_ops: FenceOps,
        gpu_context_ops: GpuContextOps,
    ) -> Arc<Self> {
        Arc::new(Self {
            graph_ops,
            packet_ops,
            poller_ops,
            fence_ops,
            gpu_context_ops,
            _lib: None,
        })
    }

    pub fn fence_ops(&self) -> FenceOps {
        self.fence_ops
    }

    /// Wrap a raw sync token the engine handed out elsewhere.
    pub fn wrap_sync_token(&self, token: MgSyncTokenRef) -> Result<SyncFence> {
        SyncFence::from_raw(token, self.fence_ops)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dynamic", &self._lib.is_some())
            .finish()
    }
}

/// Shared handle to the GPU execution context a graph runs against.
pub struct GpuContext {
    shared: SharedNativeRef,
}

impl GpuContext {
    fn from_raw(ctrl: MgGpuContextRef, ops: GpuContextOps) -> Result<Self> {
        Ok(Self {
            shared: SharedNativeRef::from_control_block("gpu context", ctrl, ops.get, ops.release)?,
        })
    }

    /// The raw context pointer, resolved through the shared control block.
    pub fn native_context(&self) -> Result<*mut c_void> {
        self.shared.target()
    }

    pub fn dispose(&mut self) {
        self.shared.dispose();
    }
}

/// Release-routing context pinned per (pipeline, pool) pair.
///
/// The engine holds the raw pointer to this for every in-flight frame; the
/// pipeline keeps the `Arc` alive until teardown, per the pinned-lifetime
/// contract for callbacks the native side retains.
struct FrameReleaseCtx {
    pool: FramePool,
    fence_ops: FenceOps,
}

unsafe extern "C" fn frame_release_trampoline(
    name: u32,
    sync_token: MgSyncTokenRef,
    user_data: *mut c_void,
) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        // SAFETY: user_data is a FrameReleaseCtx pinned by the pipeline for
        // the engine's lifetime.
        let ctx = unsafe { &*(user_data as *const FrameReleaseCtx) };
        let fence = if sync_token.is_null() {
            None
        } else {
            SyncFence::from_raw(sync_token, ctx.fence_ops).ok()
        };
        ctx.pool.on_frame_released(name, fence);
    }));
    if outcome.is_err() {
        tracing::error!(name, "panic in frame release callback");
    }
}

struct PipelineState {
    modes: HashMap<String, StreamMode>,
    observers: Vec<Arc<dyn ObserverPin>>,
    release_ctxs: Vec<Arc<FrameReleaseCtx>>,
    next_stream_id: u64,
    closed: bool,
}

/// One running graph inside the engine.
pub struct Pipeline {
    engine: Arc<Engine>,
    graph: NativeHandle,
    state: Mutex<PipelineState>,
    started: AtomicBool,
}

impl Pipeline {
    /// Build a graph from its serialized config.
    pub fn new(engine: Arc<Engine>, graph_config: &[u8]) -> Result<Self> {
        let mut graph: MgGraphRef = std::ptr::null_mut();
        // SAFETY: config points at `len` readable bytes for the duration of
        // the call; the engine copies what it keeps.
        let code = unsafe {
            (engine.graph_ops.create)(graph_config.as_ptr(), graph_config.len(), &mut graph)
        };
        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, "graph create"));
        }
        Ok(Self {
            graph: NativeHandle::owned("graph", graph, engine.graph_ops.release)?,
            engine,
            state: Mutex::new(PipelineState {
                modes: HashMap::new(),
                observers: Vec::new(),
                release_ctxs: Vec::new(),
                next_stream_id: 1,
                closed: false,
            }),
            started: AtomicBool::new(false),
        })
    }

    /// Register an async observer on a named output stream.
    ///
    /// Must happen before [`Pipeline::start`]; a stream already consumed in
    /// polling mode is rejected here rather than failing at delivery time.
    pub fn observe_output<T: FromPacket>(&self, stream: &str) -> Result<StreamObserver<T>> {
        if self.started.load(Ordering::Acquire) {
            return Err(BridgeError::InvalidConfiguration(format!(
                "observer on '{stream}' must be registered before the pipeline starts"
            )));
        }
        let graph = self.graph.get()?;
        let cname = stream_cstring(stream)?;

        let mut state = self.state.lock();
        check_stream_unclaimed(&state.modes, stream)?;

        let observer = StreamObserver::<T>::new(stream, self.engine.packet_ops);
        let shared = Arc::clone(observer.shared());
        let stream_id = state.next_stream_id;
        state.next_stream_id += 1;

        // SAFETY: graph and cname outlive the call; `shared` is pinned below
        // for as long as the engine may invoke the trampoline.
        let code = unsafe {
            (self.engine.graph_ops.observe)(
                graph,
                cname.as_ptr(),
                stream_id,
                packet_trampoline::<T>,
                Arc::as_ptr(&shared) as *mut c_void,
            )
        };
        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, format!("observe '{stream}'")));
        }
        state.observers.push(shared);
        state.modes.insert(stream.to_string(), StreamMode::Observing);
        Ok(observer)
    }

    /// Attach a blocking poller to a named output stream.
    ///
    /// The synchronous-pull opt-in for this stream; mixing with observing
    /// mode is rejected.
    pub fn poll_output<T: FromPacket>(&self, stream: &str) -> Result<StreamPoller<T>> {
        if self.started.load(Ordering::Acquire) {
            return Err(BridgeError::InvalidConfiguration(format!(
                "poller on '{stream}' must be attached before the pipeline starts"
            )));
        }
        let graph = self.graph.get()?;
        let cname = stream_cstring(stream)?;

        let mut state = self.state.lock();
        check_stream_unclaimed(&state.modes, stream)?;

        let mut poller: MgPollerRef = std::ptr::null_mut();
        // SAFETY: graph and cname outlive the call.
        let code = unsafe { (self.engine.graph_ops.add_poller)(graph, cname.as_ptr(), &mut poller) };
        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, format!("add poller '{stream}'")));
        }
        state.modes.insert(stream.to_string(), StreamMode::Polling);
        StreamPoller::from_raw(stream, poller, self.engine.poller_ops, self.engine.packet_ops)
    }

    pub fn start(&self) -> Result<()> {
        let graph = self.graph.get()?;
        // SAFETY: graph is live for the duration of this borrow.
        let code = unsafe { (self.engine.graph_ops.start)(graph) };
        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, "graph start"));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Submit a pooled frame to a named input stream.
    ///
    /// The frame leaves its guard here; the engine's release notification
    /// routes it back to the owning pool (with any consumer fence attached).
    /// Timestamps on one stream must be monotonically non-decreasing.
    pub fn send_frame(&self, stream: &str, frame: PooledFrame, timestamp: Timestamp) -> Result<()> {
        let graph = self.graph.get()?;
        let cname = stream_cstring(stream)?;

        let pool = frame.pool_handle();
        let ctx = self.pin_release_ctx(&pool);
        let user_data = Arc::as_ptr(&ctx) as *mut c_void;

        // Resolve the name while the guard still owns the frame: failing
        // here returns the frame to the pool instead of stranding it.
        let name = frame.native_name().ok_or_else(|| {
            BridgeError::InvalidConfiguration(format!(
                "frame {} has no native name bound",
                frame.id()
            ))
        })?;
        let frame = frame.detach();

        // SAFETY: graph, cname and pixel data outlive the call; the frame
        // stays alive in the pool's in-use map until the release callback
        // fires; ctx is pinned for the engine's lifetime.
        let code = match frame.storage_kind() {
            StorageKind::GpuBacked => unsafe {
                (self.engine.graph_ops.add_gpu_frame)(
                    graph,
                    cname.as_ptr(),
                    name,
                    frame.width(),
                    frame.height(),
                    frame.format().to_native(),
                    timestamp.micros(),
                    frame_release_trampoline,
                    user_data,
                )
            },
            StorageKind::CpuBacked => frame.with_pixels(|pixels| unsafe {
                (self.engine.graph_ops.add_cpu_frame)(
                    graph,
                    cname.as_ptr(),
                    pixels.as_ptr(),
                    pixels.len(),
                    name,
                    frame.width(),
                    frame.height(),
                    frame.format().to_native(),
                    timestamp.micros(),
                    frame_release_trampoline,
                    user_data,
                )
            })?,
        };
        if code != MG_STATUS_OK {
            // The engine rejected the frame, so no release callback will ever
            // fire for it; reclaim it here.
            pool.on_frame_released(name, None);
            return Err(BridgeError::native(code, format!("add frame to '{stream}'")));
        }
        Ok(())
    }

    /// The GPU execution context this graph runs against, if it has one.
    pub fn gpu_context(&self) -> Result<Option<GpuContext>> {
        let graph = self.graph.get()?;
        // SAFETY: graph is live for the duration of this borrow.
        let ctrl = unsafe { (self.engine.graph_ops.gpu_context)(graph) };
        if ctrl.is_null() {
            return Ok(None);
        }
        GpuContext::from_raw(ctrl, self.engine.gpu_context_ops).map(Some)
    }

    /// Shut the graph down.
    ///
    /// Closes the engine side first (after which no more callbacks arrive),
    /// then resolves pending observer waits with `StreamClosed` and unpins
    /// the callback contexts.
    pub fn close(&mut self) -> Result<()> {
        {
            let state = self.state.lock();
            if state.closed {
                return Ok(());
            }
        }
        let graph = self.graph.get()?;
        // SAFETY: graph is live for the duration of this borrow; the call
        // returns only once the engine is done delivering callbacks.
        let code = unsafe { (self.engine.graph_ops.close)(graph) };
        self.graph.dispose();

        let mut state = self.state.lock();
        state.closed = true;
        for observer in state.observers.drain(..) {
            observer.close_stream();
        }
        state.release_ctxs.clear();
        drop(state);

        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, "graph close"));
        }
        Ok(())
    }

    /// Reuse one pinned release context per pool.
    fn pin_release_ctx(&self, pool: &FramePool) -> Arc<FrameReleaseCtx> {
        let mut state = self.state.lock();
        if let Some(ctx) = state
            .release_ctxs
            .iter()
            .find(|ctx| ctx.pool.same_pool(pool))
        {
            return Arc::clone(ctx);
        }
        let ctx = Arc::new(FrameReleaseCtx {
            pool: pool.clone(),
            fence_ops: self.engine.fence_ops,
        });
        state.release_ctxs.push(Arc::clone(&ctx));
        ctx
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let closed = self.state.lock().closed;
        if !closed {
            tracing::warn!("pipeline dropped without close, tearing down");
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "pipeline teardown failed");
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pipeline")
            .field("started", &self.is_started())
            .field("closed", &state.closed)
            .field("streams", &state.modes.len())
            .finish()
    }
}

fn stream_cstring(stream: &str) -> Result<CString> {
    CString::new(stream).map_err(|_| {
        BridgeError::InvalidConfiguration(format!("stream name '{stream}' contains a NUL byte"))
    })
}

fn check_stream_unclaimed(modes: &HashMap<String, StreamMode>, stream: &str) -> Result<()> {
    if let Some(mode) = modes.get(stream) {
        return Err(BridgeError::InvalidConfiguration(format!(
            "stream '{stream}' is already consumed in {mode:?} mode"
        )));
    }
    Ok(())
}
