// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Raw C ABI of the mediagraph engine (`libmediagraph`).
//!
//! Everything the engine hands us is an opaque pointer; the safe wrappers in
//! `crate::core` own exactly one of these each and release it through the
//! matching `mg_*__delete` entry point. Function pointers are grouped into
//! per-object vtables so the safe layer can be constructed against any symbol
//! source: `crate::engine::Engine` resolves them from a shared library at
//! startup, statically linked hosts (and tests) supply them directly.

#![allow(dead_code)]

use std::ffi::c_void;

// Opaque engine object references
pub type MgGraphRef = *mut c_void;
pub type MgPacketRef = *mut c_void;
pub type MgPollerRef = *mut c_void;
pub type MgSyncTokenRef = *mut c_void;
pub type MgGpuContextRef = *mut c_void;

/// Status codes returned by every fallible engine call.
pub const MG_STATUS_OK: i32 = 0;
pub const MG_STATUS_INVALID_ARGUMENT: i32 = 1;
pub const MG_STATUS_NOT_FOUND: i32 = 2;
pub const MG_STATUS_FAILED_PRECONDITION: i32 = 3;
pub const MG_STATUS_INTERNAL: i32 = 4;

/// Destructor signature shared by every owning handle.
pub type ReleaseFn = unsafe extern "C" fn(ptr: *mut c_void);

/// Fired by the engine once it no longer needs an input frame.
///
/// `name` is the native buffer/texture name the frame was submitted under;
/// `sync_token` is null or a fence the consumer must reach before the frame's
/// memory may be rewritten. Ownership of a non-null token passes to the
/// callee. `user_data` is the pointer registered at submission time.
pub type FrameReleaseCallback =
    unsafe extern "C" fn(name: u32, sync_token: MgSyncTokenRef, user_data: *mut c_void);

/// Per-packet delivery for observed output streams.
///
/// Invoked on an engine-owned thread, potentially during graph teardown. The
/// packet pointer is only valid for the duration of the call; the callee must
/// copy anything it wants to keep and must not unwind; failures are reported
/// through the returned status code.
pub type PacketCallback =
    unsafe extern "C" fn(stream_id: u64, packet: MgPacketRef, user_data: *mut c_void) -> i32;

/// Entry points for GPU sync tokens (`mg_sync_token__*`).
#[derive(Clone, Copy)]
pub struct FenceOps {
    /// Block the calling thread until the token's GPU commands complete.
    pub wait: unsafe extern "C" fn(token: MgSyncTokenRef) -> i32,
    /// Insert a wait into the current GPU command queue; never blocks the CPU.
    pub wait_on_gpu: unsafe extern "C" fn(token: MgSyncTokenRef) -> i32,
    /// Non-blocking completion poll.
    pub is_ready: unsafe extern "C" fn(token: MgSyncTokenRef) -> bool,
    pub release: ReleaseFn,
}

/// Entry points for packets (`mg_packet__*`).
#[derive(Clone, Copy)]
pub struct PacketOps {
    /// Packet timestamp in microseconds.
    pub timestamp_us: unsafe extern "C" fn(packet: MgPacketRef) -> i64,
    pub is_empty: unsafe extern "C" fn(packet: MgPacketRef) -> bool,
    /// Exposes the serialized payload; the pointed-to bytes live only as long
    /// as the packet.
    pub payload:
        unsafe extern "C" fn(packet: MgPacketRef, data: *mut *const u8, len: *mut usize) -> i32,
    pub release: ReleaseFn,
}

/// Entry points for output stream pollers (`mg_poller__*`).
#[derive(Clone, Copy)]
pub struct PollerOps {
    /// Block until the next packet arrives or the stream closes. On `true`,
    /// `packet_out` holds a packet owned by the caller.
    pub next: unsafe extern "C" fn(poller: MgPollerRef, packet_out: *mut MgPacketRef) -> bool,
    pub release: ReleaseFn,
}

/// Entry points for the graph itself (`mg_graph__*`).
#[derive(Clone, Copy)]
pub struct GraphOps {
    /// Build a graph from a serialized config blob.
    pub create:
        unsafe extern "C" fn(config: *const u8, len: usize, graph_out: *mut MgGraphRef) -> i32,
    pub start: unsafe extern "C" fn(graph: MgGraphRef) -> i32,
    /// Close all input streams and wait until the graph is done.
    pub close: unsafe extern "C" fn(graph: MgGraphRef) -> i32,
    /// Submit a GPU-backed frame to a named input stream. The engine calls
    /// `on_release` exactly once when it is done with the texture.
    pub add_gpu_frame: unsafe extern "C" fn(
        graph: MgGraphRef,
        stream: *const std::ffi::c_char,
        name: u32,
        width: u32,
        height: u32,
        format: i32,
        timestamp_us: i64,
        on_release: FrameReleaseCallback,
        user_data: *mut c_void,
    ) -> i32,
    /// Submit a CPU-backed frame. The engine copies or retains `data` until
    /// `on_release` fires for `name`.
    pub add_cpu_frame: unsafe extern "C" fn(
        graph: MgGraphRef,
        stream: *const std::ffi::c_char,
        data: *const u8,
        len: usize,
        name: u32,
        width: u32,
        height: u32,
        format: i32,
        timestamp_us: i64,
        on_release: FrameReleaseCallback,
        user_data: *mut c_void,
    ) -> i32,
    /// Attach a blocking poller to a named output stream.
    pub add_poller: unsafe extern "C" fn(
        graph: MgGraphRef,
        stream: *const std::ffi::c_char,
        poller_out: *mut MgPollerRef,
    ) -> i32,
    /// Register a packet callback on a named output stream. Must be called
    /// before `start`.
    pub observe: unsafe extern "C" fn(
        graph: MgGraphRef,
        stream: *const std::ffi::c_char,
        stream_id: u64,
        callback: PacketCallback,
        user_data: *mut c_void,
    ) -> i32,
    /// Shared handle to the GPU context the graph executes against, or null
    /// when the graph runs CPU-only.
    pub gpu_context: unsafe extern "C" fn(graph: MgGraphRef) -> MgGpuContextRef,
    pub release: ReleaseFn,
}

/// Entry points for the shared GPU context handle (`mg_gpu_context__*`).
#[derive(Clone, Copy)]
pub struct GpuContextOps {
    /// Resolve the shared-pointer control block to the context it points at.
    pub get: unsafe extern "C" fn(ctx: MgGpuContextRef) -> *mut c_void,
    pub release: ReleaseFn,
}
