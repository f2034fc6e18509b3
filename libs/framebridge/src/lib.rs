// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! framebridge: safe host-side runtime for the native mediagraph engine.
//!
//! The engine is an opaque, asynchronous media-processing graph living behind
//! a C ABI. This crate owns the boundary: every native object is wrapped in
//! an ownership handle that releases it exactly once, frames flow through a
//! bounded pool whose reuse is gated on the engine's GPU fences, and named
//! engine outputs are consumed through blocking pollers or async observers.
//!
//! Typical flow: acquire a frame from a [`core::FramePool`], fill it, submit
//! it via [`engine::Pipeline::send_frame`]; consume results from
//! [`core::StreamObserver::wait_next`]; the engine's release notification
//! recycles the frame once any pending fence is satisfied.

// Suppress pedantic clippy warnings that are intentional design choices
#![allow(clippy::too_many_arguments)] // Frame submission entry points mirror the C signatures

pub mod core;
pub mod engine;
pub mod ffi;

pub use crate::core::{
    BridgeConfig,
    BridgeError,
    FrameBuffer,
    FrameId,
    FrameNameRegistry,
    FramePool,
    FromPacket,
    NativeHandle,
    Ownership,
    Packet,
    PixelFormat,
    PoolConfig,
    PoolStats,
    PooledFrame,
    Result,
    SharedNativeRef,
    StorageKind,
    StreamConfig,
    StreamMode,
    StreamObserver,
    StreamPoller,
    SyncFence,
    Timestamp,
    UniqueNativeRef,
    wait_all,
};
pub use crate::engine::{Engine, GpuContext, Pipeline};
