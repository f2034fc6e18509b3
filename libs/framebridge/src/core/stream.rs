// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Output stream delivery.
//!
//! Each named engine output is consumed under exactly one of two models,
//! chosen at setup time and never mixed on the same stream:
//!
//! - **Polling** ([`StreamPoller`]): a direct blocking pull from the engine's
//!   own queue, no host-side buffering.
//! - **Observing** ([`StreamObserver`]): the engine pushes packets into an
//!   extern "C" trampoline on a thread it owns; the trampoline copies the
//!   value out and publishes it into a single-slot mailbox that host-side
//!   waiters await with a timeout. Downstream consumers care about freshness,
//!   not completeness, so an unconsumed result is overwritten by a newer one
//!   and out-of-order results are dropped: published timestamps are
//!   monotonically increasing per stream.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::error::{BridgeError, Result};
use crate::core::handle::NativeHandle;
use crate::core::packet::{FromPacket, Packet, Timestamp};
use crate::ffi::{MG_STATUS_INTERNAL, MG_STATUS_OK, MgPacketRef, MgPollerRef, PacketOps, PollerOps};

/// How a named output stream is consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    Polling,
    Observing,
}

struct Slot<T> {
    /// Latest unconsumed result, or a pending error for the next waiter.
    value: Option<Result<T>>,
    /// High-water mark of published timestamps; results at or below it are
    /// dropped.
    last_published: Timestamp,
    closed: bool,
}

pub(crate) struct ObserverShared<T> {
    stream_name: String,
    packet_ops: PacketOps,
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

impl<T: FromPacket> ObserverShared<T> {
    /// Handle one packet delivered by the engine.
    ///
    /// Runs on an engine-owned thread, possibly during graph teardown. The
    /// packet is only borrowed for this call; the value copy happens here,
    /// before we return. Never unwinds; the trampoline converts everything
    /// to a status code.
    pub(crate) fn deliver(&self, packet: MgPacketRef) -> i32 {
        let packet = Packet::borrowed(packet, self.packet_ops);
        let empty = match packet.is_empty() {
            Ok(empty) => empty,
            Err(_) => return MG_STATUS_INTERNAL,
        };
        if empty {
            // Timestamp-bound updates carry no value.
            return MG_STATUS_OK;
        }
        let timestamp = match packet.timestamp() {
            Ok(timestamp) => timestamp,
            Err(_) => return MG_STATUS_INTERNAL,
        };
        match T::from_packet(&packet) {
            Ok(value) => {
                self.publish_value(timestamp, value);
                MG_STATUS_OK
            }
            Err(err) => {
                let code = match &err {
                    BridgeError::NativeCall { code, .. } => *code,
                    _ => MG_STATUS_INTERNAL,
                };
                // The failure goes both ways: a status for the engine and a
                // typed error for whichever waiter is pending.
                self.publish_error(err);
                code
            }
        }
    }

    pub(crate) fn publish_value(&self, timestamp: Timestamp, value: T) {
        let mut slot = self.slot.lock();
        if slot.closed {
            return;
        }
        if timestamp <= slot.last_published {
            tracing::trace!(
                stream = %self.stream_name,
                timestamp = timestamp.micros(),
                last = slot.last_published.micros(),
                "dropping out-of-order result"
            );
            return;
        }
        slot.last_published = timestamp;
        slot.value = Some(Ok(value));
        drop(slot);
        self.notify.notify_one();
    }

    pub(crate) fn publish_error(&self, err: BridgeError) {
        let mut slot = self.slot.lock();
        if slot.closed {
            return;
        }
        tracing::warn!(stream = %self.stream_name, error = %err, "publishing stream error");
        slot.value = Some(Err(err));
        drop(slot);
        self.notify.notify_one();
    }

    pub(crate) fn close(&self) {
        self.slot.lock().closed = true;
        // Wake currently-registered waiters and leave a permit for one that
        // races with the flag.
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Type-erased handle to a pinned observer, so the owning pipeline can close
/// every observed stream at teardown without knowing the value types.
pub(crate) trait ObserverPin: Send + Sync {
    fn close_stream(&self);
}

impl<T: FromPacket> ObserverPin for ObserverShared<T> {
    fn close_stream(&self) {
        self.close();
    }
}

/// Extern "C" entry point registered with the engine for one observed stream.
///
/// `user_data` points at the [`ObserverShared`] pinned by the owning pipeline
/// for the engine's full lifetime.
pub(crate) unsafe extern "C" fn packet_trampoline<T: FromPacket>(
    _stream_id: u64,
    packet: MgPacketRef,
    user_data: *mut c_void,
) -> i32 {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        // SAFETY: the pipeline keeps the observer alive until the engine
        // confirms teardown, and only registers this trampoline with a
        // matching `ObserverShared<T>`.
        let shared = unsafe { &*(user_data as *const ObserverShared<T>) };
        shared.deliver(packet)
    }));
    outcome.unwrap_or(MG_STATUS_INTERNAL)
}

/// Async consumer half of an observed output stream.
pub struct StreamObserver<T: FromPacket> {
    shared: Arc<ObserverShared<T>>,
}

impl<T: FromPacket> StreamObserver<T> {
    pub(crate) fn new(stream_name: impl Into<String>, packet_ops: PacketOps) -> Self {
        Self {
            shared: Arc::new(ObserverShared {
                stream_name: stream_name.into(),
                packet_ops,
                slot: Mutex::new(Slot {
                    value: None,
                    last_published: Timestamp::UNSET,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ObserverShared<T>> {
        &self.shared
    }

    pub fn stream_name(&self) -> &str {
        &self.shared.stream_name
    }

    /// Await the next qualifying result.
    ///
    /// Resolves `Ok(Some(_))` with the next published value, `Ok(None)` when
    /// `timeout` elapses first, or the typed error a delivery published. A
    /// timeout consumes nothing: the slot is untouched, so a later wait still
    /// observes a late-arriving result. Never blocks the engine's delivery
    /// thread.
    pub async fn wait_next(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut slot = self.shared.slot.lock();
                if let Some(result) = slot.value.take() {
                    return result.map(Some);
                }
                if slot.closed {
                    return Err(BridgeError::StreamClosed);
                }
            }
            let notified = self.shared.notify.notified();
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => continue,
                Err(_) => return Ok(None),
            }
        }
    }

    /// Stop delivery: pending and future waiters resolve to
    /// [`BridgeError::StreamClosed`], later publishes are dropped.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<T: FromPacket> std::fmt::Debug for StreamObserver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamObserver")
            .field("stream", &self.shared.stream_name)
            .finish()
    }
}

/// Await one result from each of several observers of the same logical frame.
///
/// A join, not a race: the aggregate fails fast if any individual wait fails,
/// otherwise it waits for all of them (individual timeouts surface as `None`
/// entries in stream order).
pub async fn wait_all<T: FromPacket>(
    observers: &[&StreamObserver<T>],
    timeout: Duration,
) -> Result<Vec<Option<T>>> {
    futures_util::future::try_join_all(observers.iter().map(|o| o.wait_next(timeout))).await
}

/// Blocking consumer half of a polled output stream.
///
/// `next` is a direct pull from the engine's queue for the stream; it has no
/// buffering of its own and no timeout; closing the stream is what unblocks
/// a pending call.
pub struct StreamPoller<T: FromPacket> {
    stream_name: String,
    poller: NativeHandle,
    ops: PollerOps,
    packet_ops: PacketOps,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromPacket> StreamPoller<T> {
    pub(crate) fn from_raw(
        stream_name: impl Into<String>,
        poller: MgPollerRef,
        ops: PollerOps,
        packet_ops: PacketOps,
    ) -> Result<Self> {
        Ok(Self {
            stream_name: stream_name.into(),
            poller: NativeHandle::owned("stream poller", poller, ops.release)?,
            ops,
            packet_ops,
            _marker: PhantomData,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Block until the next packet arrives; `Ok(None)` means the stream
    /// closed without further data.
    pub fn next(&mut self) -> Result<Option<T>> {
        let poller = self.poller.get()?;
        let mut packet: MgPacketRef = std::ptr::null_mut();
        // SAFETY: poller is live for the duration of this borrow; on `true`
        // the engine hands us ownership of `packet`.
        let has_next = unsafe { (self.ops.next)(poller, &mut packet) };
        if !has_next {
            return Ok(None);
        }
        let packet = Packet::owned(packet, self.packet_ops)?;
        Ok(Some(T::from_packet(&packet)?))
    }

    /// Release the native poller. A pending `next` on another thread is the
    /// engine's to unblock (it does so when the stream closes).
    pub fn close(&mut self) {
        self.poller.dispose();
    }
}

impl<T: FromPacket> std::fmt::Debug for StreamPoller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPoller")
            .field("stream", &self.stream_name)
            .finish()
    }
}
