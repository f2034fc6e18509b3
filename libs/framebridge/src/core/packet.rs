// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Timestamped packets crossing the engine boundary.

use crate::core::error::{BridgeError, Result};
use crate::core::handle::NativeHandle;
use crate::ffi::{MG_STATUS_OK, MgPacketRef, PacketOps};

/// Packet timestamp in microseconds.
///
/// The engine requires input timestamps on one stream to be monotonically
/// non-decreasing; output bridges use the same scale to gate stale results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Sentinel ordering before every real timestamp.
    pub const UNSET: Timestamp = Timestamp(i64::MIN);

    pub fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub fn micros(self) -> i64 {
        self.0
    }
}

/// One packet from the engine, owned or borrowed.
///
/// A borrowed packet is the callback-scoped view handed to observer
/// trampolines: it must not outlive the callback invocation, so anything
/// worth keeping is copied out ([`Packet::payload_bytes`]) before the
/// trampoline returns.
pub struct Packet {
    handle: NativeHandle,
    ops: PacketOps,
}

impl Packet {
    /// Take ownership of a packet (e.g. one filled in by a poller).
    pub fn owned(packet: MgPacketRef, ops: PacketOps) -> Result<Self> {
        Ok(Self {
            handle: NativeHandle::owned("packet", packet, ops.release)?,
            ops,
        })
    }

    /// Borrow a packet for the duration of a native callback.
    pub fn borrowed(packet: MgPacketRef, ops: PacketOps) -> Self {
        Self {
            handle: NativeHandle::borrowed("packet", packet),
            ops,
        }
    }

    pub fn timestamp(&self) -> Result<Timestamp> {
        let ptr = self.handle.get()?;
        // SAFETY: packet is live for the duration of this borrow.
        Ok(Timestamp(unsafe { (self.ops.timestamp_us)(ptr) }))
    }

    pub fn is_empty(&self) -> Result<bool> {
        let ptr = self.handle.get()?;
        // SAFETY: packet is live for the duration of this borrow.
        Ok(unsafe { (self.ops.is_empty)(ptr) })
    }

    /// Copy the serialized payload out of native memory.
    ///
    /// The protocol-encoding layer decodes these bytes; this crate only moves
    /// them across the boundary.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        let ptr = self.handle.get()?;
        let mut data: *const u8 = std::ptr::null();
        let mut len: usize = 0;
        // SAFETY: packet is live for the duration of this borrow; the engine
        // fills `data`/`len` with a view into packet-owned memory.
        let code = unsafe { (self.ops.payload)(ptr, &mut data, &mut len) };
        if code != MG_STATUS_OK {
            return Err(BridgeError::native(code, "packet payload"));
        }
        if data.is_null() || len == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: the engine guarantees `data` points at `len` readable bytes
        // for as long as the packet is alive; we copy before returning.
        Ok(unsafe { std::slice::from_raw_parts(data, len) }.to_vec())
    }

    pub fn dispose(&mut self) {
        self.handle.dispose();
    }
}

/// Extraction seam for host-side value types.
///
/// Implementations must copy everything they need out of the packet: the
/// packet they are given may be a callback-scoped borrow that dies when the
/// trampoline returns. Failures become status codes at the callback boundary
/// instead of unwinding into native code.
pub trait FromPacket: Sized + Send + 'static {
    fn from_packet(packet: &Packet) -> Result<Self>;
}

/// Raw payload passthrough for callers that decode elsewhere.
impl FromPacket for Vec<u8> {
    fn from_packet(packet: &Packet) -> Result<Self> {
        packet.payload_bytes()
    }
}
