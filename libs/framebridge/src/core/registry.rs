// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Native-name resolution table.
//!
//! Native buffer names (GPU texture names in particular) are recycled by the
//! native allocator: two different logical frames can receive the same name
//! at different times, so a name is never identity. Every name lookup goes
//! through this registry, which tracks which live frame currently holds each
//! name and actively invalidates stale associations when a name is reassigned.
//!
//! One registry belongs to one [`FramePool`](crate::core::pool::FramePool);
//! it is created with the pool and cleared at teardown.

use std::collections::HashMap;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::core::error::{BridgeError, Result};
use crate::core::frame::{FrameBuffer, FrameId, FrameInner};

struct NameEntry {
    id: FrameId,
    frame: Weak<FrameInner>,
}

#[derive(Default)]
pub struct FrameNameRegistry {
    table: Mutex<HashMap<u32, NameEntry>>,
}

impl FrameNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `frame`.
    ///
    /// Fails with [`BridgeError::NameCollision`] if another live frame holds
    /// the name (two live frames sharing a name is a bug to surface, not
    /// hide); a mapping whose frame is gone is silently dropped and the name
    /// re-bound.
    pub fn register(&self, name: u32, frame: &FrameBuffer) -> Result<()> {
        let mut table = self.table.lock();
        Self::claim(&mut table, name, frame)?;
        table.insert(
            name,
            NameEntry {
                id: frame.id(),
                frame: frame.downgrade(),
            },
        );
        Ok(())
    }

    /// Atomically move `frame`'s binding from `old` to `new`.
    ///
    /// The collision check on `new` runs before `old` is touched, so a failed
    /// rename leaves both mappings exactly as they were.
    pub fn rename(&self, old: Option<u32>, new: u32, frame: &FrameBuffer) -> Result<()> {
        let mut table = self.table.lock();
        Self::claim(&mut table, new, frame)?;
        if let Some(old_name) = old {
            if old_name != new {
                Self::remove_if_owner(&mut table, old_name, frame.id());
            }
        }
        table.insert(
            new,
            NameEntry {
                id: frame.id(),
                frame: frame.downgrade(),
            },
        );
        Ok(())
    }

    /// Resolve a native name to the live frame that currently holds it.
    ///
    /// A mapping whose frame has been dropped is pruned on contact.
    pub fn resolve(&self, name: u32) -> Option<FrameBuffer> {
        let mut table = self.table.lock();
        match table.get(&name) {
            Some(entry) => match entry.frame.upgrade() {
                Some(inner) => Some(FrameBuffer::from_inner(inner)),
                None => {
                    table.remove(&name);
                    None
                }
            },
            None => None,
        }
    }

    /// Drop `name` if it is currently bound to `id`.
    pub fn remove(&self, name: u32, id: FrameId) {
        let mut table = self.table.lock();
        Self::remove_if_owner(&mut table, name, id);
    }

    pub fn clear(&self) {
        self.table.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Make `name` available for `frame`, dropping a stale mapping if the
    /// previous holder is gone.
    fn claim(table: &mut HashMap<u32, NameEntry>, name: u32, frame: &FrameBuffer) -> Result<()> {
        if let Some(entry) = table.get(&name) {
            if entry.id != frame.id() && entry.frame.upgrade().is_some() {
                return Err(BridgeError::NameCollision {
                    name,
                    holder: entry.id.as_uuid(),
                });
            }
            table.remove(&name);
        }
        Ok(())
    }

    fn remove_if_owner(table: &mut HashMap<u32, NameEntry>, name: u32, id: FrameId) {
        if let Some(entry) = table.get(&name) {
            if entry.id == id {
                table.remove(&name);
            }
        }
    }
}
