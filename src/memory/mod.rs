//! Hierarchical native-memory accounting.
//!
//! Arrow buffers in Rust are refcounted, so ownership is tracked at the
//! accounting layer: every column chunk holds a [`Reservation`] naming the
//! allocator node that owns its bytes. Reserving charges every node on the
//! path to the root and fails with `OutOfMemory` when any node would exceed
//! its cap; transferring moves the accounting between nodes without touching
//! the data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::PlexusError;

#[derive(Debug)]
struct Node {
    name: String,
    cap: u64,
    reserved: AtomicU64,
    parent: Option<Arc<Node>>,
    closed: AtomicBool,
}

impl Node {
    /// Charge `bytes` against this node, refusing to cross the cap.
    fn try_charge(&self, bytes: u64) -> bool {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(bytes) {
                Some(n) if n <= self.cap => n,
                _ => return false,
            };
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.reserved.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// A node in the allocator tree. Cloning shares the node.
#[derive(Clone)]
pub struct Allocator {
    node: Arc<Node>,
}

impl Allocator {
    pub fn root(name: impl Into<String>, cap: u64) -> Allocator {
        Allocator {
            node: Arc::new(Node {
                name: name.into(),
                cap,
                reserved: AtomicU64::new(0),
                parent: None,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn child(&self, name: impl Into<String>, cap: u64) -> Allocator {
        Allocator {
            node: Arc::new(Node {
                name: name.into(),
                cap,
                reserved: AtomicU64::new(0),
                parent: Some(Arc::clone(&self.node)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Bytes currently reserved in this node's subtree.
    pub fn reserved(&self) -> u64 {
        self.node.reserved.load(Ordering::Acquire)
    }

    /// Reserve `bytes` on this node, charging every ancestor. Fails with
    /// `OutOfMemory` if any node on the path would exceed its cap.
    pub fn reserve(&self, bytes: u64) -> Result<Reservation, PlexusError> {
        if self.node.closed.load(Ordering::Acquire) {
            return Err(PlexusError::Internal(format!(
                "allocator '{}' used after close",
                self.node.name
            )));
        }
        charge_chain(&self.node, bytes)?;
        Ok(Reservation {
            node: Arc::clone(&self.node),
            bytes,
        })
    }

    /// Close this node. The caller must have released all buffers first;
    /// otherwise the usage error surfaces as `LeakedBuffers`.
    pub fn close(&self) -> Result<(), PlexusError> {
        let outstanding = self.reserved();
        if outstanding > 0 {
            return Err(PlexusError::LeakedBuffers(format!(
                "allocator '{}' closed with {} bytes outstanding",
                self.node.name, outstanding
            )));
        }
        self.node.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn charge_chain(leaf: &Arc<Node>, bytes: u64) -> Result<(), PlexusError> {
    let mut charged: Vec<&Node> = Vec::new();
    let mut cursor = Some(leaf.as_ref());
    while let Some(node) = cursor {
        if !node.try_charge(bytes) {
            for undo in charged {
                undo.release(bytes);
            }
            return Err(PlexusError::OutOfMemory(format!(
                "allocator '{}' cap {} exceeded reserving {} bytes",
                node.name, node.cap, bytes
            )));
        }
        charged.push(node);
        cursor = node.parent.as_deref();
    }
    Ok(())
}

fn release_chain(leaf: &Node, bytes: u64) {
    let mut cursor = Some(leaf);
    while let Some(node) = cursor {
        node.release(bytes);
        cursor = node.parent.as_deref();
    }
}

/// Accounting ownership of a run of bytes. Released on drop.
#[derive(Debug)]
pub struct Reservation {
    node: Arc<Node>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Grow or shrink the reservation in place.
    pub fn resize(&mut self, new_bytes: u64) -> Result<(), PlexusError> {
        if new_bytes > self.bytes {
            charge_chain(&self.node, new_bytes - self.bytes)?;
        } else {
            release_chain(&self.node, self.bytes - new_bytes);
        }
        self.bytes = new_bytes;
        Ok(())
    }

    /// Move the accounting to another allocator node. The data itself is
    /// untouched; on failure the original reservation is released.
    pub fn transfer_to(self, target: &Allocator) -> Result<Reservation, PlexusError> {
        target.reserve(self.bytes)
        // `self` drops here, releasing the source side.
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        release_chain(&self.node, self.bytes);
    }
}
