//! Circular Queue Walk - Traversal of kernel-resident intrusive queues
//!
//! Based on the Mach `queue_head_t` / `queue_chain_t` convention.
//!
//! ## Design Notes
//!
//! Mach queues embed their linkage in the queued objects and are circular
//! through the queue head: an empty queue's head points to itself, and the
//! last element's `next` points back at the head. The element pointers stored
//! in the chain point at the start of the containing object, so stepping is
//! `next = *(element + link_offset)`.
//!
//! The walk therefore stops when `next == anchor`, never on NULL. A NULL
//! link in the middle of a queue means the list is torn (or the layout is
//! wrong) and ends the walk with an error.
//!
//! ```text
//!   anchor ──► elem A ──► elem B ──► anchor
//!              (+link)    (+link)
//! ```

use log::{debug, warn};

use crate::error::{IntrospectError, Result};
use crate::memory::MemoryReader;
use crate::types::KAddr;

/// Walk state over one circular queue: (current pointer, anchor)
#[derive(Debug)]
pub struct QueueWalk {
    /// Element to yield next
    next: KAddr,
    /// Queue head; reaching it again ends the walk
    anchor: KAddr,
    /// Offset of the chain inside each element
    link: u64,
    /// Failure reading the last yielded element's link, reported next step
    pending: Option<IntrospectError>,
    /// Set once the walk is finished or failed
    done: bool,
}

impl QueueWalk {
    /// Start walking the queue headed at `anchor`
    pub fn start<M: MemoryReader + ?Sized>(mem: &M, anchor: KAddr, link: u64) -> Result<Self> {
        let first = mem
            .read_ptr(anchor)
            .map_err(|e| IntrospectError::unreadable(anchor, e))?;
        debug!("queue at {}: first element {}", anchor, first);
        Ok(Self {
            next: first,
            anchor,
            link,
            pending: None,
            done: false,
        })
    }

    /// Yield the current element and advance along its link
    ///
    /// Returns `None` once the anchor is reached. A failure is reported once
    /// and then the walk is finished. An element whose own link cannot be
    /// read is still yielded; the failure follows it.
    pub fn step<M: MemoryReader + ?Sized>(&mut self, mem: &M) -> Option<Result<KAddr>> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending.take() {
            self.done = true;
            return Some(Err(err));
        }
        let current = self.next;
        if current == self.anchor {
            self.done = true;
            return None;
        }
        if current.is_null() {
            self.done = true;
            warn!("queue at {}: NULL link before reaching the head", self.anchor);
            return Some(Err(IntrospectError::NullAddress { what: "queue link" }));
        }

        let link_addr = current.offset(self.link);
        match mem.read_ptr(link_addr) {
            Ok(next) => self.next = next,
            Err(e) => {
                warn!("queue at {}: link at {} unreadable: {}", self.anchor, link_addr, e);
                self.pending = Some(IntrospectError::unreadable(link_addr, e));
            }
        }
        Some(Ok(current))
    }
}
