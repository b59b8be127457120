//! Copy-on-write cloning of the user half.

use super::{AddressSpace, alloc_table, slot_index};
use crate::tlb::TlbFlushAll;
use crate::{PageEntryBits, PhysMapper, TableLevel};
use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_info::memory::{KERNEL_PML4_START, PAGE_TABLE_ENTRIES};
use kernel_memory_addresses::FrameNumber;
use log::{debug, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CloneError {
    /// The child's tables could not be allocated; nothing of the child
    /// remains allocated.
    #[error("out of frames while cloning the address space")]
    Frames(#[from] FrameAllocError),
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Produce a child space for `fork`.
    ///
    /// The child gets its own copy of every user-half table. Leaf frames are
    /// not copied: each one gains a reference, and writable leaves are
    /// write-protected and marked copy-on-write in **both** spaces, so the
    /// first write through either side faults and is completed by
    /// [`resolve_cow_fault`](Self::resolve_cow_fault). The kernel half is
    /// copied by value.
    ///
    /// The returned flush token covers the parent's demoted entries.
    ///
    /// # Errors
    /// [`CloneError::Frames`] on exhaustion. The partial child is torn down
    /// before returning; leaves already demoted in the parent stay
    /// copy-on-write, which only costs a spurious fault later.
    pub fn clone_cow<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
    ) -> Result<(Self, TlbFlushAll), CloneError> {
        let root = alloc_table(self.mapper, alloc)?;
        let child = Self {
            root,
            mapper: self.mapper,
            owns_kernel_half: false,
        };
        child.share_kernel_half(self.root);

        if let Err(e) = self.clone_user_half(&child, alloc) {
            warn!("Address space clone failed ({e}); rolling back");
            if let Err(cleanup) = child.destroy(alloc) {
                warn!("Rollback of partial clone failed: {cleanup}");
            }
            return Err(e.into());
        }

        debug!(
            "Cloned address space {:?} into {:?}",
            self.root_page(),
            child.root_page()
        );
        Ok((child, TlbFlushAll::new()))
    }

    fn clone_user_half<A: FrameAlloc>(
        &self,
        child: &Self,
        alloc: &mut A,
    ) -> Result<(), FrameAllocError> {
        for slot in 0..KERNEL_PML4_START {
            let i = slot_index(slot);
            let entry = self.table(self.root).get(i);
            if !entry.present() {
                continue;
            }

            let copy = alloc_table(self.mapper, alloc)?;
            // Link first so a failure further down is reclaimed by `destroy`.
            child.table(child.root).set(i, entry.with_frame(copy));
            self.clone_node(entry.frame(), copy, TableLevel::Pdpt, alloc)?;
        }
        Ok(())
    }

    /// Copy the table `src` at `level` into the empty table `dst`.
    fn clone_node<A: FrameAlloc>(
        &self,
        src: FrameNumber,
        dst: FrameNumber,
        level: TableLevel,
        alloc: &mut A,
    ) -> Result<(), FrameAllocError> {
        for slot in 0..PAGE_TABLE_ENTRIES {
            let i = slot_index(slot);
            let entry = self.table(src).get(i);
            if !entry.present() {
                continue;
            }

            match level.next() {
                Some(next) if !entry.large_page() => {
                    let copy = alloc_table(self.mapper, alloc)?;
                    self.table(dst).set(i, entry.with_frame(copy));
                    self.clone_node(entry.frame(), copy, next, alloc)?;
                }
                _ => {
                    let shared = share_leaf(self.table(src).entry_mut(i), alloc)?;
                    self.table(dst).set(i, shared);
                }
            }
        }
        Ok(())
    }
}

/// Take a reference on the leaf's frame and demote it to copy-on-write if it
/// is writable. Returns the entry for the child.
fn share_leaf<A: FrameAlloc>(
    leaf: &mut PageEntryBits,
    alloc: &mut A,
) -> Result<PageEntryBits, FrameAllocError> {
    if leaf.borrowed() {
        return Ok(*leaf);
    }

    alloc.share(leaf.frame())?;
    if leaf.writable() || leaf.copy_on_write() {
        *leaf = leaf.with_writable(false).with_copy_on_write(true);
    }
    Ok(*leaf)
}
