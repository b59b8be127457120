//! # Address Space (x86-64, PML4-rooted)
//!
//! Builds and manipulates a **single** virtual address space: the tree of
//! paging structures rooted at one PML4 frame.
//!
//! ## Highlights
//!
//! - [`AddressSpace::walk`] / [`AddressSpace::walk_create`] to reach the leaf
//!   entry for an address, the latter allocating missing tables.
//! - [`AddressSpace::map`] / [`AddressSpace::unmap`] for single 4 KiB pages.
//! - [`AddressSpace::translate`] / [`AddressSpace::query`] to resolve a VA.
//! - [`AddressSpace::clone_cow`] to fork the user half copy-on-write.
//! - [`AddressSpace::switch_to`] to load CR3 with this space's root.
//!
//! ## Design
//!
//! - Intermediate tables are linked present + writable + supervisor-only.
//!   Mapping a user leaf widens the user bit along its own path only.
//! - Frames come from a [`FrameAlloc`] passed per call; the address space
//!   remembers nothing about where its frames came from.
//! - `unsafe` is confined to turning a table frame into a `&mut PageTable`
//!   through the [`PhysMapper`].

mod clone;

pub use clone::CloneError;

use crate::tlb::{TlbFlush, TlbFlushAll};
use crate::{PageEntryBits, PageTable, PhysMapper, TableIndex, TableLevel};
use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_info::memory::{KERNEL_PML4_START, PAGE_TABLE_ENTRIES};
use kernel_memory_addresses::{
    FrameNumber, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};
use kernel_registers::Cr3;
use log::trace;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    /// PML4 frame.
    root: FrameNumber,
    mapper: &'m M,
    /// `true` only for the kernel's reference space, which owns the shared
    /// kernel-half tables. Every other space merely aliases them.
    owns_kernel_half: bool,
}

/// The PML4 root page for an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Result of resolving a virtual address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    /// The 4 KiB frame backing the address.
    pub frame: FrameNumber,
    /// Leaf permissions, see [`PageEntryBits::permissions`].
    pub flags: PageEntryBits,
}

/// Failure to reach a leaf entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    /// The walk found no table at `level`. This is the defined
    /// "not present" result of a non-allocating walk.
    #[error("{va} is not present: no table at {level:?}")]
    NotPresent {
        va: VirtualAddress,
        level: TableLevel,
    },
    /// The address is covered by a 2 MiB or 1 GiB leaf.
    #[error("{va} is covered by a large page at {level:?}")]
    LargePage {
        va: VirtualAddress,
        level: TableLevel,
    },
    /// Creating a kernel-half PML4 entry in a per-process space would fork
    /// the kernel mappings.
    #[error("PML4 slot {slot} belongs to the shared kernel half")]
    SharedKernelSlot { slot: usize },
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error(transparent)]
    Walk(#[from] WalkError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// A fresh, empty space that owns its kernel half. Used once at boot
    /// for the kernel's reference space.
    ///
    /// # Errors
    /// Frame exhaustion while allocating the root.
    pub fn new_kernel<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
    ) -> Result<Self, FrameAllocError> {
        let root = alloc_table(mapper, alloc)?;
        Ok(Self {
            root,
            mapper,
            owns_kernel_half: true,
        })
    }

    /// A fresh space with an empty user half and the kernel half of
    /// `kernel` copied by value.
    ///
    /// # Errors
    /// Frame exhaustion while allocating the root.
    pub fn new_user<A: FrameAlloc>(kernel: &Self, alloc: &mut A) -> Result<Self, FrameAllocError> {
        let root = alloc_table(kernel.mapper, alloc)?;
        let this = Self {
            root,
            mapper: kernel.mapper,
            owns_kernel_half: false,
        };
        this.share_kernel_half(kernel.root);
        Ok(this)
    }

    /// Adopt a root frame built elsewhere, e.g. by the boot loader.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: RootPage, owns_kernel_half: bool) -> Self {
        Self {
            root: root.base().frame(),
            mapper,
            owns_kernel_half,
        }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// - Must run at CPL0 with paging enabled.
    /// - Assumes CR3 points at a valid PML4 frame reachable via `mapper`.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn from_current(mapper: &'m M, owns_kernel_half: bool) -> Self {
        use kernel_registers::LoadRegisterUnsafe;
        let cr3 = unsafe { Cr3::load_unsafe() };
        Self::from_root(mapper, cr3.pml4(), owns_kernel_half)
    }

    /// Physical page of the PML4.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root.page()
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn owns_kernel_half(&self) -> bool {
        self.owns_kernel_half
    }

    /// Borrow the paging structure in `frame`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn table(&self, frame: FrameNumber) -> &mut PageTable {
        // SAFETY: every frame reached from our root holds a page table.
        unsafe { self.mapper.table_mut(frame) }
    }

    fn share_kernel_half(&self, kernel_root: FrameNumber) {
        let src = self.table(kernel_root);
        let dst = self.table(self.root);
        for slot in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
            let i = slot_index(slot);
            dst.set(i, src.get(i));
        }
    }

    /// Load CR3 with this space's root, switching the executing processor
    /// to it. The CR3 write drops every non-global translation.
    ///
    /// # Safety
    /// The kernel half must be present (it is, unless the space was built
    /// with [`from_root`](Self::from_root) from garbage), and the space must
    /// outlive its time in CR3.
    pub unsafe fn switch_to(&self) {
        let cr3 = Cr3::from_pml4(self.root_page());
        trace!("Switching to address space at {:?}", cr3.pml4());

        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            use kernel_registers::StoreRegisterUnsafe;
            cr3.store_unsafe();
        }
    }

    /// Descend to the PT holding the leaf for `va`.
    fn leaf_table(&self, va: VirtualAddress) -> Result<FrameNumber, WalkError> {
        let mut table = self.root;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let entry = self.table(table).get(level.index_of(va));
            if !entry.present() {
                return Err(WalkError::NotPresent { va, level });
            }
            if entry.large_page() {
                return Err(WalkError::LargePage { va, level });
            }
            table = entry.frame();
        }
        Ok(table)
    }

    /// Leaf entry for `va`, without allocating.
    ///
    /// The returned entry may itself be non-present; only missing tables
    /// are reported as [`WalkError::NotPresent`].
    ///
    /// # Errors
    /// [`WalkError::NotPresent`] or [`WalkError::LargePage`].
    pub fn walk(&mut self, va: VirtualAddress) -> Result<&mut PageEntryBits, WalkError> {
        let pt = self.leaf_table(va)?;
        Ok(self.table(pt).entry_mut(TableLevel::Pt.index_of(va)))
    }

    /// Leaf entry for `va`, allocating exactly the missing tables.
    ///
    /// New tables are zeroed and linked present + writable + supervisor-only;
    /// [`map`](Self::map) widens the path for user leaves.
    ///
    /// # Errors
    /// Frame exhaustion (tables linked before the failure stay linked and
    /// are reclaimed with the space), a large page on the path, or an
    /// attempt to populate a shared kernel slot.
    pub fn walk_create<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<&mut PageEntryBits, WalkError> {
        let mut table = self.root;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let index = level.index_of(va);
            let entry = self.table(table).get(index);

            if entry.present() {
                if entry.large_page() {
                    return Err(WalkError::LargePage { va, level });
                }
                table = entry.frame();
                continue;
            }

            if level == TableLevel::Pml4 && index.is_kernel_slot() && !self.owns_kernel_half {
                return Err(WalkError::SharedKernelSlot {
                    slot: index.as_usize(),
                });
            }

            let next = alloc_table(self.mapper, alloc)?;
            self.table(table).set(index, PageEntryBits::table_link(next));
            trace!("Linked new table {next} below {level:?}[{}] for {va}", index.as_usize());
            table = next;
        }

        Ok(self.table(table).entry_mut(TableLevel::Pt.index_of(va)))
    }

    /// Map one 4 KiB page `va → frame` with leaf `flags` (`present` is implied).
    ///
    /// The frame's ownership passes to the mapping unless `flags` has the
    /// [`borrowed`](PageEntryBits::borrowed) bit.
    ///
    /// # Errors
    /// [`MapError::AlreadyMapped`] if a leaf is present, otherwise see
    /// [`walk_create`](Self::walk_create).
    pub fn map<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: FrameNumber,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        debug_assert!(va.is_aligned::<Size4K>(), "unaligned virtual address {va}");

        let leaf = self.walk_create(alloc, va)?;
        if leaf.present() {
            return Err(MapError::AlreadyMapped(va));
        }
        *leaf = flags.with_present(true).with_frame(frame);

        if flags.user_access() {
            self.grant_user_path(va);
        }
        Ok(())
    }

    /// Set the user bit on the intermediate entries leading to `va`.
    fn grant_user_path(&self, va: VirtualAddress) {
        debug_assert!(
            !TableLevel::Pml4.index_of(va).is_kernel_slot(),
            "user mapping in the kernel half at {va}"
        );

        let mut table = self.root;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let entry = self.table(table).entry_mut(level.index_of(va));
            entry.set_user_access(true);
            table = entry.frame();
        }
    }

    /// Clear the leaf for `va` and drop the mapping's reference to its frame.
    ///
    /// The frame returns to the allocator once no other space shares it.
    /// Borrowed frames are left alone. Emptied tables are not reclaimed.
    ///
    /// # Errors
    /// [`UnmapError::NotMapped`] if there is no 4 KiB leaf at `va`.
    pub fn unmap<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<TlbFlush, UnmapError> {
        let leaf = self.walk(va).map_err(|_| UnmapError::NotMapped(va))?;
        let entry = *leaf;
        if !entry.present() {
            return Err(UnmapError::NotMapped(va));
        }

        *leaf = PageEntryBits::new();
        release_leaf(alloc, entry)?;
        Ok(TlbFlush::new(va.page::<Size4K>().base()))
    }

    /// Resolve `va` to its backing 4 KiB frame and leaf permissions.
    ///
    /// Large kernel leaves resolve to the 4 KiB frame within them.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        let mut table = self.root;
        for level in TableLevel::WALK {
            let entry = self.table(table).get(level.index_of(va));
            if !entry.present() {
                return None;
            }

            if level == TableLevel::Pt || entry.large_page() {
                let within = (va.as_u64() & (level.entry_span() - 1)) >> Size4K::SHIFT;
                return Some(Translation {
                    frame: entry.frame() + within,
                    flags: entry.permissions(),
                });
            }
            table = entry.frame();
        }
        None
    }

    /// Translate a `VirtualAddress` to a `PhysicalAddress` if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(va)
            .map(|t| t.frame.page().join(va.offset::<Size4K>()))
    }

    /// Pre-populate every kernel-half PML4 slot with an empty PDPT.
    ///
    /// Done once on the kernel's reference space before the first user
    /// space is derived, so that kernel mappings made later never need a new
    /// PML4 entry and are seen by every space through the shared PDPTs.
    ///
    /// # Errors
    /// Frame exhaustion; slots filled so far stay filled.
    pub fn preallocate_kernel_half<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
    ) -> Result<(), FrameAllocError> {
        debug_assert!(self.owns_kernel_half);

        for slot in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
            let i = slot_index(slot);
            if !self.table(self.root).get(i).present() {
                let pdpt = alloc_table(self.mapper, alloc)?;
                self.table(self.root).set(i, PageEntryBits::table_link(pdpt));
            }
        }
        Ok(())
    }

    /// Release every user-half leaf and table, leaving an empty user half.
    ///
    /// # Errors
    /// Reference-count corruption reported by the allocator.
    pub fn destroy_low_mappings<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
    ) -> Result<TlbFlushAll, UnmapError> {
        for slot in 0..KERNEL_PML4_START {
            self.free_slot(alloc, slot)?;
        }
        Ok(TlbFlushAll::new())
    }

    /// Tear the space down, returning every frame it owns.
    ///
    /// Must not be active on any processor.
    ///
    /// # Errors
    /// Reference-count corruption reported by the allocator.
    pub fn destroy<A: FrameAlloc>(mut self, alloc: &mut A) -> Result<(), UnmapError> {
        self.destroy_low_mappings(alloc)?.ignore();

        if self.owns_kernel_half {
            for slot in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
                self.free_slot(alloc, slot)?;
            }
        }

        alloc.free(self.root, 0)?;
        Ok(())
    }

    fn free_slot<A: FrameAlloc>(&self, alloc: &mut A, slot: usize) -> Result<(), FrameAllocError> {
        let i = slot_index(slot);
        let entry = self.table(self.root).get(i);
        if entry.present() {
            self.table(self.root).set(i, PageEntryBits::new());
            self.free_subtree(alloc, entry.frame(), TableLevel::Pdpt)?;
        }
        Ok(())
    }

    /// Release everything below `table` (at `level`) and then `table` itself.
    fn free_subtree<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: FrameNumber,
        level: TableLevel,
    ) -> Result<(), FrameAllocError> {
        for (_, entry) in self.table(table).present() {
            match level.next() {
                Some(next) if !entry.large_page() => self.free_subtree(alloc, entry.frame(), next)?,
                _ => release_leaf(alloc, entry)?,
            }
        }
        alloc.free(table, 0)
    }
}

/// Allocate and zero one table frame.
fn alloc_table<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    alloc: &mut A,
) -> Result<FrameNumber, FrameAllocError> {
    let frame = alloc.alloc_4k()?;
    // SAFETY: freshly allocated, nobody else references it.
    unsafe { mapper.table_mut(frame).zero() };
    Ok(frame)
}

/// Drop a leaf's reference to its frame, unless the frame is borrowed.
fn release_leaf<A: FrameAlloc>(alloc: &mut A, entry: PageEntryBits) -> Result<(), FrameAllocError> {
    if !entry.borrowed() {
        alloc.release(entry.frame())?;
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
const fn slot_index(slot: usize) -> TableIndex {
    TableIndex::new(slot as u16)
}
