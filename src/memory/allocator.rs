//! Compute-node local allocator over leased remote segments.
//!
//! A segment (1 GiB) is carved into 4 KiB pages; pages are handed out one
//! at a time to per-thread page groups of eight mirrors. Each mirror
//! shadows one remote page and serves size-classed chunks from it. All of
//! this is pure bookkeeping - no remote traffic happens here.

use log::{debug, info};
use parking_lot::Mutex;

use crate::memory::RemotePointer;
use crate::{AllocError, PAGE_GROUP_SIZE, PAGE_SIZE, SEGMENT_SIZE};

/// Chunk size classes a page mirror can be bound to. A mirror starts
/// `Unknown` and is fixed to a class on first use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationClass {
    Chunk16,
    Chunk32,
    Chunk64,
    Chunk128,
    Chunk256,
    Chunk512,
    Chunk1024,
    Chunk2048,
    Chunk4096,
    Unknown,
}

const CLASS_TABLE: [AllocationClass; 9] = [
    AllocationClass::Chunk16,
    AllocationClass::Chunk32,
    AllocationClass::Chunk64,
    AllocationClass::Chunk128,
    AllocationClass::Chunk256,
    AllocationClass::Chunk512,
    AllocationClass::Chunk1024,
    AllocationClass::Chunk2048,
    AllocationClass::Chunk4096,
];

impl AllocationClass {
    pub fn chunk_size(self) -> usize {
        match self {
            AllocationClass::Chunk16 => 16,
            AllocationClass::Chunk32 => 32,
            AllocationClass::Chunk64 => 64,
            AllocationClass::Chunk128 => 128,
            AllocationClass::Chunk256 => 256,
            AllocationClass::Chunk512 => 512,
            AllocationClass::Chunk1024 => 1024,
            AllocationClass::Chunk2048 => 2048,
            AllocationClass::Chunk4096 => 4096,
            AllocationClass::Unknown => 0,
        }
    }

    /// The smallest class whose chunk covers `size`.
    pub fn for_size(size: usize) -> Result<AllocationClass, AllocError> {
        if size == 0 {
            return Err(AllocError::SizeZero);
        }
        if size > PAGE_SIZE {
            return Err(AllocError::TooLarge(size));
        }
        let units = size.div_ceil(16);
        let idx = units.next_power_of_two().trailing_zeros() as usize;
        Ok(CLASS_TABLE[idx])
    }
}

/// Compute-local shadow of one remote page.
#[derive(Clone, Debug)]
pub struct PageMirror {
    class: AllocationClass,
    empty_slots: u16,
    offset: u16,
    page_base: RemotePointer,
}

impl PageMirror {
    fn new(page_base: RemotePointer) -> PageMirror {
        PageMirror {
            class: AllocationClass::Unknown,
            empty_slots: 0,
            offset: 0,
            page_base,
        }
    }

    fn initialize(&mut self, class: AllocationClass) {
        self.class = class;
        self.empty_slots = (PAGE_SIZE / class.chunk_size()) as u16;
        self.offset = 0;
    }

    fn available(&self) -> bool {
        self.class != AllocationClass::Unknown
            && (self.offset as usize) < PAGE_SIZE / self.class.chunk_size()
    }

    /// Hand out the next slot. The caller checked `available` first.
    fn allocate(&mut self) -> RemotePointer {
        debug_assert!(self.available());
        let chunk = self.page_base
            .offset(self.offset as u64 * self.class.chunk_size() as u64);
        self.offset += 1;
        self.empty_slots -= 1;
        chunk
    }

    /// Record a freed chunk. `offset` never moves backwards; the slot is
    /// only reclaimable by a future compaction pass.
    fn free(&mut self, ptr: RemotePointer) -> bool {
        if self.page_base != ptr.page() {
            return false;
        }
        self.empty_slots += 1;
        true
    }
}

/// What a page group can do for a requested class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupStatus {
    /// Some mirror can serve the request.
    Ok,
    /// A matching-class mirror exists but is exhausted; refill one page.
    EmptyPage,
    /// No matching or unbound mirror; refill the whole group.
    EmptyPageGroup,
}

/// Eight page mirrors bound to one compute thread.
pub struct PageGroup {
    pages: [PageMirror; PAGE_GROUP_SIZE],
}

impl PageGroup {
    pub fn status(&self, class: AllocationClass) -> GroupStatus {
        let mut have_class = false;
        for p in &self.pages {
            if p.class == AllocationClass::Unknown {
                return GroupStatus::Ok;
            }
            if p.class == class {
                if p.available() {
                    return GroupStatus::Ok;
                }
                have_class = true;
            }
        }
        if have_class {
            GroupStatus::EmptyPage
        } else {
            GroupStatus::EmptyPageGroup
        }
    }

    /// Serve one chunk. The caller consulted `status` first.
    pub fn allocate(&mut self, class: AllocationClass) -> Option<RemotePointer> {
        for p in self.pages.iter_mut() {
            if p.class == class && p.available() {
                return Some(p.allocate());
            }
            if p.class == AllocationClass::Unknown {
                p.initialize(class);
                return Some(p.allocate());
            }
        }
        None
    }

    pub fn free(&mut self, ptr: RemotePointer) -> bool {
        let page = ptr.page();
        self.pages
            .iter_mut()
            .any(|p| p.page_base == page && p.free(ptr))
    }
}

/// One leased segment and the cursor into its unhanded pages.
struct Segment {
    seg: RemotePointer,
    offset: usize,
    available_pages: usize,
}

impl Segment {
    fn new(seg: RemotePointer) -> Segment {
        // the first page holds segment metadata and is never handed out
        Segment {
            seg,
            offset: 1,
            available_pages: SEGMENT_SIZE / PAGE_SIZE - 1,
        }
    }

    fn offer_page(&mut self) -> PageMirror {
        let page = self.seg.offset((self.offset * PAGE_SIZE) as u64);
        self.offset += 1;
        self.available_pages -= 1;
        PageMirror::new(page)
    }
}

/// Tracks the segment currently being carved plus every segment ever
/// leased, so a future recycle pass knows what to give back.
#[derive(Default)]
struct SegmentTracker {
    current: Option<Segment>,
    leased: Vec<RemotePointer>,
}

impl SegmentTracker {
    fn assign(&mut self, seg: RemotePointer) {
        self.leased.push(seg);
        self.current = Some(Segment::new(seg));
    }

    fn available(&self, pages: usize) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.available_pages >= pages)
    }
}

/// The per-compute-node remote allocator. Page groups live with their
/// owning threads; only segment refills synchronise here.
pub struct ComputeNodeAllocator {
    tracker: Mutex<SegmentTracker>,
}

impl ComputeNodeAllocator {
    pub fn new() -> ComputeNodeAllocator {
        ComputeNodeAllocator {
            tracker: Mutex::new(SegmentTracker::default()),
        }
    }

    /// Bind a freshly granted segment.
    pub fn apply_for_memory(&self, seg: RemotePointer) {
        info!("binding new segment {:?}", seg);
        self.tracker.lock().assign(seg);
    }

    /// Hand out a chunk of at least `size` bytes from the caller's page
    /// group. `SegmentExhausted` asks the caller to lease a new segment
    /// (over RPC) and retry; the group is left untouched in that case.
    pub fn allocate(
        &self,
        group: &mut Option<PageGroup>,
        size: usize,
    ) -> Result<RemotePointer, AllocError> {
        let class = AllocationClass::for_size(size)?;

        if group.is_none() {
            *group = Some(self.refill_group()?);
        }
        let g = group.as_mut().unwrap();

        match g.status(class) {
            GroupStatus::Ok => {}
            GroupStatus::EmptyPage => self.refill_single_page(g, class)?,
            GroupStatus::EmptyPageGroup => *g = self.refill_group()?,
        }

        g.allocate(class).ok_or(AllocError::SegmentExhausted)
    }

    /// Record a freed chunk on its owning mirror. Chunks whose mirror has
    /// already left this thread's group are left to the (deferred)
    /// reclamation pass.
    pub fn free(&self, group: &mut Option<PageGroup>, ptr: RemotePointer) {
        if let Some(g) = group.as_mut() {
            if g.free(ptr) {
                return;
            }
        }
        debug!("freed chunk {:?} outside the caller's page group", ptr);
    }

    fn refill_group(&self) -> Result<PageGroup, AllocError> {
        let mut tracker = self.tracker.lock();
        if !tracker.available(PAGE_GROUP_SIZE) {
            return Err(AllocError::SegmentExhausted);
        }
        let seg = tracker.current.as_mut().unwrap();
        let pages = std::array::from_fn(|_| seg.offer_page());
        Ok(PageGroup { pages })
    }

    fn refill_single_page(
        &self,
        group: &mut PageGroup,
        class: AllocationClass,
    ) -> Result<(), AllocError> {
        let mut tracker = self.tracker.lock();
        if !tracker.available(PAGE_GROUP_SIZE) {
            return Err(AllocError::SegmentExhausted);
        }
        let seg = tracker.current.as_mut().unwrap();
        for p in group.pages.iter_mut() {
            if p.class == class && !p.available() {
                *p = seg.offer_page();
                p.initialize(class);
            }
        }
        Ok(())
    }
}

impl Default for ComputeNodeAllocator {
    fn default() -> Self {
        ComputeNodeAllocator::new()
    }
}
