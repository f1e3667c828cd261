//! Low-heap allocator (spec §4.L).
//!
//! A coalescing free-list allocator over a single bootloader-owned byte
//! range, grounded directly in `examples/original_source/boot/malloc.cc`'s
//! `blk_hdr_t` / `malloc_aligned` / `realloc_aligned` / `free`.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::error::{BootError, BootResult};

const SIG_FREE: u32 = 0xFEEE_B10C;
const SIG_USED: u32 = 0xA10C_A1ED;

/// 16-byte block header, matching the original `blk_hdr_t` layout.
#[repr(C)]
struct BlockHeader {
    /// Size of this block including the header, in bytes.
    size: u32,
    sig: u32,
    neg_size: u32,
    /// Truncated address of `self`, used to detect corruption.
    self_addr: u32,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

impl BlockHeader {
    #[inline]
    fn set_size(&mut self, new_size: u32) {
        self.size = new_size;
        self.neg_size = new_size.wrapping_neg();
    }

    #[inline]
    fn make_valid(&mut self) {
        self.self_addr = self as *const _ as usize as u32;
    }

    #[inline]
    fn invalid(&self) -> bool {
        self.size.wrapping_add(self.neg_size) != 0
            || self.self_addr != (self as *const _ as usize as u32)
    }
}

/// Coalescing free-list allocator over `[heap_st, heap_en)`.
///
/// Invariants (checked on every touch, per spec §4.L): `size + neg_size == 0`;
/// `self_addr == truncated address of header`; `size` is a positive multiple
/// of 16. Violating any of them is fatal.
pub struct LowHeap {
    heap_st: *mut BlockHeader,
    /// One past the last real block: the end-of-heap sentinel header.
    heap_en: *mut BlockHeader,
    rover: *mut BlockHeader,
}

// Single-threaded bootloader core (spec §5): the heap is only ever touched
// by one caller at a time, but the firmware binary needs to store it in a
// `'static` cell to serve as the global allocator.
unsafe impl Send for LowHeap {}
unsafe impl Sync for LowHeap {}

impl LowHeap {
    /// Build a heap over `[start, start + len)`. `start` and `start + len`
    /// are rounded to 16-byte boundaries inward, matching `malloc_init`.
    ///
    /// # Safety
    ///
    /// `[start, start + len)` must be a valid, otherwise-unused, writable
    /// byte range for the lifetime of this `LowHeap`.
    pub unsafe fn new(start: usize, len: usize) -> Self {
        let st = (start + 15) & !15;
        let en = (start + len) & !15;
        assert!(en > st + HEADER_SIZE, "heap window too small");

        let heap_st = st as *mut BlockHeader;
        let heap_en = (en as *mut BlockHeader).wrapping_sub(1);

        unsafe {
            (*heap_en).set_size(0);
            (*heap_en).make_valid();
            (*heap_en).sig = SIG_USED;

            (*heap_st).set_size((heap_en as usize - heap_st as usize) as u32);
            (*heap_st).make_valid();
            (*heap_st).sig = SIG_FREE;
        }

        LowHeap {
            heap_st,
            heap_en,
            rover: heap_st,
        }
    }

    #[inline]
    unsafe fn next_blk(blk: *mut BlockHeader) -> *mut BlockHeader {
        unsafe { (blk as *mut u8).add((*blk).size as usize) as *mut BlockHeader }
    }

    unsafe fn coalesce(
        &mut self,
        blk: *mut BlockHeader,
        mut next: *mut BlockHeader,
    ) -> *mut BlockHeader {
        unsafe {
            while (*blk).sig == SIG_FREE && (*next).sig == SIG_FREE {
                let merged = (*blk).size + (*next).size;
                (*blk).set_size(merged);
                (*next).self_addr = 0;
                (*next).size = 0xBAD1_1111;
                (*next).neg_size = 0;

                if self.rover == next {
                    self.rover = blk;
                }

                next = Self::next_blk(blk);
            }
            next
        }
    }

    /// Allocate `bytes` rounded up to 16 plus the header, aligned so the
    /// returned pointer's address is `≡ 0 (mod alignment)`. `alignment` must
    /// be a power of two. Returns `None` on failure (spec: null pointer).
    pub fn alloc(&mut self, bytes: usize, alignment: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        debug_assert!(alignment.is_power_of_two());

        let need = (((bytes + 15) & !15) + HEADER_SIZE) as u32;

        let start_pos = self.rover;
        let mut blk = start_pos;

        unsafe {
            if (*blk).invalid() {
                self.panic_corrupt();
            }

            loop {
                let mut next = Self::next_blk(blk);
                if (*next).invalid() {
                    self.panic_corrupt();
                }
                next = self.coalesce(blk, next);

                if (*blk).sig == SIG_FREE {
                    if self.rover > blk || (*self.rover).sig == SIG_USED {
                        self.rover = blk;
                    }

                    let payload = (blk as *mut u8).add(HEADER_SIZE) as usize;
                    let aligned_payload = (payload + alignment - 1) & !(alignment - 1);
                    let align_adj = (aligned_payload - payload) as u32;

                    if (*blk).size >= need + align_adj {
                        if align_adj != 0 {
                            let aligned_hdr =
                                (blk as *mut u8).add(align_adj as usize) as *mut BlockHeader;
                            (*aligned_hdr).set_size((*blk).size - align_adj);
                            (*aligned_hdr).make_valid();
                            (*aligned_hdr).sig = SIG_FREE;

                            if self.rover > aligned_hdr {
                                self.rover = aligned_hdr;
                            }

                            (*blk).set_size(align_adj);
                            blk = aligned_hdr;
                        }

                        let remain = (*blk).size - need;
                        if remain != 0 {
                            let tail = (blk as *mut u8).add(need as usize) as *mut BlockHeader;
                            (*tail).set_size(remain);
                            (*tail).make_valid();
                            (*tail).sig = SIG_FREE;
                        }

                        (*blk).set_size(need);
                        (*blk).sig = SIG_USED;

                        return NonNull::new((blk as *mut u8).add(HEADER_SIZE));
                    }
                }

                blk = if (*blk).size > 0 {
                    next
                } else {
                    self.heap_st
                };

                if blk == start_pos {
                    break;
                }
            }
        }

        None
    }

    pub fn calloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let p = self.alloc(bytes, 16)?;
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0, bytes) };
        Some(p)
    }

    /// Try to extend in place by coalescing with the following block; on
    /// failure, allocate fresh, copy, and free the old block.
    ///
    /// # Safety
    ///
    /// `p` must be a live pointer previously returned by this allocator.
    pub unsafe fn realloc(
        &mut self,
        p: NonNull<u8>,
        bytes: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        unsafe {
            let blk = (p.as_ptr() as *mut BlockHeader).wrapping_sub(1);
            if (*blk).invalid() {
                self.panic_corrupt();
            }

            let need = (((bytes + 15) & !15) + HEADER_SIZE) as u32;
            let old_payload = (*blk).size as usize - HEADER_SIZE;

            if (*blk).size < need {
                let mut next = Self::next_blk(blk);
                if (*next).invalid() {
                    self.panic_corrupt();
                }
                if (*next).sig == SIG_FREE {
                    next = self.coalesce(next, Self::next_blk(next));
                }

                if (*next).sig == SIG_FREE && (*blk).size + (*next).size >= need {
                    let new_blk = (blk as *mut u8).add(need as usize) as *mut BlockHeader;
                    let new_size = (next as usize - new_blk as usize) as u32;
                    (*new_blk).set_size(new_size);
                    (*new_blk).make_valid();
                    (*new_blk).sig = SIG_FREE;

                    (*blk).set_size(need);

                    (*next).self_addr = 0;
                    (*next).size = 0xBAD1_1111;
                    (*next).neg_size = 0;

                    return NonNull::new((blk as *mut u8).add(HEADER_SIZE));
                }

                let fresh = self.alloc(bytes, alignment)?;
                core::ptr::copy_nonoverlapping(
                    p.as_ptr(),
                    fresh.as_ptr(),
                    old_payload.min(bytes),
                );
                (*blk).sig = SIG_FREE;
                if self.rover > blk {
                    self.rover = blk;
                }
                return Some(fresh);
            }

            if (*blk).size > need {
                let next = Self::next_blk(blk);
                let new_blk = (blk as *mut u8).add(need as usize) as *mut BlockHeader;
                let new_size = (next as usize - new_blk as usize) as u32;
                (*new_blk).set_size(new_size);
                (*new_blk).make_valid();
                (*new_blk).sig = SIG_FREE;

                (*blk).set_size(need);
                return NonNull::new((blk as *mut u8).add(HEADER_SIZE));
            }

            Some(p)
        }
    }

    /// Walks from `heap_st` to find the block immediately preceding `blk`.
    /// `None` if `blk` is the first block in the heap.
    unsafe fn find_prev(&self, blk: *mut BlockHeader) -> Option<*mut BlockHeader> {
        if blk == self.heap_st {
            return None;
        }
        unsafe {
            let mut cur = self.heap_st;
            while cur != blk {
                let next = Self::next_blk(cur);
                if next == blk {
                    return Some(cur);
                }
                cur = next;
            }
        }
        None
    }

    /// Asserts the block signature is `Used`, flips it to `Free`, then
    /// coalesces with the following and preceding blocks if they are free,
    /// pulling the rover back if the merged block starts earlier.
    ///
    /// # Safety
    ///
    /// `p` must be a live pointer previously returned by this allocator and
    /// must not be freed twice.
    pub unsafe fn free(&mut self, p: NonNull<u8>) {
        unsafe {
            let blk = (p.as_ptr() as *mut BlockHeader).wrapping_sub(1);
            if (*blk).sig != SIG_USED {
                panic!("Bad free call, block signature is not USED");
            }
            if (*blk).invalid() {
                self.panic_corrupt();
            }
            (*blk).sig = SIG_FREE;
            if self.rover > blk {
                self.rover = blk;
            }

            let next = Self::next_blk(blk);
            if (*next).invalid() {
                self.panic_corrupt();
            }
            self.coalesce(blk, next);

            if let Some(prev) = self.find_prev(blk) {
                if (*prev).sig == SIG_FREE {
                    self.coalesce(prev, blk);
                }
            }
        }
    }

    #[cold]
    fn panic_corrupt(&self) -> ! {
        panic!("{}", BootError::CorruptedHeap)
    }

    /// Walks the heap, verifying signatures, sizes, alignment, ordering, and
    /// absence of uncoalesced adjacent free pairs.
    pub fn validate(&self) -> BootResult<()> {
        unsafe {
            let mut blk = self.heap_st;
            loop {
                if (*blk).invalid() || !matches!((*blk).sig, SIG_FREE | SIG_USED) {
                    return Err(BootError::CorruptedHeap);
                }
                if (*blk).size & 15 != 0 {
                    return Err(BootError::CorruptedHeap);
                }
                if blk < self.heap_st || blk > self.heap_en {
                    return Err(BootError::CorruptedHeap);
                }
                if blk == self.heap_en {
                    if (*blk).size != 0 {
                        return Err(BootError::CorruptedHeap);
                    }
                    break;
                }

                let next = Self::next_blk(blk);
                if (*blk).sig == SIG_FREE && (*next).sig == SIG_FREE {
                    return Err(BootError::CorruptedHeap);
                }

                blk = next;
            }
            Ok(())
        }
    }

    /// Sum of all free-block payload bytes currently in the heap.
    pub fn free_space_total(&self) -> u64 {
        unsafe {
            let mut total = 0u64;
            let mut blk = self.heap_st;
            while blk != self.heap_en {
                if (*blk).sig == SIG_FREE {
                    total += ((*blk).size as usize - HEADER_SIZE) as u64;
                }
                blk = Self::next_blk(blk);
            }
            total
        }
    }
}

unsafe impl core::alloc::GlobalAlloc for spin::Mutex<LowHeap> {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        self.lock()
            .alloc(layout.size(), layout.align().max(16))
            .map(|p| p.as_ptr())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        if let Some(p) = NonNull::new(ptr) {
            unsafe { self.lock().free(p) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_heap(bytes: usize) -> (Vec<u8>, LowHeap) {
        let mut buf = vec![0u8; bytes];
        let heap = unsafe { LowHeap::new(buf.as_mut_ptr() as usize, bytes) };
        (buf, heap)
    }

    #[test]
    fn alloc_aligns_and_validates() {
        let (_buf, mut heap) = make_heap(64 * 1024);
        let p = heap.alloc(100, 64).expect("alloc");
        assert_eq!(p.as_ptr() as usize % 64, 0);
        heap.validate().unwrap();
        unsafe { heap.free(p) };
        heap.validate().unwrap();
    }

    #[test]
    fn round_trip_leaves_full_free_space() {
        let (_buf, mut heap) = make_heap(64 * 1024);
        let initial = heap.free_space_total();
        let p = heap.alloc(123, 16).unwrap();
        unsafe { heap.free(p) };
        assert_eq!(heap.free_space_total(), initial);
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let (_buf, mut heap) = make_heap(16 * 1024);
        let p = heap.alloc(32, 16).unwrap();
        unsafe {
            heap.free(p);
            heap.free(p);
        }
    }

    proptest! {
        // S6: random allocation/free sequence must validate and fully
        // reclaim free space.
        #[test]
        fn random_alloc_free_sequence_validates(
            sizes in prop::collection::vec(16usize..2048, 1..50),
            aligns in prop::collection::vec(prop::sample::select(vec![16usize, 32, 64, 256, 4096]), 1..50),
        ) {
            let (_buf, mut heap) = make_heap(4 * 1024 * 1024);
            let initial = heap.free_space_total();

            let n = sizes.len().min(aligns.len());
            let mut allocs = Vec::new();
            for i in 0..n {
                if let Some(p) = heap.alloc(sizes[i], aligns[i]) {
                    prop_assert_eq!(p.as_ptr() as usize % aligns[i], 0);
                    allocs.push(p);
                }
            }
            heap.validate().unwrap();

            for p in allocs {
                unsafe { heap.free(p) };
            }
            heap.validate().unwrap();
            prop_assert_eq!(heap.free_space_total(), initial);
        }
    }
}
