// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project

//! Core algorithms for a second-stage bootloader: the low-heap allocator,
//! the physical memory map, the page-table builder, the ELF64 loader, and
//! the hand-off sequencer. Firmware-specific glue (UEFI, BIOS) lives in a
//! separate binary crate and talks to this one only through the traits in
//! [`collab`].
//!
//! `#![cfg_attr(not(test), no_std)]` mirrors the idiom the `x86_64` crate
//! uses (a dependency `jotunheimkernel` pulls in): outside of tests the
//! crate is `no_std`, but under `cfg(test)` it compiles against `std` so
//! the host toolchain can run the property and scenario tests in §8
//! without a custom `no_std` test harness.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod collab;
pub mod elf;
pub mod error;
pub mod handoff;
pub mod heap;
pub mod paging;
pub mod physmem;

use collab::{Console, FileIo, ProgressSink};
use elf::ElfLoader;
use error::BootResult;
use handoff::HandOff;
use heap::LowHeap;
use paging::{PageFactory, PageTables};
use physmem::PhysMap;

/// Ties the four components together in the order spec §9's Design Note
/// requires: heap before physmap before page tables before anything that
/// allocates through them. There is no global mutable state; a firmware
/// binary owns one `BootContext` (behind a `spin::Once`/`spin::Mutex` cell
/// when it needs `'static` access from its entry point, the same role
/// those types play in `jotunheimkernel`).
pub struct BootContext {
    pub physmap: PhysMap,
    pub tables: PageTables,
}

impl BootContext {
    /// Builds the page-table root once the physical map has been
    /// populated and fixed up by the firmware binary.
    pub fn new(mut physmap: PhysMap) -> BootResult<Self> {
        let tables = PageTables::new(&mut physmap)?;
        Ok(BootContext { physmap, tables })
    }

    pub fn factory(&mut self) -> &mut PhysMap {
        &mut self.physmap
    }

    /// Loads the kernel image through the ELF loader, wiring this
    /// context's page tables and physical-page factory together with the
    /// firmware-supplied collaborators.
    pub fn load_kernel<IO: FileIo, P: ProgressSink>(
        &mut self,
        path: &str,
        io: &mut IO,
        progress: &mut P,
        global_pages_supported: bool,
    ) -> BootResult<elf::LoadedImage> {
        let mut loader = ElfLoader {
            factory: &mut self.physmap,
            tables: &mut self.tables,
            io,
            progress,
            global_pages_supported,
        };
        loader.load(path)
    }

    /// Drives the hand-off responsibilities that only need this context's
    /// page tables and physical-page factory; the caller still assembles
    /// [`handoff::BootParams`] from its own probes and calls
    /// [`handoff::HandOff::enter_kernel`] itself, since that call never
    /// returns.
    pub fn handoff(&mut self, global_pages_supported: bool, no_execute_supported: bool) -> HandOff<'_, PhysMap> {
        HandOff {
            factory: &mut self.physmap,
            tables: &mut self.tables,
            global_pages_supported,
            no_execute_supported,
        }
    }
}

/// Reports a message through both the console and serial collaborators,
/// then halts permanently — the only recourse once a non-recoverable
/// [`error::BootError`] escapes to the top level (spec §7), grounded in
/// `jotunboot/src/main.rs`'s `die()`.
pub fn panic_with(console: &mut impl Console, message: &str) -> ! {
    console.print_at(0, 0, 0x4F, message);
    loop {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack));
        }
    }
}
