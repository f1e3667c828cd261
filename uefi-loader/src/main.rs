// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project

//! UEFI firmware glue: wires `boot-core`'s architecture-neutral bootloader
//! algorithms to the `uefi` crate's protocol calls. Grounded directly in
//! `jotunboot/src/main.rs`'s `#[entry] fn main`: serial bring-up before
//! `uefi::helpers::init()`, `get_image_file_system`/`fs::FileSystem` for the
//! kernel image, `boot::allocate_pages` for every physical page this binary
//! itself needs, and `boot::exit_boot_services` immediately before the jump.
//! ACPI/MPS discovery follows `boot/efi/boottable_efi.cc`'s
//! `boottbl_find_acpi_rsdp`/`boottbl_find_mptables` (scan
//! `ConfigurationTable` for the ACPI 2.0, ACPI 1.0, and MPS GUIDs); the
//! console glue follows `boot/efi/screen_efi.cc`'s `print_at`/`scroll_screen`.
#![no_std]
#![no_main]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::arch::asm;

use log::{error, info};
use uefi::boot::{self, AllocateType, MemoryType, ScopedProtocol};
use uefi::cstr16;
use uefi::fs::{FileSystem, Path};
use uefi::guid;
use uefi::prelude::*;
use uefi::proto::console::gop::{GraphicsOutput, PixelFormat};
use uefi::proto::console::text::Output;
use uefi::table::cfg::{ACPI2_GUID, ACPI_GUID};
use uefi::{CStr16, CString16};

use boot_core::collab::{AcpiProbe, Console, FileHandle, FileIo, FirmwareExit, GraphicsSink, Mode, ProgressSink};
use boot_core::error::{BootError, BootResult};
use boot_core::handoff::{AcpiInfo, BootConfig, HandOff, HandOffInputs, MpTablesInfo, NumaInfo};
use boot_core::heap::LowHeap;
use boot_core::BootContext;

/// MPS floating-pointer-structure GUID (`eb9d2d2f-2d88-4d4c-9620-33b16b3fd87b`),
/// not exposed by the `uefi` crate's `table::cfg` module.
const MPS_TABLE_GUID: uefi::Guid = guid!("eb9d2d2f-2d88-4d4c-9620-33b16b3fd87b");

const KERNEL_PATH: &str = "/JOTUNHEIM/KERNEL.ELF";
const TRAMPOLINE_BLOB: &[u8] = &[0xFA, 0xF4, 0xEB, 0xFC]; // cli; hlt; jmp $-2

/* ===================== Global allocator ===================== */

/// The bootloader's own heap (spec §4.L) rather than the firmware pool
/// allocator `jotunboot` uses via `uefi::allocator::Allocator` — a firmware
/// binary built against `boot-core` needs its allocations to survive
/// `ExitBootServices`, which frees every UEFI pool allocation out from
/// under it.
static HEAP: spin::Once<spin::Mutex<LowHeap>> = spin::Once::new();

struct HeapAllocator;

unsafe impl GlobalAlloc for HeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match HEAP.get() {
            Some(heap) => unsafe { <spin::Mutex<LowHeap> as GlobalAlloc>::alloc(heap, layout) },
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(heap) = HEAP.get() {
            unsafe { <spin::Mutex<LowHeap> as GlobalAlloc>::dealloc(heap, ptr, layout) };
        }
    }
}

#[global_allocator]
static ALLOCATOR: HeapAllocator = HeapAllocator;

const HEAP_PAGES: usize = 2048; // 8 MiB

fn init_heap() {
    let pages = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, HEAP_PAGES)
        .unwrap_or_else(|e| die(&format!("allocate heap pages: {e:?}")));
    let start = pages.as_ptr() as usize;
    let heap = unsafe { LowHeap::new(start, HEAP_PAGES * 0x1000) };
    HEAP.call_once(|| spin::Mutex::new(heap));
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    unsafe {
        serial_init();
        serial_line("[serial][PANIC]");
    }
    error!("panic: {info}");
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

/* ===================== Serial (QEMU `-serial stdio`) ===================== */

const COM1: u16 = 0x3F8;

unsafe fn serial_init() {
    unsafe {
        asm!("out dx, al", in("dx") COM1 + 1, in("al") 0u8);
        asm!("out dx, al", in("dx") COM1 + 3, in("al") 0x80u8);
        asm!("out dx, al", in("dx") COM1 + 0, in("al") 0x01u8);
        asm!("out dx, al", in("dx") COM1 + 1, in("al") 0x00u8);
        asm!("out dx, al", in("dx") COM1 + 3, in("al") 0x03u8);
        asm!("out dx, al", in("dx") COM1 + 2, in("al") 0xC7u8);
        asm!("out dx, al", in("dx") COM1 + 4, in("al") 0x0Bu8);
    }
}

unsafe fn serial_putc(c: u8) {
    unsafe {
        loop {
            let mut lsr: u8;
            asm!("in al, dx", out("al") lsr, in("dx") COM1 + 5);
            if (lsr & 0x20) != 0 {
                break;
            }
        }
        asm!("out dx, al", in("dx") COM1, in("al") c);
    }
}

fn serial_line(s: &str) {
    unsafe {
        for b in s.bytes() {
            serial_putc(b);
        }
        serial_putc(b'\r');
        serial_putc(b'\n');
    }
}

#[cold]
fn die(msg: &str) -> ! {
    error!("[fatal] {msg}");
    serial_line(&format!("[serial][FATAL] {msg}"));
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

/* ===================== FileIo ===================== */

fn to_uefi_path(path: &str) -> CString16 {
    let backslashed = path.replace('/', "\\");
    CString16::try_from(backslashed.as_str()).expect("path is valid UCS-2")
}

struct FileIoUefi {
    fs: FileSystem,
    files: BTreeMap<i32, Vec<u8>>,
    next_fd: i32,
    drv_serial: u64,
}

impl FileIoUefi {
    fn new(fs: FileSystem, drv_serial: u64) -> Self {
        FileIoUefi {
            fs,
            files: BTreeMap::new(),
            next_fd: 1,
            drv_serial,
        }
    }
}

impl FileIo for FileIoUefi {
    fn open(&mut self, path: &str) -> BootResult<FileHandle> {
        let uefi_path = to_uefi_path(path);
        let data = self
            .fs
            .read(Path::new(&uefi_path))
            .map_err(|_| BootError::DiskRead)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, data);
        Ok(FileHandle(fd))
    }

    fn filesize(&mut self, fd: FileHandle) -> BootResult<u64> {
        self.files
            .get(&fd.0)
            .map(|v| v.len() as u64)
            .ok_or(BootError::DiskRead)
    }

    fn pread(&mut self, fd: FileHandle, dst: &mut [u8], off: u64) -> BootResult<usize> {
        let data = self.files.get(&fd.0).ok_or(BootError::DiskRead)?;
        let off = off as usize;
        if off >= data.len() {
            return Ok(0);
        }
        let n = dst.len().min(data.len() - off);
        dst[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn close(&mut self, fd: FileHandle) {
        self.files.remove(&fd.0);
    }

    fn drv_serial(&mut self) -> u64 {
        self.drv_serial
    }
}

/* ===================== Console ===================== */

struct ConsoleUefi<'a> {
    out: &'a mut ScopedProtocol<Output>,
}

impl Console for ConsoleUefi<'_> {
    fn print_at(&mut self, col: u16, row: u16, attr: u8, text: &str) {
        let (fg, bg) = attr_to_color(attr);
        let _ = self.out.set_cursor_position(col as usize, row as usize);
        let _ = self.out.set_color(fg, bg);
        let mut buf = [0u16; 256];
        if let Ok(s) = CStr16::from_str_with_buf(text, &mut buf) {
            let _ = self.out.output_string(s);
        }
    }

    fn scroll(&mut self, attr: u8) {
        let (fg, bg) = attr_to_color(attr);
        let _ = self.out.set_cursor_position(0, 24);
        let _ = self.out.set_color(fg, bg);
        let _ = self.out.output_string(cstr16!("\r\n"));
    }
}

/// Splits a packed VGA-style attribute byte (low nibble foreground, high
/// nibble background) into the `uefi` text protocol's separate color enums,
/// matching the palette `screen_efi.cc`'s callers already assume.
fn attr_to_color(attr: u8) -> (uefi::proto::console::text::Color, uefi::proto::console::text::Color) {
    use uefi::proto::console::text::Color;
    const PALETTE: [Color; 16] = [
        Color::Black,
        Color::Blue,
        Color::Green,
        Color::Cyan,
        Color::Red,
        Color::Magenta,
        Color::Brown,
        Color::LightGray,
        Color::DarkGray,
        Color::LightBlue,
        Color::LightGreen,
        Color::LightCyan,
        Color::LightRed,
        Color::LightMagenta,
        Color::Yellow,
        Color::White,
    ];
    (PALETTE[(attr & 0xF) as usize], PALETTE[((attr >> 4) & 0xF) as usize])
}

/* ===================== Progress ===================== */

struct SerialProgress;

impl ProgressSink for SerialProgress {
    fn report(&mut self, done_bytes: u64, total_bytes: u64) {
        info!("kernel load: {done_bytes}/{total_bytes} bytes");
    }
}

/* ===================== Graphics ===================== */

struct GraphicsSinkUefi<'a> {
    gop: &'a mut ScopedProtocol<GraphicsOutput>,
}

impl GraphicsSink for GraphicsSinkUefi<'_> {
    fn enumerate_modes(&mut self) -> BootResult<Vec<Mode>> {
        let mut out = Vec::new();
        for mode in self.gop.modes() {
            let info = mode.info();
            let (width, height) = info.resolution();
            let (red, green, blue, alpha) = match info.pixel_format() {
                PixelFormat::Rgb => ((0u8, 8u8), (8, 8), (16, 8), (24, 8)),
                PixelFormat::Bgr => ((16u8, 8u8), (8, 8), (0, 8), (24, 8)),
                _ => continue,
            };
            out.push(Mode {
                width: width as u32,
                height: height as u32,
                pitch: info.stride() as u32 * 4,
                bpp: 32,
                red_pos: red.0,
                red_width: red.1,
                green_pos: green.0,
                green_width: green.1,
                blue_pos: blue.0,
                blue_width: blue.1,
                alpha_pos: alpha.0,
                alpha_width: alpha.1,
                framebuffer_base: self.gop.frame_buffer().as_mut_ptr() as u64,
            });
        }
        Ok(out)
    }

    fn set_mode(&mut self, mode: &Mode) -> bool {
        let target = self.gop.modes().find(|m| {
            let (w, h) = m.info().resolution();
            w as u32 == mode.width && h as u32 == mode.height
        });
        match target {
            Some(m) => self.gop.set_mode(&m).is_ok(),
            None => false,
        }
    }
}

/* ===================== ACPI / MPS ===================== */

struct AcpiProbeUefi;

impl AcpiProbe for AcpiProbeUefi {
    fn find_rsdp(&mut self) -> Option<(u64, u64, u64)> {
        let mut found = None;
        uefi::system::with_config_table(|entries| {
            for entry in entries {
                if entry.guid == ACPI2_GUID {
                    let rsdp2 = entry.address as *const Rsdp20;
                    let rsdp2 = unsafe { &*rsdp2 };
                    found = Some((rsdp2.xsdt_addr, rsdp2.length as u64, 8));
                    return;
                }
            }
            for entry in entries {
                if entry.guid == ACPI_GUID {
                    let rsdp = entry.address as *const Rsdp10;
                    let rsdp = unsafe { &*rsdp };
                    found = Some((rsdp.rsdt_addr as u64, 0, 4));
                    return;
                }
            }
        });
        found
    }

    fn find_mptables(&mut self) -> Option<u64> {
        let mut found = None;
        uefi::system::with_config_table(|entries| {
            for entry in entries {
                if entry.guid == MPS_TABLE_GUID {
                    found = Some(entry.address as u64);
                    return;
                }
            }
        });
        found
    }
}

/// RSDP layouts as defined by the ACPI specification; only the fields this
/// probe reads are named.
#[repr(C, packed)]
struct Rsdp10 {
    _signature: [u8; 8],
    _checksum: u8,
    _oemid: [u8; 6],
    _revision: u8,
    rsdt_addr: u32,
}

#[repr(C, packed)]
struct Rsdp20 {
    _v1: Rsdp10,
    length: u32,
    xsdt_addr: u64,
    _ext_checksum: u8,
    _reserved: [u8; 3],
}

/* ===================== Firmware exit ===================== */

struct FirmwareExitUefi;

impl FirmwareExit for FirmwareExitUefi {
    fn exit_boot_services(&mut self) -> BootResult<()> {
        let _ = unsafe { boot::exit_boot_services(None) };
        Ok(())
    }
}

/* ===================== Entry ===================== */

#[entry]
fn main() -> Status {
    unsafe { serial_init() };
    serial_line(">>> boot-core UEFI loader entry");

    if uefi::helpers::init().is_err() {
        serial_line("[serial][FATAL] helpers::init failed");
        loop {
            unsafe { asm!("hlt") };
        }
    }

    init_heap();
    info!("heap ready: {} pages", HEAP_PAGES);

    if let Ok(out_handle) = boot::get_handle_for_protocol::<Output>() {
        if let Ok(mut out) = boot::open_protocol_exclusive::<Output>(out_handle) {
            let mut console = ConsoleUefi { out: &mut out };
            console.print_at(0, 0, 0x0F, "jotunheim boot-core loader");
        }
    }

    let image = boot::image_handle();
    let fs_proto = boot::get_image_file_system(image)
        .unwrap_or_else(|e| die(&format!("get_image_file_system: {e:?}")));
    let mut io = FileIoUefi::new(fs_proto, 0);

    let mut physmap = boot_core::physmem::PhysMap::new();
    populate_physmap_from_uefi(&mut physmap);

    let mut ctx = BootContext::new(physmap).unwrap_or_else(|e| die(&format!("page tables: {e}")));

    let mut progress = SerialProgress;
    let global_pages_supported = cpu_supports_global_pages();
    let no_execute_supported = cpu_supports_no_execute();

    let image_info = ctx
        .load_kernel(KERNEL_PATH, &mut io, &mut progress, global_pages_supported)
        .unwrap_or_else(|e| die(&format!("load kernel: {e}")));
    info!("kernel entry = 0x{:x}", image_info.entry_point);

    let mut framebuffer_base = 0u64;
    let mut framebuffer_size = 0u64;
    let mut vbe_selected_mode = 0u64;
    if let Ok(gop_handle) = boot::get_handle_for_protocol::<GraphicsOutput>() {
        if let Ok(mut gop) = boot::open_protocol_exclusive::<GraphicsOutput>(gop_handle) {
            let mut gfx = GraphicsSinkUefi { gop: &mut gop };
            if let Ok(modes) = gfx.enumerate_modes() {
                if let Some(best) = modes.iter().max_by_key(|m| m.width as u64 * m.height as u64) {
                    if gfx.set_mode(best) {
                        framebuffer_base = best.framebuffer_base;
                        framebuffer_size = best.pitch as u64 * best.height as u64;
                        vbe_selected_mode = 1;
                    }
                }
            }
        }
    }

    let mut acpi_probe = AcpiProbeUefi;
    let acpi_rsdt = acpi_probe
        .find_rsdp()
        .map(|(addr, size, ptrsz)| AcpiInfo {
            rsdt_addr: addr,
            rsdt_size: size,
            ptrsz,
        })
        .unwrap_or_default();
    let mptables = acpi_probe
        .find_mptables()
        .map(|mp_addr| MpTablesInfo { mp_addr })
        .unwrap_or_default();

    let ap_entry = ctx
        .handoff(global_pages_supported, no_execute_supported)
        .install_trampoline(TRAMPOLINE_BLOB)
        .unwrap_or_else(|e| die(&format!("install trampoline: {e}")));

    ctx.handoff(global_pages_supported, no_execute_supported)
        .install_identity_mappings(framebuffer_base, framebuffer_size, ap_entry)
        .unwrap_or_else(|e| die(&format!("identity mappings: {e}")));

    let inputs = HandOffInputs {
        phys_mem_table: 0,
        phys_mem_table_size: 0,
        vbe_info: 0,
        vbe_selected_mode,
        acpi_rsdt,
        mptables,
        numa: NumaInfo::default(),
        boot_drv_serial: io.drv_serial,
        initrd_start: 0,
        initrd_size: 0,
        phys_mapping: 0,
        phys_mapping_size: 0,
        command_line: 0,
        config: BootConfig {
            serial_debugout: 1,
            serial_baud: 3, // 115200
            acpi_enable: (acpi_rsdt.rsdt_addr != 0) as u8,
            mps_enable: (mptables.mp_addr != 0) as u8,
            e9_enable: 1,
            ..BootConfig::default()
        },
    };

    let params = boot_core::handoff::build_params(ap_entry, inputs);
    let params_phys = &params as *const _ as u64;

    serial_line("[serial] exiting boot services");
    let mut exit = FirmwareExitUefi;
    boot_core::handoff::exit_firmware(&mut exit).unwrap_or_else(|e| die(&format!("exit_boot_services: {e}")));

    unsafe {
        HandOff::<boot_core::physmem::PhysMap>::enter_kernel(
            ctx.tables.root_addr(),
            image_info.entry_point,
            params_phys,
            no_execute_supported,
        )
    }
}

/// Folds the UEFI memory map into the bootloader's own physical-range list
/// (spec §4.P), matching the shape `boot/physmem_efi.cc` builds from
/// `GetMemoryMap` before handing it to the common fix-up pass.
fn populate_physmap_from_uefi(map: &mut boot_core::physmem::PhysMap) {
    use boot_core::physmem::{PhysRange, RangeKind};
    use uefi::boot::MemoryType as M;

    let mmap = match boot::memory_map(MemoryType::LOADER_DATA) {
        Ok(m) => m,
        Err(_) => return,
    };
    for desc in mmap.entries() {
        if desc.page_count == 0 {
            continue;
        }
        let kind = match desc.ty {
            M::CONVENTIONAL | M::BOOT_SERVICES_CODE | M::BOOT_SERVICES_DATA => RangeKind::Normal,
            M::ACPI_RECLAIM => RangeKind::Reclaimable,
            M::ACPI_NON_VOLATILE => RangeKind::Nvs,
            M::UNUSABLE => RangeKind::Bad,
            _ => RangeKind::Unusable,
        };
        map.insert(PhysRange::new(
            desc.phys_start,
            desc.page_count * 0x1000,
            kind,
        ));
    }
}

fn cpu_supports_global_pages() -> bool {
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.edx & (1 << 13) != 0
}

fn cpu_supports_no_execute() -> bool {
    let leaf = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
    leaf.edx & (1 << 20) != 0
}
