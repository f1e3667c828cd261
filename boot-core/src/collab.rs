//! Collaborator trait shapes for firmware services kept out of this crate's
//! scope (spec §6): filesystem access, graphics mode selection, console
//! output, progress reporting, and ACPI discovery. A firmware-specific
//! binary crate (`uefi-loader`) supplies the implementations; `boot-core`
//! only names the shape it needs, the same split the teacher draws between
//! `jotunboot/src/main.rs`'s boot logic and the `uefi` crate's protocol
//! wrappers it calls into.

use crate::error::BootResult;

/// Opaque file descriptor, matching spec §6's `i32`-typed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileHandle(pub i32);

/// The filesystem surface the ELF loader needs. Paths are `/`-separated
/// regardless of the backing filesystem's native separator.
pub trait FileIo {
    fn open(&mut self, path: &str) -> BootResult<FileHandle>;
    fn filesize(&mut self, fd: FileHandle) -> BootResult<u64>;
    /// Returns the number of bytes actually read: exactly `dst.len()` on
    /// full success, fewer at EOF. A backend-level error is surfaced as
    /// `Err(BootError::DiskRead)` rather than a negative count.
    fn pread(&mut self, fd: FileHandle, dst: &mut [u8], off: u64) -> BootResult<usize>;
    fn close(&mut self, fd: FileHandle);
    /// Boot-drive serial number, folded in here per spec §6 rather than
    /// exposed as a separate free function.
    fn drv_serial(&mut self) -> u64;
}

/// Reports load progress as a byte count against a known total (spec §4.E's
/// `done_file_bytes / total_file_bytes`).
pub trait ProgressSink {
    fn report(&mut self, done_bytes: u64, total_bytes: u64);
}

/// Minimal text console (spec §6).
pub trait Console {
    fn print_at(&mut self, col: u16, row: u16, attr: u8, text: &str);
    fn scroll(&mut self, attr: u8);
}

/// One candidate display mode (spec §6's graphics interface).
#[derive(Debug, Clone, Copy, Default)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
    pub red_pos: u8,
    pub red_width: u8,
    pub green_pos: u8,
    pub green_width: u8,
    pub blue_pos: u8,
    pub blue_width: u8,
    pub alpha_pos: u8,
    pub alpha_width: u8,
    pub framebuffer_base: u64,
}

/// Firmware graphics mode enumeration/selection (spec §6).
pub trait GraphicsSink {
    fn enumerate_modes(&mut self) -> BootResult<alloc::vec::Vec<Mode>>;
    fn set_mode(&mut self, mode: &Mode) -> bool;
}

/// ACPI RSDP discovery, used by the hand-off sequencer to populate
/// `BootParams.acpi_rsdt` (spec §4.H).
pub trait AcpiProbe {
    /// Returns `(rsdt_addr, rsdt_size, ptrsz)`, or `None` if no ACPI tables
    /// are present.
    fn find_rsdp(&mut self) -> Option<(u64, u64, u64)>;
    /// Returns the MP-tables floating pointer structure's address, if any.
    fn find_mptables(&mut self) -> Option<u64>;
}

/// Firmware boot-services teardown. On UEFI this wraps `ExitBootServices`
/// with the current memory-map key; on legacy BIOS there is no equivalent
/// call and an implementation can simply return `Ok(())` (spec §4.H).
pub trait FirmwareExit {
    fn exit_boot_services(&mut self) -> BootResult<()>;
}
