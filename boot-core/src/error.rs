//! Error kinds recognised by the bootloader core (spec §7).
//!
//! There is no `thiserror` here: the crate is `no_std` outside of tests and
//! needs a hand-rolled `Display` impl, the same choice `jotunheimkernel`
//! makes for `KernelError`.

use core::fmt;

/// Sum type returned by fallible core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "boot errors must be handled or escalated to a panic"]
pub enum BootError {
    /// The low-heap allocator found a block header that fails its
    /// `size + neg_size == 0` / `self == &header` invariant.
    CorruptedHeap,
    /// `PhysMap` invariants (sortedness, non-overlap, coalescence) broke.
    CorruptedPhysMap,
    /// An allocation request could not be satisfied.
    OutOfMemory { requested: u64 },
    /// A `pread` returned fewer bytes than requested, or a negative status.
    DiskRead,
    /// The ELF header, program headers, or relocation records are malformed
    /// or reference an unsupported relocation type.
    BadElf,
    /// The CPU does not support long mode (`CPUID.80000001H:EDX[29]`).
    NoLongMode,
    /// `ExitBootServices` (or the BIOS equivalent) failed.
    FirmwareExitFailed,
    /// `PageTables::iovec` was asked for a virtual range with an absent PTE.
    MissingMapping,
}

impl BootError {
    /// Per spec §7: these kinds are never recoverable across a component
    /// boundary and must be escalated to a panic by the caller.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            BootError::CorruptedHeap
                | BootError::CorruptedPhysMap
                | BootError::NoLongMode
                | BootError::FirmwareExitFailed
                | BootError::DiskRead
                | BootError::BadElf
                | BootError::MissingMapping
        )
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::CorruptedHeap => write!(f, "Corrupt heap block header"),
            BootError::CorruptedPhysMap => write!(f, "Corrupt physical memory map"),
            BootError::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {requested} bytes")
            }
            BootError::DiskRead => write!(f, "Disk read failed"),
            BootError::BadElf => write!(f, "Malformed or unsupported ELF image"),
            BootError::NoLongMode => write!(f, "CPU does not support long mode"),
            BootError::FirmwareExitFailed => write!(f, "Failed to exit firmware boot services"),
            BootError::MissingMapping => write!(f, "Requested region is not mapped"),
        }
    }
}

pub type BootResult<T> = Result<T, BootError>;
