//! Permission encoding for page-table entries (spec §3 `PteBuilder`, §4.T).
//!
//! One implementation per architecture, selected at compile time via
//! `cfg(target_arch)` — monomorphisation per the Design Note in spec §9,
//! no dynamic dispatch needed at runtime. The x86-64 bit layout is grounded
//! in `examples/original_source/boot/paging.c`'s `PTE_PRESENT` /
//! `PTE_WRITABLE` / `PTE_GLOBAL` / `PTE_NX` constants, encoded as a
//! `bitflags!` set the way `nmraz-corrosios`'s `X86PageTableFlags` does
//! (`other_examples/b41a337f_...mmu.rs.rs`); the AArch64 layout is grounded
//! in `doublegate-VeridianOS/kernel/src/mm/page_table.rs`'s
//! `cfg(target_arch = "aarch64")` TTBR handling, with the same `bitflags!`
//! treatment for its descriptor attribute bits.

/// Semantic permission set for one page-table entry, independent of
/// architecture bit positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PteBuilder {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub huge: bool,
    /// Write-through caching (x86-64 PWT, bit 3). No AArch64 equivalent.
    pub pwt: bool,
    /// Cache-disable (x86-64 PCD, bit 4). No AArch64 equivalent.
    pub pcd: bool,
    /// Page-attribute-table bit (x86-64 PAT: bit 7 on a 4 KiB leaf, bit 12
    /// on a huge-page leaf — `to_pte` picks the position for the level).
    /// No AArch64 equivalent.
    pub pat: bool,
    /// Whether the executing CPU honors `EFER.NX`/the PTE NX bit at all; if
    /// false, `executable(false)` is encoded without setting the NX bit,
    /// since setting a reserved bit on a CPU without the feature faults.
    pub nx_supported: bool,
    pub physaddr: u64,
}

impl PteBuilder {
    pub fn new(physaddr: u64) -> Self {
        PteBuilder {
            readable: true,
            nx_supported: true,
            physaddr,
            ..Default::default()
        }
    }

    pub fn writable(mut self, v: bool) -> Self {
        self.writable = v;
        self
    }

    pub fn executable(mut self, v: bool) -> Self {
        self.executable = v;
        self
    }

    pub fn global(mut self, v: bool) -> Self {
        self.global = v;
        self
    }

    pub fn huge(mut self, v: bool) -> Self {
        self.huge = v;
        self
    }

    pub fn user(mut self, v: bool) -> Self {
        self.user = v;
        self
    }

    pub fn pwt(mut self, v: bool) -> Self {
        self.pwt = v;
        self
    }

    pub fn pcd(mut self, v: bool) -> Self {
        self.pcd = v;
        self
    }

    pub fn pat(mut self, v: bool) -> Self {
        self.pat = v;
        self
    }

    pub fn nx_supported(mut self, v: bool) -> Self {
        self.nx_supported = v;
        self
    }

    /// Encode into the raw entry. `level` follows the builder's table-depth
    /// numbering: 1 for a terminal 4 KiB PT entry, 2 for a 2 MiB PD entry,
    /// 3 for a 1 GiB PDPT entry.
    pub fn to_pte(self, level: u8) -> u64 {
        arch::to_pte(self, level)
    }
}

/// Entry for a non-leaf (intermediate) table, installed with
/// `Present | Writable` per spec §4.T.
pub fn intermediate_entry(table_phys: u64) -> u64 {
    arch::intermediate_entry(table_phys)
}

pub fn is_present(pte: u64) -> bool {
    arch::is_present(pte)
}

/// True if `pte` is a huge-page terminal entry (2 MiB/1 GiB) rather than a
/// pointer to the next table level.
pub fn is_huge(pte: u64) -> bool {
    arch::is_huge(pte)
}

pub fn addr_of(pte: u64) -> u64 {
    pte & arch::ADDR_MASK
}

/// Replace the address bits of `pte`, keeping its flag bits.
pub fn with_addr(pte: u64, addr: u64) -> u64 {
    (pte & !arch::ADDR_MASK) | (addr & arch::ADDR_MASK)
}

/// Clear the present bit and address bits, keeping the remaining flags —
/// used by `alias_range` when the original mapping is absent (spec §4.T).
pub fn cleared_but_flagged(flags_only: u64) -> u64 {
    arch::clear_present_and_addr(flags_only)
}

/// Bits to clear from a terminal entry to drop its Dirty/Accessed state
/// (spec §4.E step 6). Zero on architectures with no software-managed
/// Dirty bit in this minimal scheme.
pub fn dirty_accessed_clear_mask() -> u64 {
    arch::DIRTY_ACCESSED_MASK
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::PteBuilder;
    use bitflags::bitflags;

    bitflags! {
        /// Raw x86-64 page-table entry flag bits, independent of level.
        /// `PAGE_SIZE` (bit 7) is the PS bit on a huge PD/PDPT entry and
        /// doubles as the PAT bit's position on a 4 KiB PT entry — `to_pte`
        /// picks `PAT_4K` or `PAT_HUGE` based on whether the entry is huge
        /// so the two never collide.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub(super) struct X86PteFlags: u64 {
            const PRESENT    = 1 << 0;
            const WRITABLE   = 1 << 1;
            const USER       = 1 << 2;
            const PWT        = 1 << 3;
            const PCD        = 1 << 4;
            const ACCESSED   = 1 << 5;
            const DIRTY      = 1 << 6;
            const PAT_4K     = 1 << 7;
            const PAGE_SIZE  = 1 << 7;
            const GLOBAL     = 1 << 8;
            const PAT_HUGE   = 1 << 12;
            const NO_EXECUTE = 1 << 63;
        }
    }

    pub(super) const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    pub(super) const DIRTY_ACCESSED_MASK: u64 = X86PteFlags::ACCESSED.bits() | X86PteFlags::DIRTY.bits();

    pub(super) fn to_pte(b: PteBuilder, level: u8) -> u64 {
        let huge = b.huge && level > 1;
        let mut flags = X86PteFlags::PRESENT;
        flags.set(X86PteFlags::WRITABLE, b.writable);
        flags.set(X86PteFlags::USER, b.user);
        flags.set(X86PteFlags::PWT, b.pwt);
        flags.set(X86PteFlags::PCD, b.pcd);
        flags.set(X86PteFlags::GLOBAL, b.global);
        flags.set(X86PteFlags::NO_EXECUTE, !b.executable && b.nx_supported);
        flags.set(X86PteFlags::PAGE_SIZE, huge);
        if huge {
            flags.set(X86PteFlags::PAT_HUGE, b.pat);
        } else {
            flags.set(X86PteFlags::PAT_4K, b.pat);
        }
        (b.physaddr & ADDR_MASK) | flags.bits()
    }

    pub(super) fn intermediate_entry(table_phys: u64) -> u64 {
        (table_phys & ADDR_MASK) | (X86PteFlags::PRESENT | X86PteFlags::WRITABLE).bits()
    }

    pub(super) fn is_present(pte: u64) -> bool {
        X86PteFlags::from_bits_truncate(pte).contains(X86PteFlags::PRESENT)
    }

    pub(super) fn is_huge(pte: u64) -> bool {
        X86PteFlags::from_bits_truncate(pte).contains(X86PteFlags::PAGE_SIZE)
    }

    pub(super) fn clear_present_and_addr(flags_only: u64) -> u64 {
        (flags_only & !ADDR_MASK) & !X86PteFlags::PRESENT.bits()
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::PteBuilder;
    use bitflags::bitflags;

    bitflags! {
        /// Raw AArch64 descriptor attribute bits (long-descriptor format).
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub(super) struct AArch64PteFlags: u64 {
            const VALID        = 1 << 0;
            /// Set on table descriptors at non-leaf levels and on 4 KiB leaf
            /// descriptors; clear on 2 MiB/1 GiB block descriptors.
            const TABLE_OR_PAGE = 1 << 1;
            const AP_EL0       = 1 << 6;
            const AP_RO        = 1 << 7;
            const SH_INNER     = 0b11 << 8;
            const AF           = 1 << 10;
            const PXN          = 1 << 53;
            const UXN         = 1 << 54;
        }
    }

    pub(super) const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
    /// No software-managed Dirty bit in this minimal descriptor scheme.
    pub(super) const DIRTY_ACCESSED_MASK: u64 = 0;

    pub(super) fn to_pte(b: PteBuilder, level: u8) -> u64 {
        let mut flags = AArch64PteFlags::VALID | AArch64PteFlags::AF | AArch64PteFlags::SH_INNER;
        flags.set(AArch64PteFlags::TABLE_OR_PAGE, level == 1 || !b.huge);
        flags.set(AArch64PteFlags::AP_RO, !b.writable);
        flags.set(AArch64PteFlags::AP_EL0, b.user);
        if !b.executable {
            flags.insert(AArch64PteFlags::UXN | AArch64PteFlags::PXN);
        } else if !b.user {
            flags.insert(AArch64PteFlags::PXN);
        }
        (b.physaddr & ADDR_MASK) | flags.bits()
    }

    pub(super) fn intermediate_entry(table_phys: u64) -> u64 {
        (table_phys & ADDR_MASK) | (AArch64PteFlags::VALID | AArch64PteFlags::TABLE_OR_PAGE).bits()
    }

    pub(super) fn is_present(pte: u64) -> bool {
        AArch64PteFlags::from_bits_truncate(pte).contains(AArch64PteFlags::VALID)
    }

    pub(super) fn is_huge(pte: u64) -> bool {
        let flags = AArch64PteFlags::from_bits_truncate(pte);
        flags.contains(AArch64PteFlags::VALID) && !flags.contains(AArch64PteFlags::TABLE_OR_PAGE)
    }

    pub(super) fn clear_present_and_addr(flags_only: u64) -> u64 {
        (flags_only & !ADDR_MASK) & !AArch64PteFlags::VALID.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_bit_survives_round_trip() {
        let pte = PteBuilder::new(0x1000).writable(true).to_pte(1);
        assert!(is_present(pte));
        assert!(!is_huge(pte));
        assert_eq!(addr_of(pte), 0x1000);
    }

    #[test]
    fn huge_only_set_above_level_one() {
        let huge_leaf = PteBuilder::new(0x20_0000).huge(true).to_pte(2);
        assert!(is_huge(huge_leaf));

        let not_huge = PteBuilder::new(0x1000).huge(true).to_pte(1);
        assert!(!is_huge(not_huge));
    }

    #[test]
    fn with_addr_preserves_flags() {
        let pte = PteBuilder::new(0x1000).writable(true).executable(false).to_pte(1);
        let moved = with_addr(pte, 0x9000);
        assert_eq!(addr_of(moved), 0x9000);
        assert_eq!(moved & !arch::ADDR_MASK, pte & !arch::ADDR_MASK);
    }

    #[test]
    fn cleared_but_flagged_drops_present_and_addr() {
        let pte = PteBuilder::new(0x4000).writable(true).to_pte(1);
        let cleared = cleared_but_flagged(pte);
        assert!(!is_present(cleared));
        assert_eq!(addr_of(cleared), 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn cache_attribute_bits_reach_the_entry() {
        let pte = PteBuilder::new(0x1000)
            .writable(true)
            .pwt(true)
            .pcd(true)
            .to_pte(1);
        assert_eq!(pte & 0b1_1000, 0b1_1000, "PWT (bit 3) and PCD (bit 4) must be set");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn pat_bit_moves_between_4kib_and_huge_positions() {
        let four_kib = PteBuilder::new(0x1000).pat(true).to_pte(1);
        assert_eq!(four_kib & (1 << 7), 1 << 7, "4 KiB PAT sits at bit 7");
        assert_eq!(four_kib & (1 << 12), 0);

        let huge = PteBuilder::new(0x20_0000).huge(true).pat(true).to_pte(2);
        assert_eq!(huge & (1 << 12), 1 << 12, "huge-page PAT sits at bit 12");
    }
}
