//! Page-table construction (spec §4.T): a [`PteBuilder`] for architecture-
//! specific permission encoding plus [`PageTables`] for the shared
//! 4-level walk.

mod pte;
mod table;

pub use pte::{dirty_accessed_clear_mask, PteBuilder};
pub use table::{IoVec, PageFactory, PageTable, PageTables};
