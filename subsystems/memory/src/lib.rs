//! # Lattice Memory Subsystem
//!
//! The software translation structure of a Lattice processor node.
//!
//! On a disaggregated machine the processor node has no hardware-walked
//! page tables for its cached data: translations from task virtual
//! addresses to cache-line physical addresses live in a software-managed
//! four-level radix tree. The cache fault path walks this tree, allocates
//! missing intermediate levels on demand, and installs leaf entries once a
//! line has been fetched from the remote memory owner.
//!
//! ## Components
//!
//! - **Entries**: the leaf translation word and its flag bits
//! - **Tables**: leaf tables with per-table entry locks, and the atomic
//!   directory levels above them
//! - **Address spaces**: the per-task root plus the walk operations
//!
//! ## Locking
//!
//! Each leaf table carries one `spin::Mutex` - the fine-grained
//! translation-entry lock of the fault path. Entry words are atomic, so
//! lock-free reads are always allowed; all entry writes go through a held
//! [`EntryGuard`]. Intermediate levels are published with compare-and-swap
//! and never freed before the address space itself, so walkers need no
//! lock at all.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod entry;
pub mod space;
pub mod table;

pub use entry::{Entry, EntryFlags};
pub use space::{AddressSpace, MemoryError};
pub use table::{EntryGuard, EntryRef, LeafTable, SlotPtr};
