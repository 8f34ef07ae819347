//! Demand-paged virtual memory and a journalled filesystem core for a
//! teaching operating system.
//!
//! The two halves share only the bottom of the stack: [`block`] (the device
//! abstraction), [`error`], [`sync`], and [`config`]. [`memory`] implements
//! the coremap/page-table/TLB/swap subsystem and its fault-service path;
//! [`fs`] implements the journalled filesystem (buffer cache, physical
//! journal, transactions, crash recovery). [`kernel`] wires the memory half
//! together into one owned root; the filesystem half is wired together by
//! [`fs::filesystem::Filesystem`].

pub mod block;
pub mod config;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod sync;
