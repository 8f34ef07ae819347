//! Demand-paged virtual memory: coremap, page tables, TLB, swap, and the
//! fault-service path that ties them together.

pub mod addr;
pub mod addrspace;
pub mod coremap;
pub mod fault;
pub mod pagetable;
pub mod swap;
pub mod tlb;
