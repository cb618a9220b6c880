//! Virtual memory.
//!
//! Address spaces are demand paged: construction maps nothing, the
//! page-fault path loads pages from the executable on first touch, and
//! under memory pressure the [`coremap`] evicts the least-recently-used
//! frame into the owning space's swap file — itself an ordinary file in the
//! filesystem.

pub mod address_space;
pub mod coremap;

pub use address_space::AddressSpace;
