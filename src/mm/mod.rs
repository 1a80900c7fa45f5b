//! Memory layout seen by the dispatch core
//!
//! The core never allocates or maps memory. It only needs to know where the
//! user/kernel split lies on each architecture so that pointers coming from
//! user code and fault addresses can be classified.

pub mod address;

pub use address::{AccessKind, AddressLayout, VirtAddr, PAGE_SIZE};
