//! Counter store adapters.

pub mod memory;

pub use memory::InMemoryCounterStore;
