pub mod memory;
pub mod sled_store;

pub use careledger_core::chain::ChainStore;
pub use memory::MemoryStore;
pub use sled_store::SledStore;
