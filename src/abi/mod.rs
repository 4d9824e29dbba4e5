//! ABI store, contract map and selector resolution

pub mod finder;
pub mod map;
pub mod store;

pub use finder::{AbiFinder, AbiFinderResult};
pub use map::ContractMap;
pub use store::ContractStore;
