pub mod engine;
pub mod memory;
pub mod persistence;

pub use engine::{DataMapRef, MetaMapRef, OrderedMap, OrderedStore, UndoMapRef};
pub use memory::{InMemoryStore, StoreConfig};
