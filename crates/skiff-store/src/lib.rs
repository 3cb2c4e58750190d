pub mod error;
pub mod hash;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use hash::compute_state_hash;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use store::{DeviceStore, SnapshotKind, StateSnapshot};
