//! Durable storage for definitions, instances, tasks, logs and CC records

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod traits;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use traits::{FlowStore, StoreTx};
