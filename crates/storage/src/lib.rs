pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::{EntityKind, StorageError};
pub use memory::{InMemorySnapshot, InMemoryStorage};
pub use record::{NegotiationRecord, ProvisionDataRecord, TransferProcessRecord};
pub use traits::ConnectorStorage;
