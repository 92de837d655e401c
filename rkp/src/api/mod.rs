pub mod memstore;
pub mod source;
pub mod store;
pub mod xlinestore;

pub use memstore::MemoryStore;
pub use source::{EventSource, EventType, ObjectEvent, WatchedObject};
pub use store::{ObjectStore, RawObject, StoreError, StoreEvent, StoreEventStream};
pub use xlinestore::XlineStore;
