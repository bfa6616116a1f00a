pub mod errors;
pub mod fs;
pub mod resource;
pub mod store;

pub use errors::ConfigError;
pub use fs::FsBackend;
pub use resource::{Resource, ResourceKey};
pub use store::{ChangeType, StoreBackend, StoreEvent};
