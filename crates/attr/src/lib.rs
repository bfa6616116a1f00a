pub mod bag;
pub mod dictionary;
pub mod errors;
pub mod pool;
pub mod value;
pub mod vocabulary;
pub mod wire;

pub use bag::{AttributeBag, AttributePresence, AttributeRef, ReferencedSet};
pub use dictionary::GlobalWords;
pub use errors::AttrError;
pub use pool::{BagPool, PooledBag};
pub use value::{AttributeValue, ValueType};
pub use vocabulary::{Finder, Manifest, Vocabulary};
pub use wire::{ReferencedAttributes, WireAttributes};
