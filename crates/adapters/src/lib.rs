//! Reference adapters shipped with the runtime. Everything else arrives
//! through the same `AdapterInfo` registration, so nothing in the core knows
//! these by name.

pub mod denier;
pub mod noop;

use telemesh_template::AdapterInfo;

/// The built-in adapter inventory.
pub fn inventory() -> Vec<AdapterInfo> {
    vec![denier::info(), noop::info()]
}

pub use telemesh_template::adapter::AdapterRegistry;
