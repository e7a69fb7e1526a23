pub mod controller;
pub mod election;
pub mod usage;

pub use controller::{run_catalog_controller, CatalogContext};
