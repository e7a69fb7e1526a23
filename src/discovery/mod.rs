pub mod controller;
pub mod projection;
pub mod sync;

pub use controller::{run_discovery_controller, DiscoveryContext};
