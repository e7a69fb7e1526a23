pub mod controller;
pub mod plan;
pub mod translator;

pub use controller::{run_deployment_controller, DeploymentContext};
