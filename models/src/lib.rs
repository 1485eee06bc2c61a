pub mod instance;
pub mod offer;
pub mod ops;
pub mod resource;
pub mod run_spec;
