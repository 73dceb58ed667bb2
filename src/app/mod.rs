pub mod errors;
pub mod factory;
pub mod service;
pub mod task_runner;

pub use factory::{AppFactory, AppPaths};
pub use service::{IndexService, QueryOutcome, ServiceOptions};
