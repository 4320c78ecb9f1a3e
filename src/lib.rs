pub mod capture;
pub mod config;
pub mod connectivity;
pub mod logging;
pub mod platform;
pub mod queue;
pub mod serial;
pub mod service;
pub mod simulator;
pub mod status;
pub mod store;
pub mod upload;

pub use config::AppConfig;
pub use service::Service;
