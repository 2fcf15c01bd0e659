pub mod client;
pub mod config;
pub mod config_validation;
pub mod endpoints;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod percentiles;
pub mod rate_controller;
pub mod recorder;
pub mod report;
pub mod request;
pub mod utils;
pub mod worker;
