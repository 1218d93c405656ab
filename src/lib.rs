// Library crate for the binary and the integration tests.

pub mod aggregate;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod perf_log;
pub mod report;
pub mod scoring;
pub mod settings;
pub mod trial;
