mod correlation;
mod file_store;
mod intake;
mod metadata;
mod prediction;
mod routes;
mod server;
mod store;

pub mod app;
pub mod config;
pub mod telemetry;

pub use app::start_app;
