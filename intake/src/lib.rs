pub mod admission;
pub mod api;
pub mod config;
pub mod decoder;
pub mod intake_endpoint;
pub mod model;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod stream;
pub mod time;
