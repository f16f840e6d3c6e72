pub mod api;
pub mod error_sink;
pub mod transport;
