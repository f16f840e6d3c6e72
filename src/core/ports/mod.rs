pub mod connector;
pub mod error_sink;
pub mod runner;
pub mod sink;
