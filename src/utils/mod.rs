pub mod error;
pub mod log_ring;
pub mod logger;
pub mod scheduler;
