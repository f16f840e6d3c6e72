pub mod ack_tracker;
pub mod delivery_queue;
pub mod health_reporter_service;
pub mod maintenance;
pub mod notification_bus;
pub mod rate_limiter;
pub mod registry;
