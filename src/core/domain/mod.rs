pub mod connection;
pub mod delivery;
pub mod health;
pub mod notification;
pub mod optimistic;
