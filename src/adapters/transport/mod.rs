pub mod channel_sink;
pub mod ws_connector;
