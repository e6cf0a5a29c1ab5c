//! couch-road: the WebSocket relay couch participants join channels through.

pub mod config;
pub mod relay;
pub mod websocket;

pub use config::Config;
pub use relay::Relay;
pub use websocket::{router, spawn_sweeper};
