pub mod client;
pub mod connection_registry;
pub mod control_messages;
pub mod poll_loop;
pub mod server;
pub mod session_config;
pub mod session_error;
pub mod session_events;
