use std::time::Duration;

use crate::session::session_config::SessionConfig;
use crate::transport::PeerId;

/// convenience method for unit test code: create a [PeerId] based on a number, the same number
///  generating the same id and different numbers different ids
pub fn test_peer_id_from_number(number: u16) -> PeerId {
    PeerId(1000 + number as u64)
}

/// A config with short timings, so that tests with a paused clock do not need to advance a lot
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::new();
    config.poll_interval = Duration::from_millis(10);
    config.connect_timeout = Duration::from_millis(50);
    config.disconnect_grace_period = Duration::from_millis(20);
    config
}
