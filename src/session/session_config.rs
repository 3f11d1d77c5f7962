use std::time::Duration;

use anyhow::bail;
use tracing::{error, warn};

use crate::session::control_messages::CONTROL_CHANNEL;
use crate::transport::{Channel, DeliveryMode};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// time between two polling cycles of a poll loop, i.e. after all pending packets were
    ///  drained and dispatched
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// time between sending a DISCONNECT message and closing the transport session, giving the
    ///  message a chance to leave
    pub disconnect_grace_period: Duration,
    /// if set, the server disconnects peers that did not send any data for this long
    pub idle_timeout: Option<Duration>,
    /// capacity of the broadcast channels for lifecycle events. Subscribers that fall behind by
    ///  more than this number of events miss events.
    pub event_buffer_size: usize,

    channels: Vec<DeliveryMode>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::new()
    }
}

impl SessionConfig {
    pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 0.03333;

    pub fn new() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_secs_f64(Self::DEFAULT_POLL_INTERVAL_SECS),
            connect_timeout: Duration::from_millis(25000),
            disconnect_grace_period: Duration::from_millis(100),
            idle_timeout: None,
            event_buffer_size: 1024,
            channels: vec![DeliveryMode::Reliable, DeliveryMode::Unreliable],
        }
    }

    pub fn with_poll_interval_secs(mut self, secs: f64) -> anyhow::Result<SessionConfig> {
        if !secs.is_finite() || secs <= 0.0 {
            bail!("poll interval must be a positive number of seconds, was {}", secs);
        }
        self.poll_interval = match Duration::try_from_secs_f64(secs) {
            Ok(poll_interval) => poll_interval,
            Err(e) => bail!("invalid poll interval of {} seconds: {}", secs, e),
        };
        Ok(self)
    }

    /// Sets the delivery mode per user data channel. Channel 0 is always reliable: a different
    ///  mode for it is overridden. An empty list falls back to the default channels.
    pub fn with_channels(mut self, channels: Vec<DeliveryMode>) -> SessionConfig {
        if channels.is_empty() {
            warn!("no channels configured - using default channels");
            return self;
        }

        self.channels = channels;
        if !self.channels[0].is_reliable() {
            warn!("channel 0 was configured as {:?}, it is always reliable", self.channels[0]);
        }
        self.channels[0] = DeliveryMode::Reliable;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("at least one channel must be configured");
        }
        if self.channels.len() > CONTROL_CHANNEL as usize {
            bail!("{} channels are configured, but channel {} is reserved for control messages", self.channels.len(), CONTROL_CHANNEL);
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must not be zero");
        }
        if self.event_buffer_size == 0 {
            bail!("event buffer size must not be zero");
        }
        Ok(())
    }

    pub fn channels(&self) -> &[DeliveryMode] {
        &self.channels
    }

    pub fn num_channels(&self) -> Channel {
        // validate() ensures the number of channels fits
        self.channels.len() as Channel
    }

    /// Resolves the channel to actually send on, and its delivery mode. Channels outside the
    ///  configured range fall back to channel 0, which is reliable.
    pub fn delivery_mode(&self, channel: Channel) -> (Channel, DeliveryMode) {
        match self.channels.get(channel as usize) {
            Some(&mode) => (channel, mode),
            None => {
                error!("unknown channel id {} - sending via reliable channel 0 instead", channel);
                (0, DeliveryMode::Reliable)
            }
        }
    }

    pub fn max_packet_size(&self, channel: Channel) -> usize {
        self.channels.get(channel as usize)
            .unwrap_or(&DeliveryMode::Reliable)
            .max_packet_size()
    }
}
