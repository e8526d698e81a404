//! Hub configuration: queue capacities, timings and limits

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by the hub, its connections and the middleware pipeline.
///
/// Constructed once at startup and handed to each component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Capacity of the hub's broadcast ingress
    #[serde(default = "default_broadcast_buffer")]
    pub broadcast_buffer: usize,
    /// Capacity of the register/unregister mailboxes
    #[serde(default = "default_register_buffer")]
    pub register_buffer: usize,
    /// Capacity of each connection's outbound message queue
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Capacity of each connection's outbound token queue
    #[serde(default = "default_token_buffer")]
    pub token_buffer: usize,
    /// Capacity of the middleware pipeline ingress
    #[serde(default = "default_pipeline_buffer")]
    pub pipeline_buffer: usize,
    /// Sliding session lifetime, refreshed on each delivery attempt
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Time allowed for a single write to the transport
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
    /// Time allowed between pongs before the peer is considered dead
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    /// Largest inbound frame accepted, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Fill ratio of the outbound queue above which a warning is logged
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    /// Attempts made to mint a token that is not already in use
    #[serde(default = "default_token_attempts")]
    pub token_attempts: usize,
}

fn default_broadcast_buffer() -> usize {
    512
}
fn default_register_buffer() -> usize {
    64
}
fn default_send_buffer() -> usize {
    1024
}
fn default_token_buffer() -> usize {
    1
}
fn default_pipeline_buffer() -> usize {
    256
}
fn default_session_ttl_secs() -> u64 {
    3600
}
fn default_write_wait_secs() -> u64 {
    100
}
fn default_pong_wait_secs() -> u64 {
    600
}
fn default_max_message_size() -> usize {
    8192
}
fn default_warning_ratio() -> f64 {
    0.9
}
fn default_token_attempts() -> usize {
    8
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_buffer: default_broadcast_buffer(),
            register_buffer: default_register_buffer(),
            send_buffer: default_send_buffer(),
            token_buffer: default_token_buffer(),
            pipeline_buffer: default_pipeline_buffer(),
            session_ttl_secs: default_session_ttl_secs(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            max_message_size: default_max_message_size(),
            warning_ratio: default_warning_ratio(),
            token_attempts: default_token_attempts(),
        }
    }
}

impl HubConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keepalive period. Always shorter than the pong wait so a healthy peer
    /// answers before its read deadline lapses.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    /// Queue length above which the outbound queue is in its red zone.
    pub fn warning_threshold(&self) -> usize {
        (self.send_buffer as f64 * self.warning_ratio).floor() as usize
    }

    /// Clamp values that would make the channels unusable.
    pub fn normalized(mut self) -> Self {
        self.broadcast_buffer = self.broadcast_buffer.max(1);
        self.register_buffer = self.register_buffer.max(1);
        self.send_buffer = self.send_buffer.max(1);
        self.token_buffer = self.token_buffer.max(1);
        self.pipeline_buffer = self.pipeline_buffer.max(1);
        self.token_attempts = self.token_attempts.max(1);
        self.warning_ratio = self.warning_ratio.clamp(0.0, 1.0);
        self
    }
}
