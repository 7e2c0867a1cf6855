//! Tunables for the acquisition pipeline and the firmware updater.
//!
//! Plain structs with public fields. Hosts usually embed them in their own
//! configuration and deserialize them with whatever format they already use.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceProfile;

/// Records collected before a decode run is started.
const DEFAULT_PENDING_CAPACITY: usize = 40;

/// Slots per emitted packet; one second at 250 Hz.
const DEFAULT_NOTIFICATION_THRESHOLD: usize = 250;

/// Payload bytes per OAD packet; with the 2-byte index this fills a 20-byte BLE write.
const DEFAULT_CHUNK_SIZE: usize = 18;
const DEFAULT_MAX_PACKET_RETRIES: u32 = 3;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RECONNECT_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity `C` of the pending raw buffer.
    pub pending_capacity: usize,
    /// Threshold `T` of the consolidated packet buffer.
    pub notification_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            notification_threshold: DEFAULT_NOTIFICATION_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    /// One packet per second of signal for the given headset.
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        Self {
            pending_capacity: profile.slots_per_frame * 10,
            notification_threshold: profile.sample_rate as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OadConfig {
    pub chunk_size: usize,
    /// Write attempts per packet before the transfer is abandoned.
    pub max_packet_retries: u32,
    pub max_reconnect_attempts: u32,
    pub ack_timeout: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for OadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_packet_retries: DEFAULT_MAX_PACKET_RETRIES,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            reconnect_timeout: Duration::from_secs(DEFAULT_RECONNECT_TIMEOUT_SECS),
        }
    }
}
