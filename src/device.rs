//! Headset models.
//!
//! Each model is a plain [`DeviceProfile`] value picked by [`DeviceType`]; there is
//! no per-model behaviour beyond what the profile describes.

use serde::{Deserialize, Serialize};

use crate::acquisition::FrameLayout;
use crate::codec::{TransportKind, FRAME_INDEX_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceType {
    /// Two-channel consumer headset, streams over BLE.
    #[default]
    Melomind,
    /// Eight-channel research headset, streams over USB.
    VPro,
}

/// Static description of a headset model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_type: DeviceType,
    pub channel_count: usize,
    /// Acquisition electrodes in channel order.
    pub electrodes: Vec<String>,
    pub references: Vec<String>,
    pub grounds: Vec<String>,
    /// Samples per second per channel.
    pub sample_rate: u16,
    pub transport: TransportKind,
    /// Status bytes following the frame index (0, 1 or 2).
    pub status_bytes: usize,
    /// Sample slots carried by a complete frame.
    pub slots_per_frame: usize,
}

impl DeviceProfile {
    pub fn melomind() -> Self {
        Self {
            device_type: DeviceType::Melomind,
            channel_count: 2,
            electrodes: names(&["P3", "P4"]),
            references: names(&["M1"]),
            grounds: names(&["M2"]),
            sample_rate: 250,
            transport: TransportKind::Ble,
            status_bytes: 1,
            slots_per_frame: 4,
        }
    }

    pub fn vpro() -> Self {
        Self {
            device_type: DeviceType::VPro,
            channel_count: 8,
            electrodes: names(&["Fp1", "Fp2", "F3", "F4", "C3", "C4", "O1", "O2"]),
            references: names(&["M1"]),
            grounds: names(&["M2"]),
            sample_rate: 250,
            transport: TransportKind::Usb,
            status_bytes: 2,
            slots_per_frame: 5,
        }
    }

    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            transport: self.transport,
            channel_count: self.channel_count,
            status_bytes: self.status_bytes,
            slots_per_frame: self.slots_per_frame,
        }
    }

    /// Size in bytes of a complete EEG frame.
    pub fn frame_size(&self) -> usize {
        FRAME_INDEX_SIZE
            + self.status_bytes
            + self.slots_per_frame * self.channel_count * self.transport.sample_width()
    }
}

impl From<DeviceType> for DeviceProfile {
    fn from(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Melomind => DeviceProfile::melomind(),
            DeviceType::VPro => DeviceProfile::vpro(),
        }
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_are_consistent() {
        for device_type in [DeviceType::Melomind, DeviceType::VPro] {
            let profile = DeviceProfile::from(device_type);
            assert_eq!(profile.device_type, device_type);
            assert_eq!(profile.electrodes.len(), profile.channel_count);
            assert!(profile.slots_per_frame <= profile.status_bytes * 8);
        }
    }

    #[test]
    fn melomind_frame_fits_a_ble_notification() {
        assert_eq!(DeviceProfile::melomind().frame_size(), 19);
        assert_eq!(DeviceProfile::vpro().frame_size(), 124);
    }
}
