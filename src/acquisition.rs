//! Acquisition stage: raw frames to ordered sample records.
//!
//! # Frame layout
//!
//! ```text
//! <index u16 BE> <status bytes (0..=2)> <slot 0: ch0 ch1 ...> <slot 1: ...> ...
//! ```
//!
//! Each status byte carries one bit per sample slot, least significant bit first;
//! slot `n` reads bit `n % 8` of status byte `n / 8`. Without status bytes the
//! status of every slot is undeterminable and reported as NaN.
//!
//! Lost frames are detected from the index and replaced by one
//! [`SampleRecord::LostPacketMarker`] per slot of a complete frame, so the
//! downstream time axis stays uniform.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{self, TransportKind, FRAME_INDEX_SIZE};
use crate::errors::DecodeError;
use crate::sequence::SequenceTracker;

/// Upper bound on slots per frame; two status bytes address sixteen slots.
pub const MAX_SLOTS_PER_FRAME: usize = 16;

const DC_OFFSET_WORD: usize = 2;

/// Byte layout of the EEG frames of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub transport: TransportKind,
    pub channel_count: usize,
    pub status_bytes: usize,
    pub slots_per_frame: usize,
}

impl FrameLayout {
    /// Bytes per sample slot across all channels.
    pub fn stride(&self) -> usize {
        self.transport.sample_width() * self.channel_count
    }

    /// Index plus status bytes.
    pub fn header_size(&self) -> usize {
        FRAME_INDEX_SIZE + self.status_bytes
    }

    /// Largest slot count a frame may carry.
    pub fn max_slots(&self) -> usize {
        if self.status_bytes == 0 {
            MAX_SLOTS_PER_FRAME
        } else {
            (self.status_bytes * 8).min(MAX_SLOTS_PER_FRAME)
        }
    }

    /// Check the frame shape and return its slot count.
    fn validate(&self, frame: &[u8]) -> Result<usize, DecodeError> {
        let header = self.header_size();
        if frame.len() < header {
            return Err(DecodeError::InvalidLength {
                expected: header,
                actual: frame.len(),
            });
        }

        let len = frame.len() - header;
        let stride = self.stride();
        if stride == 0 || len % stride != 0 {
            return Err(DecodeError::Misaligned { len, stride });
        }

        let slots = len / stride;
        if slots > self.max_slots() {
            return Err(DecodeError::TooManySlots {
                slots,
                max: self.max_slots(),
            });
        }
        Ok(slots)
    }
}

/// One sample slot as delivered to the buffering stage.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleRecord {
    /// Raw channel words of one slot, concatenated in channel order, and the
    /// slot's status bit (`0.0`, `1.0`, or NaN when undeterminable).
    Valid { raw: Vec<u8>, status: f32 },
    /// Placeholder for a slot of a lost frame; decodes to NaN on every channel.
    LostPacketMarker,
}

impl SampleRecord {
    pub fn is_lost(&self) -> bool {
        matches!(self, SampleRecord::LostPacketMarker)
    }
}

/// Per-channel DC offsets from the low-rate telemetry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcOffsetReading {
    pub index: u16,
    /// Volts, one per channel.
    pub offsets: Vec<f32>,
}

/// Counters since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    pub frames: u64,
    pub rejected: u64,
    /// Frames reported missing by the sequence tracker.
    pub lost: u64,
}

/// Splits frames into [`SampleRecord`]s, inserting loss markers for gaps.
///
/// Not thread safe on purpose: the pipeline holds it behind the lock that
/// serializes frame handling, which keeps the tracker and record order consistent.
#[derive(Debug, Clone)]
pub struct Acquisition {
    layout: FrameLayout,
    tracker: SequenceTracker,
    stats: AcquisitionStats,
}

impl Acquisition {
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            tracker: SequenceTracker::new(),
            stats: AcquisitionStats::default(),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats
    }

    /// Turn one raw frame into its ordered records, loss markers first.
    ///
    /// Malformed frames are rejected before the tracker sees them; the next valid
    /// frame then accounts for the gap.
    pub fn on_frame(&mut self, frame: &[u8]) -> Result<Vec<SampleRecord>, DecodeError> {
        let slots = match self.layout.validate(frame) {
            Ok(slots) => slots,
            Err(e) => {
                self.stats.rejected += 1;
                warn!("dropping malformed frame ({} bytes): {}", frame.len(), e);
                return Err(e);
            }
        };

        let index = codec::decode_frame_index(frame)?;
        let missed = self.tracker.observe(index) as usize;
        self.stats.frames += 1;
        self.stats.lost += missed as u64;

        let mut records = Vec::with_capacity(missed * self.layout.slots_per_frame + slots);
        if missed > 0 {
            debug!(
                "frame {} follows {} lost frames, inserting {} markers",
                index,
                missed,
                missed * self.layout.slots_per_frame
            );
            records.resize(missed * self.layout.slots_per_frame, SampleRecord::LostPacketMarker);
        }

        let header = self.layout.header_size();
        let status = &frame[FRAME_INDEX_SIZE..header];
        let stride = self.layout.stride();

        for (slot, raw) in frame[header..].chunks_exact(stride).enumerate() {
            records.push(SampleRecord::Valid {
                raw: raw.to_vec(),
                status: status_bit(status, slot),
            });
        }

        Ok(records)
    }

    /// Decode a DC-offset telemetry frame: index followed by one word per channel.
    pub fn on_dc_offset_frame(&self, frame: &[u8]) -> Result<DcOffsetReading, DecodeError> {
        let expected = FRAME_INDEX_SIZE + DC_OFFSET_WORD * self.layout.channel_count;
        if frame.len() != expected {
            return Err(DecodeError::InvalidLength {
                expected,
                actual: frame.len(),
            });
        }

        let index = codec::decode_frame_index(frame)?;
        let offsets = frame[FRAME_INDEX_SIZE..]
            .chunks_exact(DC_OFFSET_WORD)
            .map(codec::decode_dc_offset)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DcOffsetReading { index, offsets })
    }

    /// Forget the sequence history and counters, e.g. on stream restart.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.stats = AcquisitionStats::default();
    }
}

fn status_bit(status: &[u8], slot: usize) -> f32 {
    match status.get(slot / 8) {
        Some(byte) => ((byte >> (slot % 8)) & 0x01) as f32,
        None => f32::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(status_bytes: usize, channels: usize, slots: usize) -> FrameLayout {
        FrameLayout {
            transport: TransportKind::Ble,
            channel_count: channels,
            status_bytes,
            slots_per_frame: slots,
        }
    }

    fn frame(index: u16, status: &[u8], samples: &[i16]) -> Vec<u8> {
        let mut out = index.to_be_bytes().to_vec();
        out.extend_from_slice(status);
        for s in samples {
            out.extend_from_slice(&s.to_be_bytes());
        }
        out
    }

    #[test]
    fn splits_slots_and_channels() {
        let mut acq = Acquisition::new(layout(1, 2, 2));
        let records = acq.on_frame(&frame(1, &[0b10], &[1, 2, 3, 4])).unwrap();
        assert_eq!(
            records,
            vec![
                SampleRecord::Valid {
                    raw: vec![0, 1, 0, 2],
                    status: 0.0
                },
                SampleRecord::Valid {
                    raw: vec![0, 3, 0, 4],
                    status: 1.0
                },
            ]
        );
    }

    #[test]
    fn missing_status_is_nan() {
        let mut acq = Acquisition::new(layout(0, 1, 2));
        let records = acq.on_frame(&frame(1, &[], &[7, 8])).unwrap();
        assert_eq!(records.len(), 2);
        for record in records {
            match record {
                SampleRecord::Valid { status, .. } => assert!(status.is_nan()),
                SampleRecord::LostPacketMarker => panic!("unexpected marker"),
            }
        }
    }

    #[test]
    fn second_status_byte_covers_slots_eight_and_up() {
        let mut acq = Acquisition::new(layout(2, 1, 10));
        let samples: Vec<i16> = (0..10).collect();
        let records = acq.on_frame(&frame(1, &[0x00, 0b10], &samples)).unwrap();
        let statuses: Vec<f32> = records
            .iter()
            .map(|r| match r {
                SampleRecord::Valid { status, .. } => *status,
                SampleRecord::LostPacketMarker => f32::NAN,
            })
            .collect();
        assert_eq!(statuses[8], 0.0);
        assert_eq!(statuses[9], 1.0);
    }

    #[test]
    fn gap_inserts_markers_for_whole_frames() {
        let mut acq = Acquisition::new(layout(1, 1, 2));
        acq.on_frame(&frame(5, &[0], &[1, 2])).unwrap();
        let records = acq.on_frame(&frame(8, &[0], &[3, 4])).unwrap();
        assert_eq!(records.len(), 2 * 2 + 2);
        assert!(records[..4].iter().all(SampleRecord::is_lost));
        assert!(!records[4].is_lost());
        assert_eq!(
            acq.stats(),
            AcquisitionStats {
                frames: 2,
                rejected: 0,
                lost: 2
            }
        );
    }

    #[test]
    fn malformed_frames_are_rejected_without_touching_the_tracker() {
        let mut acq = Acquisition::new(layout(1, 2, 2));
        assert_eq!(
            acq.on_frame(&[0x00, 0x01]),
            Err(DecodeError::InvalidLength {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(
            acq.on_frame(&[0x00, 0x01, 0x00, 0xAA, 0xBB, 0xCC]),
            Err(DecodeError::Misaligned { len: 3, stride: 4 })
        );
        assert_eq!(acq.stats().rejected, 2);

        // The rejected frames did not seed the tracker.
        let records = acq.on_frame(&frame(9, &[0], &[1, 2])).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn too_many_slots_for_status_bits() {
        let mut acq = Acquisition::new(layout(1, 1, 8));
        let samples: Vec<i16> = (0..9).collect();
        assert_eq!(
            acq.on_frame(&frame(1, &[0], &samples)),
            Err(DecodeError::TooManySlots { slots: 9, max: 8 })
        );

        let mut acq = Acquisition::new(layout(0, 1, 8));
        let samples: Vec<i16> = (0..17).collect();
        assert_eq!(
            acq.on_frame(&frame(1, &[], &samples)),
            Err(DecodeError::TooManySlots { slots: 17, max: 16 })
        );
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut acq = Acquisition::new(layout(0, 1, 1));
        acq.on_frame(&frame(1, &[], &[1])).unwrap();
        acq.reset();
        let records = acq.on_frame(&frame(100, &[], &[1])).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(acq.stats().frames, 1);
    }

    #[test]
    fn dc_offset_frame() {
        let acq = Acquisition::new(layout(1, 2, 4));
        let reading = acq.on_dc_offset_frame(&[0x00, 0x07, 0x00, 0x10, 0xFF, 0xF0]).unwrap();
        assert_eq!(reading.index, 7);
        assert_eq!(reading.offsets.len(), 2);
        assert!(reading.offsets[0] > 0.0);
        assert!(reading.offsets[1] < 0.0);
        assert!(acq.on_dc_offset_frame(&[0x00, 0x07, 0x00]).is_err());
    }
}
