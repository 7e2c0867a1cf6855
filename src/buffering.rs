//! Two-stage buffering: pending raw records and the consolidated packet.
//!
//! The pending buffer collects [`SampleRecord`]s until it holds `capacity`
//! entries, then hands the whole run over for decoding and starts empty again.
//! Decoded runs are appended to the [`ConsolidatedBuffer`], which emits a frozen
//! copy every time it fills up to the notification threshold; whatever did not
//! fit seeds the next packet.

use std::mem;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::acquisition::{FrameLayout, SampleRecord};
use crate::codec;
use crate::errors::PipelineError;

// ============================================================================
// Pending raw buffer
// ============================================================================

#[derive(Debug, Clone)]
pub struct PendingBuffer {
    records: Vec<SampleRecord>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append records; once the buffer reaches capacity its whole content is
    /// returned and the buffer is left empty.
    pub fn push(&mut self, records: Vec<SampleRecord>) -> Option<Vec<SampleRecord>> {
        self.records.extend(records);
        if self.records.len() >= self.capacity {
            Some(mem::replace(
                &mut self.records,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

// ============================================================================
// Decode step
// ============================================================================

/// A run of decoded slots: a channel × time matrix and the per-slot status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBlock {
    pub channels: Vec<Vec<f32>>,
    pub status: Vec<f32>,
}

impl DecodedBlock {
    /// Number of time columns.
    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}

/// Convert records to volts. Loss markers become NaN on every channel.
pub fn decode_records(records: &[SampleRecord], layout: &FrameLayout) -> DecodedBlock {
    let width = layout.transport.sample_width();
    let mut channels = vec![Vec::with_capacity(records.len()); layout.channel_count];
    let mut status = Vec::with_capacity(records.len());

    for record in records {
        match record {
            SampleRecord::LostPacketMarker => {
                for channel in channels.iter_mut() {
                    channel.push(f32::NAN);
                }
                status.push(f32::NAN);
            }
            SampleRecord::Valid { raw, status: bit } => {
                let mut words = raw.chunks_exact(width);
                for channel in channels.iter_mut() {
                    let volts = match words.next() {
                        Some(word) => codec::decode_channel_sample(word, layout.transport)
                            .unwrap_or_else(|e| {
                                warn!("undecodable sample word: {}", e);
                                f32::NAN
                            }),
                        None => {
                            warn!("record of {} bytes is short for {} channels", raw.len(), layout.channel_count);
                            f32::NAN
                        }
                    };
                    channel.push(volts);
                }
                status.push(*bit);
            }
        }
    }

    DecodedBlock { channels, status }
}

// ============================================================================
// Consolidated packet buffer
// ============================================================================

/// A frozen, client-visible run of exactly `threshold` decoded slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedPacket {
    pub channels: Vec<Vec<f32>>,
    pub status: Vec<f32>,
}

impl ConsolidatedPacket {
    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}

/// Accumulates decoded blocks up to the client-notification threshold.
#[derive(Debug, Clone)]
pub struct ConsolidatedBuffer {
    channels: Vec<Vec<f32>>,
    status: Vec<f32>,
    threshold: usize,
}

impl ConsolidatedBuffer {
    pub fn new(channel_count: usize, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            channels: vec![Vec::with_capacity(threshold); channel_count],
            status: Vec::with_capacity(threshold),
            threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Append a decoded block, returning every packet completed on the way.
    ///
    /// With `room = threshold - len`: a block that fits is appended, and the
    /// buffer is emitted as soon as it reaches the threshold. A larger block fills
    /// the remaining room, the full buffer is emitted as a copy, and the rest
    /// seeds a fresh buffer. An empty packet is never produced.
    ///
    /// A block whose shape does not match the buffer is rejected as a whole.
    pub fn append(&mut self, block: &DecodedBlock) -> Result<Vec<ConsolidatedPacket>, PipelineError> {
        self.check_shape(block)?;
        debug_assert!(self.len() < self.threshold, "consolidated buffer kept a full packet");

        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < block.len() {
            let room = self.threshold - self.len();
            if room == 0 {
                packets.push(self.freeze());
                continue;
            }

            let end = offset + room.min(block.len() - offset);
            for (dst, src) in self.channels.iter_mut().zip(&block.channels) {
                dst.extend_from_slice(&src[offset..end]);
            }
            self.status.extend_from_slice(&block.status[offset..end]);
            offset = end;

            if self.len() == self.threshold {
                packets.push(self.freeze());
            }
        }

        Ok(packets)
    }

    fn check_shape(&self, block: &DecodedBlock) -> Result<(), PipelineError> {
        let ragged = block.channels.iter().any(|c| c.len() != block.status.len());
        if block.channels.len() != self.channels.len() || ragged {
            let err = PipelineError::BlockShape {
                channels: block.channels.len(),
                expected: self.channels.len(),
                lengths: block.channels.iter().map(Vec::len).collect(),
                slots: block.status.len(),
            };
            warn!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Copy the current content out and start over with an empty buffer.
    fn freeze(&mut self) -> ConsolidatedPacket {
        let packet = ConsolidatedPacket {
            channels: self.channels.clone(),
            status: self.status.clone(),
        };
        self.clear();
        packet
    }

    pub fn clear(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.clear();
        }
        self.status.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TransportKind;

    fn block(start: usize, n: usize) -> DecodedBlock {
        let values: Vec<f32> = (start..start + n).map(|v| v as f32).collect();
        DecodedBlock {
            channels: vec![values.clone()],
            status: vec![1.0; n],
        }
    }

    #[test]
    fn pending_hands_over_at_capacity() {
        let mut pending = PendingBuffer::new(3);
        assert!(pending.push(vec![SampleRecord::LostPacketMarker; 2]).is_none());
        let taken = pending.push(vec![SampleRecord::LostPacketMarker; 2]).unwrap();
        assert_eq!(taken.len(), 4);
        assert!(pending.is_empty());
    }

    #[test]
    fn decode_maps_markers_to_nan() {
        let layout = FrameLayout {
            transport: TransportKind::Ble,
            channel_count: 2,
            status_bytes: 1,
            slots_per_frame: 1,
        };
        let records = vec![
            SampleRecord::Valid {
                raw: vec![0x00, 0x01, 0xFF, 0xFF],
                status: 1.0,
            },
            SampleRecord::LostPacketMarker,
        ];
        let decoded = decode_records(&records, &layout);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.channels[0][0], TransportKind::Ble.volts_per_count());
        assert_eq!(decoded.channels[1][0], -TransportKind::Ble.volts_per_count());
        assert!(decoded.channels[0][1].is_nan());
        assert!(decoded.channels[1][1].is_nan());
        assert_eq!(decoded.status[0], 1.0);
        assert!(decoded.status[1].is_nan());
    }

    #[test]
    fn block_that_fits_is_not_emitted() {
        let mut buffer = ConsolidatedBuffer::new(1, 10);
        assert!(buffer.append(&block(0, 4)).unwrap().is_empty());
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn exact_fill_emits_immediately() {
        let mut buffer = ConsolidatedBuffer::new(1, 10);
        buffer.append(&block(0, 4)).unwrap();
        let packets = buffer.append(&block(4, 6)).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channels[0], (0..10).map(|v| v as f32).collect::<Vec<_>>());
        assert!(buffer.is_empty());

        let packets = buffer.append(&block(10, 10)).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn mismatched_channel_count_is_rejected() {
        let mut buffer = ConsolidatedBuffer::new(2, 4);
        let err = buffer.append(&block(0, 3)).unwrap_err();
        assert_eq!(
            err,
            PipelineError::BlockShape {
                channels: 1,
                expected: 2,
                lengths: vec![3],
                slots: 3
            }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn channel_shorter_than_status_is_rejected() {
        let mut buffer = ConsolidatedBuffer::new(1, 4);
        let ragged = DecodedBlock {
            channels: vec![vec![0.5]],
            status: vec![1.0; 3],
        };
        assert!(matches!(
            buffer.append(&ragged),
            Err(PipelineError::BlockShape { slots: 3, .. })
        ));
        assert!(buffer.is_empty());
        // The buffer keeps working afterwards.
        assert_eq!(buffer.append(&block(0, 4)).unwrap().len(), 1);
    }

    #[test]
    fn overflow_is_carried_into_next_packet() {
        let mut buffer = ConsolidatedBuffer::new(1, 10);
        buffer.append(&block(0, 7)).unwrap();
        let packets = buffer.append(&block(7, 5)).unwrap();

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 10);
        assert_eq!(packets[0].channels[0], (0..10).map(|v| v as f32).collect::<Vec<_>>());
        assert_eq!(buffer.len(), 2);

        let next = buffer.append(&block(12, 8)).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].channels[0], (10..20).map(|v| v as f32).collect::<Vec<_>>());
        assert!(buffer.is_empty());
    }

    #[test]
    fn block_of_exactly_threshold_emits_once() {
        let mut buffer = ConsolidatedBuffer::new(1, 3);
        assert_eq!(buffer.append(&block(0, 3)).unwrap().len(), 1);
        assert!(buffer.append(&block(3, 1)).unwrap().is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn large_block_emits_several_packets() {
        let mut buffer = ConsolidatedBuffer::new(1, 4);
        let packets = buffer.append(&block(0, 10)).unwrap();
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.len() == 4));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn empty_block_never_emits() {
        let mut buffer = ConsolidatedBuffer::new(1, 2);
        buffer.append(&block(0, 1)).unwrap();
        assert!(buffer.append(&DecodedBlock {
            channels: vec![vec![]],
            status: vec![],
        })
        .unwrap()
        .is_empty());
    }

    #[test]
    fn emitted_packet_is_detached_from_the_buffer() {
        let mut buffer = ConsolidatedBuffer::new(1, 2);
        let packets = buffer.append(&block(0, 3)).unwrap();
        buffer.append(&block(100, 1)).unwrap();
        assert_eq!(packets[0].channels[0], vec![0.0, 1.0]);
    }
}
