//! Bit-level codec for headset frames.
//!
//! Everything in here is stateless: raw sample words to volts, DC-offset
//! telemetry words, outbound command frames, and the mailbox opcode table.
//!
//! # Sample words
//!
//! A channel sample is a big-endian two's-complement word whose width depends on
//! the transport. Decoding assembles the bytes, drops `shift` low bits, then
//! sign-extends by hand: if the sign bit is set the upper negative-mask bits are
//! OR-ed in, otherwise the word is AND-ed with the positive mask. The result is
//! scaled by a fixed volts-per-count constant reflecting amplifier gain and ADC
//! resolution.

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

// ============================================================================
// Constants
// ============================================================================

/// Size of the big-endian frame index at the start of every frame.
pub const FRAME_INDEX_SIZE: usize = 2;

/// Melomind BLE link: 16-bit ADC words, gain 8.
const VOLTAGE_BLE: f32 = 0.286e-6 / 8.0;

/// VPro USB link: 24-bit ADC words, 4.5 V reference, gain 24.
const VOLTAGE_USB: f32 = 4.5 / 24.0 / 8_388_607.0;

/// DC-offset telemetry: 12-bit words against a 2.4 V reference.
const VOLTAGE_DC_OFFSET: f32 = 2.4 / 2048.0;

const DC_OFFSET_WIDTH: usize = 2;
const DC_OFFSET_SHIFT: u32 = 4;

/// First byte of every outbound command frame.
pub const COMMAND_START_MARKER: u8 = 0x3C;

/// Written in place of the checksum; the firmware recomputes it on its side.
pub const CHECKSUM_PLACEHOLDER: u8 = 0x00;

/// Header bytes preceding the payload of a command frame.
pub const COMMAND_HEADER_SIZE: usize = 7;

// ============================================================================
// Sample words
// ============================================================================

/// Physical link a frame arrived on. Selects word width and scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth Low Energy notifications (Melomind).
    #[default]
    Ble,
    /// USB bulk transfers (VPro).
    Usb,
}

/// Sign-extension parameters for one word family.
#[derive(Debug, Clone, Copy)]
struct WordFormat {
    width: usize,
    shift: u32,
    volts_per_count: f32,
}

impl WordFormat {
    fn bits(self) -> u32 {
        (self.width as u32) * 8 - self.shift
    }

    fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    fn negative_mask(self) -> u32 {
        u32::MAX << self.bits()
    }

    fn positive_mask(self) -> u32 {
        !self.negative_mask()
    }

    fn decode_counts(self, raw: &[u8]) -> Result<i32, DecodeError> {
        if raw.len() != self.width {
            return Err(DecodeError::InvalidLength {
                expected: self.width,
                actual: raw.len(),
            });
        }

        let word = raw
            .iter()
            .fold(0u32, |acc, &byte| (acc << 8) | byte as u32)
            >> self.shift;

        let extended = if word & self.sign_bit() != 0 {
            word | self.negative_mask()
        } else {
            word & self.positive_mask()
        };

        Ok(extended as i32)
    }

    fn decode(self, raw: &[u8]) -> Result<f32, DecodeError> {
        Ok(self.decode_counts(raw)? as f32 * self.volts_per_count)
    }
}

const DC_OFFSET_FORMAT: WordFormat = WordFormat {
    width: DC_OFFSET_WIDTH,
    shift: DC_OFFSET_SHIFT,
    volts_per_count: VOLTAGE_DC_OFFSET,
};

impl TransportKind {
    fn format(self) -> WordFormat {
        match self {
            TransportKind::Ble => WordFormat {
                width: 2,
                shift: 0,
                volts_per_count: VOLTAGE_BLE,
            },
            TransportKind::Usb => WordFormat {
                width: 3,
                shift: 0,
                volts_per_count: VOLTAGE_USB,
            },
        }
    }

    /// Bytes per channel per sample slot.
    pub fn sample_width(self) -> usize {
        self.format().width
    }

    /// Volts represented by one ADC count.
    pub fn volts_per_count(self) -> f32 {
        self.format().volts_per_count
    }
}

/// Read the big-endian frame index from the first two bytes.
pub fn decode_frame_index(frame: &[u8]) -> Result<u16, DecodeError> {
    match frame {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InvalidLength {
            expected: FRAME_INDEX_SIZE,
            actual: frame.len(),
        }),
    }
}

/// Decode one channel sample into volts.
pub fn decode_channel_sample(raw: &[u8], kind: TransportKind) -> Result<f32, DecodeError> {
    kind.format().decode(raw)
}

/// Decode one channel sample into signed ADC counts, without scaling.
pub fn decode_channel_counts(raw: &[u8], kind: TransportKind) -> Result<i32, DecodeError> {
    kind.format().decode_counts(raw)
}

/// Decode one DC-offset telemetry word into volts.
pub fn decode_dc_offset(raw: &[u8]) -> Result<f32, DecodeError> {
    DC_OFFSET_FORMAT.decode(raw)
}

// ============================================================================
// Command frames
// ============================================================================

/// An outbound command before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: u8,
    pub packet_id: u16,
    pub payload: Vec<u8>,
}

impl CommandFrame {
    pub fn new(opcode: MailboxOpcode, packet_id: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode as u8,
            packet_id,
            payload,
        }
    }
}

/// Concatenate the framing fields and payload into one outbound buffer.
///
/// Layout: `<start marker> <payload length u16 BE> <opcode> <checksum placeholder>
/// <packet id u16 BE> <payload...>`. Payloads longer than `u16::MAX` bytes are
/// rejected.
pub fn assemble_command_frame(frame: &CommandFrame) -> Result<Vec<u8>, DecodeError> {
    let len = u16::try_from(frame.payload.len()).map_err(|_| DecodeError::PayloadTooLarge {
        len: frame.payload.len(),
    })?;
    let mut out = Vec::with_capacity(COMMAND_HEADER_SIZE + frame.payload.len());
    out.push(COMMAND_START_MARKER);
    out.extend_from_slice(&len.to_be_bytes());
    out.push(frame.opcode);
    out.push(CHECKSUM_PLACEHOLDER);
    out.extend_from_slice(&frame.packet_id.to_be_bytes());
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

// ============================================================================
// Mailbox
// ============================================================================

/// Mailbox opcodes understood by the headset firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MailboxOpcode {
    StartOtaTransfer = 0x03,
    OtaModeEvent = 0x05,
    OtaIndexResetEvent = 0x06,
    OtaStatusEvent = 0x07,
    SystemRebootEvent = 0x09,
}

impl MailboxOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(MailboxOpcode::StartOtaTransfer),
            0x05 => Some(MailboxOpcode::OtaModeEvent),
            0x06 => Some(MailboxOpcode::OtaIndexResetEvent),
            0x07 => Some(MailboxOpcode::OtaStatusEvent),
            0x09 => Some(MailboxOpcode::SystemRebootEvent),
            _ => None,
        }
    }
}

/// A device-to-host mailbox notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxEvent {
    /// Answer to the update request.
    OtaMode { accepted: bool },
    /// The device missed a packet and asks for it again.
    OtaIndexReset { index: u16 },
    /// CRC readback after the last packet.
    OtaStatus { crc_ok: bool },
    SystemReboot,
    /// Any opcode not in the table. Kept so callers can log it.
    Unknown { opcode: u8, payload: Vec<u8> },
}

impl MailboxEvent {
    /// Parse `<opcode> <payload...>`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&opcode, payload) = bytes.split_first().ok_or(DecodeError::InvalidLength {
            expected: 1,
            actual: 0,
        })?;

        let first = |payload: &[u8]| {
            payload.first().copied().ok_or(DecodeError::InvalidLength {
                expected: 2,
                actual: bytes.len(),
            })
        };

        let event = match MailboxOpcode::from_u8(opcode) {
            Some(MailboxOpcode::OtaModeEvent) => MailboxEvent::OtaMode {
                accepted: first(payload)? != 0,
            },
            Some(MailboxOpcode::OtaStatusEvent) => MailboxEvent::OtaStatus {
                crc_ok: first(payload)? != 0,
            },
            Some(MailboxOpcode::OtaIndexResetEvent) => match payload {
                [lo, hi, ..] => MailboxEvent::OtaIndexReset {
                    index: u16::from_le_bytes([*lo, *hi]),
                },
                _ => {
                    return Err(DecodeError::InvalidLength {
                        expected: 3,
                        actual: bytes.len(),
                    })
                }
            },
            Some(MailboxOpcode::SystemRebootEvent) => MailboxEvent::SystemReboot,
            Some(MailboxOpcode::StartOtaTransfer) | None => MailboxEvent::Unknown {
                opcode,
                payload: payload.to_vec(),
            },
        };
        Ok(event)
    }
}
