//! Acquisition core for mbt EEG headsets.
//!
//! This crate turns raw transport frames into calibrated, gap-aware packets of
//! EEG signal, tracks the connection lifecycle of a headset, and drives
//! over-the-air firmware updates. The radio itself is not part of it: hosts feed
//! received frames in and provide a [`CommandSink`] or [`OadLink`] for the
//! outbound direction.
//!
//! # Data path
//!
//! 1. [`Acquisition::on_frame`] validates a frame, checks its index for gaps and
//!    yields one record per sample slot, with a lost-packet marker for every
//!    missed frame.
//! 2. Records collect in a pending buffer. When it fills, a decode task turns
//!    them into volts (NaN for lost slots) and appends them to the consolidated
//!    buffer.
//! 3. Every `notification_threshold` slots a packet is scored and published as an
//!    [`EegPacket`].
//!
//! # Timing
//!
//! Frame indices are the only clock the headset gives. A slot's time is
//! `first_index * slots_per_frame + position` sample periods after stream start;
//! lost frames keep their place in the packet as NaN columns, so the mapping
//! stays valid across gaps.

pub mod acquisition;
pub mod buffering;
pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod errors;
pub mod firmware;
pub mod logging;
pub mod oad;
pub mod pipeline;
pub mod sequence;
pub mod session;
pub mod transport;

pub use acquisition::{Acquisition, AcquisitionStats, DcOffsetReading, FrameLayout, SampleRecord};
pub use codec::{CommandFrame, MailboxEvent, MailboxOpcode, TransportKind};
pub use config::{OadConfig, PipelineConfig};
pub use connection::{ConnectionState, ConnectionStateMachine, StateChange};
pub use device::{DeviceProfile, DeviceType};
pub use errors::*;
pub use firmware::{FirmwareImage, FirmwareVersion};
pub use logging::init_logging;
pub use oad::{OadController, OadEvent, OadOutcome, OadProgress, OadSession, OadState};
pub use pipeline::{AcquisitionPipeline, CoverageQuality, EegPacket, PacketReceiver, QualityScorer};
pub use sequence::SequenceTracker;
pub use session::Session;
pub use transport::{CommandSink, OadLink};
