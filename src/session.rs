//! Headset session: connection lifecycle plus the acquisition pipeline.
//!
//! All commands take `&mut self`, so transitions and frames are serialized by the
//! caller. A transition that ends streaming resets the pipeline before it
//! returns; the next frame therefore always starts from clean buffers.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::broadcast;

use crate::acquisition::{AcquisitionStats, DcOffsetReading};
use crate::codec::{self, CommandFrame, MailboxOpcode};
use crate::config::PipelineConfig;
use crate::connection::{ConnectionState, ConnectionStateMachine, StateChange};
use crate::device::DeviceProfile;
use crate::errors::Result;
use crate::pipeline::{AcquisitionPipeline, PacketReceiver, QualityScorer};
use crate::transport::CommandSink;

pub struct Session {
    profile: DeviceProfile,
    connection: ConnectionStateMachine,
    pipeline: AcquisitionPipeline,
    sink: Box<dyn CommandSink>,
    next_packet_id: u16,
}

impl Session {
    /// Build a session for `profile`. Must be called within a Tokio runtime.
    pub fn new(
        profile: DeviceProfile,
        config: PipelineConfig,
        scorer: Arc<dyn QualityScorer>,
        sink: Box<dyn CommandSink>,
    ) -> (Self, PacketReceiver) {
        let (pipeline, packets) = AcquisitionPipeline::spawn(profile.layout(), config, scorer);
        info!(
            "session created: device={:?}, channels={}, rate={}Hz",
            profile.device_type, profile.channel_count, profile.sample_rate
        );
        let session = Self {
            profile,
            connection: ConnectionStateMachine::new(),
            pipeline,
            sink,
            next_packet_id: 0,
        };
        (session, packets)
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.connection.subscribe()
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.pipeline.stats()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub fn scan(&mut self) -> Result<()> {
        for change in self.connection.request_scan()? {
            self.after_transition(change);
        }
        Ok(())
    }

    pub fn connect(&mut self) -> Result<()> {
        self.apply(ConnectionState::Connecting)
    }

    pub fn start_stream(&mut self) -> Result<()> {
        self.apply(ConnectionState::Streaming)
    }

    /// Stop streaming but keep the link.
    pub fn stop_stream(&mut self) -> Result<()> {
        self.apply(ConnectionState::Connected)
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.apply(ConnectionState::Disconnecting)
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    pub fn on_scan_timeout(&mut self) -> Result<()> {
        self.apply(ConnectionState::ScanTimeout)
    }

    pub fn on_scan_failure(&mut self) -> Result<()> {
        self.apply(ConnectionState::ScanFailure)
    }

    pub fn on_connected(&mut self) -> Result<()> {
        self.apply(ConnectionState::Connected)
    }

    pub fn on_connection_failure(&mut self) -> Result<()> {
        self.apply(ConnectionState::ConnectionFailure)
    }

    pub fn on_link_lost(&mut self) -> Result<()> {
        self.apply(ConnectionState::ConnectionInterrupted)
    }

    pub fn on_disconnected(&mut self) -> Result<()> {
        self.apply(ConnectionState::Disconnected)
    }

    /// Feed one EEG frame. Frames outside of `Streaming` are ignored and `false`
    /// is returned.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<bool> {
        if self.connection.state() != ConnectionState::Streaming {
            debug!("ignoring frame received in {:?}", self.connection.state());
            return Ok(false);
        }
        self.pipeline.push_frame(frame)?;
        Ok(true)
    }

    pub fn handle_dc_offset_frame(&mut self, frame: &[u8]) -> Result<DcOffsetReading> {
        Ok(self.pipeline.push_dc_offset_frame(frame)?)
    }

    /// Frame and write a mailbox command; returns the packet id used.
    pub fn send_command(&mut self, opcode: MailboxOpcode, payload: Vec<u8>) -> Result<u16> {
        let packet_id = self.next_packet_id;
        let bytes = codec::assemble_command_frame(&CommandFrame::new(opcode, packet_id, payload))?;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        self.sink.send(&bytes)?;
        debug!("sent {:?} as packet {} ({} bytes)", opcode, packet_id, bytes.len());
        Ok(packet_id)
    }

    pub async fn close(self) {
        self.pipeline.shutdown().await;
    }

    fn apply(&mut self, to: ConnectionState) -> Result<()> {
        let change = self.connection.transition_to(to)?;
        self.after_transition(change);
        Ok(())
    }

    fn after_transition(&mut self, change: StateChange) {
        if change.stops_stream() {
            self.pipeline.reset();
        }
    }
}
