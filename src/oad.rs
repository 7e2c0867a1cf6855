//! Over-the-air firmware update (OAD).
//!
//! # Protocol
//!
//! 1. The host sends an update request (target version and packet count).
//! 2. The device accepts or rejects it.
//! 3. Packets are written in index order, one at a time: the next packet only
//!    goes out once the previous write was acknowledged. The device may report a
//!    lost index at any point; that packet is sent again before the transfer
//!    moves on.
//! 4. After the last packet the device reads back the image CRC and reports it.
//! 5. On success the device drops the link and reboots. The host reconnects,
//!    with a bounded number of attempts, and checks the running version.
//!
//! [`OadController`] is the state machine. Every input is an [`OadEvent`] and
//! every output an [`OadAction`]; it performs no I/O. [`OadSession`] drives it
//! over an [`OadLink`] and supplies the two timers the protocol needs.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::codec::{self, CommandFrame, MailboxEvent, MailboxOpcode};
use crate::config::OadConfig;
use crate::errors::OadFailure;
use crate::firmware::{FirmwareImage, FirmwareVersion};
use crate::transport::OadLink;

// ============================================================================
// States, events, actions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OadState {
    #[default]
    Idle,
    ValidationPending,
    Transferring,
    CrcPending,
    AwaitingReboot,
    Reconnecting,
    Complete,
    Failed(OadFailure),
}

impl OadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OadState::Complete | OadState::Failed(_))
    }

    fn is_active(&self) -> bool {
        !self.is_terminal() && *self != OadState::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OadEvent {
    /// Notification from the device mailbox.
    Mailbox(MailboxEvent),
    /// The transport confirmed the write of packet `index`.
    PacketAcknowledged { index: u16 },
    /// The write of packet `index` was not confirmed in time.
    PacketTimedOut { index: u16 },
    Disconnected,
    Reconnected { firmware_version: FirmwareVersion },
    ReconnectFailed,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OadOutcome {
    Success { version: FirmwareVersion },
    Failure(OadFailure),
}

impl OadOutcome {
    pub fn into_result(self) -> Result<FirmwareVersion, OadFailure> {
        match self {
            OadOutcome::Success { version } => Ok(version),
            OadOutcome::Failure(reason) => Err(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OadAction {
    None,
    /// Write the framed update request.
    SendRequest(Vec<u8>),
    SendPacket { index: u16, bytes: Vec<u8> },
    Reconnect { attempt: u32 },
    Finished(OadOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OadProgress {
    pub acknowledged: usize,
    pub total: usize,
}

// ============================================================================
// Controller
// ============================================================================

/// Session data; exists from `start` until the update ends.
#[derive(Debug)]
struct OadContext {
    version: FirmwareVersion,
    image: FirmwareImage,
    /// Lowest index never sent.
    next_index: usize,
    /// Indices reported lost and waiting to be sent again.
    outstanding: BTreeSet<u16>,
    in_flight: Option<u16>,
    attempts: u32,
    acknowledged: Vec<bool>,
    crc_ok: Option<bool>,
    reconnect_attempt: u32,
    expect_disconnect: bool,
}

impl OadContext {
    fn progress(&self) -> OadProgress {
        OadProgress {
            acknowledged: self.acknowledged.iter().filter(|a| **a).count(),
            total: self.image.packet_count(),
        }
    }

    /// Lost packets first, lowest index first, then fresh ones.
    fn next_to_send(&mut self) -> Option<u16> {
        if let Some(index) = self.outstanding.pop_first() {
            return Some(index);
        }
        if self.next_index < self.image.packet_count() {
            let index = self.next_index as u16;
            self.next_index += 1;
            return Some(index);
        }
        None
    }

    fn send(&mut self, index: u16) -> OadAction {
        self.in_flight = Some(index);
        self.attempts = 1;
        match self.image.packet(index) {
            Some(bytes) => OadAction::SendPacket { index, bytes },
            None => OadAction::None,
        }
    }
}

pub struct OadController {
    config: OadConfig,
    state: OadState,
    context: Option<OadContext>,
    last_progress: Option<OadProgress>,
}

impl OadController {
    pub fn new(config: OadConfig) -> Self {
        Self {
            config,
            state: OadState::Idle,
            context: None,
            last_progress: None,
        }
    }

    pub fn state(&self) -> &OadState {
        &self.state
    }

    pub fn progress(&self) -> Option<OadProgress> {
        self.context.as_ref().map(OadContext::progress).or(self.last_progress)
    }

    /// Packet currently waiting for its write acknowledgement.
    pub fn in_flight(&self) -> Option<u16> {
        self.context.as_ref().and_then(|c| c.in_flight)
    }

    /// Begin an update. Ignored while another update is running.
    pub fn start(&mut self, image: Vec<u8>, version: FirmwareVersion) -> OadAction {
        if self.state.is_active() {
            warn!("update already running in {:?}, ignoring start", self.state);
            return OadAction::None;
        }

        let image = match FirmwareImage::new(image, self.config.chunk_size) {
            Ok(image) => image,
            Err(reason) => return self.fail(reason),
        };

        let packet_count = image.packet_count() as u16;
        let mut payload = version.to_bytes().to_vec();
        payload.extend_from_slice(&packet_count.to_le_bytes());
        let request = match codec::assemble_command_frame(&CommandFrame::new(
            MailboxOpcode::StartOtaTransfer,
            0,
            payload,
        )) {
            Ok(request) => request,
            Err(e) => {
                warn!("cannot frame update request: {}", e);
                return OadAction::None;
            }
        };

        info!(
            "starting firmware update to {}: {} bytes in {} packets",
            version,
            image.len(),
            packet_count
        );
        self.context = Some(OadContext {
            version,
            acknowledged: vec![false; image.packet_count()],
            image,
            next_index: 0,
            outstanding: BTreeSet::new(),
            in_flight: None,
            attempts: 0,
            crc_ok: None,
            reconnect_attempt: 0,
            expect_disconnect: false,
        });
        self.last_progress = None;
        self.state = OadState::ValidationPending;
        OadAction::SendRequest(request)
    }

    /// Apply one event and return what the driver has to do next.
    pub fn handle(&mut self, event: OadEvent) -> OadAction {
        if !self.state.is_active() {
            debug!("ignoring {:?} in {:?}", event, self.state);
            return OadAction::None;
        }
        if event == OadEvent::Cancel {
            return self.fail(OadFailure::Cancelled);
        }

        let Some(ctx) = self.context.as_mut() else {
            return OadAction::None;
        };

        let current = self.state.clone();
        let (next, action) = match (current, event) {
            (OadState::ValidationPending, OadEvent::Mailbox(MailboxEvent::OtaMode { accepted })) => {
                if accepted {
                    match ctx.next_to_send() {
                        Some(index) => (OadState::Transferring, ctx.send(index)),
                        None => (OadState::CrcPending, OadAction::None),
                    }
                } else {
                    return self.fail(OadFailure::ValidationRejected);
                }
            }

            (OadState::Transferring, OadEvent::PacketAcknowledged { index }) => {
                if ctx.in_flight != Some(index) {
                    debug!("stray acknowledgement for packet {}", index);
                    return OadAction::None;
                }
                ctx.in_flight = None;
                ctx.acknowledged[index as usize] = true;
                match ctx.next_to_send() {
                    Some(index) => (OadState::Transferring, ctx.send(index)),
                    None => {
                        info!("all {} packets acknowledged, waiting for CRC", ctx.image.packet_count());
                        (OadState::CrcPending, OadAction::None)
                    }
                }
            }

            (OadState::Transferring, OadEvent::PacketTimedOut { index }) => {
                if ctx.in_flight != Some(index) {
                    return OadAction::None;
                }
                if ctx.attempts >= self.config.max_packet_retries {
                    let attempts = ctx.attempts;
                    return self.fail(OadFailure::TransferTimeout { index, attempts });
                }
                ctx.attempts += 1;
                warn!("packet {} not acknowledged, attempt {}", index, ctx.attempts);
                let bytes = ctx.image.packet(index).unwrap_or_default();
                (OadState::Transferring, OadAction::SendPacket { index, bytes })
            }

            (
                OadState::Transferring | OadState::CrcPending,
                OadEvent::Mailbox(MailboxEvent::OtaIndexReset { index }),
            ) => {
                if index as usize >= ctx.image.packet_count() {
                    warn!("device reported unknown packet {} as lost", index);
                    return OadAction::None;
                }
                debug!("device lost packet {}", index);
                ctx.acknowledged[index as usize] = false;
                ctx.outstanding.insert(index);
                if ctx.in_flight.is_some() {
                    (OadState::Transferring, OadAction::None)
                } else {
                    match ctx.next_to_send() {
                        Some(index) => (OadState::Transferring, ctx.send(index)),
                        None => (OadState::CrcPending, OadAction::None),
                    }
                }
            }

            (OadState::CrcPending, OadEvent::Mailbox(MailboxEvent::OtaStatus { crc_ok })) => {
                ctx.crc_ok = Some(crc_ok);
                if !crc_ok {
                    return self.fail(OadFailure::CrcMismatch);
                }
                info!("device validated the image CRC, waiting for reboot");
                ctx.expect_disconnect = true;
                (OadState::AwaitingReboot, OadAction::None)
            }

            (_, OadEvent::Disconnected) => {
                if !ctx.expect_disconnect {
                    return self.fail(OadFailure::UnexpectedDisconnect);
                }
                if self.state != OadState::AwaitingReboot {
                    return OadAction::None;
                }
                ctx.reconnect_attempt = 1;
                (OadState::Reconnecting, OadAction::Reconnect { attempt: 1 })
            }

            (OadState::Reconnecting, OadEvent::ReconnectFailed) => {
                if ctx.reconnect_attempt >= self.config.max_reconnect_attempts {
                    return self.fail(OadFailure::ReconnectTimeout);
                }
                ctx.reconnect_attempt += 1;
                warn!("reconnection failed, attempt {}", ctx.reconnect_attempt);
                (
                    OadState::Reconnecting,
                    OadAction::Reconnect {
                        attempt: ctx.reconnect_attempt,
                    },
                )
            }

            (OadState::Reconnecting, OadEvent::Reconnected { firmware_version }) => {
                if firmware_version != ctx.version {
                    let reason = OadFailure::VersionMismatch {
                        expected: ctx.version.to_string(),
                        found: firmware_version.to_string(),
                    };
                    return self.fail(reason);
                }
                return self.complete();
            }

            (state, event) => {
                debug!("ignoring {:?} in {:?}", event, state);
                return OadAction::None;
            }
        };

        if next != self.state {
            debug!("oad state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        action
    }

    fn complete(&mut self) -> OadAction {
        let Some(ctx) = self.context.take() else {
            return OadAction::None;
        };
        info!("firmware update to {} complete", ctx.version);
        self.last_progress = Some(ctx.progress());
        self.state = OadState::Complete;
        OadAction::Finished(OadOutcome::Success {
            version: ctx.version,
        })
    }

    fn fail(&mut self, reason: OadFailure) -> OadAction {
        warn!("firmware update failed in {:?}: {}", self.state, reason);
        self.last_progress = self.context.take().map(|ctx| ctx.progress());
        self.state = OadState::Failed(reason.clone());
        OadAction::Finished(OadOutcome::Failure(reason))
    }
}

// ============================================================================
// Driver
// ============================================================================

/// When a pending packet or reconnect attempt is given up on.
#[derive(Debug)]
struct Deadline {
    at: Instant,
    expired: OadEvent,
}

/// Runs one update over a link, fed by device and transport events.
pub struct OadSession<L: OadLink> {
    controller: OadController,
    link: L,
    config: OadConfig,
    progress: Option<mpsc::UnboundedSender<OadProgress>>,
}

impl<L: OadLink> OadSession<L> {
    pub fn new(link: L, config: OadConfig) -> Self {
        Self {
            controller: OadController::new(config),
            link,
            config,
            progress: None,
        }
    }

    /// Report `acknowledged / total` after every packet.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<OadProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn state(&self) -> &OadState {
        self.controller.state()
    }

    /// Run the update until it completes or fails.
    ///
    /// The ack timer starts when a packet is written and the reconnect timer when
    /// an attempt starts. Events the controller ignores do not push either
    /// deadline back. Closing the event channel cancels the update.
    pub async fn run(
        &mut self,
        image: Vec<u8>,
        version: FirmwareVersion,
        events: &mut mpsc::UnboundedReceiver<OadEvent>,
    ) -> Result<FirmwareVersion, OadFailure> {
        let mut action = self.controller.start(image, version);
        if action == OadAction::None {
            return Err(OadFailure::Cancelled);
        }

        let mut deadline: Option<Deadline> = None;
        loop {
            let mut feedback = None;
            match action {
                OadAction::None => {}
                OadAction::SendRequest(bytes) => {
                    if let Err(e) = self.link.write_packet(&bytes) {
                        warn!("failed to send update request: {}", e);
                        feedback = Some(OadEvent::Disconnected);
                    }
                }
                OadAction::SendPacket { index, bytes } => {
                    deadline = Some(Deadline {
                        at: Instant::now() + self.config.ack_timeout,
                        expired: OadEvent::PacketTimedOut { index },
                    });
                    if let Err(e) = self.link.write_packet(&bytes) {
                        warn!("failed to write packet {}: {}", index, e);
                        feedback = Some(OadEvent::PacketTimedOut { index });
                    }
                }
                OadAction::Reconnect { attempt } => {
                    deadline = Some(Deadline {
                        at: Instant::now() + self.config.reconnect_timeout,
                        expired: OadEvent::ReconnectFailed,
                    });
                    if let Err(e) = self.link.request_reconnect(attempt) {
                        warn!("reconnect attempt {} could not start: {}", attempt, e);
                        feedback = Some(OadEvent::ReconnectFailed);
                    }
                }
                OadAction::Finished(outcome) => {
                    self.report_progress();
                    return outcome.into_result();
                }
            }
            self.report_progress();

            let event = match feedback {
                Some(event) => event,
                None => self.next_event(events, deadline.as_ref()).await,
            };
            action = self.controller.handle(event);
        }
    }

    /// Wait for the next event, or for the deadline when it still guards the
    /// current packet or reconnect attempt.
    async fn next_event(
        &self,
        events: &mut mpsc::UnboundedReceiver<OadEvent>,
        deadline: Option<&Deadline>,
    ) -> OadEvent {
        let armed = deadline.filter(|d| match (self.controller.state(), &d.expired) {
            (OadState::Transferring, OadEvent::PacketTimedOut { index }) => {
                self.controller.in_flight() == Some(*index)
            }
            (OadState::Reconnecting, OadEvent::ReconnectFailed) => true,
            _ => false,
        });

        let received = match armed {
            Some(d) => match tokio::time::timeout_at(d.at, events.recv()).await {
                Ok(received) => received,
                Err(_) => return d.expired.clone(),
            },
            None => events.recv().await,
        };
        received.unwrap_or(OadEvent::Cancel)
    }

    fn report_progress(&self) {
        if let (Some(tx), Some(progress)) = (&self.progress, self.controller.progress()) {
            let _ = tx.send(progress);
        }
    }
}
